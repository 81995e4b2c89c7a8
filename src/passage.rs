//! # Passage State Machine
//!
//! Consumes checkpoint-entry events and turns start/end pairs into closed
//! passages. The machine is purely event-reactive: it has no global
//! started/stopped mode, only the open-passage and debounce maps.
//!
//! Per entry event `E(checkpoint, now)`:
//!
//! 1. **Debounce**: re-entries within `min_reentry_interval` are discarded.
//! 2. **End-match**: every segment ending here is checked for an open
//!    passage at its start, gated, and closed.
//! 3. **Start-match**: if the checkpoint starts a segment, the *first* such
//!    segment (catalog order) is direction-gated and, on pass, a passage is
//!    opened (overwriting any unmatched one). Other segments sharing that
//!    start are never considered; fanning out to all of them is a behavior
//!    change that needs a product decision first.
//!
//! On a chain of segments (A→C, C→D) entering C closes A→C and opens C→D in
//! the same event. Self-loops never reach the catalog, so the passage being
//! closed is never the one being opened.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};

use crate::catalog::{Catalog, Segment};
use crate::geo_utils::{calculate_bearing, heading_within};

/// Tolerance applied against a checkpoint's fixed heading attribute.
pub const FIXED_HEADING_TOLERANCE_DEGREES: f64 = 45.0;

/// A passage that was opened at a segment's start and closed at its end.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedPassage {
    pub segment: Segment,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl ClosedPassage {
    /// Passage duration in seconds (always > 0).
    pub fn duration_secs(&self) -> f64 {
        duration_secs(self.ended_at - self.started_at)
    }
}

/// What an entry event did to the open-passage map. Used for logging and tests.
///
/// Start outcomes take precedence: a checkpoint that ends one segment and
/// starts another reports `Started`/`WrongDirection`, and the passages it
/// closed come back alongside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    /// Re-entry inside the debounce window
    Debounced,
    /// A passage was opened (or re-opened) at this checkpoint
    Started,
    /// Start checkpoint, but the direction gate rejected it
    WrongDirection,
    /// Checkpoint only ends segments; see the returned passages
    Ended,
    /// Checkpoint belongs to no segment
    Unmatched,
}

/// Length of `duration` in seconds, with microsecond resolution.
pub(crate) fn duration_secs(duration: Duration) -> f64 {
    match duration.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        // Only overflows past ~292k years
        None => duration.num_milliseconds() as f64 / 1000.0,
    }
}

/// Is the observed direction compatible with `segment`?
///
/// A valid live heading is compared against the bearing from start to end.
/// Without one, the start checkpoint's fixed heading is used with a ±45°
/// tolerance. With no directional data at all the passage is accepted.
pub fn direction_gate(segment: &Segment, heading: Option<f64>, tolerance: f64) -> bool {
    match heading.filter(|h| h.is_finite() && *h >= 0.0) {
        Some(heading) => {
            let expected = calculate_bearing(&segment.start.location, &segment.end.location);
            heading_within(heading, expected, tolerance)
        }
        None => match segment.start.heading {
            Some(fixed) => {
                let expected = calculate_bearing(&segment.start.location, &segment.end.location);
                heading_within(fixed, expected, FIXED_HEADING_TOLERANCE_DEGREES)
            }
            None => true,
        },
    }
}

/// Open passages and entry debounce, keyed by checkpoint id.
#[derive(Debug, Clone)]
pub struct PassageTracker {
    min_reentry_interval: Duration,
    heading_tolerance: f64,
    open: HashMap<String, DateTime<Utc>>,
    last_entry: HashMap<String, DateTime<Utc>>,
}

impl PassageTracker {
    pub fn new(min_reentry_interval_secs: f64, heading_tolerance_degrees: f64) -> Self {
        Self {
            min_reentry_interval: Duration::milliseconds((min_reentry_interval_secs * 1000.0) as i64),
            heading_tolerance: heading_tolerance_degrees,
            open: HashMap::new(),
            last_entry: HashMap::new(),
        }
    }

    /// Process one zone-entry event.
    ///
    /// Returns the outcome plus any passages it closed. Closed passages can
    /// accompany [`EntryOutcome::Ended`], [`EntryOutcome::Started`] and
    /// [`EntryOutcome::WrongDirection`].
    pub fn on_entry(
        &mut self,
        catalog: &Catalog,
        checkpoint_id: &str,
        now: DateTime<Utc>,
        heading: Option<f64>,
    ) -> (EntryOutcome, Vec<ClosedPassage>) {
        if let Some(last) = self.last_entry.get(checkpoint_id) {
            if now - *last < self.min_reentry_interval {
                debug!("[PassageTracker] Debounced re-entry at {}", checkpoint_id);
                return (EntryOutcome::Debounced, Vec::new());
            }
        }
        self.last_entry.insert(checkpoint_id.to_string(), now);

        let (any_end, closed) = self.close_passages(catalog, checkpoint_id, now, heading);

        let Some(segment) = catalog.first_segment_starting_at(checkpoint_id) else {
            let outcome = if any_end {
                EntryOutcome::Ended
            } else {
                EntryOutcome::Unmatched
            };
            return (outcome, closed);
        };

        if !direction_gate(segment, heading, self.heading_tolerance) {
            debug!(
                "[PassageTracker] Start of '{}' rejected by direction gate",
                segment.name
            );
            return (EntryOutcome::WrongDirection, closed);
        }
        if self.open.insert(checkpoint_id.to_string(), now).is_some() {
            debug!("[PassageTracker] Overwrote unmatched start at {}", checkpoint_id);
        }
        info!("[PassageTracker] Passage started: '{}'", segment.name);
        (EntryOutcome::Started, closed)
    }

    /// Close every open passage whose segment ends at `checkpoint_id`.
    ///
    /// Returns whether the checkpoint ends any segment at all, plus the
    /// passages that were closed with a positive duration.
    fn close_passages(
        &mut self,
        catalog: &Catalog,
        checkpoint_id: &str,
        now: DateTime<Utc>,
        heading: Option<f64>,
    ) -> (bool, Vec<ClosedPassage>) {
        let mut closed = Vec::new();
        let mut any_end = false;
        for segment in catalog.segments_ending_at(checkpoint_id) {
            any_end = true;
            let Some(&started_at) = self.open.get(&segment.start.id) else {
                continue;
            };
            if !direction_gate(segment, heading, self.heading_tolerance) {
                debug!(
                    "[PassageTracker] End of '{}' rejected by direction gate",
                    segment.name
                );
                continue;
            }
            self.open.remove(&segment.start.id);

            if now <= started_at {
                debug!(
                    "[PassageTracker] Dropping '{}': non-positive duration",
                    segment.name
                );
                continue;
            }
            info!("[PassageTracker] Passage closed: '{}'", segment.name);
            closed.push(ClosedPassage {
                segment: segment.clone(),
                started_at,
                ended_at: now,
            });
        }
        (any_end, closed)
    }

    /// Start time of the open passage at `checkpoint_id`, if any.
    pub fn open_passage(&self, checkpoint_id: &str) -> Option<DateTime<Utc>> {
        self.open.get(checkpoint_id).copied()
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Drop all passage and debounce state.
    pub fn clear(&mut self) {
        self.open.clear();
        self.last_entry.clear();
    }
}
