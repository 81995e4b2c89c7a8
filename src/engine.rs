//! # Speed Engine
//!
//! Stateful context object that owns everything the pipeline needs:
//!
//! - The current checkpoint catalog
//! - The active zone set and the platform zone monitor
//! - Passage/debounce state and the latest heading sample
//! - The results broadcast, a window of recent measurements and the retry queue
//!
//! Events must be delivered serially (`&mut self`), which is what the
//! platform callbacks guarantee; no locking happens here. [`SpeedEngine::run`]
//! offers the same thing as a channel-driven event pump.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc};

use crate::catalog::{Catalog, CatalogSource};
use crate::distance::DistanceProvider;
use crate::error::Result;
use crate::passage::PassageTracker;
use crate::queue::RetryQueue;
use crate::report::{AvgSpeedReport, ClientMetadata, Measurement};
use crate::zones::{reconcile, release_all, select_zones, ZoneMonitor};
use crate::{EngineConfig, GpsPoint};

/// Capacity of the results broadcast; slow subscribers lag, they never block.
const RESULTS_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// Events
// ============================================================================

/// Inputs accepted by [`SpeedEngine::run`].
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// New position fix, optionally with a course/heading in degrees
    Location {
        position: GpsPoint,
        heading: Option<f64>,
    },
    /// Heading-only sample (compass), degrees
    Heading(f64),
    /// The platform reported entry into a watched zone
    ZoneEntered {
        checkpoint_id: String,
        at: DateTime<Utc>,
    },
}

/// Engine statistics for monitoring.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStats {
    pub checkpoint_count: u32,
    pub segment_count: u32,
    pub active_zone_count: u32,
    pub open_passage_count: u32,
    pub measurement_count: u64,
    pub pending_upload_count: u32,
}

// ============================================================================
// Speed Engine
// ============================================================================

/// The average-speed pipeline for one monitored vehicle.
pub struct SpeedEngine<M: ZoneMonitor> {
    config: EngineConfig,
    catalog: Catalog,
    active_zones: HashSet<String>,
    tracker: PassageTracker,
    heading: Option<f64>,
    last_position: Option<GpsPoint>,
    monitor: M,
    distance: Arc<dyn DistanceProvider>,
    queue: RetryQueue,
    metadata: ClientMetadata,
    results: broadcast::Sender<Measurement>,
    recent: VecDeque<Measurement>,
    measurement_count: u64,
}

impl<M: ZoneMonitor> SpeedEngine<M> {
    /// Create an engine with an empty catalog.
    pub fn new(
        config: EngineConfig,
        monitor: M,
        distance: Arc<dyn DistanceProvider>,
        queue: RetryQueue,
        metadata: ClientMetadata,
    ) -> Self {
        let (results, _) = broadcast::channel(RESULTS_CHANNEL_CAPACITY);
        let tracker = PassageTracker::new(
            config.min_reentry_interval_secs,
            config.heading_tolerance_degrees,
        );
        Self {
            config,
            catalog: Catalog::default(),
            active_zones: HashSet::new(),
            tracker,
            heading: None,
            last_position: None,
            monitor,
            distance,
            queue,
            metadata,
            results,
            recent: VecDeque::new(),
            measurement_count: 0,
        }
    }

    // ========================================================================
    // Catalog
    // ========================================================================

    /// Fetch a new catalog and swap it in.
    ///
    /// On failure the previous catalog stays in effect and the error is
    /// returned. Open passages are not reconciled against the new catalog.
    pub async fn refresh_catalog<S>(&mut self, source: &S) -> Result<()>
    where
        S: CatalogSource + ?Sized,
    {
        match Catalog::refresh(source, self.config.default_geofence_radius).await {
            Ok(catalog) => {
                self.set_catalog(catalog);
                Ok(())
            }
            Err(e) => {
                warn!("[SpeedEngine] Catalog refresh failed, keeping previous: {}", e);
                Err(e)
            }
        }
    }

    /// Replace the catalog and re-select zones around the last known position.
    pub fn set_catalog(&mut self, catalog: Catalog) {
        self.catalog = catalog;
        if let Some(position) = self.last_position {
            self.reconcile_zones(position);
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    // ========================================================================
    // Position & Heading
    // ========================================================================

    /// Record a position (and optional heading) sample and reconcile zones.
    ///
    /// A fix without a heading clears the previous one, so a stale course
    /// never gates later passages. Compass samples from [`Self::update_heading`]
    /// stay in effect until the next fix.
    pub fn update_location(&mut self, position: GpsPoint, heading: Option<f64>) {
        if !position.is_valid() {
            debug!("[SpeedEngine] Ignoring invalid position {:?}", position);
            return;
        }
        self.heading = heading;
        self.last_position = Some(position);
        self.reconcile_zones(position);
    }

    /// Record a heading-only sample. Negative values mean "unknown".
    pub fn update_heading(&mut self, heading: f64) {
        self.heading = Some(heading);
    }

    fn reconcile_zones(&mut self, position: GpsPoint) {
        let plan = select_zones(
            &position,
            &self.catalog,
            &self.active_zones,
            self.config.max_monitored_zones,
            self.config.default_geofence_radius,
        );
        if plan.is_empty() {
            return;
        }
        debug!(
            "[SpeedEngine] Zones: +{} -{}",
            plan.to_start.len(),
            plan.to_stop.len()
        );
        reconcile(plan, &mut self.monitor, &mut self.active_zones);
    }

    // ========================================================================
    // Zone Entries
    // ========================================================================

    /// Handle a zone-entry event and return the measurements it completed.
    pub async fn on_zone_entered(&mut self, checkpoint_id: &str, now: DateTime<Utc>) -> Vec<Measurement> {
        let (outcome, closed) = self.tracker.on_entry(&self.catalog, checkpoint_id, now, self.heading);
        debug!("[SpeedEngine] Entry at {}: {:?}", checkpoint_id, outcome);
        if closed.is_empty() {
            return Vec::new();
        }

        let distance = Arc::clone(&self.distance);
        let mut measurements = Vec::with_capacity(closed.len());
        for passage in closed {
            let from = passage.segment.start.location;
            let to = passage.segment.end.location;
            let measurement = match distance.route_distance(from, to).await {
                Ok(meters) => Measurement::from_passage(&passage, meters),
                Err(e) => Err(e),
            };
            match measurement {
                Ok(measurement) => {
                    self.publish(measurement.clone());
                    measurements.push(measurement);
                }
                Err(e) => {
                    warn!(
                        "[SpeedEngine] Dropping measurement for '{}': {}",
                        passage.segment.name, e
                    );
                }
            }
        }
        measurements
    }

    fn publish(&mut self, measurement: Measurement) {
        info!(
            "[SpeedEngine] {}: {:.0} m in {:.0} s = {:.1} km/h",
            measurement.segment_name,
            measurement.distance_meters,
            measurement.duration_secs(),
            measurement.avg_speed_kmh
        );
        self.measurement_count += 1;

        if self.config.recent_measurements_limit > 0 {
            while self.recent.len() >= self.config.recent_measurements_limit {
                self.recent.pop_front();
            }
            self.recent.push_back(measurement.clone());
        }

        self.queue
            .enqueue(AvgSpeedReport::new(&measurement, &self.metadata));
        // No subscribers is fine
        let _ = self.results.send(measurement);
    }

    // ========================================================================
    // Results
    // ========================================================================

    /// Subscribe to new measurements.
    pub fn subscribe(&self) -> broadcast::Receiver<Measurement> {
        self.results.subscribe()
    }

    /// Most recent measurements, oldest first.
    pub fn recent_measurements(&self) -> Vec<Measurement> {
        self.recent.iter().cloned().collect()
    }

    pub fn queue(&self) -> &RetryQueue {
        &self.queue
    }

    // ========================================================================
    // State
    // ========================================================================

    /// Ids currently watched by the platform, sorted.
    pub fn active_zones(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active_zones.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn open_passage_count(&self) -> usize {
        self.tracker.open_count()
    }

    pub fn monitor(&self) -> &M {
        &self.monitor
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            checkpoint_count: self.catalog.checkpoints().len() as u32,
            segment_count: self.catalog.segments().len() as u32,
            active_zone_count: self.active_zones.len() as u32,
            open_passage_count: self.tracker.open_count() as u32,
            measurement_count: self.measurement_count,
            pending_upload_count: self.queue.pending_count() as u32,
        }
    }

    /// Stop monitoring: release every zone and forget passage state.
    ///
    /// Pending uploads keep going; shut the queue down separately.
    pub fn stop(&mut self) {
        let released = self.active_zones.len();
        release_all(&mut self.monitor, &mut self.active_zones);
        self.tracker.clear();
        self.heading = None;
        self.last_position = None;
        info!("[SpeedEngine] Stopped, released {} zones", released);
    }

    /// Process events one at a time until the channel closes, then stop.
    pub async fn run(mut self, mut events: mpsc::Receiver<EngineEvent>) -> Self {
        while let Some(event) = events.recv().await {
            match event {
                EngineEvent::Location { position, heading } => {
                    self.update_location(position, heading);
                }
                EngineEvent::Heading(heading) => self.update_heading(heading),
                EngineEvent::ZoneEntered { checkpoint_id, at } => {
                    self.on_zone_entered(&checkpoint_id, at).await;
                }
            }
        }
        self.stop();
        self
    }
}

// ============================================================================
// Tests
// ============================================================================
