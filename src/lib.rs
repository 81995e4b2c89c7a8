//! # Avg Speed
//!
//! Average-speed measurement over road segments bounded by two geofenced
//! checkpoints (cameras), with durable delivery of the results.
//!
//! This library provides:
//! - Nearest-N checkpoint selection under a platform geofence cap
//! - A passage state machine with entry debounce and direction gating
//! - A persisted FIFO retry queue with single-flight upload and exponential backoff
//!
//! ## Features
//!
//! - **`http`** - Enable the reqwest client for the traffic backend
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use avg_speed::{Catalog, CameraDto, SegmentDto, PassageTracker};
//! use chrono::{Duration, Utc};
//!
//! let catalog = Catalog::from_dtos(
//!     vec![
//!         CameraDto { id: "A".into(), lat: 42.6281, lng: 23.3711, direction: None },
//!         CameraDto { id: "C".into(), lat: 42.6321, lng: 23.3791, direction: None },
//!     ],
//!     vec![SegmentDto {
//!         name: "A→C".into(),
//!         start_camera_id: "A".into(),
//!         end_camera_id: "C".into(),
//!         geofence_radius: Some(50.0),
//!     }],
//!     300.0,
//! );
//!
//! let mut tracker = PassageTracker::new(30.0, 30.0);
//! let t0 = Utc::now();
//! tracker.on_entry(&catalog, "A", t0, None);
//! let (_, closed) = tracker.on_entry(&catalog, "C", t0 + Duration::seconds(45), None);
//! assert_eq!(closed.len(), 1);
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{AvgSpeedError, Result};

// Geographic utilities (distance, bearing, heading comparison)
pub mod geo_utils;

// Checkpoint catalog and its wire types
pub mod catalog;
pub use catalog::{CameraDto, Catalog, CatalogSource, Checkpoint, Segment, SegmentDto};

// Nearest-N zone selection and reconciliation
pub mod zones;
pub use zones::{nearest_checkpoints, reconcile, select_zones, ZoneMonitor, ZonePlan, ZoneRequest};

// Passage state machine
pub mod passage;
pub use passage::{direction_gate, ClosedPassage, EntryOutcome, PassageTracker};

// Route distance with straight-line fallback
pub mod distance;
pub use distance::{DistanceProvider, StraightLineDistance, WithStraightLineFallback};

// Measurements and upload records
pub mod report;
pub use report::{average_speed_kmh, AvgSpeedReport, ClientMetadata, Measurement};

// Queue file persistence
pub mod persistence;
pub use persistence::QueueStore;

// Durable retry queue
pub mod queue;
pub use queue::{Backoff, ReportUploader, RetryConfig, RetryQueue};

// Stateful engine tying everything together
pub mod engine;
pub use engine::{EngineEvent, EngineStats, SpeedEngine};

// HTTP client for the traffic backend
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "http")]
pub use http::{BackendClient, BackendConfig, TokenProvider};

/// Initialize logging for Android.
#[cfg(target_os = "android")]
pub fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("AvgSpeedRust"),
    );
}

#[cfg(not(target_os = "android"))]
pub fn init_logging() {
    // No-op on non-Android platforms; hosts install their own `log` backend
}

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use avg_speed::GpsPoint;
/// let point = GpsPoint::new(42.6281, 23.3711); // Sofia
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// Configuration for checkpoint monitoring and passage detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of zones watched at once (platform hard limit).
    /// Default: 20
    pub max_monitored_zones: usize,

    /// Geofence radius for segments without their own, and for checkpoints
    /// that belong to no segment. Default: 300.0 meters
    pub default_geofence_radius: f64,

    /// Re-entries into the same checkpoint within this window are ignored.
    /// Default: 30.0 seconds
    pub min_reentry_interval_secs: f64,

    /// Allowed deviation of the live heading from the segment bearing.
    /// Default: 30.0 degrees
    pub heading_tolerance_degrees: f64,

    /// Number of recent measurements kept for subscribers that join late.
    /// Default: 50
    pub recent_measurements_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_monitored_zones: 20,
            default_geofence_radius: 300.0,
            min_reentry_interval_secs: 30.0,
            heading_tolerance_degrees: 30.0,
            recent_measurements_limit: 50,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(AvgSpeedError::Config { message });

        if self.max_monitored_zones == 0 {
            return invalid("max_monitored_zones must be at least 1".to_string());
        }
        if !(self.default_geofence_radius.is_finite() && self.default_geofence_radius > 0.0) {
            return invalid(format!(
                "default_geofence_radius must be positive, got {}",
                self.default_geofence_radius
            ));
        }
        if !(self.min_reentry_interval_secs.is_finite() && self.min_reentry_interval_secs >= 0.0) {
            return invalid(format!(
                "min_reentry_interval_secs must be non-negative, got {}",
                self.min_reentry_interval_secs
            ));
        }
        if !(0.0..=180.0).contains(&self.heading_tolerance_degrees) {
            return invalid(format!(
                "heading_tolerance_degrees must be within 0..=180, got {}",
                self.heading_tolerance_degrees
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
