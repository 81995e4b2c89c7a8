//! # Checkpoint Catalog
//!
//! Holds the mapped set of checkpoints (cameras) and ordered checkpoint pairs
//! (segments). The catalog is rebuilt wholesale on every refresh; there is no
//! incremental merge with a previous catalog.

use std::collections::HashMap;

use futures::future::BoxFuture;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{AvgSpeedError, Result};
use crate::GpsPoint;

// ============================================================================
// Wire Types
// ============================================================================

/// Camera as served by `GET /v1/traffic/cameras`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraDto {
    pub id: String,
    pub lat: f64,
    pub lng: f64,
    /// Direction traffic faces at the camera, degrees (0..360)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<f64>,
}

/// Segment as served by `GET /v1/traffic/segments`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentDto {
    pub name: String,
    pub start_camera_id: String,
    pub end_camera_id: String,
    /// Geofence radius in meters; falls back to the configured default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geofence_radius: Option<f64>,
}

/// Source of raw catalog data (usually the traffic backend).
pub trait CatalogSource: Send + Sync {
    fn fetch_cameras(&self) -> BoxFuture<'_, Result<Vec<CameraDto>>>;
    fn fetch_segments(&self) -> BoxFuture<'_, Result<Vec<SegmentDto>>>;
}

// ============================================================================
// Mapped Types
// ============================================================================

/// A fixed, geolocated checkpoint used as a geofence trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub id: String,
    pub location: GpsPoint,
    /// Fixed heading attribute in degrees, if the camera declares one
    pub heading: Option<f64>,
}

impl From<CameraDto> for Checkpoint {
    fn from(dto: CameraDto) -> Self {
        Self {
            id: dto.id,
            location: GpsPoint::new(dto.lat, dto.lng),
            heading: dto.direction.filter(|h| h.is_finite()),
        }
    }
}

/// An ordered checkpoint pair defining a road section to time.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub name: String,
    pub start: Checkpoint,
    pub end: Checkpoint,
    /// Geofence radius in meters
    pub geofence_radius: f64,
}

// ============================================================================
// Catalog
// ============================================================================

/// Immutable snapshot of all known checkpoints and segments.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    checkpoints: Vec<Checkpoint>,
    index: HashMap<String, usize>,
    segments: Vec<Segment>,
}

impl Catalog {
    /// Build a catalog from raw DTOs.
    ///
    /// Checkpoints keep their source order (later duplicates of an id are
    /// ignored). Segments whose endpoints are unknown, or that start and end
    /// at the same checkpoint, are dropped.
    pub fn from_dtos(cameras: Vec<CameraDto>, segments: Vec<SegmentDto>, default_radius: f64) -> Self {
        let mut checkpoints = Vec::with_capacity(cameras.len());
        let mut index = HashMap::with_capacity(cameras.len());

        for camera in cameras {
            if index.contains_key(&camera.id) {
                debug!("[Catalog] Ignoring duplicate camera '{}'", camera.id);
                continue;
            }
            index.insert(camera.id.clone(), checkpoints.len());
            checkpoints.push(Checkpoint::from(camera));
        }

        let mapped: Vec<Segment> = segments
            .into_iter()
            .filter_map(|dto| {
                if dto.start_camera_id == dto.end_camera_id {
                    debug!("[Catalog] Dropping segment '{}': start == end", dto.name);
                    return None;
                }
                let start = index.get(&dto.start_camera_id).map(|&i| &checkpoints[i]);
                let end = index.get(&dto.end_camera_id).map(|&i| &checkpoints[i]);
                match (start, end) {
                    (Some(start), Some(end)) => Some(Segment {
                        name: dto.name,
                        start: start.clone(),
                        end: end.clone(),
                        geofence_radius: dto
                            .geofence_radius
                            .filter(|r| r.is_finite() && *r > 0.0)
                            .unwrap_or(default_radius),
                    }),
                    _ => {
                        debug!(
                            "[Catalog] Dropping segment '{}': unknown endpoint ({} -> {})",
                            dto.name, dto.start_camera_id, dto.end_camera_id
                        );
                        None
                    }
                }
            })
            .collect();

        Self {
            checkpoints,
            index,
            segments: mapped,
        }
    }

    /// Fetch cameras and segments concurrently and build a fresh catalog.
    ///
    /// Either fetch failing fails the whole refresh; no partial catalog is
    /// ever produced.
    pub async fn refresh<S>(source: &S, default_radius: f64) -> Result<Self>
    where
        S: CatalogSource + ?Sized,
    {
        let (cameras, segments) =
            futures::try_join!(source.fetch_cameras(), source.fetch_segments()).map_err(|e| {
                AvgSpeedError::Catalog {
                    message: e.to_string(),
                }
            })?;

        let raw_segments = segments.len();
        let catalog = Self::from_dtos(cameras, segments, default_radius);
        info!(
            "[Catalog] Refreshed: {} checkpoints, {}/{} segments mapped",
            catalog.checkpoints.len(),
            catalog.segments.len(),
            raw_segments
        );
        Ok(catalog)
    }

    /// All checkpoints in catalog order.
    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    /// All mapped segments in catalog order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn checkpoint(&self, id: &str) -> Option<&Checkpoint> {
        self.index.get(id).map(|&i| &self.checkpoints[i])
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    /// First segment (catalog order) starting at `checkpoint_id`.
    pub fn first_segment_starting_at(&self, checkpoint_id: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.start.id == checkpoint_id)
    }

    /// Every segment ending at `checkpoint_id`, in catalog order.
    pub fn segments_ending_at<'a>(&'a self, checkpoint_id: &'a str) -> impl Iterator<Item = &'a Segment> + 'a {
        self.segments.iter().filter(move |s| s.end.id == checkpoint_id)
    }

    /// Monitoring radius for a checkpoint: the largest geofence radius of any
    /// segment touching it, or `default_radius` if it belongs to none.
    pub fn monitoring_radius(&self, checkpoint_id: &str, default_radius: f64) -> f64 {
        self.segments
            .iter()
            .filter(|s| s.start.id == checkpoint_id || s.end.id == checkpoint_id)
            .map(|s| s.geofence_radius)
            .fold(None, |acc: Option<f64>, r| Some(acc.map_or(r, |a| a.max(r))))
            .unwrap_or(default_radius)
    }
}
