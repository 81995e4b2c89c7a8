//! # Zone Selection
//!
//! The platform can only watch a small number of geofences at once, while the
//! catalog may hold hundreds of checkpoints. On every position update the
//! selector picks the `max_count` nearest checkpoints and reconciles that
//! target against the zones currently being watched.

use std::collections::HashSet;

use log::{debug, warn};

use crate::catalog::Catalog;
use crate::error::Result;
use crate::geo_utils::haversine_distance;
use crate::GpsPoint;

/// Platform geofence capability.
///
/// Entry events do not flow through this trait; the host forwards them to
/// [`crate::SpeedEngine::on_zone_entered`].
pub trait ZoneMonitor: Send {
    /// Start watching a circular zone around `center`.
    fn watch(&mut self, id: &str, center: GpsPoint, radius_meters: f64) -> Result<()>;

    /// Stop watching a zone. Unknown ids are ignored.
    fn unwatch(&mut self, id: &str);
}

/// A zone that should start being watched.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneRequest {
    pub id: String,
    pub center: GpsPoint,
    pub radius: f64,
}

/// Difference between the active zone set and the target set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZonePlan {
    /// Nearest first
    pub to_start: Vec<ZoneRequest>,
    /// Sorted by id
    pub to_stop: Vec<String>,
}

impl ZonePlan {
    pub fn is_empty(&self) -> bool {
        self.to_start.is_empty() && self.to_stop.is_empty()
    }
}

/// Ids of the `max_count` checkpoints nearest to `position`, nearest first.
///
/// Ties keep catalog order.
pub fn nearest_checkpoints(position: &GpsPoint, catalog: &Catalog, max_count: usize) -> Vec<String> {
    let mut ranked: Vec<(f64, &str)> = catalog
        .checkpoints()
        .iter()
        .map(|c| (haversine_distance(position, &c.location), c.id.as_str()))
        .collect();

    // sort_by is stable, so equal distances stay in catalog order
    ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
    ranked
        .into_iter()
        .take(max_count)
        .map(|(_, id)| id.to_string())
        .collect()
}

/// Compute which zones to start and stop for the given position.
pub fn select_zones(
    position: &GpsPoint,
    catalog: &Catalog,
    active: &HashSet<String>,
    max_count: usize,
    default_radius: f64,
) -> ZonePlan {
    let target = nearest_checkpoints(position, catalog, max_count);
    let target_set: HashSet<&str> = target.iter().map(String::as_str).collect();

    let mut to_stop: Vec<String> = active
        .iter()
        .filter(|id| !target_set.contains(id.as_str()))
        .cloned()
        .collect();
    to_stop.sort();

    let to_start = target
        .iter()
        .filter(|id| !active.contains(*id))
        .filter_map(|id| catalog.checkpoint(id))
        .map(|checkpoint| ZoneRequest {
            id: checkpoint.id.clone(),
            center: checkpoint.location,
            radius: catalog.monitoring_radius(&checkpoint.id, default_radius),
        })
        .collect();

    ZonePlan { to_start, to_stop }
}

/// Apply a plan to the monitor, keeping `active` in step with what the
/// platform actually watches.
///
/// Stops run before starts so the platform cap is never exceeded. A zone the
/// platform refuses is left out of `active` and retried on the next update.
pub fn reconcile<M>(plan: ZonePlan, monitor: &mut M, active: &mut HashSet<String>)
where
    M: ZoneMonitor + ?Sized,
{
    for id in plan.to_stop {
        if active.remove(&id) {
            monitor.unwatch(&id);
            debug!("[ZoneSelector] Stopped watching {}", id);
        }
    }

    for request in plan.to_start {
        if active.contains(&request.id) {
            continue;
        }
        match monitor.watch(&request.id, request.center, request.radius) {
            Ok(()) => {
                debug!(
                    "[ZoneSelector] Watching {} (r={:.0}m)",
                    request.id, request.radius
                );
                active.insert(request.id);
            }
            Err(e) => {
                warn!("[ZoneSelector] Could not watch {}: {}", request.id, e);
            }
        }
    }
}

/// Release every active zone.
pub fn release_all<M>(monitor: &mut M, active: &mut HashSet<String>)
where
    M: ZoneMonitor + ?Sized,
{
    let mut ids: Vec<String> = active.drain().collect();
    ids.sort();
    for id in ids {
        monitor.unwatch(&id);
    }
}
