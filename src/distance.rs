//! Route distance between two checkpoints.
//!
//! The platform usually offers a road-network distance; when it fails the
//! great-circle distance is used instead.

use futures::future::BoxFuture;
use log::debug;

use crate::error::{AvgSpeedError, Result};
use crate::geo_utils::haversine_distance;
use crate::GpsPoint;

/// Distance lookup between two coordinates, in meters.
pub trait DistanceProvider: Send + Sync {
    fn route_distance(&self, from: GpsPoint, to: GpsPoint) -> BoxFuture<'_, Result<f64>>;
}

/// Great-circle distance. Never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct StraightLineDistance;

impl DistanceProvider for StraightLineDistance {
    fn route_distance(&self, from: GpsPoint, to: GpsPoint) -> BoxFuture<'_, Result<f64>> {
        Box::pin(async move { Ok(haversine_distance(&from, &to)) })
    }
}

/// Wraps a route provider and falls back to the straight-line distance when
/// it errors or returns a non-positive/non-finite value.
#[derive(Debug, Clone)]
pub struct WithStraightLineFallback<P> {
    primary: P,
}

impl<P> WithStraightLineFallback<P> {
    pub fn new(primary: P) -> Self {
        Self { primary }
    }
}

impl<P: DistanceProvider> DistanceProvider for WithStraightLineFallback<P> {
    fn route_distance(&self, from: GpsPoint, to: GpsPoint) -> BoxFuture<'_, Result<f64>> {
        Box::pin(async move {
            match self.primary.route_distance(from, to).await {
                Ok(meters) if meters.is_finite() && meters > 0.0 => Ok(meters),
                Ok(meters) => {
                    debug!("[Distance] Route distance {} unusable, using straight line", meters);
                    Ok(haversine_distance(&from, &to))
                }
                Err(e) => {
                    debug!("[Distance] Route lookup failed ({}), using straight line", e);
                    Ok(haversine_distance(&from, &to))
                }
            }
        })
    }
}

/// Check a distance before it is used for a speed computation.
pub(crate) fn validate_distance(meters: f64) -> Result<f64> {
    if meters.is_finite() && meters > 0.0 {
        Ok(meters)
    } else {
        Err(AvgSpeedError::Distance {
            message: format!("unusable distance {}", meters),
        })
    }
}
