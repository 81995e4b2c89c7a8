//! Geographic utilities: great-circle distance, forward bearing and
//! circular heading comparison.

use geo::{Bearing, Distance, Haversine, Point};

use crate::GpsPoint;

/// Great-circle distance between two points in meters.
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let point1 = Point::new(p1.longitude, p1.latitude);
    let point2 = Point::new(p2.longitude, p2.latitude);
    Haversine::distance(point1, point2)
}

/// Initial bearing from `from` to `to`, in degrees clockwise from north (0..360).
pub fn calculate_bearing(from: &GpsPoint, to: &GpsPoint) -> f64 {
    let origin = Point::new(from.longitude, from.latitude);
    let destination = Point::new(to.longitude, to.latitude);
    normalize_degrees(Haversine::bearing(origin, destination))
}

/// Wrap any angle into 0..360.
pub fn normalize_degrees(degrees: f64) -> f64 {
    let wrapped = degrees.rem_euclid(360.0);
    // rem_euclid can return 360.0 for tiny negative inputs
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Angular distance between two bearings along the shorter arc (0..=180).
pub fn bearing_difference(a: f64, b: f64) -> f64 {
    let diff = (normalize_degrees(a) - normalize_degrees(b)).abs();
    if diff > 180.0 {
        360.0 - diff
    } else {
        diff
    }
}

/// Whether `heading` lies within `tolerance` degrees of `expected`.
pub fn heading_within(heading: f64, expected: f64, tolerance: f64) -> bool {
    bearing_difference(heading, expected) <= tolerance
}
