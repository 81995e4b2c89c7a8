//! Measurements and the upload records built from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::distance::validate_distance;
use crate::error::{AvgSpeedError, Result};
use crate::passage::{duration_secs, ClosedPassage};

/// Conversion factor from m/s to km/h.
const MPS_TO_KMH: f64 = 3.6;

/// A completed average-speed measurement over one segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub segment_name: String,
    pub start_checkpoint_id: String,
    pub end_checkpoint_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Route distance in meters
    pub distance_meters: f64,
    /// Average speed in km/h
    pub avg_speed_kmh: f64,
}

impl Measurement {
    /// Build a measurement from a closed passage and its route distance.
    ///
    /// Fails if the distance is unusable or the duration is not positive.
    pub fn from_passage(passage: &ClosedPassage, distance_meters: f64) -> Result<Self> {
        let distance_meters = validate_distance(distance_meters)?;
        let seconds = passage.duration_secs();
        if !(seconds.is_finite() && seconds > 0.0) {
            return Err(AvgSpeedError::Measurement {
                message: format!("non-positive duration {}s for '{}'", seconds, passage.segment.name),
            });
        }
        Ok(Self {
            segment_name: passage.segment.name.clone(),
            start_checkpoint_id: passage.segment.start.id.clone(),
            end_checkpoint_id: passage.segment.end.id.clone(),
            started_at: passage.started_at,
            ended_at: passage.ended_at,
            distance_meters,
            avg_speed_kmh: average_speed_kmh(distance_meters, seconds),
        })
    }

    pub fn duration_secs(&self) -> f64 {
        duration_secs(self.ended_at - self.started_at)
    }
}

/// Average speed in km/h for a distance covered in `seconds`.
///
/// `seconds` must be positive; [`Measurement::from_passage`] checks it.
pub fn average_speed_kmh(distance_meters: f64, seconds: f64) -> f64 {
    distance_meters / seconds * MPS_TO_KMH
}

/// Client identification attached to every upload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientMetadata {
    pub app_version: String,
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Payload of `POST /v1/traffic/avg-speed-report`, also the on-disk queue
/// record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvgSpeedReport {
    pub segment_name: String,
    pub start_camera_id: String,
    pub end_camera_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub route_distance_meters: f64,
    #[serde(rename = "avgSpeedKmH")]
    pub avg_speed_kmh: f64,
    pub app_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl AvgSpeedReport {
    pub fn new(measurement: &Measurement, metadata: &ClientMetadata) -> Self {
        Self {
            segment_name: measurement.segment_name.clone(),
            start_camera_id: measurement.start_checkpoint_id.clone(),
            end_camera_id: measurement.end_checkpoint_id.clone(),
            started_at: measurement.started_at,
            ended_at: measurement.ended_at,
            route_distance_meters: measurement.distance_meters,
            avg_speed_kmh: measurement.avg_speed_kmh,
            app_version: metadata.app_version.clone(),
            device_id: metadata.device_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Checkpoint, Segment};
    use crate::GpsPoint;

    fn passage(seconds: i64) -> ClosedPassage {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        ClosedPassage {
            segment: Segment {
                name: "A→C".to_string(),
                start: Checkpoint {
                    id: "SOF-A1".to_string(),
                    location: GpsPoint::new(42.6281, 23.3711),
                    heading: None,
                },
                end: Checkpoint {
                    id: "SOF-C1".to_string(),
                    location: GpsPoint::new(42.6321, 23.3791),
                    heading: None,
                },
                geofence_radius: 50.0,
            },
            started_at: start,
            ended_at: start + chrono::Duration::seconds(seconds),
        }
    }

    #[test]
    fn test_kilometer_in_a_minute_is_sixty_kmh() {
        let m = Measurement::from_passage(&passage(60), 1000.0).unwrap();
        assert!((m.avg_speed_kmh - 60.0).abs() < 1e-9);
        assert_eq!(m.duration_secs(), 60.0);
    }

    #[test]
    fn test_unusable_distance_rejected() {
        assert!(Measurement::from_passage(&passage(60), 0.0).is_err());
    }

    #[test]
    fn test_zero_duration_rejected() {
        assert!(matches!(
            Measurement::from_passage(&passage(0), 1000.0),
            Err(AvgSpeedError::Measurement { .. })
        ));
    }

    #[test]
    fn test_sub_millisecond_passage_has_real_speed() {
        let mut short = passage(0);
        short.ended_at = short.started_at + chrono::Duration::microseconds(500);
        let m = Measurement::from_passage(&short, 1.0).unwrap();
        assert!((m.duration_secs() - 0.0005).abs() < 1e-12);
        assert!((m.avg_speed_kmh - 7200.0).abs() < 1e-6);
    }

    #[test]
    fn test_report_wire_format() {
        let m = Measurement::from_passage(&passage(60), 1000.0).unwrap();
        let report = AvgSpeedReport::new(
            &m,
            &ClientMetadata {
                app_version: "1.2.0".to_string(),
                device_id: None,
            },
        );
        let json: serde_json::Value = serde_json::to_value(&report).unwrap();
        assert_eq!(json["segmentName"], "A→C");
        assert_eq!(json["startCameraId"], "SOF-A1");
        assert_eq!(json["endCameraId"], "SOF-C1");
        assert_eq!(json["startedAt"], "2023-11-14T22:13:20Z");
        assert!((json["avgSpeedKmH"].as_f64().unwrap() - 60.0).abs() < 1e-9);
        assert_eq!(json["routeDistanceMeters"], 1000.0);
        assert_eq!(json["appVersion"], "1.2.0");
        assert!(json.get("deviceId").is_none());
    }
}
