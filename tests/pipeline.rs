//! End-to-end pipeline tests.
//!
//! Catalog refresh -> zone selection -> passage -> measurement -> durable
//! delivery, driven only through the public API with in-memory fakes for the
//! platform and the backend.
//!
//! Run with: `cargo test --test pipeline`

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use avg_speed::{
    AvgSpeedError, AvgSpeedReport, CameraDto, CatalogSource, ClientMetadata, DistanceProvider,
    EngineConfig, EngineEvent, GpsPoint, ReportUploader, Result, RetryConfig, RetryQueue,
    SegmentDto, SpeedEngine, WithStraightLineFallback, ZoneMonitor,
};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};

// ============================================================================
// Fakes
// ============================================================================

#[derive(Default)]
struct PlatformZones {
    watched: HashSet<String>,
}

impl ZoneMonitor for PlatformZones {
    fn watch(&mut self, id: &str, _center: GpsPoint, _radius_meters: f64) -> Result<()> {
        self.watched.insert(id.to_string());
        Ok(())
    }

    fn unwatch(&mut self, id: &str) {
        self.watched.remove(id);
    }
}

/// Backend that serves a fixed catalog and accepts reports while online.
#[derive(Default)]
struct FakeBackend {
    online: AtomicBool,
    delivered: Mutex<Vec<AvgSpeedReport>>,
}

impl FakeBackend {
    fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn delivered(&self) -> Vec<AvgSpeedReport> {
        self.delivered.lock().unwrap().clone()
    }
}

impl CatalogSource for FakeBackend {
    fn fetch_cameras(&self) -> BoxFuture<'_, Result<Vec<CameraDto>>> {
        Box::pin(async {
            Ok(vec![
                CameraDto { id: "S".into(), lat: 42.6510, lng: 23.3640, direction: None },
                CameraDto { id: "E".into(), lat: 42.6660, lng: 23.3210, direction: None },
                CameraDto { id: "FAR".into(), lat: 43.2141, lng: 27.9147, direction: None },
            ])
        })
    }

    fn fetch_segments(&self) -> BoxFuture<'_, Result<Vec<SegmentDto>>> {
        Box::pin(async {
            Ok(vec![SegmentDto {
                name: "Tsarigradsko".into(),
                start_camera_id: "S".into(),
                end_camera_id: "E".into(),
                geofence_radius: None,
            }])
        })
    }
}

impl ReportUploader for FakeBackend {
    fn upload<'a>(&'a self, report: &'a AvgSpeedReport) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if !self.online.load(Ordering::SeqCst) {
                return Err(AvgSpeedError::http("network unreachable"));
            }
            self.delivered.lock().unwrap().push(report.clone());
            Ok(())
        })
    }
}

/// Route service that is always down.
struct NoRoutes;

impl DistanceProvider for NoRoutes {
    fn route_distance(&self, _from: GpsPoint, _to: GpsPoint) -> BoxFuture<'_, Result<f64>> {
        Box::pin(async {
            Err(AvgSpeedError::Distance {
                message: "routing unavailable".into(),
            })
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn t(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

fn slow_retry() -> RetryConfig {
    RetryConfig {
        base_delay_ms: 600_000,
        max_delay_ms: 600_000,
        upload_timeout_ms: 5_000,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn new_engine(queue: RetryQueue) -> SpeedEngine<PlatformZones> {
    SpeedEngine::new(
        EngineConfig::default(),
        PlatformZones::default(),
        Arc::new(WithStraightLineFallback::new(NoRoutes)),
        queue,
        ClientMetadata {
            app_version: "2.1.0".into(),
            device_id: None,
        },
    )
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_offline_measurement_survives_restart_and_is_delivered() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let queue_path = dir.path().join("avg_speed_queue.json");
    let backend = Arc::new(FakeBackend::default());

    {
        let queue = RetryQueue::open(&queue_path, backend.clone(), slow_retry());
        let mut engine = new_engine(queue.clone());
        engine.refresh_catalog(backend.as_ref()).await.unwrap();

        engine.update_location(GpsPoint::new(42.6500, 23.3660), Some(300.0));
        assert!(engine.active_zones().contains(&"S".to_string()));

        engine.on_zone_entered("S", t(0)).await;
        let measurements = engine.on_zone_entered("E", t(240)).await;
        assert_eq!(measurements.len(), 1);

        // Straight-line fallback: ~3.9 km in 4 minutes
        let m = &measurements[0];
        assert!((m.distance_meters - 3892.0).abs() < 20.0, "distance {}", m.distance_meters);
        assert!((m.avg_speed_kmh - 58.4).abs() < 0.5, "speed {}", m.avg_speed_kmh);

        wait_until(|| !queue.is_uploading()).await;
        assert_eq!(queue.pending_count(), 1);
        queue.persisted().await;
        engine.stop();
        queue.shutdown();
    }

    assert!(backend.delivered().is_empty());
    backend.set_online(true);

    let queue = RetryQueue::open(&queue_path, backend.clone(), slow_retry());
    wait_until(|| queue.pending_count() == 0).await;

    let delivered = backend.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].segment_name, "Tsarigradsko");
    assert_eq!(delivered[0].app_version, "2.1.0");

    queue.persisted().await;
    let on_disk: Vec<AvgSpeedReport> =
        serde_json::from_slice(&std::fs::read(&queue_path).unwrap()).unwrap();
    assert!(on_disk.is_empty());
}

#[tokio::test]
async fn test_connectivity_change_flushes_backlog() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(FakeBackend::default());
    let queue = RetryQueue::open(dir.path().join("queue.json"), backend.clone(), slow_retry());
    let (online_tx, online_rx) = watch::channel(false);
    let _watcher = queue.watch_connectivity(online_rx);

    let mut engine = new_engine(queue.clone());
    engine.refresh_catalog(backend.as_ref()).await.unwrap();

    for lap in 0..3 {
        let base = lap * 1_000;
        engine.on_zone_entered("S", t(base)).await;
        engine.on_zone_entered("E", t(base + 300)).await;
        wait_until(|| !queue.is_uploading()).await;
    }
    assert_eq!(queue.pending_count(), 3);

    backend.set_online(true);
    online_tx.send(true).unwrap();
    wait_until(|| queue.pending_count() == 0).await;

    // FIFO order preserved
    let starts: Vec<DateTime<Utc>> = backend.delivered().iter().map(|r| r.started_at).collect();
    assert_eq!(starts, vec![t(0), t(1_000), t(2_000)]);
}

#[tokio::test]
async fn test_event_pump_with_wrong_way_passage() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(FakeBackend::default());
    backend.set_online(true);
    let queue = RetryQueue::open(dir.path().join("queue.json"), backend.clone(), slow_retry());

    let mut engine = new_engine(queue.clone());
    engine.refresh_catalog(backend.as_ref()).await.unwrap();
    let mut results = engine.subscribe();

    let (tx, rx) = mpsc::channel(16);
    let pump = tokio::spawn(engine.run(rx));

    // Heading the opposite way: start is rejected
    tx.send(EngineEvent::Heading(115.0)).await.unwrap();
    tx.send(EngineEvent::ZoneEntered { checkpoint_id: "S".into(), at: t(0) }).await.unwrap();
    tx.send(EngineEvent::ZoneEntered { checkpoint_id: "E".into(), at: t(200) }).await.unwrap();

    // Right way round
    tx.send(EngineEvent::Heading(290.0)).await.unwrap();
    tx.send(EngineEvent::ZoneEntered { checkpoint_id: "S".into(), at: t(1_000) }).await.unwrap();
    tx.send(EngineEvent::ZoneEntered { checkpoint_id: "E".into(), at: t(1_200) }).await.unwrap();
    drop(tx);

    let engine = pump.await.unwrap();
    let m = results.recv().await.unwrap();
    assert_eq!(m.started_at, t(1_000));
    assert!(results.try_recv().is_err());
    assert_eq!(engine.stats().measurement_count, 1);
    assert_eq!(engine.open_passage_count(), 0);

    wait_until(|| queue.pending_count() == 0).await;
    assert_eq!(backend.delivered().len(), 1);
}
