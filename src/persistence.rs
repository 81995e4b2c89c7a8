//! # Queue Store
//!
//! Durable snapshot of the pending upload list.
//!
//! The whole list is stored as one JSON array and rewritten on every
//! mutation. Writes are handed to a single writer task through an ordered
//! channel: callers never wait for the disk and two writes never interleave.
//! Each write goes to `<file>.tmp` first and is then renamed over the target.

use std::path::{Path, PathBuf};

use log::{debug, error, warn};
use tokio::sync::{mpsc, oneshot};

use crate::error::Result;
use crate::report::AvgSpeedReport;

enum WriterCommand {
    Save(Vec<AvgSpeedReport>),
    Barrier(oneshot::Sender<()>),
}

/// Handle to the persisted queue file.
#[derive(Debug, Clone)]
pub struct QueueStore {
    path: PathBuf,
    writer: mpsc::UnboundedSender<WriterCommand>,
}

impl std::fmt::Debug for WriterCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriterCommand::Save(records) => write!(f, "Save({} records)", records.len()),
            WriterCommand::Barrier(_) => write!(f, "Barrier"),
        }
    }
}

impl QueueStore {
    /// Open the store and spawn its writer task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(path.clone(), rx));
        Self { path, writer: tx }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted list. Missing or corrupt files yield an empty list.
    pub fn load(&self) -> Vec<AvgSpeedReport> {
        load_records(&self.path)
    }

    /// Schedule a full snapshot write. Returns immediately.
    pub fn save(&self, records: Vec<AvgSpeedReport>) {
        if self.writer.send(WriterCommand::Save(records)).is_err() {
            warn!("[QueueStore] Writer task gone, snapshot not persisted");
        }
    }

    /// Wait until every snapshot scheduled before this call has been written
    /// (or has failed).
    pub async fn persisted(&self) {
        let (tx, rx) = oneshot::channel();
        if self.writer.send(WriterCommand::Barrier(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Read a queue file synchronously.
pub fn load_records(path: &Path) -> Vec<AvgSpeedReport> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!("[QueueStore] Could not read {:?}: {}", path, e);
            return Vec::new();
        }
    };

    match serde_json::from_slice::<Vec<AvgSpeedReport>>(&bytes) {
        Ok(records) => {
            debug!("[QueueStore] Rehydrated {} records from {:?}", records.len(), path);
            records
        }
        Err(e) => {
            warn!("[QueueStore] Discarding unreadable queue file {:?}: {}", path, e);
            Vec::new()
        }
    }
}

/// Write a snapshot atomically via a temp file.
pub async fn write_records(path: &Path, records: &[AvgSpeedReport]) -> Result<()> {
    let json = serde_json::to_vec(records)?;
    let temp_path = path.with_extension("tmp");
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&temp_path, json).await?;
    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}

async fn run_writer(path: PathBuf, mut rx: mpsc::UnboundedReceiver<WriterCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Save(mut records) => {
                // Only the newest pending snapshot matters
                let mut barriers = Vec::new();
                while let Ok(next) = rx.try_recv() {
                    match next {
                        WriterCommand::Save(newer) => records = newer,
                        WriterCommand::Barrier(tx) => {
                            barriers.push(tx);
                            break;
                        }
                    }
                }

                match write_records(&path, &records).await {
                    Ok(()) => debug!("[QueueStore] Saved {} records", records.len()),
                    Err(e) => error!("[QueueStore] Failed to save {:?}: {}", path, e),
                }

                for tx in barriers {
                    let _ = tx.send(());
                }
            }
            WriterCommand::Barrier(tx) => {
                let _ = tx.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use tempfile::TempDir;

    fn report(name: &str) -> AvgSpeedReport {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        AvgSpeedReport {
            segment_name: name.to_string(),
            start_camera_id: "A".to_string(),
            end_camera_id: "B".to_string(),
            started_at: start,
            ended_at: start + chrono::Duration::seconds(60),
            route_distance_meters: 1000.0,
            avg_speed_kmh: 60.0,
            app_version: "1.0.0".to_string(),
            device_id: Some("device-1".to_string()),
        }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(load_records(&dir.path().join("absent.json")).is_empty());
    }

    #[test]
    fn test_corrupt_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(load_records(&path).is_empty());
    }

    #[tokio::test]
    async fn test_round_trip_preserves_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");
        let records: Vec<AvgSpeedReport> = (0..5).map(|i| report(&format!("seg-{}", i))).collect();

        let store = QueueStore::open(&path);
        store.save(records.clone());
        store.persisted().await;

        assert_eq!(load_records(&path), records);
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_write_under_regular_file_fails() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();

        let result = write_records(&blocker.join("queue.json"), &[report("a")]).await;
        assert!(matches!(result, Err(crate::error::AvgSpeedError::Persistence { .. })));
    }

    #[tokio::test]
    async fn test_last_snapshot_wins() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");
        let store = QueueStore::open(&path);

        store.save(vec![report("a")]);
        store.save(vec![report("a"), report("b")]);
        store.save(vec![report("b")]);
        store.persisted().await;

        assert_eq!(store.load(), vec![report("b")]);
    }
}
