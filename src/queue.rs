//! # Retry Queue
//!
//! Durable FIFO of pending speed reports with single-flight delivery.
//!
//! - Only the head record is ever uploaded, and only one upload runs at a
//!   time. A record leaves the queue only after the backend acknowledged it.
//! - A failed (or timed-out) upload schedules a retry after an exponential
//!   backoff: `base_delay`, doubled per consecutive failure, capped at
//!   `max_delay`. A success resets the delay.
//! - `flush` is triggered by `enqueue`, by the retry timer and by
//!   connectivity coming back. It is a no-op while an upload is running or
//!   when the queue is empty.
//! - Every enqueue and every successful removal persists a full snapshot via
//!   [`QueueStore`].

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{AvgSpeedError, Result};
use crate::persistence::QueueStore;
use crate::report::AvgSpeedReport;

/// Delivers one report to the backend. Any error is a delivery failure.
pub trait ReportUploader: Send + Sync {
    fn upload<'a>(&'a self, report: &'a AvgSpeedReport) -> BoxFuture<'a, Result<()>>;
}

// ============================================================================
// Configuration
// ============================================================================

/// Retry and timeout settings for report delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// First retry delay after a failure, in milliseconds.
    /// Default: 2000
    pub base_delay_ms: u64,

    /// Upper bound for the retry delay, in milliseconds.
    /// Default: 300000 (5 minutes)
    pub max_delay_ms: u64,

    /// Deadline for a single upload attempt, in milliseconds.
    /// Default: 15000
    pub upload_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            max_delay_ms: 300_000,
            upload_timeout_ms: 15_000,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_delay_ms == 0 {
            return Err(AvgSpeedError::Config {
                message: "base_delay_ms must be positive".to_string(),
            });
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(AvgSpeedError::Config {
                message: format!(
                    "max_delay_ms ({}) is below base_delay_ms ({})",
                    self.max_delay_ms, self.base_delay_ms
                ),
            });
        }
        if self.upload_timeout_ms == 0 {
            return Err(AvgSpeedError::Config {
                message: "upload_timeout_ms must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Exponential backoff: base, 2×base, 4×base, … capped at max.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let base = base.min(max);
        Self {
            base,
            max,
            current: base,
        }
    }

    /// Delay to wait after the next failure.
    pub fn peek(&self) -> Duration {
        self.current
    }

    /// Consume a failure: return its delay and double the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

// ============================================================================
// Queue
// ============================================================================

struct QueueState {
    records: VecDeque<AvgSpeedReport>,
    uploading: bool,
    stopped: bool,
    backoff: Backoff,
    retry_timer: Option<JoinHandle<()>>,
}

struct Inner {
    state: Mutex<QueueState>,
    uploader: Arc<dyn ReportUploader>,
    store: QueueStore,
    config: RetryConfig,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // State transitions never panic mid-way, so a poisoned lock is still consistent
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cloneable handle to the retry queue.
#[derive(Clone)]
pub struct RetryQueue {
    inner: Arc<Inner>,
}

impl RetryQueue {
    /// Open the queue backed by `path`, rehydrating any persisted records,
    /// and start delivering them.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(
        path: impl Into<PathBuf>,
        uploader: Arc<dyn ReportUploader>,
        config: RetryConfig,
    ) -> Self {
        let store = QueueStore::open(path);
        let records: VecDeque<AvgSpeedReport> = store.load().into();
        if !records.is_empty() {
            info!("[RetryQueue] Rehydrated {} pending reports", records.len());
        }

        let queue = Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    records,
                    uploading: false,
                    stopped: false,
                    backoff: Backoff::new(config.base_delay(), config.max_delay()),
                    retry_timer: None,
                }),
                uploader,
                store,
                config,
            }),
        };
        queue.flush();
        queue
    }

    /// Append a report, persist the new snapshot and trigger delivery.
    pub fn enqueue(&self, report: AvgSpeedReport) {
        {
            let mut state = self.inner.lock();
            debug!(
                "[RetryQueue] Enqueued '{}' ({} pending)",
                report.segment_name,
                state.records.len() + 1
            );
            state.records.push_back(report);
            // Sent under the lock so snapshots reach the writer in order
            self.inner.store.save(state.records.iter().cloned().collect());
        }
        self.flush();
    }

    /// Try to deliver the head record. Returns immediately.
    pub fn flush(&self) {
        let report = {
            let mut state = self.inner.lock();
            if state.stopped || state.uploading {
                return;
            }
            let Some(head) = state.records.front().cloned() else {
                return;
            };
            state.uploading = true;
            head
        };

        tokio::spawn(upload_head(Arc::clone(&self.inner), report));
    }

    /// Connectivity came back: try to deliver right away.
    pub fn on_connectivity_restored(&self) {
        info!("[RetryQueue] Connectivity restored");
        self.flush();
    }

    /// Flush whenever `online` flips from false to true.
    ///
    /// The task ends when the sender is dropped or the queue is gone.
    pub fn watch_connectivity(&self, mut online: watch::Receiver<bool>) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut was_online = *online.borrow_and_update();
            while online.changed().await.is_ok() {
                let is_online = *online.borrow_and_update();
                if is_online && !was_online {
                    match weak.upgrade() {
                        Some(inner) => RetryQueue { inner }.on_connectivity_restored(),
                        None => break,
                    }
                }
                was_online = is_online;
            }
        })
    }

    /// Stop delivering. Pending records stay persisted; a retry timer that
    /// still fires becomes a no-op.
    pub fn shutdown(&self) {
        let mut state = self.inner.lock();
        state.stopped = true;
        if let Some(timer) = state.retry_timer.take() {
            timer.abort();
        }
        info!(
            "[RetryQueue] Shut down with {} pending reports",
            state.records.len()
        );
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// Snapshot of pending records in delivery order.
    pub fn pending(&self) -> Vec<AvgSpeedReport> {
        self.inner.lock().records.iter().cloned().collect()
    }

    pub fn is_uploading(&self) -> bool {
        self.inner.lock().uploading
    }

    /// Delay that the next failure would schedule.
    pub fn current_backoff(&self) -> Duration {
        self.inner.lock().backoff.peek()
    }

    pub fn config(&self) -> &RetryConfig {
        &self.inner.config
    }

    /// Wait until every snapshot written so far has reached the disk.
    pub async fn persisted(&self) {
        self.inner.store.persisted().await;
    }
}

async fn upload_head(inner: Arc<Inner>, report: AvgSpeedReport) {
    let timeout = inner.config.upload_timeout();
    let result = match tokio::time::timeout(timeout, inner.uploader.upload(&report)).await {
        Ok(result) => result,
        Err(_) => Err(AvgSpeedError::Timeout {
            seconds: timeout.as_secs_f64(),
        }),
    };

    match result {
        Ok(()) => {
            let remaining = {
                let mut state = inner.lock();
                // Single-flight: nothing else removes records, so the head is still `report`
                state.records.pop_front();
                state.uploading = false;
                state.backoff.reset();
                if let Some(timer) = state.retry_timer.take() {
                    timer.abort();
                }
                inner.store.save(state.records.iter().cloned().collect());
                state.records.len()
            };
            info!(
                "[RetryQueue] Delivered '{}' ({} pending)",
                report.segment_name, remaining
            );
            RetryQueue { inner }.flush();
        }
        Err(e) => {
            let mut state = inner.lock();
            state.uploading = false;
            if state.stopped {
                return;
            }
            let delay = state.backoff.next_delay();
            warn!(
                "[RetryQueue] Upload of '{}' failed: {}; retrying in {:?}",
                report.segment_name, e, delay
            );
            if let Some(timer) = state.retry_timer.take() {
                timer.abort();
            }
            state.retry_timer = Some(tokio::spawn(retry_after(Arc::downgrade(&inner), delay)));
        }
    }
}

async fn retry_after(inner: Weak<Inner>, delay: Duration) {
    tokio::time::sleep(delay).await;
    if let Some(inner) = inner.upgrade() {
        debug!("[RetryQueue] Retry timer fired");
        RetryQueue { inner }.flush();
    }
}
