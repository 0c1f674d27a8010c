//! Write-behind progress reporting
//!
//! Pipeline stages emit `(stage, percent)` at will; a background flusher
//! coalesces them so the store sees at most one write per interval per
//! job. Decoupling the pipeline from store latency keeps stage code free
//! of database awareness, and the final value is always flushed when the
//! tracker is dropped.

use crate::store::JobStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Minimum spacing between progress writes for one job
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Cheap cloneable handle the pipeline reports through
#[derive(Clone)]
pub struct ProgressTracker {
    tx: mpsc::UnboundedSender<(String, u8)>,
}

impl ProgressTracker {
    /// Record a progress observation (fire-and-forget).
    pub fn update(&self, stage: &str, percent: u8) {
        let _ = self.tx.send((stage.to_string(), percent));
    }

    /// A tracker whose updates go nowhere; for tests and inline paths
    /// that do not persist intermediate progress.
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }
}

/// Spawn the flusher for one job. The task exits after the last tracker
/// clone is dropped and the final update is written.
pub fn spawn_tracker(
    store: Arc<dyn JobStore>,
    job_id: Uuid,
    interval: Duration,
) -> (ProgressTracker, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, u8)>();

    let handle = tokio::spawn(async move {
        let mut pending: Option<(String, u8)> = None;
        let mut last_stage = String::new();
        let mut last_write = tokio::time::Instant::now() - interval;

        loop {
            let recv = tokio::time::timeout(interval, rx.recv()).await;
            match recv {
                Ok(Some(update)) => {
                    // Stage changes flush immediately; same-stage updates
                    // wait out the interval.
                    let stage_changed = update.0 != last_stage;
                    pending = Some(update);
                    if stage_changed || last_write.elapsed() >= interval {
                        flush(&store, job_id, &mut pending, &mut last_stage).await;
                        last_write = tokio::time::Instant::now();
                    }
                }
                Ok(None) => {
                    flush(&store, job_id, &mut pending, &mut last_stage).await;
                    break;
                }
                Err(_elapsed) => {
                    if pending.is_some() {
                        flush(&store, job_id, &mut pending, &mut last_stage).await;
                        last_write = tokio::time::Instant::now();
                    }
                }
            }
        }
        debug!(%job_id, "progress flusher stopped");
    });

    (ProgressTracker { tx }, handle)
}

async fn flush(
    store: &Arc<dyn JobStore>,
    job_id: Uuid,
    pending: &mut Option<(String, u8)>,
    last_stage: &mut String,
) {
    if let Some((stage, percent)) = pending.take() {
        if let Err(e) = store.update_progress(job_id, &stage, percent).await {
            warn!(%job_id, stage, percent, error = %e, "progress write failed");
        }
        *last_stage = stage;
    }
}
