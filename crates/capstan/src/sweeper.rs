//! Expired-lease sweeper
//!
//! Runs every `sweep_interval` and returns jobs whose lease deadline
//! passed to the ready set. Jobs that already spent their attempt budget
//! fail with `exhausted_retries` instead of cycling forever.

use crate::store::JobStore;
use crate::QueueConfig;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Sweeper {
    store: Arc<dyn JobStore>,
    config: QueueConfig,
    shutdown: CancellationToken,
}

impl Sweeper {
    pub fn new(store: Arc<dyn JobStore>, config: QueueConfig, shutdown: CancellationToken) -> Self {
        Self {
            store,
            config,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(self) {
        info!(
            interval_s = self.config.sweep_interval.as_secs(),
            max_attempts = self.config.max_attempts,
            "lease sweeper started"
        );
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.store.requeue_expired(self.config.max_attempts).await {
                        Ok(report) => {
                            if !report.requeued.is_empty() || !report.exhausted.is_empty() {
                                info!(
                                    requeued = report.requeued.len(),
                                    exhausted = report.exhausted.len(),
                                    "reclaimed expired leases"
                                );
                            } else {
                                debug!("sweep pass found no expired leases");
                            }
                        }
                        Err(e) => warn!(error = %e, "sweep pass failed"),
                    }
                }
                _ = self.shutdown.cancelled() => {
                    info!("lease sweeper stopping");
                    break;
                }
            }
        }
    }
}
