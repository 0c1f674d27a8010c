//! Webhook delivery for terminal job states
//!
//! At-least-once: the payload leads with `job_id` so receivers can
//! deduplicate. Delivery failures never touch the job record.

use crate::{CallbackConfig, JobError, JobState};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Body POSTed to the caller-supplied `callback_url`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub job_id: Uuid,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

/// Delivery counters exposed to the metrics surface
#[derive(Debug, Default)]
pub struct CallbackStats {
    pub delivered: AtomicU64,
    pub failed: AtomicU64,
}

/// Retrying webhook sender
#[derive(Clone)]
pub struct CallbackSender {
    client: reqwest::Client,
    config: CallbackConfig,
    stats: Arc<CallbackStats>,
}

impl CallbackSender {
    pub fn new(config: CallbackConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            stats: Arc::new(CallbackStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<CallbackStats> {
        Arc::clone(&self.stats)
    }

    /// Deliver with exponential backoff; gives up after
    /// `config.max_attempts` tries.
    pub async fn deliver(&self, url: &str, payload: &CallbackPayload) {
        let mut delay = self.config.backoff_base;
        for attempt in 1..=self.config.max_attempts {
            match self.client.post(url).json(payload).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(job_id = %payload.job_id, url, attempt, "callback delivered");
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Ok(resp) => {
                    warn!(
                        job_id = %payload.job_id,
                        url,
                        attempt,
                        status = %resp.status(),
                        "callback rejected"
                    );
                }
                Err(e) => {
                    warn!(job_id = %payload.job_id, url, attempt, error = %e, "callback send failed");
                }
            }
            if attempt < self.config.max_attempts {
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Fire-and-forget variant used by the dispatcher after an ack.
    pub fn deliver_detached(&self, url: String, payload: CallbackPayload) {
        let sender = self.clone();
        tokio::spawn(async move {
            sender.deliver(&url, &payload).await;
        });
    }
}
