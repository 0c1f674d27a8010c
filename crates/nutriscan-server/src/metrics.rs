//! Process-scoped metrics service
//!
//! Cheap atomic counters for the request path, merged with job-store
//! aggregates by the admin endpoints. Created once at startup and
//! injected through [`crate::state::AppState`].

use capstan::CallbackStats;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct Metrics {
    pub started_at: DateTime<Utc>,
    requests_total: AtomicU64,
    rate_limited_total: AtomicU64,
    jobs_submitted_total: AtomicU64,
    sync_parses_total: AtomicU64,
    callback_stats: Arc<CallbackStats>,
}

impl Metrics {
    pub fn new(callback_stats: Arc<CallbackStats>) -> Self {
        Self {
            started_at: Utc::now(),
            requests_total: AtomicU64::new(0),
            rate_limited_total: AtomicU64::new(0),
            jobs_submitted_total: AtomicU64::new(0),
            sync_parses_total: AtomicU64::new(0),
            callback_stats,
        }
    }

    pub fn inc_requests(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rate_limited(&self) {
        self.rate_limited_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_jobs_submitted(&self) {
        self.jobs_submitted_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sync_parses(&self) {
        self.sync_parses_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Counter snapshot for the metrics endpoint.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "uptime_seconds": (Utc::now() - self.started_at).num_seconds(),
            "requests_total": self.requests_total.load(Ordering::Relaxed),
            "rate_limited_total": self.rate_limited_total.load(Ordering::Relaxed),
            "jobs_submitted_total": self.jobs_submitted_total.load(Ordering::Relaxed),
            "sync_parses_total": self.sync_parses_total.load(Ordering::Relaxed),
            "callbacks_delivered_total": self.callback_stats.delivered.load(Ordering::Relaxed),
            "callbacks_failed_total": self.callback_stats.failed.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new(Arc::new(CallbackStats::default()));
        metrics.inc_requests();
        metrics.inc_requests();
        metrics.inc_jobs_submitted();

        let snap = metrics.snapshot();
        assert_eq!(snap["requests_total"], 2);
        assert_eq!(snap["jobs_submitted_total"], 1);
        assert_eq!(snap["rate_limited_total"], 0);
    }
}
