//! Administrative endpoints: metrics, realtime stats, retention cleanup

use crate::envelope::ok;
use crate::error::{ApiError, ApiResult};
use crate::middleware::RequestId;
use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use capstan::JobState;
use chrono::Utc;
use serde::Deserialize;
use std::time::Duration;

const STATS_WINDOW: Duration = Duration::from_secs(24 * 3600);

/// `GET /admin/metrics`: store aggregates plus process counters.
pub async fn metrics(
    State(state): State<AppState>,
    RequestId(request_id): RequestId,
) -> ApiResult {
    let store_stats = state
        .store
        .stats(STATS_WINDOW)
        .await
        .map_err(|e| ApiError::from_store(request_id, e))?;

    Ok(ok(
        request_id,
        serde_json::json!({
            "store": store_stats,
            "process": state.metrics.snapshot(),
        }),
    ))
}

/// `GET /admin/stats/real-time`
pub async fn realtime_stats(
    State(state): State<AppState>,
    RequestId(request_id): RequestId,
) -> ApiResult {
    // Window back to UTC midnight gives "today" aggregates.
    let now = Utc::now();
    let midnight = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .unwrap_or_default()
        .and_utc();
    let since_midnight = (now - midnight).to_std().unwrap_or_default();

    let stats = state
        .store
        .stats(since_midnight)
        .await
        .map_err(|e| ApiError::from_store(request_id, e))?;

    let count = |key: &str| stats.by_state.get(key).copied().unwrap_or(0);
    Ok(ok(
        request_id,
        serde_json::json!({
            "processing": count("running") + count("leased"),
            "queued": count("queued") + count("pending"),
            "completed_today": stats.completed_in_window,
            "failed_today": stats.failed_in_window,
            "success_rate": stats.success_rate,
            "avg_duration_ms": stats.avg_duration_ms,
        }),
    ))
}

#[derive(Debug, Deserialize, Default)]
pub struct CleanupRequest {
    /// Jobs older than this many days are removed; defaults to the
    /// configured retention.
    pub days: Option<u32>,
}

/// `POST /admin/cleanup`: bulk-delete terminal jobs and their blobs.
pub async fn cleanup(
    State(state): State<AppState>,
    RequestId(request_id): RequestId,
    body: Option<Json<CleanupRequest>>,
) -> ApiResult {
    let days = body
        .map(|Json(req)| req.days)
        .unwrap_or(None)
        .unwrap_or(state.config.retention_days);
    let older_than = Utc::now() - chrono::Duration::days(days as i64);

    let report = state
        .store
        .cleanup(
            older_than,
            &[JobState::Completed, JobState::Failed, JobState::Cancelled],
        )
        .await
        .map_err(|e| ApiError::from_store(request_id, e))?;

    for handle in &report.blob_handles {
        if let Err(e) = state.blobs.delete(handle).await {
            tracing::warn!(handle, error = %e, "blob removal failed during cleanup");
        }
    }

    tracing::info!(deleted = report.deleted, days, "retention cleanup finished");
    Ok(ok(
        request_id,
        serde_json::json!({ "deleted": report.deleted, "older_than_days": days }),
    ))
}
