//! Job read and lifecycle endpoints: status, result, history, batch,
//! delete, cancel

use crate::envelope::{accepted, ok, respond};
use crate::error::{ApiError, ApiResult};
use crate::middleware::RequestId;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use capstan::{CancelOutcome, Job, JobFilter, JobState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Listing row: the full record minus the (potentially large) result body
#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Uuid>,
    pub filename: String,
    pub size_bytes: u64,
    pub parsing_type: String,
    pub priority: String,
    pub state: String,
    pub progress: u8,
    pub stage: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            batch_id: job.batch_id,
            filename: job.filename.clone(),
            size_bytes: job.size_bytes,
            parsing_type: job.parsing_type.clone(),
            priority: job.priority.to_string(),
            state: job.state.to_string(),
            progress: job.progress,
            stage: job.stage.clone(),
            attempts: job.attempts,
            created_at: job.created_at,
            updated_at: job.updated_at,
            finished_at: job.finished_at,
            error_kind: job.error.as_ref().map(|e| e.kind.clone()),
        }
    }
}

fn parse_id(request_id: Uuid, raw: &str) -> Result<Uuid, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::not_found(request_id, format!("no job with id {:?}", raw)))
}

async fn load_job(state: &AppState, request_id: Uuid, id: Uuid) -> Result<Job, ApiError> {
    match state
        .store
        .get(id)
        .await
        .map_err(|e| ApiError::from_store(request_id, e))?
    {
        Some(job) => Ok(job),
        None => {
            if state
                .store
                .was_deleted(id)
                .await
                .map_err(|e| ApiError::from_store(request_id, e))?
            {
                Err(ApiError::gone(request_id, format!("job {} was deleted", id)))
            } else {
                Err(ApiError::not_found(request_id, format!("job {} not found", id)))
            }
        }
    }
}

/// `GET /parse/status/{id}`
pub async fn job_status(
    State(state): State<AppState>,
    RequestId(request_id): RequestId,
    Path(raw_id): Path<String>,
) -> ApiResult {
    let id = parse_id(request_id, &raw_id)?;
    let job = match load_job(&state, request_id, id).await {
        Ok(job) => job,
        // Status is a liveness poll; deleted reads as absent here.
        Err(e) if e.status == StatusCode::GONE => {
            return Err(ApiError::not_found(request_id, format!("job {} not found", id)))
        }
        Err(e) => return Err(e),
    };

    Ok(ok(
        request_id,
        serde_json::json!({
            "job_id": job.id,
            "state": job.state,
            "progress": job.progress,
            "stage": job.stage,
            "attempts": job.attempts,
        }),
    ))
}

/// `GET /parse/result/{id}`: the result once terminal, 202 before that,
/// 410 after deletion.
pub async fn job_result(
    State(state): State<AppState>,
    RequestId(request_id): RequestId,
    Path(raw_id): Path<String>,
) -> ApiResult {
    let id = parse_id(request_id, &raw_id)?;
    let job = load_job(&state, request_id, id).await?;

    match job.state {
        JobState::Completed => Ok(ok(
            request_id,
            serde_json::json!({
                "job_id": job.id,
                "state": job.state,
                "result": job.result,
            }),
        )),
        JobState::Failed | JobState::Cancelled => Ok(ok(
            request_id,
            serde_json::json!({
                "job_id": job.id,
                "state": job.state,
                "error": job.error,
            }),
        )),
        _ => Ok(accepted(
            request_id,
            "job not yet completed",
            serde_json::json!({
                "job_id": job.id,
                "state": job.state,
                "progress": job.progress,
                "stage": job.stage,
            }),
        )),
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct HistoryQuery {
    /// Comma-separated state filter, e.g. `completed,failed`
    pub state: Option<String>,
    pub parsing_type: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub page: Option<u32>,
    pub size: Option<u32>,
}

/// `GET /parse/history`
pub async fn job_history(
    State(state): State<AppState>,
    RequestId(request_id): RequestId,
    Query(query): Query<HistoryQuery>,
) -> ApiResult {
    let mut states = Vec::new();
    if let Some(raw) = &query.state {
        for part in raw.split(',').filter(|s| !s.trim().is_empty()) {
            let parsed: JobState = part.trim().parse().map_err(|_| {
                ApiError::bad_request(
                    request_id,
                    "invalid_state",
                    format!("unknown job state {:?}", part.trim()),
                )
            })?;
            states.push(parsed);
        }
    }

    let filter = JobFilter {
        states,
        parsing_type: query.parsing_type.clone(),
        batch_id: None,
        created_after: query.created_after,
        created_before: query.created_before,
    };
    let page = query.page.unwrap_or(1).max(1);
    let size = query.size.unwrap_or(20).clamp(1, 200);

    let (jobs, total) = state
        .store
        .list(&filter, page, size)
        .await
        .map_err(|e| ApiError::from_store(request_id, e))?;

    let summaries: Vec<JobSummary> = jobs.iter().map(JobSummary::from).collect();
    Ok(ok(
        request_id,
        serde_json::json!({
            "jobs": summaries,
            "total": total,
            "page": page,
            "size": size,
        }),
    ))
}

/// `GET /parse/batch/{id}`: derived per-state totals plus the rows.
pub async fn batch_status(
    State(state): State<AppState>,
    RequestId(request_id): RequestId,
    Path(raw_id): Path<String>,
) -> ApiResult {
    let id = parse_id(request_id, &raw_id)?;
    let batch = state
        .store
        .get_batch(id)
        .await
        .map_err(|e| ApiError::from_store(request_id, e))?
        .ok_or_else(|| ApiError::not_found(request_id, format!("batch {} not found", id)))?;

    let jobs = state
        .store
        .list_batch_jobs(id)
        .await
        .map_err(|e| ApiError::from_store(request_id, e))?;

    let mut totals: BTreeMap<String, u64> = BTreeMap::new();
    for job in &jobs {
        *totals.entry(job.state.to_string()).or_insert(0) += 1;
    }
    let summaries: Vec<JobSummary> = jobs.iter().map(JobSummary::from).collect();

    Ok(ok(
        request_id,
        serde_json::json!({
            "batch_id": batch.id,
            "description": batch.description,
            "created_at": batch.created_at,
            "totals": totals,
            "jobs": summaries,
        }),
    ))
}

/// `DELETE /parse/{id}`: remove the record and its blob.
pub async fn delete_job(
    State(state): State<AppState>,
    RequestId(request_id): RequestId,
    Path(raw_id): Path<String>,
) -> ApiResult {
    let id = parse_id(request_id, &raw_id)?;
    let handle = state
        .store
        .delete(id)
        .await
        .map_err(|e| ApiError::from_store(request_id, e))?
        .ok_or_else(|| ApiError::not_found(request_id, format!("job {} not found", id)))?;

    if let Err(e) = state.blobs.delete(&handle).await {
        // The tombstone is in place; the sweep-cycle guarantee is kept by
        // the retention cleanup.
        tracing::warn!(%id, handle, error = %e, "blob removal failed after delete");
    }

    tracing::info!(%id, "job deleted");
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `POST /parse/{id}/cancel`: immediate when waiting, cooperative when
/// running.
pub async fn cancel_job(
    State(state): State<AppState>,
    RequestId(request_id): RequestId,
    Path(raw_id): Path<String>,
) -> ApiResult {
    let id = parse_id(request_id, &raw_id)?;
    match state
        .store
        .cancel(id)
        .await
        .map_err(|e| ApiError::from_store(request_id, e))?
    {
        CancelOutcome::Cancelled => Ok(ok(
            request_id,
            serde_json::json!({ "job_id": id, "state": "cancelled" }),
        )),
        CancelOutcome::Requested => Ok(respond(
            StatusCode::ACCEPTED,
            request_id,
            "cancellation requested; the job stops at the next stage boundary",
            serde_json::json!({ "job_id": id, "cancel_requested": true }),
        )),
        CancelOutcome::AlreadyTerminal => Err(ApiError::conflict(
            request_id,
            "already_terminal",
            format!("job {} already finished", id),
        )),
        CancelOutcome::NotFound => {
            Err(ApiError::not_found(request_id, format!("job {} not found", id)))
        }
    }
}
