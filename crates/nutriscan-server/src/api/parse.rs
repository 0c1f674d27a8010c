//! Submission endpoints: sync, async, and batch parsing

use crate::envelope::{accepted, ok};
use crate::error::{ApiError, ApiResult};
use crate::executor::map_pipeline_error;
use crate::middleware::RequestId;
use crate::state::AppState;
use axum::extract::{Multipart, Query, State};
use capstan::progress::FLUSH_INTERVAL;
use capstan::{error_kind, AckOutcome, ExecError, JobError, NewJob, Priority, TransitionOutcome};
use chrono::Utc;
use nutriscan_parse::pipeline::ProgressSink;
use nutriscan_parse::{ParsingType, UploadInfo, ValidationErrorKind};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Deserialize, Default)]
pub struct ParseParams {
    pub parsing_type: Option<String>,
    pub priority: Option<String>,
    pub callback_url: Option<String>,
}

fn parse_type(request_id: Uuid, params: &ParseParams) -> Result<ParsingType, ApiError> {
    match &params.parsing_type {
        None => Ok(ParsingType::Auto),
        Some(raw) => raw.parse().map_err(|_| {
            ApiError::bad_request(
                request_id,
                "invalid_parsing_type",
                format!(
                    "unknown parsing_type {:?}; expected auto, nutrition_label, recipe, or diet_guide",
                    raw
                ),
            )
        }),
    }
}

fn parse_priority(request_id: Uuid, params: &ParseParams) -> Result<Priority, ApiError> {
    match &params.priority {
        None => Ok(Priority::Normal),
        Some(raw) => raw.parse().map_err(|_| {
            ApiError::bad_request(
                request_id,
                "invalid_priority",
                format!("unknown priority {:?}; expected high, normal, or low", raw),
            )
        }),
    }
}

/// Pull the single `file` field out of a multipart body.
async fn read_single_file(
    request_id: Uuid,
    mut multipart: Multipart,
) -> Result<(String, Vec<u8>), ApiError> {
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        ApiError::bad_request(request_id, "invalid_multipart", format!("multipart error: {}", e))
    })? {
        if field.name() == Some("file") {
            let filename = field.file_name().unwrap_or("upload.pdf").to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|e| {
                    ApiError::bad_request(
                        request_id,
                        "invalid_multipart",
                        format!("failed to read file field: {}", e),
                    )
                })?
                .to_vec();
            return Ok((filename, bytes));
        }
    }
    Err(ApiError::bad_request(
        request_id,
        "missing_file",
        "multipart body must contain a `file` field",
    ))
}

/// Pull every `files` (or `file`) field out of a multipart body.
async fn read_many_files(
    request_id: Uuid,
    mut multipart: Multipart,
) -> Result<Vec<(String, Vec<u8>)>, ApiError> {
    let mut files = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        ApiError::bad_request(request_id, "invalid_multipart", format!("multipart error: {}", e))
    })? {
        if matches!(field.name(), Some("files") | Some("file")) {
            let filename = field.file_name().unwrap_or("upload.pdf").to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|e| {
                    ApiError::bad_request(
                        request_id,
                        "invalid_multipart",
                        format!("failed to read file field: {}", e),
                    )
                })?
                .to_vec();
            files.push((filename, bytes));
        }
    }
    Ok(files)
}

/// Run the validator and map failures onto HTTP statuses.
fn validate_upload(
    request_id: Uuid,
    state: &AppState,
    bytes: &[u8],
    filename: &str,
    sync: bool,
) -> Result<UploadInfo, ApiError> {
    let limit = if sync {
        state.config.max_sync_file_size
    } else {
        state.config.max_file_size
    };

    nutriscan_parse::validate(bytes, filename, limit).map_err(|e| match e.kind {
        ValidationErrorKind::TooLarge => {
            let mut message = e.message;
            if sync && (bytes.len() as u64) <= state.config.max_file_size {
                message = format!(
                    "{}; use POST /parse/async for files up to {} bytes",
                    message, state.config.max_file_size
                );
            }
            ApiError::payload_too_large(request_id, message)
        }
        kind => ApiError::bad_request(request_id, kind.as_str(), e.message),
    })
}

/// Store the blob, create the record, move it into the ready set.
async fn submit_job(
    state: &AppState,
    request_id: Uuid,
    info: &UploadInfo,
    bytes: &[u8],
    parsing_type: ParsingType,
    priority: Priority,
    callback_url: Option<String>,
    batch_id: Option<Uuid>,
) -> Result<Uuid, ApiError> {
    let mut new_job = NewJob::new(
        &info.sanitized_name,
        info.size,
        &info.hash,
        "",
        parsing_type.to_string(),
    )
    .with_priority(priority);
    if let Some(batch) = batch_id {
        new_job = new_job.with_batch(batch);
    }
    if let Some(url) = callback_url {
        new_job = new_job.with_callback(url);
    }

    let stored = state
        .blobs
        .put(new_job.id, &info.sanitized_name, bytes)
        .await
        .map_err(|e| ApiError::from_blob(request_id, e))?;
    new_job.blob_handle = stored.handle;

    let job = state
        .store
        .create(new_job)
        .await
        .map_err(|e| ApiError::from_store(request_id, e))?;

    match state
        .store
        .enqueue(job.id)
        .await
        .map_err(|e| ApiError::from_store(request_id, e))?
    {
        TransitionOutcome::Applied => {}
        TransitionOutcome::Conflict => {
            tracing::error!(job_id = %job.id, "fresh job refused enqueue");
            return Err(ApiError::internal(request_id));
        }
    }

    state.metrics.inc_jobs_submitted();
    state.wake.notify_one();
    Ok(job.id)
}

/// `POST /parse/async`: validate, persist, enqueue, 202.
pub async fn parse_async(
    State(state): State<AppState>,
    RequestId(request_id): RequestId,
    Query(params): Query<ParseParams>,
    multipart: Multipart,
) -> ApiResult {
    let parsing_type = parse_type(request_id, &params)?;
    let priority = parse_priority(request_id, &params)?;
    let (filename, bytes) = read_single_file(request_id, multipart).await?;
    let info = validate_upload(request_id, &state, &bytes, &filename, false)?;

    if !info.warnings.is_empty() {
        tracing::warn!(%request_id, warnings = ?info.warnings, "upload accepted with warnings");
    }

    let job_id = submit_job(
        &state,
        request_id,
        &info,
        &bytes,
        parsing_type,
        priority,
        params.callback_url.clone(),
        None,
    )
    .await?;

    tracing::info!(%job_id, %parsing_type, %priority, size = info.size, "job enqueued");
    Ok(accepted(
        request_id,
        "job accepted",
        serde_json::json!({ "job_id": job_id }),
    ))
}

/// `POST /parse/batch`: all-or-nothing validation, then one job per file.
pub async fn parse_batch(
    State(state): State<AppState>,
    RequestId(request_id): RequestId,
    Query(params): Query<ParseParams>,
    multipart: Multipart,
) -> ApiResult {
    let parsing_type = parse_type(request_id, &params)?;
    let priority = parse_priority(request_id, &params)?;
    let files = read_many_files(request_id, multipart).await?;
    if files.is_empty() {
        return Err(ApiError::bad_request(
            request_id,
            "missing_file",
            "batch body must contain at least one `files` field",
        ));
    }

    // Validate everything before any side effect; one bad file rejects
    // the whole batch.
    let mut validated = Vec::with_capacity(files.len());
    for (filename, bytes) in &files {
        let info = validate_upload(request_id, &state, bytes, filename, false)
            .map_err(|e| e.with_details(serde_json::json!({ "filename": filename })))?;
        validated.push(info);
    }

    let batch = state
        .store
        .create_batch(&format!("batch of {} files", files.len()))
        .await
        .map_err(|e| ApiError::from_store(request_id, e))?;

    let mut job_ids = Vec::with_capacity(files.len());
    for ((_, bytes), info) in files.iter().zip(&validated) {
        let job_id = submit_job(
            &state,
            request_id,
            info,
            bytes,
            parsing_type,
            priority,
            None,
            Some(batch.id),
        )
        .await?;
        job_ids.push(job_id);
    }

    tracing::info!(batch_id = %batch.id, jobs = job_ids.len(), "batch enqueued");
    Ok(accepted(
        request_id,
        "batch accepted",
        serde_json::json!({ "batch_id": batch.id, "job_ids": job_ids }),
    ))
}

/// Forwards pipeline progress into the job record on the sync path.
struct SyncSink(capstan::ProgressTracker);

impl ProgressSink for SyncSink {
    fn update(&self, stage: &str, percent: u8) {
        self.0.update(stage, percent);
    }
}

/// `POST /parse/sync`: run the pipeline inline under a bounded deadline.
pub async fn parse_sync(
    State(state): State<AppState>,
    RequestId(request_id): RequestId,
    Query(params): Query<ParseParams>,
    multipart: Multipart,
) -> ApiResult {
    state.metrics.inc_sync_parses();
    let parsing_type = parse_type(request_id, &params)?;
    let (filename, bytes) = read_single_file(request_id, multipart).await?;
    let info = validate_upload(request_id, &state, &bytes, &filename, true)?;

    let mut new_job = NewJob::new(
        &info.sanitized_name,
        info.size,
        &info.hash,
        "",
        parsing_type.to_string(),
    );
    let stored = state
        .blobs
        .put(new_job.id, &info.sanitized_name, &bytes)
        .await
        .map_err(|e| ApiError::from_blob(request_id, e))?;
    new_job.blob_handle = stored.handle;

    let job = state
        .store
        .create(new_job)
        .await
        .map_err(|e| ApiError::from_store(request_id, e))?;

    // The request task plays worker: a synthetic lease keeps the state
    // invariants intact while the pipeline runs inline.
    let owner = format!("sync-{}", request_id);
    let deadline = Utc::now()
        + chrono::Duration::milliseconds(state.config.sync_deadline.as_millis() as i64);
    match state
        .store
        .begin_inline(job.id, &owner, deadline)
        .await
        .map_err(|e| ApiError::from_store(request_id, e))?
    {
        TransitionOutcome::Applied => {}
        TransitionOutcome::Conflict => {
            tracing::error!(job_id = %job.id, "fresh job refused inline start");
            return Err(ApiError::internal(request_id));
        }
    }

    let (tracker, flusher) =
        capstan::progress::spawn_tracker(Arc::clone(&state.store), job.id, FLUSH_INTERVAL);
    let sink = SyncSink(tracker);
    let cancel = CancellationToken::new();
    let bytes = Arc::new(bytes);

    let outcome = tokio::time::timeout(
        state.config.sync_deadline,
        state.pipeline.run(bytes, parsing_type, &sink, &cancel),
    )
    .await;

    drop(sink);
    let _ = flusher.await;

    match outcome {
        Ok(Ok(doc)) => {
            let value = serde_json::to_value(&doc)
                .map_err(|_| ApiError::internal(request_id))?;
            state
                .store
                .ack(job.id, &owner, AckOutcome::Completed(value.clone()))
                .await
                .map_err(|e| ApiError::from_store(request_id, e))?;
            Ok(ok(
                request_id,
                serde_json::json!({ "job_id": job.id, "result": value }),
            ))
        }
        Ok(Err(pipeline_err)) => {
            let job_error = match map_pipeline_error(pipeline_err) {
                ExecError::Transient(e) | ExecError::Fatal(e) => e,
                ExecError::Cancelled => {
                    JobError::new(error_kind::DEADLINE_EXCEEDED, "sync parse cancelled")
                }
            };
            state
                .store
                .ack(job.id, &owner, AckOutcome::Failed(job_error.clone()))
                .await
                .map_err(|e| ApiError::from_store(request_id, e))?;
            Err(ApiError::unprocessable(
                request_id,
                &job_error.kind,
                job_error.message,
            )
            .with_details(serde_json::json!({ "job_id": job.id, "stage": job_error.stage })))
        }
        Err(_elapsed) => {
            cancel.cancel();
            let job_error = JobError::new(
                error_kind::DEADLINE_EXCEEDED,
                format!(
                    "sync parse exceeded the {}s deadline",
                    state.config.sync_deadline.as_secs()
                ),
            );
            state
                .store
                .ack(job.id, &owner, AckOutcome::Failed(job_error))
                .await
                .map_err(|e| ApiError::from_store(request_id, e))?;
            Err(ApiError::timeout(
                request_id,
                "sync parse deadline exceeded; resubmit via POST /parse/async",
            ))
        }
    }
}
