//! Bridges the parsing pipeline into the capstan dispatcher
//!
//! The dispatcher knows leases and progress; the pipeline knows PDFs.
//! This adapter reads the blob, maps the requested parsing type, forwards
//! progress, and translates pipeline failures into the queue's
//! transient/fatal vocabulary.

use capstan::{
    error_kind, BlobError, ExecError, Job, JobError, JobExecutor, ProgressTracker,
};
use capstan::BlobStore;
use nutriscan_parse::pipeline::ProgressSink;
use nutriscan_parse::{ParsingType, Pipeline, PipelineError};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct ParseExecutor {
    blobs: Arc<BlobStore>,
    pipeline: Arc<Pipeline>,
}

impl ParseExecutor {
    pub fn new(blobs: Arc<BlobStore>, pipeline: Arc<Pipeline>) -> Self {
        Self { blobs, pipeline }
    }
}

/// Adapts the dispatcher's write-behind tracker to the pipeline's sink.
struct TrackerSink(ProgressTracker);

impl ProgressSink for TrackerSink {
    fn update(&self, stage: &str, percent: u8) {
        self.0.update(stage, percent);
    }
}

/// Map a pipeline failure onto the retry policy.
pub fn map_pipeline_error(err: PipelineError) -> ExecError {
    match err {
        PipelineError::Cancelled(_) => ExecError::Cancelled,
        PipelineError::Stage {
            stage,
            kind,
            message,
        } => {
            let job_error = JobError::new(kind.as_str(), message).with_stage(stage);
            if kind.is_transient() {
                ExecError::Transient(job_error)
            } else {
                ExecError::Fatal(job_error)
            }
        }
    }
}

#[async_trait::async_trait]
impl JobExecutor for ParseExecutor {
    async fn execute(
        &self,
        job: &Job,
        progress: ProgressTracker,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, ExecError> {
        let bytes = self.blobs.get(&job.blob_handle).await.map_err(|e| {
            let job_error =
                JobError::new(error_kind::BLOB_IO, e.to_string()).with_stage("extract_basic_info");
            match e {
                // A vanished blob will not come back; I/O hiccups might.
                BlobError::NotFound(_) | BlobError::InvalidHandle(_) => {
                    ExecError::Fatal(job_error)
                }
                BlobError::Io(_) => ExecError::Transient(job_error),
            }
        })?;

        let requested: ParsingType = job.parsing_type.parse().map_err(|_| {
            ExecError::Fatal(JobError::new(
                error_kind::SERVER_ERROR,
                format!("job carries unknown parsing type {:?}", job.parsing_type),
            ))
        })?;

        let sink = TrackerSink(progress);
        let doc = self
            .pipeline
            .run(Arc::new(bytes), requested, &sink, &cancel)
            .await
            .map_err(map_pipeline_error)?;

        serde_json::to_value(&doc).map_err(|e| {
            ExecError::Fatal(JobError::new(
                error_kind::SERVER_ERROR,
                format!("result serialization failed: {}", e),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nutriscan_parse::pipeline::ParseFailKind;

    #[test]
    fn test_transient_kinds_map_to_nack() {
        let err = PipelineError::Stage {
            stage: "ocr_fallback",
            kind: ParseFailKind::OcrTransient,
            message: "rasterizer busy".to_string(),
        };
        assert!(matches!(map_pipeline_error(err), ExecError::Transient(_)));
    }

    #[test]
    fn test_permanent_kinds_map_to_fatal() {
        let err = PipelineError::Stage {
            stage: "extract_text",
            kind: ParseFailKind::Unparseable,
            message: "no text layer".to_string(),
        };
        match map_pipeline_error(err) {
            ExecError::Fatal(job_error) => {
                assert_eq!(job_error.kind, "unparseable");
                assert_eq!(job_error.stage.as_deref(), Some("extract_text"));
            }
            other => panic!("unexpected mapping: {:?}", other),
        }
    }

    #[test]
    fn test_cancel_maps_to_cancelled() {
        assert!(matches!(
            map_pipeline_error(PipelineError::Cancelled("detect_type")),
            ExecError::Cancelled
        ));
    }
}
