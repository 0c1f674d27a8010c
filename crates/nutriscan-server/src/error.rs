//! API error handling
//!
//! Foreseeable conditions map to a semantic status and a machine-readable
//! kind; only genuinely unexpected failures become opaque 500s. The
//! request id travels inside the error so the envelope stays uniform.

use crate::envelope::{Envelope, ErrorBody};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use capstan::{BlobError, StoreError};
use chrono::Utc;
use uuid::Uuid;

pub type ApiResult = Result<Response, ApiError>;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub request_id: Uuid,
}

impl ApiError {
    pub fn new(
        request_id: Uuid,
        status: StatusCode,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            kind: kind.into(),
            message: message.into(),
            details: None,
            request_id,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_request(request_id: Uuid, kind: &str, message: impl Into<String>) -> Self {
        Self::new(request_id, StatusCode::BAD_REQUEST, kind, message)
    }

    pub fn payload_too_large(request_id: Uuid, message: impl Into<String>) -> Self {
        Self::new(request_id, StatusCode::PAYLOAD_TOO_LARGE, "too_large", message)
    }

    pub fn not_found(request_id: Uuid, message: impl Into<String>) -> Self {
        Self::new(request_id, StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn gone(request_id: Uuid, message: impl Into<String>) -> Self {
        Self::new(request_id, StatusCode::GONE, "deleted", message)
    }

    pub fn conflict(request_id: Uuid, kind: &str, message: impl Into<String>) -> Self {
        Self::new(request_id, StatusCode::CONFLICT, kind, message)
    }

    pub fn unprocessable(request_id: Uuid, kind: &str, message: impl Into<String>) -> Self {
        Self::new(request_id, StatusCode::UNPROCESSABLE_ENTITY, kind, message)
    }

    pub fn timeout(request_id: Uuid, message: impl Into<String>) -> Self {
        Self::new(
            request_id,
            StatusCode::GATEWAY_TIMEOUT,
            "deadline_exceeded",
            message,
        )
    }

    pub fn internal(request_id: Uuid) -> Self {
        Self::new(
            request_id,
            StatusCode::INTERNAL_SERVER_ERROR,
            "server_error",
            "internal server error",
        )
    }

    /// Store failures are never the client's fault.
    pub fn from_store(request_id: Uuid, err: StoreError) -> Self {
        tracing::error!(%request_id, error = %err, "store operation failed");
        Self::new(
            request_id,
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_unavailable",
            "job store unavailable",
        )
    }

    pub fn from_blob(request_id: Uuid, err: BlobError) -> Self {
        tracing::error!(%request_id, error = %err, "blob operation failed");
        Self::new(
            request_id,
            StatusCode::INTERNAL_SERVER_ERROR,
            "blob_io",
            "blob storage unavailable",
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body: Envelope<()> = Envelope {
            code: self.status.as_u16(),
            message: self.message,
            data: None,
            timestamp: Utc::now(),
            request_id: self.request_id,
            error: Some(ErrorBody {
                kind: self.kind,
                details: self.details,
            }),
        };
        (self.status, Json(body)).into_response()
    }
}
