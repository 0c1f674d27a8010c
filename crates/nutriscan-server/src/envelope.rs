//! Uniform JSON response envelope
//!
//! Every response carries `{code, message, data, timestamp, request_id}`;
//! errors add `error: {type, details}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    pub timestamp: DateTime<Utc>,
    pub request_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// Success response with the given status.
pub fn respond<T: Serialize>(
    status: StatusCode,
    request_id: Uuid,
    message: impl Into<String>,
    data: T,
) -> Response {
    let body = Envelope {
        code: status.as_u16(),
        message: message.into(),
        data: Some(data),
        timestamp: Utc::now(),
        request_id,
        error: None,
    };
    (status, Json(body)).into_response()
}

/// 200 OK shortcut.
pub fn ok<T: Serialize>(request_id: Uuid, data: T) -> Response {
    respond(StatusCode::OK, request_id, "ok", data)
}

/// 202 Accepted shortcut.
pub fn accepted<T: Serialize>(request_id: Uuid, message: impl Into<String>, data: T) -> Response {
    respond(StatusCode::ACCEPTED, request_id, message, data)
}
