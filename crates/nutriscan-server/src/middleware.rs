//! Request middleware: request ids, security headers, rate limiting

use crate::envelope::{Envelope, ErrorBody};
use crate::state::AppState;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use std::net::SocketAddr;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-request correlation id, generated at the edge and echoed in every
/// envelope and response header.
#[derive(Debug, Clone, Copy)]
pub struct RequestId(pub Uuid);

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for RequestId
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<RequestId>()
            .copied()
            .unwrap_or_else(|| RequestId(Uuid::new_v4())))
    }
}

/// Outermost layer: assign the request id, count the request, echo the
/// id back in a response header.
pub async fn request_id(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let id = RequestId(Uuid::new_v4());
    req.extensions_mut().insert(id);
    state.metrics.inc_requests();

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id.0.to_string()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

/// Standard security headers on every response.
pub async fn security_headers(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        HeaderName::from_static("x-xss-protection"),
        HeaderValue::from_static("1; mode=block"),
    );
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("no-referrer"),
    );
    response
}

/// Token-bucket admission by client IP. Rejections carry a
/// `Retry-After` hint and the uniform error envelope.
pub async fn rate_limit(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let principal = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    match state.gate.check(&principal) {
        Ok(()) => next.run(req).await,
        Err(wait) => {
            state.metrics.inc_rate_limited();
            let request_id = req
                .extensions()
                .get::<RequestId>()
                .copied()
                .unwrap_or_else(|| RequestId(Uuid::new_v4()));
            tracing::debug!(principal, wait_s = wait.as_secs(), "rate limited");

            let retry_after = wait.as_secs().max(1);
            let body: Envelope<()> = Envelope {
                code: StatusCode::TOO_MANY_REQUESTS.as_u16(),
                message: "rate limit exceeded".to_string(),
                data: None,
                timestamp: Utc::now(),
                request_id: request_id.0,
                error: Some(ErrorBody {
                    kind: "rate_limited".to_string(),
                    details: Some(serde_json::json!({ "retry_after_seconds": retry_after })),
                }),
            };
            let mut response =
                (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
    }
}
