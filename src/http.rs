//! HTTP transport over the gateway.
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `POST /v1/chat/completions` | submit a job, blocking JSON or SSE stream |
//! | `POST /api/keys`, `GET /api/keys` | issue and list credentials |
//! | `DELETE /api/keys/:id` | revoke a credential |
//! | `GET /health`, `GET /ready` | dependency probes |
//!
//! Errors share one body shape: `{"error":{"message","type","code"}}`.

use crate::config::ErrorDetail;
use crate::dispatch::{Dispatch, StreamEvent};
use crate::envelope::{Envelope, Quota, Reply};
use crate::error::GatewayError;
use crate::gateway::Gateway;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tower::ServiceExt;

pub const IDEMPOTENCY_KEY: HeaderName = HeaderName::from_static("idempotency-key");
pub const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// Sentinel payload that ends an event stream.
pub const DONE_SENTINEL: &str = "[DONE]";

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/api/keys", post(create_key).get(list_keys))
        .route("/api/keys/:id", delete(revoke_key))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .fallback(not_found)
        .with_state(gateway)
}

/// Serve `gateway` on `listen_addr` until Ctrl-C, then drain the worker pool.
pub async fn serve(gateway: Gateway, listen_addr: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    let gateway = Arc::new(gateway);
    axum::serve(listener, router(gateway.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    match Arc::try_unwrap(gateway) {
        Ok(gateway) => gateway.shutdown().await,
        Err(_) => tracing::warn!("gateway still referenced after server stop; skipping worker drain"),
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        return;
    }
    tracing::info!("ctrl-c received; stopping");
}

/// HTTP status for each error family.
pub fn status_for(error: &GatewayError) -> StatusCode {
    match error {
        GatewayError::MissingCredential
        | GatewayError::MalformedCredential(_)
        | GatewayError::InvalidCredential => StatusCode::UNAUTHORIZED,
        GatewayError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
        GatewayError::ExecutionFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        GatewayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        GatewayError::DependencyUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
    }
}

pub fn error_body(error: &GatewayError, detail: ErrorDetail) -> Value {
    json!({
        "error": {
            "message": error.public_message(detail),
            "type": error.kind().as_str(),
            "code": error.code(),
        }
    })
}

fn plain_error(status: StatusCode, kind: &str, code: &str, message: &str) -> Response {
    let body = json!({"error": {"message": message, "type": kind, "code": code}});
    (status, Json(body)).into_response()
}

fn quota_headers(quota: Option<Quota>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let Some(quota) = quota else {
        return headers;
    };
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(quota.limit));
    if let Some(remaining) = quota.remaining {
        headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(remaining));
    }
    if let Some(retry_after) = quota.retry_after {
        headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after.as_secs().max(1)));
    }
    headers
}

fn header_string(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers.get(name).map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
}

fn error_response(error: &GatewayError, quota: Option<Quota>, detail: ErrorDetail) -> Response {
    (status_for(error), quota_headers(quota), Json(error_body(error, detail))).into_response()
}

fn sse_json<T: Serialize>(value: &T) -> Event {
    match serde_json::to_string(value) {
        Ok(data) => Event::default().data(data),
        Err(err) => {
            tracing::error!(error = %err, "failed to encode stream event");
            Event::default().data(json!({"error": {"message": "encoding failed"}}).to_string())
        }
    }
}

fn reply_response(reply: Reply, detail: ErrorDetail) -> Response {
    let headers = quota_headers(reply.quota);
    match reply.body {
        Dispatch::Blocking(completion) => (StatusCode::OK, headers, Json(completion)).into_response(),
        Dispatch::Streaming(stream) => {
            let events = stream.map(move |event| -> Result<Event, Infallible> {
                Ok(match event {
                    StreamEvent::Chunk(chunk) => sse_json(&chunk),
                    StreamEvent::Error(err) => sse_json(&error_body(&err, detail)),
                    StreamEvent::Done => Event::default().data(DONE_SENTINEL),
                })
            });
            (
                headers,
                [(header::CACHE_CONTROL, "no-cache"), (ACCEL_BUFFERING, "no")],
                Sse::new(events),
            )
                .into_response()
        }
    }
}

async fn chat_completions(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // Unparseable bodies still go through admission first and fail validation afterwards.
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let mut envelope = Envelope::new(body);
    envelope.authorization = header_string(&headers, &header::AUTHORIZATION);
    envelope.idempotency_key = header_string(&headers, &IDEMPOTENCY_KEY);

    let detail = gateway.error_detail();
    match gateway.service().oneshot(envelope).await {
        Ok(reply) => reply_response(reply, detail),
        Err(rejection) => error_response(&rejection.error, rejection.quota, detail),
    }
}

async fn create_key(State(gateway): State<Arc<Gateway>>, body: Bytes) -> Response {
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let name = match body.get("name").and_then(Value::as_str) {
        Some(name) if !name.trim().is_empty() => name,
        _ => {
            return plain_error(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "invalid_name",
                "Missing or invalid \"name\" field",
            )
        }
    };
    match gateway.credentials().issue(name).await {
        Ok(issued) => (StatusCode::CREATED, Json(issued)).into_response(),
        Err(err) => error_response(&err, None, gateway.error_detail()),
    }
}

async fn list_keys(State(gateway): State<Arc<Gateway>>) -> Response {
    match gateway.credentials().list().await {
        Ok(keys) => Json(json!({ "keys": keys })).into_response(),
        Err(err) => error_response(&err, None, gateway.error_detail()),
    }
}

async fn revoke_key(State(gateway): State<Arc<Gateway>>, Path(id): Path<String>) -> Response {
    match gateway.credentials().revoke(&id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => plain_error(
            StatusCode::NOT_FOUND,
            "invalid_request_error",
            "not_found",
            "API key not found",
        ),
        Err(err) => error_response(&err, None, gateway.error_detail()),
    }
}

async fn health(State(gateway): State<Arc<Gateway>>) -> Response {
    let report = gateway.health().await;
    let status = if report.is_healthy() { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(report)).into_response()
}

async fn ready(State(gateway): State<Arc<Gateway>>) -> Response {
    let (queue, credentials) =
        futures::join!(gateway.is_queue_reachable(), gateway.is_credential_store_reachable());
    let ready = queue && credentials;
    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(json!({ "ready": ready }))).into_response()
}

async fn not_found() -> Response {
    plain_error(StatusCode::NOT_FOUND, "invalid_request_error", "not_found", "Not found")
}
