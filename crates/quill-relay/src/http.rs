//! HTTP transport.
//!
//! Accepts `POST /` with a JSON-RPC body, admits the caller (bearer token,
//! rate limit), runs the decision core, and forwards allowed messages to the
//! configured upstream. Upstream replies stream through unchanged; SSE
//! `data:` frames are additionally recorded as response events. CORS is wide
//! open for local development.

use crate::admission::{self, Principal};
use crate::decision::{DecisionCore, Outcome};
use crate::rate_limit::RateLimiter;
use crate::sse::SseFrameSplitter;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use futures_util::StreamExt;
use quill_storage::AuthStore;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Subject attributed to unauthenticated callers.
pub const ANONYMOUS_SUBJECT: &str = "anonymous";

/// Shared state threaded through axum handlers via [`State`].
pub struct AppState {
    /// The decision core shared with the stdio transport.
    pub core: Arc<DecisionCore>,
    /// Auth store; `None` disables bearer admission.
    pub auth: Option<Arc<AuthStore>>,
    /// Per-subject rate limiter.
    pub limiter: RateLimiter,
    /// HTTP client for upstream forwarding.
    pub client: reqwest::Client,
    /// Upstream JSON-RPC endpoint.
    pub upstream_url: String,
}

/// Build the axum [`Router`] with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", post(relay_handler).options(preflight_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `POST /` — admit, decide, forward.
async fn relay_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    // Admission
    let principal = match admit(&state, &headers).await {
        Ok(principal) => principal,
        Err(response) => return response,
    };
    let subject = principal
        .as_ref()
        .map(|p| p.subject.clone())
        .unwrap_or_else(|| ANONYMOUS_SUBJECT.to_string());

    // Rate limiting
    let check = state
        .limiter
        .check(&subject, principal.as_ref().and_then(|p| p.rate_limit_rpm))
        .await;
    if !check.allowed {
        state.core.record_rate_limited(&body).await;
        return rate_limited_response(check.retry_after_secs);
    }

    // Decision
    match state.core.decide(&body, &subject).await {
        Outcome::Deny { response } => {
            debug!(%subject, "Returning synthesized denial");
            json_response(StatusCode::OK, response)
        }
        Outcome::Forward => forward_upstream(&state, body).await,
    }
}

/// `OPTIONS /` — CORS preflight.
async fn preflight_handler() -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    apply_cors(response.headers_mut());
    response
}

/// `GET /health` — report relay and store health.
async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let ledger = state.core.logger().store();
    let (ledger_healthy, records) = match ledger.health_check().await {
        Ok(()) => (true, ledger.count().await.unwrap_or(0)),
        Err(_) => (false, 0),
    };

    let status = if ledger_healthy { "healthy" } else { "degraded" };
    let body = json!({
        "status": status,
        "server_name": state.core.server_name(),
        "ledger": {"healthy": ledger_healthy, "records": records},
    });
    let code = if ledger_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    json_response(code, body.to_string())
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

/// Check the bearer token when auth is enabled. `Err` carries the ready
/// 401 response.
async fn admit(state: &AppState, headers: &HeaderMap) -> Result<Option<Principal>, Response> {
    let Some(auth) = &state.auth else {
        return Ok(None);
    };

    let Some(token) = bearer_token(headers) else {
        return Err(unauthorized("missing Authorization bearer token"));
    };

    match admission::authenticate(auth, token).await {
        Ok(Some(principal)) => Ok(Some(principal)),
        Ok(None) => Err(unauthorized("invalid, revoked, or expired credential")),
        Err(e) => {
            error!("Credential lookup failed: {e}");
            Err(jsonrpc_error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                -32603,
                "authentication service unavailable",
            ))
        }
    }
}

/// Extract the bearer token from the Authorization header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

// ---------------------------------------------------------------------------
// Upstream forwarding
// ---------------------------------------------------------------------------

async fn forward_upstream(state: &Arc<AppState>, body: String) -> Response {
    let upstream = state
        .client
        .post(&state.upstream_url)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await;

    let upstream = match upstream {
        Ok(resp) => resp,
        Err(e) => {
            error!("Upstream request failed: {e}");
            let error_body = upstream_error_body(&format!("upstream request failed: {e}"));
            state.core.record_response(&error_body).await;
            return json_response(StatusCode::BAD_GATEWAY, error_body);
        }
    };

    let status = upstream.status();
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();

    if !status.is_success() {
        let detail = upstream.text().await.unwrap_or_default();
        error!(%status, "Upstream returned an error status");
        let error_body = upstream_error_body(&format!(
            "upstream returned {status}: {}",
            detail.chars().take(200).collect::<String>()
        ));
        state.core.record_response(&error_body).await;
        return json_response(StatusCode::BAD_GATEWAY, error_body);
    }

    if content_type.starts_with("text/event-stream") {
        stream_sse_response(state, upstream).await
    } else {
        match upstream.text().await {
            Ok(text) => {
                state.core.record_response(&text).await;
                json_response(StatusCode::OK, text)
            }
            Err(e) => {
                error!("Failed to read upstream body: {e}");
                let error_body = upstream_error_body("failed to read upstream body");
                state.core.record_response(&error_body).await;
                json_response(StatusCode::BAD_GATEWAY, error_body)
            }
        }
    }
}

/// Relay an SSE stream as received, logging each complete `data:` frame as a
/// response event.
async fn stream_sse_response(state: &Arc<AppState>, upstream: reqwest::Response) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(64);

    let core = Arc::clone(&state.core);
    tokio::spawn(async move {
        let mut stream = upstream.bytes_stream();
        let mut splitter = SseFrameSplitter::new();

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    for frame in splitter.push(&bytes) {
                        core.record_response(&frame).await;
                    }
                    if tx.send(Ok(bytes)).await.is_err() {
                        // Client disconnected; stop pulling from upstream.
                        info!("Client disconnected mid-stream");
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx
                        .send(Err(std::io::Error::other(e.to_string())))
                        .await;
                    return;
                }
            }
        }
        if let Some(tail) = splitter.finish() {
            core.record_response(&tail).await;
        }
    });

    let body = Body::from_stream(tokio_stream::wrappers::ReceiverStream::new(rx));
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    apply_cors(response.headers_mut());
    response
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

/// CORS allows any origin for local development.
fn apply_cors(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("authorization, content-type"),
    );
}

fn json_response(status: StatusCode, body: String) -> Response {
    let mut response = (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response();
    apply_cors(response.headers_mut());
    response
}

/// A JSON-RPC-shaped error body with the given code/message.
fn jsonrpc_error_response(status: StatusCode, code: i64, message: &str) -> Response {
    let body = json!({
        "jsonrpc": "2.0",
        "id": null,
        "error": {"code": code, "message": message}
    })
    .to_string();
    json_response(status, body)
}

fn unauthorized(message: &str) -> Response {
    jsonrpc_error_response(StatusCode::UNAUTHORIZED, -32001, message)
}

fn upstream_error_body(message: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": null,
        "error": {"code": -32000, "message": message}
    })
    .to_string()
}

fn rate_limited_response(retry_after_secs: u64) -> Response {
    let body = json!({
        "jsonrpc": "2.0",
        "id": null,
        "error": {"code": -32029, "message": "rate limit exceeded"}
    })
    .to_string();
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::RETRY_AFTER, retry_after_secs.to_string()),
        ],
        body,
    )
        .into_response();
    apply_cors(response.headers_mut());
    response
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
