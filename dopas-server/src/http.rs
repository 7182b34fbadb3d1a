//! Dopas HTTP REST API
//!
//! Axum-based HTTP server that exposes the patient simulator over HTTP.
//!
//! Architecture: each endpoint has a thin axum handler that delegates to a
//! pure inner function. The inner functions are directly testable without
//! axum dispatch machinery.
//!
//! Endpoints:
//! - GET  /health  — health check with DB status
//! - GET  /version — server version info
//! - POST /message — send one doctor message, receive the classified turn

use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use dopas_core::{DopasConfig, DopasError, Orchestrator};
use serde::Deserialize;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use uuid::Uuid;

/// User-facing message for network-layer failures reaching the model.
pub const CONNECTION_ERROR_TEXT: &str =
    "Unable to connect to patient simulator. Please check your connection.";

/// User-facing message for any other failure.
pub const GENERIC_ERROR_TEXT: &str =
    "Technical difficulties with patient simulator. Please try again.";

/// Shared state for all HTTP handlers
pub struct HttpState {
    pub pool: PgPool,
    pub config: DopasConfig,
    pub orchestrator: Orchestrator,
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/message", post(message_handler))
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: Arc<HttpState>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!(
        "{}:{}",
        state.config.service.host, state.config.service.port
    );

    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Dopas HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct MessageRequest {
    pub message: Option<String>,
    /// Opaque client-generated session key; the server mints one when absent
    /// and echoes it back so the client can continue the session.
    pub session_id: Option<String>,
}

/// Client-side session keys look like `session_<millis>_<random>`; the
/// server-minted ones follow the same shape.
pub fn generate_session_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let random = Uuid::new_v4().simple().to_string();
    format!("session_{}_{}", millis, &random[..9])
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

/// Inner health check — queries DB and returns (status_code, json_body).
pub async fn health_inner(pool: &PgPool) -> (StatusCode, serde_json::Value) {
    match dopas_core::db::health_check(pool).await {
        Ok(pg_ver) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "postgresql": pg_ver,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "unhealthy",
                "error": e.to_string(),
            }),
        ),
    }
}

/// Inner version — returns version info (pure, no IO).
pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "dopas/1",
    })
}

/// Inner message — validates the doctor message and runs the orchestrator's
/// retrying send path.
pub async fn message_inner(
    orchestrator: &Orchestrator,
    req: MessageRequest,
) -> (StatusCode, serde_json::Value) {
    let message = match req.message {
        Some(m) if !m.trim().is_empty() => m,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                serde_json::json!({
                    "error": "message field is required",
                    "status": "error",
                }),
            );
        }
    };

    let session_id = req
        .session_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(generate_session_id);

    match orchestrator.handle_with_retry(&message, &session_id).await {
        Ok(reply) => {
            let mut body = serde_json::to_value(&reply.response)
                .unwrap_or_else(|_| serde_json::json!({}));
            if let Some(obj) = body.as_object_mut() {
                obj.insert("session_id".to_string(), serde_json::json!(session_id));
            }
            (StatusCode::OK, body)
        }
        Err(e) => error_to_http(&e),
    }
}

/// Map an orchestrator error onto the transport taxonomy: connectivity
/// failures get the "check your connection" message, everything else the
/// generic one. The underlying error is logged, not leaked.
pub fn error_to_http(error: &DopasError) -> (StatusCode, serde_json::Value) {
    if error.is_connectivity() {
        tracing::error!(error = %error, "Model endpoint unreachable");
        (
            StatusCode::BAD_GATEWAY,
            serde_json::json!({
                "error": CONNECTION_ERROR_TEXT,
                "status": "error",
            }),
        )
    } else {
        tracing::error!(error = %error, "Failed to handle message");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({
                "error": GENERIC_ERROR_TEXT,
                "status": "error",
            }),
        )
    }
}

// ============================================================================
// Axum handler wrappers (thin — delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state.pool).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn message_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<MessageRequest>,
) -> impl IntoResponse {
    let (status, body) = message_inner(&state.orchestrator, req).await;
    (status, Json(body))
}

// ============================================================================
// Unit Tests — inner functions, no DB required
// ============================================================================
