//! Health check and metrics endpoints.
//!
//! Used by load balancers and the Prometheus scraper; none require auth.

use crate::error::AppError;
use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, http::header, response::IntoResponse};
use serde_json::{Value, json};

/// Liveness: the process is up. Does not touch dependencies.
///
/// ```text
/// GET /health
/// ```
#[allow(clippy::unused_async)]
pub async fn health_check() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

/// Readiness: the database answers.
///
/// ```text
/// GET /health/ready
/// ```
///
/// # Errors
///
/// 503 when the database ping fails.
pub async fn readiness(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    state.db.ping().await.map_err(|e| {
        tracing::warn!(error = %e, "Readiness check failed");
        AppError::unavailable("Database unavailable")
    })?;
    Ok(Json(json!({ "status": "ready" })))
}

/// Prometheus text exposition.
///
/// ```text
/// GET /metrics
/// ```
///
/// # Errors
///
/// 404 when metrics are disabled.
#[allow(clippy::unused_async)]
pub async fn metrics(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let handle = state
        .metrics
        .as_ref()
        .ok_or_else(|| AppError::not_found("Metrics are disabled"))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    ))
}
