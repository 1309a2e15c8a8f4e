//! Liveness and readiness

use super::{ApiError, AppState};
use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

/// The process is up. Never touches the store.
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Ready when the store answers a verification round-trip.
pub async fn ready(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let health = state.monitor.repository().health().await?;
    Ok(Json(json!({
        "status": "ready",
        "database": health,
    })))
}
