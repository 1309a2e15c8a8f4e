//! Throughput test endpoints

use super::{ApiError, AppState, RangeQuery, ok};
use axum::Json;
use axum::extract::{Query, State};
use axum::response::Response;
use serde_json::{Value, json};
use tracing::info;

pub async fn trigger(State(state): State<AppState>) -> Result<Response, ApiError> {
    info!("Throughput test requested over HTTP");
    let result = state.monitor.trigger().trigger().await?;
    Ok(ok(result))
}

pub async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "isRunning": state.monitor.trigger().is_running() }))
}

pub async fn history(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Result<Response, ApiError> {
    let range = query.time_range()?;
    let metrics = state
        .monitor
        .repository()
        .query_throughput_history(range)
        .await?;
    Ok(ok(metrics))
}
