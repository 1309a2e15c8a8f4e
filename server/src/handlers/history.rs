//! Probe history, connectivity and monitor statistics

use super::{ApiError, AppState, RangeQuery, ok};
use axum::Json;
use axum::extract::{Query, State};
use axum::response::Response;
use linkwatch::analysis::{Granularity, summarize};
use linkwatch_model::MonitorStats;
use serde_json::json;

pub async fn probes(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Result<Response, ApiError> {
    let range = query.time_range()?;
    let metrics = state
        .monitor
        .repository()
        .query_probe_history(range, query.host.clone())
        .await?;
    Ok(ok(metrics))
}

pub async fn connectivity(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Result<Response, ApiError> {
    let range = query.time_range()?;
    let granularity = match query.granularity.as_deref() {
        Some(raw) => raw
            .parse::<Granularity>()
            .map_err(|e| ApiError::BadRequest(e.to_string()))?,
        None => Granularity::default(),
    };

    let buckets = state
        .monitor
        .repository()
        .query_connectivity_status(range, granularity)
        .await?;
    let summary = summarize(&buckets);
    Ok(ok(json!({ "buckets": buckets, "summary": summary })))
}

pub async fn stats(State(state): State<AppState>) -> Json<MonitorStats> {
    Json(state.monitor.stats())
}
