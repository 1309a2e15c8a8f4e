//! HTTP handlers

mod health;
mod history;
mod throughput;

use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use linkwatch::Monitor;
use linkwatch::analysis::resolve_range;
use linkwatch_model::{DbError, TimeRange, TriggerError};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub monitor: Arc<Monitor>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/throughput/trigger", post(throughput::trigger))
        .route("/api/throughput/status", get(throughput::status))
        .route("/api/throughput/history", get(throughput::history))
        .route("/api/probes/history", get(history::probes))
        .route("/api/connectivity", get(history::connectivity))
        .route("/api/monitor/stats", get(history::stats))
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .with_state(state)
}

/// Range selection shared by the history endpoints
#[derive(Debug, Default, Deserialize)]
pub struct RangeQuery {
    /// Last-N window such as `24h`
    pub range: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub host: Option<String>,
    pub granularity: Option<String>,
}

impl RangeQuery {
    fn time_range(&self) -> Result<TimeRange, ApiError> {
        resolve_range(
            self.range.as_deref(),
            self.start.as_deref(),
            self.end.as_deref(),
        )
        .map_err(|e| ApiError::BadRequest(e.to_string()))
    }
}

/// Error responses: `{success: false, code, error}`
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Db(DbError),
    Trigger(TriggerError),
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        ApiError::Db(err)
    }
}

impl From<TriggerError> for ApiError {
    fn from(err: TriggerError) -> Self {
        ApiError::Trigger(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Db(DbError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Trigger(TriggerError::AlreadyRunning) => StatusCode::CONFLICT,
            ApiError::Trigger(TriggerError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Trigger(TriggerError::ExecutionFailed(_)) => StatusCode::BAD_GATEWAY,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::Db(DbError::Unavailable(_)) => "DB_UNAVAILABLE",
            ApiError::Db(_) => "DATABASE_ERROR",
            ApiError::Trigger(e) => e.code(),
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::BadRequest(message) => message.clone(),
            ApiError::Db(e) => e.to_string(),
            ApiError::Trigger(e) => e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("{} {}: {}", status.as_u16(), self.code(), self.message());
        }
        let body = json!({
            "success": false,
            "code": self.code(),
            "error": self.message(),
        });
        (status, Json(body)).into_response()
    }
}

/// `{success: true, data}`
fn ok<T: serde::Serialize>(data: T) -> Response {
    Json(json!({ "success": true, "data": data })).into_response()
}
