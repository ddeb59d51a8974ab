//! HTTP endpoint handlers
//!
//! One manual trigger (`POST /api/v1/sync`) plus read-only views over run
//! status, the series registry, stored observations, gaps and checkpoints.

use crate::error::{ErrorResponse, SyncError};
use crate::server::types::{ApiResponse, HealthData, RangeQuery, RunsQuery};
use crate::state::AppState;
use crate::sync::orchestrator::SyncRequest;
use crate::sync::status::RunOutcome;
use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

const DEFAULT_RUNS_LIMIT: usize = 20;
const MAX_RUNS_LIMIT: usize = 200;

fn error_status(err: &SyncError) -> StatusCode {
    match err {
        SyncError::NotFound(_) => StatusCode::NOT_FOUND,
        SyncError::State(_) => StatusCode::CONFLICT,
        SyncError::Config(_) | SyncError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &SyncError) -> Response {
    let status = error_status(err);
    if status.is_server_error() {
        error!("Request failed: {}", err);
    }
    let body = ErrorResponse::from(err);
    (status, Json(ApiResponse::<()>::error(body.code, body.message))).into_response()
}

fn ok<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(ApiResponse::success(data))).into_response()
}

/// GET /health
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(ApiResponse::success(HealthData {
        service: "series-sync".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        running: state.orchestrator.board().is_running(),
    }))
}

/// POST /api/v1/sync
///
/// 200 when every series succeeded, 207 on partial failure, 422 when the
/// run could not start and 409 while another run holds the lock.
pub async fn trigger_sync(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SyncRequest>,
) -> Response {
    info!(
        "Sync requested over HTTP: mode={}, series={:?}",
        request.mode, request.series_ids
    );

    let report = match state.run_sync(request).await {
        Ok(report) => report,
        Err(e) => return error_response(&e),
    };

    match report.outcome() {
        RunOutcome::AllSucceeded => ok(report),
        RunOutcome::PartialFailure => {
            let message = format!(
                "{} of {} series failed",
                report.failed_series, report.total_series
            );
            (StatusCode::MULTI_STATUS, Json(ApiResponse::partial(report, message))).into_response()
        }
        RunOutcome::NotStarted => {
            let message = report
                .error
                .clone()
                .unwrap_or_else(|| "sync run could not start".to_string());
            warn!("Sync run {} could not start: {}", report.run_id, message);
            let body = ApiResponse {
                status: "error".to_string(),
                message: Some(message),
                code: Some("RUN_NOT_STARTED".to_string()),
                data: Some(report),
            };
            (StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response()
        }
    }
}

/// GET /api/v1/status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Response {
    match state.latest_report().await {
        Ok(Some(report)) => ok(report),
        Ok(None) => error_response(&SyncError::NotFound("no sync run recorded yet".into())),
        Err(e) => error_response(&e),
    }
}

/// GET /api/v1/runs?limit=n
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_RUNS_LIMIT).clamp(1, MAX_RUNS_LIMIT);
    match state.recent_reports(limit).await {
        Ok(reports) => ok(reports),
        Err(e) => error_response(&e),
    }
}

/// GET /api/v1/series
pub async fn list_series(State(state): State<Arc<AppState>>) -> Response {
    match state.series_status().await {
        Ok(series) => ok(series),
        Err(e) => error_response(&e),
    }
}

/// GET /api/v1/series/:id/observations?from&to
pub async fn get_observations(
    State(state): State<Arc<AppState>>,
    Path(series_id): Path<String>,
    Query(range): Query<RangeQuery>,
) -> Response {
    match state.observations(&series_id, range.from, range.to).await {
        Ok(rows) => ok(rows),
        Err(e) => error_response(&e),
    }
}

/// GET /api/v1/series/:id/gaps?from&to
pub async fn get_gaps(
    State(state): State<Arc<AppState>>,
    Path(series_id): Path<String>,
    Query(range): Query<RangeQuery>,
) -> Response {
    match state.gaps(&series_id, range.from, range.to).await {
        Ok(report) => ok(report),
        Err(e) => error_response(&e),
    }
}

/// GET /api/v1/checkpoints
pub async fn list_checkpoints(State(state): State<Arc<AppState>>) -> Response {
    match state.checkpoints().await {
        Ok(checkpoints) => ok(checkpoints),
        Err(e) => error_response(&e),
    }
}
