//! Scheduled-task administration and the ticker status endpoint.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::Response;
use serde::Deserialize;

use portico_engine::scheduler::validate_cron;
use portico_storage::scheduled_repo::{self, ScheduleType};

use super::auth::AdminViewer;
use super::{AppError, AppState, response};

pub(super) async fn types(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
) -> Response {
    response::ok(state.scheduler.handler_ids())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct UpsertScheduledRequest {
    #[serde(default)]
    handler_id: Option<String>,
    schedule_type: ScheduleType,
    #[serde(default)]
    interval_sec: Option<i64>,
    #[serde(default)]
    cron_expression: Option<String>,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    config: serde_json::Value,
}

fn default_true() -> bool {
    true
}

fn validate_schedule(req: &UpsertScheduledRequest) -> Result<(), AppError> {
    match req.schedule_type {
        ScheduleType::Interval => {
            if req.interval_sec.is_none_or(|v| v < 1) {
                return Err(AppError::bad_request(
                    "interval schedules need intervalSec >= 1",
                ));
            }
        }
        ScheduleType::Cron => {
            let expr = req
                .cron_expression
                .as_deref()
                .ok_or_else(|| AppError::bad_request("cron schedules need cronExpression"))?;
            validate_cron(expr).map_err(|e| AppError::bad_request(e.to_string()))?;
        }
    }
    Ok(())
}

pub(super) async fn list(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
) -> Result<Response, AppError> {
    Ok(response::ok(scheduled_repo::list(&state.db).await?))
}

pub(super) async fn create(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
    Json(req): Json<UpsertScheduledRequest>,
) -> Result<Response, AppError> {
    let handler_id = req
        .handler_id
        .as_deref()
        .ok_or_else(|| AppError::bad_request("handlerId is required"))?;
    if !state.scheduler.handler_ids().iter().any(|id| *id == handler_id) {
        return Err(AppError::bad_request(format!(
            "unknown handler: {handler_id}"
        )));
    }
    validate_schedule(&req)?;

    let job = scheduled_repo::create(
        &state.db,
        handler_id,
        req.schedule_type,
        req.interval_sec,
        req.cron_expression.as_deref(),
        req.enabled,
        req.config,
    )
    .await?;
    Ok(response::created(job))
}

pub(super) async fn get_one(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let job = scheduled_repo::get(&state.db, &id)
        .await?
        .ok_or_else(|| AppError::not_found("no such scheduled task"))?;
    Ok(response::ok(job))
}

pub(super) async fn update(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
    Path(id): Path<String>,
    Json(req): Json<UpsertScheduledRequest>,
) -> Result<Response, AppError> {
    validate_schedule(&req)?;
    let updated = scheduled_repo::update(
        &state.db,
        &id,
        req.schedule_type,
        req.interval_sec,
        req.cron_expression.as_deref(),
        req.enabled,
        req.config,
    )
    .await?;
    if !updated {
        return Err(AppError::not_found("no such scheduled task"));
    }
    Ok(response::ok_message("updated"))
}

pub(super) async fn delete(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    if !scheduled_repo::delete(&state.db, &id).await? {
        return Err(AppError::not_found("no such scheduled task"));
    }
    Ok(response::ok_message("deleted"))
}

#[derive(Debug, Deserialize)]
pub(super) struct RunsQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    20
}

pub(super) async fn runs(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
    Path(id): Path<String>,
    Query(query): Query<RunsQuery>,
) -> Result<Response, AppError> {
    let runs = scheduled_repo::list_runs(&state.db, &id, query.limit.clamp(1, 200)).await?;
    Ok(response::ok(runs))
}

pub(super) async fn run_now(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    state
        .scheduler
        .trigger_manual(&id)
        .await
        .map_err(|e| AppError::bad_request(e.to_string()))?;
    Ok(response::ok_message("triggered"))
}

pub(super) async fn ticker(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
) -> Result<Response, AppError> {
    Ok(response::ok(state.scheduler.ticker_status().await?))
}
