//! Search-index administration.

use axum::Json;
use axum::extract::State;
use axum::response::Response;
use serde::Deserialize;

use portico_core::jobs::TriggerType;
use portico_engine::index::{TASK_APPLY_DIRTY, TASK_REBUILD};

use super::auth::AdminViewer;
use super::{AppError, AppState, response};

pub(super) async fn status(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
) -> Result<Response, AppError> {
    Ok(response::ok(state.index.status().await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(super) struct IndexJobRequest {
    mount_ids: Option<Vec<String>>,
    options: Option<serde_json::Value>,
}

fn job_payload(req: IndexJobRequest) -> serde_json::Value {
    serde_json::json!({
        "mountIds": req.mount_ids,
        "options": req.options.unwrap_or_else(|| serde_json::json!({})),
    })
}

pub(super) async fn rebuild(
    State(state): State<AppState>,
    AdminViewer(viewer): AdminViewer,
    Json(req): Json<IndexJobRequest>,
) -> Result<Response, AppError> {
    let job = state
        .jobs
        .submit(
            TASK_REBUILD,
            job_payload(req),
            &viewer.owner_id(),
            TriggerType::Manual,
        )
        .await?;
    Ok(response::created(serde_json::json!({ "jobId": job.job_id })))
}

pub(super) async fn apply_dirty(
    State(state): State<AppState>,
    AdminViewer(viewer): AdminViewer,
    Json(req): Json<IndexJobRequest>,
) -> Result<Response, AppError> {
    let job = state
        .jobs
        .submit(
            TASK_APPLY_DIRTY,
            job_payload(req),
            &viewer.owner_id(),
            TriggerType::Manual,
        )
        .await?;
    Ok(response::created(serde_json::json!({ "jobId": job.job_id })))
}

/// Cancel any running index jobs.
pub(super) async fn stop(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
) -> Result<Response, AppError> {
    let jobs = state.jobs.list(None).await?;
    let mut stopped = 0u32;
    for job in jobs {
        if matches!(job.task_type.as_str(), TASK_REBUILD | TASK_APPLY_DIRTY)
            && !job.status.is_terminal()
            && state.jobs.cancel(&job.job_id).await?
        {
            stopped += 1;
        }
    }
    Ok(response::ok(serde_json::json!({ "stopped": stopped })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(super) struct ClearRequest {
    mount_ids: Option<Vec<String>>,
}

pub(super) async fn clear(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
    Json(req): Json<ClearRequest>,
) -> Result<Response, AppError> {
    let cleared = state.index.clear(req.mount_ids.as_deref()).await?;
    state.search.flush();
    Ok(response::ok(serde_json::json!({ "clearedMounts": cleared })))
}
