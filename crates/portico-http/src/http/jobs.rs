//! Job endpoints: list/get/cancel/retry/delete.

use axum::extract::{Path, State};
use axum::response::Response;
use serde::Serialize;

use portico_core::jobs::JobStatus;
use portico_storage::jobs_repo::Job;
use portico_vfs::Viewer;

use super::auth::CurrentViewer;
use super::{AppError, AppState, response};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobView {
    job_id: String,
    task_type: String,
    status: JobStatus,
    stats: portico_core::jobs::JobStats,
    trigger_type: portico_core::jobs::TriggerType,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    finished_at: Option<i64>,
    updated_at_ms: i64,
    allowed_actions: Vec<&'static str>,
}

fn job_view(job: Job) -> JobView {
    let mut allowed_actions: Vec<&'static str> = job.status.allowed_actions().to_vec();
    // `retry` only exists when there is something to retry.
    if job.status.is_terminal() && job.stats.failed_count == 0 {
        allowed_actions.retain(|a| *a != "retry");
    }
    JobView {
        job_id: job.job_id,
        task_type: job.task_type,
        status: job.status,
        stats: job.stats,
        trigger_type: job.trigger_type,
        error_message: job.error_message,
        created_at: job.created_at,
        started_at: job.started_at,
        finished_at: job.finished_at,
        updated_at_ms: job.updated_at_ms,
        allowed_actions,
    }
}

fn check_owner(viewer: &Viewer, job: &Job) -> Result<(), AppError> {
    if viewer.is_admin() || job.owner == viewer.owner_id() {
        Ok(())
    } else {
        Err(AppError::forbidden("not your job"))
    }
}

pub(super) async fn list(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
) -> Result<Response, AppError> {
    let owner = if viewer.is_admin() {
        None
    } else {
        Some(viewer.owner_id())
    };
    let jobs = state.jobs.list(owner.as_deref()).await?;
    Ok(response::ok(
        jobs.into_iter().map(job_view).collect::<Vec<_>>(),
    ))
}

pub(super) async fn get_one(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Path(job_id): Path<String>,
) -> Result<Response, AppError> {
    let job = state
        .jobs
        .get(&job_id)
        .await?
        .ok_or_else(|| AppError::not_found("no such job"))?;
    check_owner(&viewer, &job)?;
    Ok(response::ok(job_view(job)))
}

pub(super) async fn cancel(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Path(job_id): Path<String>,
) -> Result<Response, AppError> {
    let job = state
        .jobs
        .get(&job_id)
        .await?
        .ok_or_else(|| AppError::not_found("no such job"))?;
    check_owner(&viewer, &job)?;

    if !state.jobs.cancel(&job_id).await? {
        return Err(AppError::conflict("job already finished"));
    }
    Ok(response::ok_message("cancellation requested"))
}

pub(super) async fn retry(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Path(job_id): Path<String>,
) -> Result<Response, AppError> {
    let job = state
        .jobs
        .get(&job_id)
        .await?
        .ok_or_else(|| AppError::not_found("no such job"))?;
    check_owner(&viewer, &job)?;

    let new_job = state.jobs.retry(&job_id).await?;
    Ok(response::created(job_view(new_job)))
}

pub(super) async fn delete(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Path(job_id): Path<String>,
) -> Result<Response, AppError> {
    let job = state
        .jobs
        .get(&job_id)
        .await?
        .ok_or_else(|| AppError::not_found("no such job"))?;
    check_owner(&viewer, &job)?;

    state.jobs.delete(&job_id).await?;
    Ok(response::ok_message("deleted"))
}
