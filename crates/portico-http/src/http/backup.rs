//! Configuration backup endpoints (JSON export/restore of config tables).

use axum::Json;
use axum::extract::State;
use axum::response::Response;
use serde::Deserialize;

use portico_storage::backup::{self, BackupFile};

use super::auth::AdminViewer;
use super::{AppError, AppState, response};

pub(super) async fn modules(AdminViewer(_): AdminViewer) -> Response {
    response::ok(backup::MODULES)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct CreateRequest {
    modules: Option<Vec<String>>,
}

pub(super) async fn create(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
    Json(req): Json<CreateRequest>,
) -> Result<Response, AppError> {
    let dump = backup::export(&state.db, req.modules.as_deref()).await?;
    Ok(response::ok(dump))
}

pub(super) async fn restore_preview(
    AdminViewer(_): AdminViewer,
    Json(file): Json<BackupFile>,
) -> Result<Response, AppError> {
    Ok(response::ok(backup::preview(&file)))
}

pub(super) async fn restore(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
    Json(file): Json<BackupFile>,
) -> Result<Response, AppError> {
    let preview = backup::preview(&file);
    if !preview.integrity_issues.is_empty() {
        return Err(AppError::bad_request(format!(
            "backup has integrity issues: {}",
            preview.integrity_issues.join("; ")
        )));
    }

    let restored = backup::restore(&state.db, &file).await?;
    // Restored mounts/configs invalidate everything derived.
    state.fs.cache.clear(None);
    state.search.flush();
    Ok(response::ok(serde_json::json!({ "restoredRows": restored })))
}
