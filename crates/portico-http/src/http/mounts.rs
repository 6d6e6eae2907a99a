//! Mount administration.

use axum::Json;
use axum::extract::{Path, State};
use axum::response::Response;
use serde::Deserialize;

use portico_storage::mounts_repo::{self, NewMount, WebdavPolicy};
use portico_storage::storage_configs_repo;

use super::auth::{AdminViewer, CurrentViewer};
use super::{AppError, AppState, response};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct UpsertMountRequest {
    name: String,
    mount_path: String,
    storage_config_id: String,
    #[serde(default = "default_true")]
    is_active: bool,
    #[serde(default)]
    sort_order: i64,
    #[serde(default = "default_cache_ttl")]
    cache_ttl_seconds: i64,
    #[serde(default)]
    web_proxy: bool,
    #[serde(default)]
    webdav_policy: Option<String>,
    #[serde(default)]
    enable_sign: bool,
    #[serde(default)]
    sign_expires_sec: Option<i64>,
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl() -> i64 {
    300
}

impl UpsertMountRequest {
    fn into_new_mount(self) -> Result<NewMount, AppError> {
        let mount_path = portico_core::paths::normalize(&self.mount_path)
            .map_err(|e| AppError::bad_request(e.to_string()))?;
        let webdav_policy = match self.webdav_policy.as_deref() {
            None => WebdavPolicy::Redirect302,
            Some(raw) => raw
                .parse::<WebdavPolicy>()
                .map_err(|e| AppError::bad_request(e.to_string()))?,
        };
        Ok(NewMount {
            name: self.name.trim().to_string(),
            mount_path,
            storage_config_id: self.storage_config_id,
            is_active: self.is_active,
            sort_order: self.sort_order,
            cache_ttl_seconds: self.cache_ttl_seconds.max(0),
            web_proxy: self.web_proxy,
            webdav_policy,
            enable_sign: self.enable_sign,
            sign_expires_sec: self.sign_expires_sec,
        })
    }
}

/// Mounts visible to the caller (admins see all; API keys see mounts inside
/// their basic path and storage ACL).
pub(super) async fn list(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
) -> Result<Response, AppError> {
    let mounts = mounts_repo::list(&state.db).await?;
    let visible = portico_vfs::router::visible_mounts(&mounts, &viewer);
    Ok(response::ok(visible))
}

pub(super) async fn create(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
    Json(req): Json<UpsertMountRequest>,
) -> Result<Response, AppError> {
    let new = req.into_new_mount()?;
    if storage_configs_repo::get(&state.db, &new.storage_config_id)
        .await?
        .is_none()
    {
        return Err(AppError::bad_request("unknown storage config"));
    }

    let mount = match mounts_repo::create(&state.db, new).await {
        Ok(mount) => mount,
        Err(error) if error.to_string().contains("UNIQUE") => {
            return Err(AppError::conflict("mount path already in use"));
        }
        Err(error) => return Err(error.into()),
    };
    Ok(response::created(mount))
}

pub(super) async fn get_one(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let mount = mounts_repo::get(&state.db, &id)
        .await?
        .ok_or_else(|| AppError::not_found("no such mount"))?;
    Ok(response::ok(mount))
}

pub(super) async fn update(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
    Path(id): Path<String>,
    Json(req): Json<UpsertMountRequest>,
) -> Result<Response, AppError> {
    let new = req.into_new_mount()?;
    if !mounts_repo::update(&state.db, &id, new).await? {
        return Err(AppError::not_found("no such mount"));
    }
    // Config changed; cached listings for this mount are stale.
    state.fs.cache.invalidate_mount(&id);
    Ok(response::ok_message("updated"))
}

pub(super) async fn delete(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    if !mounts_repo::delete(&state.db, &id).await? {
        return Err(AppError::not_found("no such mount"));
    }
    state.fs.cache.invalidate_mount(&id);
    Ok(response::ok_message("deleted"))
}

/// Field schema the admin UI renders mount forms from.
pub(super) async fn schema(AdminViewer(_): AdminViewer) -> Response {
    response::ok(serde_json::json!({
        "fields": [
            {"name": "name", "type": "string", "required": true},
            {"name": "mountPath", "type": "path", "required": true, "unique": true},
            {"name": "storageConfigId", "type": "storage_config", "required": true},
            {"name": "isActive", "type": "bool", "default": true},
            {"name": "sortOrder", "type": "int", "default": 0},
            {"name": "cacheTtlSeconds", "type": "int", "default": 300},
            {"name": "webProxy", "type": "bool", "default": false},
            {"name": "webdavPolicy", "type": "enum", "values": ["302_redirect", "proxy"], "default": "302_redirect"},
            {"name": "enableSign", "type": "bool", "default": false},
            {"name": "signExpiresSec", "type": "int", "optional": true},
        ],
    }))
}
