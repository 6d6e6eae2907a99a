//! Admin auth, API-key management, settings, dashboard and cache admin.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use serde::{Deserialize, Serialize};
use sqlx::Row as _;

use portico_storage::{admins_repo, api_keys_repo, settings_repo};
use portico_vfs::Viewer;

use super::auth::{AdminViewer, CurrentViewer, bearer_token};
use super::{AppError, AppState, response};

pub(super) async fn guest_config(State(state): State<AppState>) -> Result<Response, AppError> {
    let site_name = settings_repo::get_or_default(&state.db, "site_name").await?;
    let guest_shares = settings_repo::get_or_default(&state.db, "guest_shares_enabled").await?;
    Ok(response::ok(serde_json::json!({
        "siteName": site_name,
        "guestSharesEnabled": guest_shares.as_deref() == Some("true"),
    })))
}

#[derive(Debug, Deserialize)]
pub(super) struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginData {
    token: String,
    expires_at: i64,
    username: String,
}

pub(super) async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Response, AppError> {
    let admin = admins_repo::authenticate(&state.db, &req.username, &req.password)
        .await?
        .ok_or_else(|| AppError::unauthorized("invalid credentials"))?;
    let (token, expires_at) = admins_repo::create_token(&state.db, &admin.id).await?;
    Ok(response::ok(LoginData {
        token,
        expires_at,
        username: admin.username,
    }))
}

pub(super) async fn logout(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    if let Some(token) = bearer_token(&headers) {
        admins_repo::delete_token(&state.db, &token).await?;
    }
    Ok(response::ok_message("logged out"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ChangePasswordRequest {
    old_password: String,
    new_password: String,
}

pub(super) async fn change_password(
    State(state): State<AppState>,
    AdminViewer(viewer): AdminViewer,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<Response, AppError> {
    let Viewer::Admin { admin_id } = &viewer else {
        return Err(AppError::forbidden("admin access required"));
    };
    if req.new_password.len() < 8 {
        return Err(AppError::bad_request("new password must be at least 8 characters"));
    }

    // Re-verify the old password before rotating.
    let row = sqlx::query("SELECT username FROM admins WHERE id = ? LIMIT 1")
        .bind(admin_id)
        .fetch_one(&state.db)
        .await?;
    let username = row.get::<String, _>("username");
    if admins_repo::authenticate(&state.db, &username, &req.old_password)
        .await?
        .is_none()
    {
        return Err(AppError::unauthorized("old password is wrong"));
    }

    admins_repo::change_password(&state.db, admin_id, &req.new_password).await?;
    Ok(response::ok_message("password changed; sign in again"))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiKeyView {
    id: String,
    name: String,
    permissions: u32,
    basic_path: String,
    is_guest: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
    created_at: i64,
    storage_acl: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<String>,
}

fn key_view(key: api_keys_repo::ApiKey, secret: Option<String>) -> ApiKeyView {
    ApiKeyView {
        id: key.id,
        name: key.name,
        permissions: key.permissions,
        basic_path: key.basic_path,
        is_guest: key.is_guest,
        expires_at: key.expires_at,
        created_at: key.created_at,
        storage_acl: key.storage_acl,
        key: secret,
    }
}

pub(super) async fn list_api_keys(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
) -> Result<Response, AppError> {
    let keys = api_keys_repo::list(&state.db).await?;
    Ok(response::ok(
        keys.into_iter().map(|k| key_view(k, None)).collect::<Vec<_>>(),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateApiKeyRequest {
    name: String,
    #[serde(default)]
    permissions: u32,
    #[serde(default = "default_basic_path")]
    basic_path: String,
    #[serde(default)]
    is_guest: bool,
    #[serde(default)]
    expires_at: Option<i64>,
}

fn default_basic_path() -> String {
    "/".to_string()
}

pub(super) async fn create_api_key(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
    Json(req): Json<CreateApiKeyRequest>,
) -> Result<Response, AppError> {
    let basic_path = portico_core::paths::normalize(&req.basic_path)
        .map_err(|e| AppError::bad_request(e.to_string()))?;
    let (key, secret) = api_keys_repo::create(
        &state.db,
        req.name.trim(),
        req.permissions,
        &basic_path,
        req.is_guest,
        req.expires_at,
    )
    .await?;
    // The plaintext secret is returned exactly once.
    Ok(response::created(key_view(key, Some(secret))))
}

pub(super) async fn get_api_key(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let key = api_keys_repo::get(&state.db, &id)
        .await?
        .ok_or_else(|| AppError::not_found("no such API key"))?;
    Ok(response::ok(key_view(key, None)))
}

pub(super) async fn update_api_key(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
    Path(id): Path<String>,
    Json(req): Json<CreateApiKeyRequest>,
) -> Result<Response, AppError> {
    let basic_path = portico_core::paths::normalize(&req.basic_path)
        .map_err(|e| AppError::bad_request(e.to_string()))?;
    let updated = api_keys_repo::update(
        &state.db,
        &id,
        req.name.trim(),
        req.permissions,
        &basic_path,
        req.expires_at,
    )
    .await?;
    if !updated {
        return Err(AppError::not_found("no such API key"));
    }
    Ok(response::ok_message("updated"))
}

pub(super) async fn delete_api_key(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    if !api_keys_repo::delete(&state.db, &id).await? {
        return Err(AppError::not_found("no such API key"));
    }
    Ok(response::ok_message("deleted"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct StorageAclRequest {
    storage_config_ids: Vec<String>,
}

pub(super) async fn set_api_key_storage_acl(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
    Path(id): Path<String>,
    Json(req): Json<StorageAclRequest>,
) -> Result<Response, AppError> {
    if api_keys_repo::get(&state.db, &id).await?.is_none() {
        return Err(AppError::not_found("no such API key"));
    }
    api_keys_repo::set_storage_acl(&state.db, &id, &req.storage_config_ids).await?;
    Ok(response::ok_message("storage ACL updated"))
}

pub(super) async fn list_settings(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
) -> Result<Response, AppError> {
    Ok(response::ok(settings_repo::all(&state.db).await?))
}

pub(super) async fn settings_metadata(AdminViewer(_): AdminViewer) -> Response {
    response::ok(settings_repo::METADATA)
}

pub(super) async fn settings_groups(AdminViewer(_): AdminViewer) -> Response {
    response::ok(serde_json::json!([
        {"id": settings_repo::GROUP_GENERAL, "name": "general"},
        {"id": settings_repo::GROUP_UPLOAD, "name": "upload"},
        {"id": settings_repo::GROUP_INDEX, "name": "index"},
        {"id": settings_repo::GROUP_WEBDAV, "name": "webdav"},
    ]))
}

pub(super) async fn settings_group(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
    Path(gid): Path<i64>,
) -> Result<Response, AppError> {
    Ok(response::ok(settings_repo::group(&state.db, gid).await?))
}

pub(super) async fn update_settings_group(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
    Path(gid): Path<i64>,
    Json(values): Json<std::collections::BTreeMap<String, String>>,
) -> Result<Response, AppError> {
    for (key, value) in &values {
        let known = settings_repo::METADATA
            .iter()
            .any(|m| m.key == key.as_str() && m.group_id == gid);
        if !known {
            return Err(AppError::bad_request(format!(
                "unknown setting {key} for group {gid}"
            )));
        }
        settings_repo::set(&state.db, key, value).await?;
    }
    Ok(response::ok_message("settings updated"))
}

pub(super) async fn dashboard_stats(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
) -> Result<Response, AppError> {
    async fn count(db: &sqlx::SqlitePool, sql: &str) -> Result<i64, AppError> {
        Ok(sqlx::query(sql).fetch_one(db).await?.get::<i64, _>(0))
    }

    Ok(response::ok(serde_json::json!({
        "mounts": count(&state.db, "SELECT COUNT(1) FROM mounts").await?,
        "storageConfigs": count(&state.db, "SELECT COUNT(1) FROM storage_configs").await?,
        "apiKeys": count(&state.db, "SELECT COUNT(1) FROM api_keys").await?,
        "shares": count(&state.db, "SELECT COUNT(1) FROM share_records").await?,
        "activeJobs": count(
            &state.db,
            "SELECT COUNT(1) FROM jobs WHERE status IN ('pending', 'running', 'cancelling')",
        )
        .await?,
        "indexedEntries": count(&state.db, "SELECT COUNT(1) FROM fs_search_index_entries").await?,
    })))
}

pub(super) async fn cache_stats(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
) -> Response {
    response::ok(state.fs.cache.stats())
}

/// Admins flush everything; API keys flush only their own view.
pub(super) async fn cache_clear(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
) -> Result<Response, AppError> {
    match &viewer {
        Viewer::Admin { .. } => {
            state.fs.cache.clear(None);
            state.search.flush();
        }
        Viewer::ApiKey(_) => {
            state.fs.cache.clear(Some(&viewer.scope_key()));
        }
    }
    Ok(response::ok_message("cache cleared"))
}
