//! Per-directory metadata management and directory-password verification.

use axum::Json;
use axum::extract::{Query, State};
use axum::response::Response;
use serde::Deserialize;

use portico_storage::fs_meta_repo::{self, DirectoryMeta};
use portico_storage::password::hash_password;
use portico_vfs::meta::DEFAULT_PATH_TOKEN_TTL_SECS;

use super::auth::{AdminViewer, CurrentViewer};
use super::{AppError, AppState, response};

#[derive(Debug, Deserialize)]
pub(super) struct MetaQuery {
    path: String,
}

/// Effective metadata for a path (inheritance applied). Admin-only: raw
/// hide patterns and password presence are management data.
pub(super) async fn get_meta(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
    Query(query): Query<MetaQuery>,
) -> Result<Response, AppError> {
    let path = portico_core::paths::normalize(&query.path)
        .map_err(|e| AppError::bad_request(e.to_string()))?;
    let chain = fs_meta_repo::chain_for(&state.db, &path).await?;
    let (effective, password_source) = fs_meta_repo::effective_meta(&chain, &path);
    let own = fs_meta_repo::get(&state.db, &path).await?;

    Ok(response::ok(serde_json::json!({
        "effective": effective,
        "own": own,
        "passwordSource": password_source,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct PutMetaRequest {
    path: String,
    #[serde(default)]
    header_markdown: Option<String>,
    #[serde(default)]
    header_inherit: bool,
    #[serde(default)]
    footer_markdown: Option<String>,
    #[serde(default)]
    footer_inherit: bool,
    #[serde(default)]
    hide_patterns: Vec<String>,
    #[serde(default)]
    hide_inherit: bool,
    /// Plaintext; hashed at rest. `None` keeps the current password.
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    password_inherit: bool,
    /// Explicitly drop the password.
    #[serde(default)]
    clear_password: bool,
}

pub(super) async fn put_meta(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
    Json(req): Json<PutMetaRequest>,
) -> Result<Response, AppError> {
    let path = portico_core::paths::normalize(&req.path)
        .map_err(|e| AppError::bad_request(e.to_string()))?;

    // Validate patterns up front so broken regexes never reach listings.
    for pattern in &req.hide_patterns {
        regex::Regex::new(pattern)
            .map_err(|e| AppError::bad_request(format!("invalid hide pattern: {e}")))?;
    }

    let password_hash = if req.clear_password {
        None
    } else {
        match req.password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => Some(hash_password(password)?),
            None => fs_meta_repo::get(&state.db, &path)
                .await?
                .and_then(|m| m.password_hash),
        }
    };

    fs_meta_repo::upsert(
        &state.db,
        &DirectoryMeta {
            path: path.clone(),
            header_markdown: req.header_markdown,
            header_inherit: req.header_inherit,
            footer_markdown: req.footer_markdown,
            footer_inherit: req.footer_inherit,
            hide_patterns: req.hide_patterns,
            hide_inherit: req.hide_inherit,
            password_hash,
            password_inherit: req.password_inherit,
        },
    )
    .await?;
    Ok(response::ok_message("metadata saved"))
}

pub(super) async fn delete_meta(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
    Query(query): Query<MetaQuery>,
) -> Result<Response, AppError> {
    let path = portico_core::paths::normalize(&query.path)
        .map_err(|e| AppError::bad_request(e.to_string()))?;
    if !fs_meta_repo::delete(&state.db, &path).await? {
        return Err(AppError::not_found("no metadata at this path"));
    }
    Ok(response::ok_message("metadata removed"))
}

#[derive(Debug, Deserialize)]
pub(super) struct VerifyPasswordRequest {
    path: String,
    password: String,
}

/// Trade a directory password for a path token scoped to the protected
/// prefix.
pub(super) async fn verify_password(
    State(state): State<AppState>,
    CurrentViewer(_viewer): CurrentViewer,
    Json(req): Json<VerifyPasswordRequest>,
) -> Result<Response, AppError> {
    let path = portico_core::paths::normalize(&req.path)
        .map_err(|e| AppError::bad_request(e.to_string()))?;
    let chain = fs_meta_repo::chain_for(&state.db, &path).await?;
    let (effective, password_source) = fs_meta_repo::effective_meta(&chain, &path);

    let (Some(hash), Some(source)) = (effective.password_hash.as_deref(), password_source) else {
        return Err(AppError::bad_request("this path is not password-protected"));
    };
    if !portico_storage::password::verify_password(&req.password, hash) {
        return Err(AppError::unauthorized("wrong password"));
    }

    let token = state
        .fs
        .path_tokens
        .issue(&source, DEFAULT_PATH_TOKEN_TTL_SECS);
    Ok(response::ok(serde_json::json!({
        "pathToken": token,
        "scope": source,
        "expiresInSec": DEFAULT_PATH_TOKEN_TTL_SECS,
    })))
}
