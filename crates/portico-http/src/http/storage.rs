//! Storage-config CRUD and storage-type capability metadata.

use axum::Json;
use axum::extract::{Path, State};
use axum::response::Response;
use serde::{Deserialize, Serialize};

use portico_driver_api::ListOptions;
use portico_driver_registry::{DriverConfig, STORAGE_TYPES};
use portico_storage::storage_configs_repo::{self, StorageConfig};

use super::auth::AdminViewer;
use super::{AppError, AppState, response};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigView {
    id: String,
    name: String,
    storage_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider_type: Option<String>,
    /// Connection settings without credentials (those never leave the
    /// server once stored).
    settings: serde_json::Value,
    default_folder: String,
    is_public: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_storage_bytes: Option<i64>,
    is_default: bool,
    created_at: i64,
    updated_at: i64,
}

fn view(config: StorageConfig) -> ConfigView {
    ConfigView {
        id: config.id,
        name: config.name,
        storage_type: config.storage_type,
        provider_type: config.provider_type,
        settings: config.settings,
        default_folder: config.default_folder,
        is_public: config.is_public,
        total_storage_bytes: config.total_storage_bytes,
        is_default: config.is_default,
        created_at: config.created_at,
        updated_at: config.updated_at,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct UpsertConfigRequest {
    name: String,
    #[serde(default)]
    storage_type: Option<String>,
    #[serde(default)]
    provider_type: Option<String>,
    #[serde(default)]
    settings: serde_json::Value,
    /// Secret connection fields; encrypted at rest, never echoed back.
    #[serde(default)]
    credentials: Option<serde_json::Value>,
    #[serde(default)]
    default_folder: String,
    #[serde(default)]
    is_public: bool,
    #[serde(default)]
    total_storage_bytes: Option<i64>,
}

pub(super) async fn list(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
) -> Result<Response, AppError> {
    let configs = storage_configs_repo::list(&state.db).await?;
    Ok(response::ok(configs.into_iter().map(view).collect::<Vec<_>>()))
}

pub(super) async fn create(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
    Json(req): Json<UpsertConfigRequest>,
) -> Result<Response, AppError> {
    let storage_type = req
        .storage_type
        .as_deref()
        .ok_or_else(|| AppError::bad_request("storageType is required"))?;
    if !STORAGE_TYPES.iter().any(|t| *t == storage_type) {
        return Err(AppError::bad_request(format!(
            "unknown storage type: {storage_type}"
        )));
    }

    let config = storage_configs_repo::create(
        &state.db,
        req.name.trim(),
        storage_type,
        req.provider_type.as_deref(),
        req.settings,
        String::new(),
        req.default_folder.trim_matches('/'),
        req.is_public,
        req.total_storage_bytes,
    )
    .await?;

    // Credentials are sealed with the row id as AAD, so encrypt after.
    if let Some(credentials) = req.credentials {
        let sealed = state
            .fs
            .seal_credentials(&config.id, &credentials)
            .map_err(AppError::from)?;
        storage_configs_repo::update(
            &state.db,
            &config.id,
            &config.name,
            config.settings.clone(),
            Some(sealed),
            &config.default_folder,
            config.is_public,
            config.total_storage_bytes,
        )
        .await?;
    }

    Ok(response::created(view(config)))
}

pub(super) async fn get_one(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let config = storage_configs_repo::get(&state.db, &id)
        .await?
        .ok_or_else(|| AppError::not_found("no such storage config"))?;
    Ok(response::ok(view(config)))
}

pub(super) async fn update(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
    Path(id): Path<String>,
    Json(req): Json<UpsertConfigRequest>,
) -> Result<Response, AppError> {
    let existing = storage_configs_repo::get(&state.db, &id)
        .await?
        .ok_or_else(|| AppError::not_found("no such storage config"))?;

    let sealed = match req.credentials {
        Some(credentials) => Some(
            state
                .fs
                .seal_credentials(&existing.id, &credentials)
                .map_err(AppError::from)?,
        ),
        None => None,
    };
    storage_configs_repo::update(
        &state.db,
        &id,
        req.name.trim(),
        req.settings,
        sealed,
        req.default_folder.trim_matches('/'),
        req.is_public,
        req.total_storage_bytes,
    )
    .await?;
    Ok(response::ok_message("updated"))
}

pub(super) async fn delete(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    // Refuse while mounts still reference the config.
    let mounts = portico_storage::mounts_repo::list(&state.db).await?;
    if mounts.iter().any(|m| m.storage_config_id == id) {
        return Err(AppError::conflict("storage config is still mounted"));
    }
    if !storage_configs_repo::delete(&state.db, &id).await? {
        return Err(AppError::not_found("no such storage config"));
    }
    Ok(response::ok_message("deleted"))
}

pub(super) async fn set_default(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    if !storage_configs_repo::set_default(&state.db, &id).await? {
        return Err(AppError::not_found("no such storage config"));
    }
    Ok(response::ok_message("default storage set"))
}

/// Connectivity probe: instantiate the driver and list the root.
pub(super) async fn test(
    State(state): State<AppState>,
    AdminViewer(_): AdminViewer,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let config = storage_configs_repo::get(&state.db, &id)
        .await?
        .ok_or_else(|| AppError::not_found("no such storage config"))?;

    let settings = state.fs.decrypted_settings(&config)?;
    let driver = state.fs.registry().resolve(&DriverConfig {
        id: config.id.clone(),
        storage_type: config.storage_type.clone(),
        settings,
        version: config.updated_at,
    })?;

    let probe = driver
        .list(config.default_folder.trim_matches('/'), &ListOptions::default())
        .await;
    Ok(match probe {
        Ok(listing) => response::ok(serde_json::json!({
            "reachable": true,
            "entries": listing.entries.len(),
        })),
        Err(error) => response::ok(serde_json::json!({
            "reachable": false,
            "error": error.to_string(),
        })),
    })
}

pub(super) async fn types(AdminViewer(_): AdminViewer) -> Response {
    response::ok(STORAGE_TYPES)
}

pub(super) async fn type_capabilities(
    AdminViewer(_): AdminViewer,
    Path(storage_type): Path<String>,
) -> Result<Response, AppError> {
    let caps = portico_driver_registry::type_capabilities(&storage_type)
        .ok_or_else(|| AppError::not_found("unknown storage type"))?;
    Ok(response::ok(caps))
}
