//! Virtual-filesystem endpoints: listing, content, writes, uploads,
//! multipart protocol and search.

use axum::Json;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, header};
use axum::response::Response;
use bytes::Bytes;
use futures_util::TryStreamExt as _;
use serde::Deserialize;

use portico_core::jobs::TriggerType;
use portico_core::permissions;
use portico_driver_api::{ByteStream, PartRecord};
use portico_engine::copy::TASK_COPY;
use portico_engine::upload::select_strategy;
use portico_storage::shares_repo::{self, NewShare, ShareKind};
use portico_vfs::search::SearchQuery;

use super::auth::CurrentViewer;
use super::{AppError, AppState, proxy, response};

fn path_token<'h>(headers: &'h HeaderMap, query_token: Option<&'h str>) -> Option<&'h str> {
    headers
        .get("x-fs-path-token")
        .and_then(|v| v.to_str().ok())
        .or(query_token)
}

#[derive(Debug, Deserialize)]
pub(super) struct PathQuery {
    path: String,
    #[serde(default)]
    path_token: Option<String>,
}

pub(super) async fn list(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Query(query): Query<PathQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let token = path_token(&headers, query.path_token.as_deref());
    let listing = state.fs.list(&viewer, &query.path, token).await?;
    Ok(response::ok(listing))
}

pub(super) async fn get_entry(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Query(query): Query<PathQuery>,
) -> Result<Response, AppError> {
    let detail = state.fs.get(&viewer, &query.path).await?;
    Ok(response::ok(detail))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct DownloadQuery {
    path: String,
    #[serde(default)]
    force_download: Option<bool>,
}

/// 302 to an external URL when one exists, else a Range-capable stream.
pub(super) async fn download(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Query(query): Query<DownloadQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let range = proxy::parse_range(&headers);
    let outcome = state.fs.download(&viewer, &query.path, range).await?;
    let name = portico_core::paths::file_name(&query.path).to_string();
    Ok(proxy::download_response(
        outcome,
        query.force_download.unwrap_or(true),
        &name,
    ))
}

/// Always same-origin streaming; used by previews and text detection.
pub(super) async fn content(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Query(query): Query<PathQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let range = proxy::parse_range(&headers);
    let handle = state.fs.content(&viewer, &query.path, range).await?;
    let name = portico_core::paths::file_name(&query.path).to_string();
    Ok(proxy::stream_response(handle, false, &name))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct FileLinkQuery {
    path: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    force_download: Option<bool>,
}

pub(super) async fn file_link(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Query(query): Query<FileLinkQuery>,
) -> Result<Response, AppError> {
    let (url, link_type) = state
        .fs
        .file_link(
            &viewer,
            &query.path,
            query.expires_in,
            query.force_download.unwrap_or(false),
        )
        .await?;
    Ok(response::ok(serde_json::json!({
        "url": url,
        "linkType": link_type,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateShareRequest {
    path: String,
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    expires_in_sec: Option<i64>,
    #[serde(default)]
    max_views: Option<i64>,
}

/// Share an existing FS file by slug.
pub(super) async fn create_share(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Json(req): Json<CreateShareRequest>,
) -> Result<Response, AppError> {
    if !viewer.is_admin() {
        viewer
            .require_permission(permissions::FILE_SHARE)
            .map_err(AppError::from)?;
    }

    let resolved = state
        .fs
        .resolve(&viewer, &req.path, permissions::MOUNT_VIEW)
        .await?;
    let entry = resolved
        .driver
        .stat(&resolved.key)
        .await
        .map_err(AppError::from)?
        .ok_or_else(|| AppError::not_found("no such file"))?;
    if entry.is_directory {
        return Err(AppError::bad_request("directories cannot be shared"));
    }

    let password_hash = match req.password.as_deref().filter(|p| !p.is_empty()) {
        Some(password) => Some(portico_storage::password::hash_password(password)?),
        None => None,
    };
    let share = shares_repo::create(
        &state.db,
        NewShare {
            slug: req.slug.clone(),
            kind: ShareKind::File,
            target: resolved.key.clone(),
            storage_config_id: Some(resolved.config.id.clone()),
            filename: Some(entry.name.clone()),
            size: Some(entry.size as i64),
            content_type: entry.content_type.clone(),
            password_hash,
            max_views: req.max_views,
            expires_at: req
                .expires_in_sec
                .map(|sec| time::OffsetDateTime::now_utc().unix_timestamp() + sec),
            created_by: viewer.owner_id(),
        },
    )
    .await
    .map_err(|e| {
        if e.to_string().contains("conflict") {
            AppError::conflict("slug already taken")
        } else {
            e.into()
        }
    })?;

    Ok(response::created(serde_json::json!({
        "slug": share.slug,
        "previewUrl": format!("/api/s/{}", share.slug),
        "downloadUrl": format!("/api/s/{}?download=true", share.slug),
    })))
}

#[derive(Debug, Deserialize)]
pub(super) struct MkdirRequest {
    path: String,
}

pub(super) async fn mkdir(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Json(req): Json<MkdirRequest>,
) -> Result<Response, AppError> {
    state.fs.mkdir(&viewer, &req.path).await?;
    Ok(response::created(serde_json::json!({ "path": req.path })))
}

#[derive(Debug, Deserialize)]
pub(super) struct UploadQuery {
    path: String,
    #[serde(default)]
    mode: Option<String>,
}

/// Direct upload through the gateway (backend-stream strategy). The body
/// streams straight to the driver.
pub(super) async fn upload(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let resolved = state
        .fs
        .resolve(&viewer, &query.path, permissions::MOUNT_UPLOAD)
        .await?;

    let strategy = select_strategy(
        resolved.driver.capabilities(),
        Some(query.mode.as_deref().unwrap_or("stream")),
    )
    .map_err(AppError::from)?;

    let size = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| AppError::bad_request("Content-Length is required"))?;
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let stream: ByteStream = Box::pin(
        body.into_data_stream()
            .map_err(std::io::Error::other),
    );
    let result = state
        .fs
        .write_resolved(&resolved, stream, size, &content_type)
        .await?;

    Ok(response::created(serde_json::json!({
        "path": resolved.path,
        "etag": result.etag,
        "strategy": strategy.as_str(),
    })))
}

#[derive(Debug, Deserialize)]
pub(super) struct UpdateRequest {
    path: String,
    content: String,
    #[serde(default)]
    content_type: Option<String>,
}

/// Small textual writes with full-overwrite semantics.
pub(super) async fn update(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Json(req): Json<UpdateRequest>,
) -> Result<Response, AppError> {
    let result = state
        .fs
        .update(
            &viewer,
            &req.path,
            req.content.into_bytes(),
            req.content_type.as_deref().unwrap_or("text/plain"),
        )
        .await?;
    Ok(response::ok(serde_json::json!({ "etag": result.etag })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RenameRequest {
    source_path: String,
    target_path: String,
}

pub(super) async fn rename(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Json(req): Json<RenameRequest>,
) -> Result<Response, AppError> {
    state
        .fs
        .rename(&viewer, &req.source_path, &req.target_path)
        .await?;
    Ok(response::ok_message("renamed"))
}

#[derive(Debug, Deserialize)]
pub(super) struct BatchRemoveRequest {
    paths: Vec<String>,
}

pub(super) async fn batch_remove(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Json(req): Json<BatchRemoveRequest>,
) -> Result<Response, AppError> {
    let results = state.fs.batch_remove(&viewer, &req.paths).await?;
    Ok(response::ok(results))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct BatchCopyRequest {
    items: Vec<portico_engine::copy::CopyItem>,
    #[serde(default)]
    options: serde_json::Value,
}

/// Batch copies run as a `copy` job; paths are permission-checked here,
/// the job itself executes with system credentials.
pub(super) async fn batch_copy(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Json(req): Json<BatchCopyRequest>,
) -> Result<Response, AppError> {
    if req.items.is_empty() {
        return Err(AppError::bad_request("no items to copy"));
    }
    for item in &req.items {
        viewer
            .require_permission(permissions::MOUNT_COPY)
            .map_err(AppError::from)?;
        viewer.check_path(&item.source_path).map_err(AppError::from)?;
        viewer.check_path(&item.target_path).map_err(AppError::from)?;
    }

    let payload = serde_json::json!({
        "items": req.items,
        "options": req.options,
    });
    let job = state
        .jobs
        .submit(TASK_COPY, payload, &viewer.owner_id(), TriggerType::Api)
        .await?;
    Ok(response::created(serde_json::json!({
        "jobId": job.job_id,
        "taskType": job.task_type,
        "status": job.status,
    })))
}

pub(super) async fn search(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Query(query): Query<SearchQuery>,
) -> Result<Response, AppError> {
    let result = state.search.search(&state.db, &viewer, &query).await?;
    Ok(response::ok(result))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct PresignRequest {
    path: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    sha256: Option<String>,
}

pub(super) async fn presign(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Json(req): Json<PresignRequest>,
) -> Result<Response, AppError> {
    let presigned = state
        .upload
        .presign_single(
            &viewer,
            &req.path,
            req.size,
            req.content_type.as_deref().unwrap_or(""),
            req.sha256.as_deref(),
        )
        .await?;
    Ok(response::ok(presigned))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct PresignCommitRequest {
    path: String,
    #[serde(default)]
    etag: Option<String>,
    #[serde(default)]
    sha256: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    size: u64,
}

pub(super) async fn presign_commit(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Json(req): Json<PresignCommitRequest>,
) -> Result<Response, AppError> {
    let result = state
        .upload
        .commit_presigned(
            &viewer,
            &req.path,
            req.etag.as_deref(),
            req.sha256.as_deref(),
            req.content_type.as_deref(),
            req.size,
        )
        .await?;
    Ok(response::ok(serde_json::json!({
        "path": req.path,
        "etag": result.etag,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct MultipartInitRequest {
    path: String,
    size: u64,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    part_size: Option<u64>,
    #[serde(default)]
    sha256: Option<String>,
}

pub(super) async fn multipart_init(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Json(req): Json<MultipartInitRequest>,
) -> Result<Response, AppError> {
    let init = state
        .upload
        .init_multipart(
            &viewer,
            &req.path,
            req.size,
            req.content_type.as_deref().unwrap_or(""),
            req.part_size,
            req.sha256.as_deref(),
        )
        .await?;
    Ok(response::ok(init))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ChunkQuery {
    file_id: String,
    part_number: u32,
}

pub(super) async fn multipart_upload_chunk(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Query(query): Query<ChunkQuery>,
    body: Bytes,
) -> Result<Response, AppError> {
    let chunk = state
        .upload
        .upload_chunk(&viewer, &query.file_id, query.part_number, body)
        .await?;
    Ok(response::ok(chunk))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CompleteRequest {
    file_id: String,
    #[serde(default)]
    parts: Vec<PartRecord>,
}

pub(super) async fn multipart_complete(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Json(req): Json<CompleteRequest>,
) -> Result<Response, AppError> {
    let done = state
        .upload
        .complete(&viewer, &req.file_id, &req.parts)
        .await?;
    Ok(response::ok(done))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct AbortRequest {
    file_id: String,
}

pub(super) async fn multipart_abort(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Json(req): Json<AbortRequest>,
) -> Result<Response, AppError> {
    state.upload.abort(&viewer, &req.file_id).await;
    Ok(response::ok_message("aborted"))
}

pub(super) async fn multipart_list_uploads(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
) -> Result<Response, AppError> {
    let owner = if viewer.is_admin() {
        None
    } else {
        Some(viewer.owner_id())
    };
    let sessions = state.upload.sessions.summaries(owner.as_deref()).await;
    Ok(response::ok(sessions))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ListPartsQuery {
    file_id: String,
}

pub(super) async fn multipart_list_parts(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Query(query): Query<ListPartsQuery>,
) -> Result<Response, AppError> {
    let parts = state.upload.list_parts(&viewer, &query.file_id).await?;
    Ok(response::ok(parts))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RefreshUrlsRequest {
    file_id: String,
    part_numbers: Vec<u32>,
}

pub(super) async fn multipart_refresh_urls(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Json(req): Json<RefreshUrlsRequest>,
) -> Result<Response, AppError> {
    let signed = state
        .upload
        .sign_parts(&viewer, &req.file_id, &req.part_numbers)
        .await?;
    Ok(response::ok(signed))
}
