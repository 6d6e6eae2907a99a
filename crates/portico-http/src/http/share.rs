//! Share service: slug-addressed file/text shares, the public `/api/s/:slug`
//! stream, the ticketed URL proxy, and the files admin surface.

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, header};
use axum::response::Response;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};

use portico_core::{permissions, paths};
use portico_driver_api::ByteStream;
use portico_driver_registry::DriverConfig;
use portico_storage::password::{hash_password, verify_password};
use portico_storage::shares_repo::{self, NewShare, ShareKind, ShareRecord};
use portico_storage::storage_configs_repo;
use portico_vfs::Viewer;

use super::auth::CurrentViewer;
use super::{AppError, AppState, proxy, response};

const TICKET_TTL_SECS: i64 = 60;

/// Default storage config, with its driver, for share uploads.
async fn default_backend(
    state: &AppState,
) -> Result<
    (
        portico_storage::storage_configs_repo::StorageConfig,
        std::sync::Arc<dyn portico_driver_api::Driver>,
    ),
    AppError,
> {
    let configs = storage_configs_repo::list(&state.db).await?;
    let config = configs
        .into_iter()
        .find(|c| c.is_default)
        .ok_or_else(|| AppError::bad_request("no default storage config is set"))?;
    let settings = state.fs.decrypted_settings(&config)?;
    let driver = state.fs.registry().resolve(&DriverConfig {
        id: config.id.clone(),
        storage_type: config.storage_type.clone(),
        settings,
        version: config.updated_at,
    })?;
    Ok((config, driver))
}

fn require_file_share(viewer: &Viewer) -> Result<(), AppError> {
    viewer
        .require_permission(permissions::FILE_SHARE)
        .map_err(AppError::from)
}

fn share_key(default_folder: &str, filename: &str) -> String {
    // Shares land under a date-sharded prefix so names cannot collide.
    let date = time::OffsetDateTime::now_utc();
    let shard = format!(
        "{:04}{:02}",
        date.year(),
        u8::from(date.month())
    );
    paths::storage_key(
        default_folder,
        &format!("shares/{shard}/{}-{filename}", &uuid::Uuid::new_v4().to_string()[..8]),
    )
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ShareView {
    slug: String,
    kind: ShareKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
    views: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_views: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
    requires_password: bool,
    created_at: i64,
    /// `null` until the password is verified.
    preview_url: Option<String>,
    download_url: Option<String>,
    link_type: &'static str,
}

fn share_view(record: &ShareRecord, unlocked: bool) -> ShareView {
    let locked = record.password_hash.is_some() && !unlocked;
    let (preview, download) = if locked {
        (None, None)
    } else {
        (
            Some(format!("/api/s/{}", record.slug)),
            Some(format!("/api/s/{}?download=true", record.slug)),
        )
    };
    ShareView {
        slug: record.slug.clone(),
        kind: record.kind,
        filename: record.filename.clone(),
        size: record.size,
        content_type: record.content_type.clone(),
        views: record.views,
        max_views: record.max_views,
        expires_at: record.expires_at,
        requires_password: record.password_hash.is_some(),
        created_at: record.created_at,
        preview_url: preview,
        download_url: download,
        // `/api/s/:slug` always streams same-origin; the link type is
        // informational only.
        link_type: "proxy",
    }
}

async fn live_share(state: &AppState, slug: &str) -> Result<ShareRecord, AppError> {
    let record = shares_repo::get(&state.db, slug)
        .await?
        .ok_or_else(|| AppError::not_found("no such share"))?;
    if record.is_expired(time::OffsetDateTime::now_utc().unix_timestamp()) {
        return Err(AppError::gone("this share has expired"));
    }
    Ok(record)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SharePresignRequest {
    filename: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    sha256: Option<String>,
}

/// Presign a direct-to-backend share upload against the default storage.
pub(super) async fn presign(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Json(req): Json<SharePresignRequest>,
) -> Result<Response, AppError> {
    require_file_share(&viewer)?;
    let (config, driver) = default_backend(&state).await?;
    if !driver.capabilities().share.presigned {
        return Err(AppError::bad_request(
            "the default storage does not support presigned share uploads",
        ));
    }

    let key = share_key(&config.default_folder, req.filename.trim());
    let presigned = driver
        .presign_single(
            &key,
            req.size,
            req.content_type.as_deref().unwrap_or(""),
            req.sha256.as_deref(),
        )
        .await
        .map_err(AppError::from)?;
    Ok(response::ok(serde_json::json!({
        "key": key,
        "presign": presigned,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ShareCommitRequest {
    key: String,
    filename: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    etag: Option<String>,
    #[serde(default)]
    sha256: Option<String>,
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    expires_in_sec: Option<i64>,
    #[serde(default)]
    max_views: Option<i64>,
}

/// Finalize a presigned share upload: verify with the driver, then create
/// the share record.
pub(super) async fn commit(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Json(req): Json<ShareCommitRequest>,
) -> Result<Response, AppError> {
    require_file_share(&viewer)?;
    let (config, driver) = default_backend(&state).await?;

    driver
        .commit_presigned(&portico_driver_api::CommitRequest {
            key: req.key.clone(),
            etag: req.etag.clone(),
            sha256: req.sha256.clone(),
            content_type: req.content_type.clone(),
            size: req.size,
        })
        .await
        .map_err(AppError::from)?;

    let password_hash = match req.password.as_deref().filter(|p| !p.is_empty()) {
        Some(password) => Some(hash_password(password)?),
        None => None,
    };
    let share = shares_repo::create(
        &state.db,
        NewShare {
            slug: req.slug,
            kind: ShareKind::File,
            target: req.key,
            storage_config_id: Some(config.id),
            filename: Some(req.filename),
            size: Some(req.size as i64),
            content_type: req.content_type,
            password_hash,
            max_views: req.max_views,
            expires_at: req
                .expires_in_sec
                .map(|sec| time::OffsetDateTime::now_utc().unix_timestamp() + sec),
            created_by: viewer.owner_id(),
        },
    )
    .await?;
    Ok(response::created(share_view(&share, true)))
}

/// Stream a share upload through the gateway (backend-stream mode); the
/// filename arrives URL-encoded in `X-Share-Filename`.
pub(super) async fn upload(
    State(state): State<AppState>,
    viewer: CurrentViewer,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let filename = headers
        .get("x-share-filename")
        .and_then(|v| v.to_str().ok())
        .map(|v| percent_decode_str(v).decode_utf8_lossy().to_string())
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| AppError::bad_request("X-Share-Filename is required"))?;
    upload_with_filename(state, viewer, filename, headers, body).await
}

/// Same upload path, with the filename in the URL.
pub(super) async fn upload_direct(
    State(state): State<AppState>,
    viewer: CurrentViewer,
    Path(filename): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let filename = percent_decode_str(&filename).decode_utf8_lossy().to_string();
    if filename.trim().is_empty() {
        return Err(AppError::bad_request("filename is required"));
    }
    upload_with_filename(state, viewer, filename, headers, body).await
}

async fn upload_with_filename(
    state: AppState,
    CurrentViewer(viewer): CurrentViewer,
    filename: String,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    use futures_util::TryStreamExt as _;

    require_file_share(&viewer)?;
    let (config, driver) = default_backend(&state).await?;
    if !driver.capabilities().share.backend_stream {
        return Err(AppError::bad_request(
            "the default storage does not accept streamed share uploads",
        ));
    }
    let size = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| AppError::bad_request("Content-Length is required"))?;
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    let key = share_key(&config.default_folder, filename.trim());
    let stream: ByteStream = Box::pin(body.into_data_stream().map_err(std::io::Error::other));
    driver
        .write(&key, stream, size, &content_type)
        .await
        .map_err(AppError::from)?;

    let share = shares_repo::create(
        &state.db,
        NewShare {
            slug: None,
            kind: ShareKind::File,
            target: key,
            storage_config_id: Some(config.id),
            filename: Some(filename),
            size: Some(size as i64),
            content_type: Some(content_type),
            password_hash: None,
            max_views: None,
            expires_at: None,
            created_by: viewer.owner_id(),
        },
    )
    .await?;
    Ok(response::created(share_view(&share, true)))
}

/// Public share view; password-protected shares come back with null URLs.
pub(super) async fn get_share(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Response, AppError> {
    let record = live_share(&state, &slug).await?;
    Ok(response::ok(share_view(&record, false)))
}

#[derive(Debug, Deserialize)]
pub(super) struct VerifyRequest {
    password: String,
}

pub(super) async fn verify(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(req): Json<VerifyRequest>,
) -> Result<Response, AppError> {
    let record = live_share(&state, &slug).await?;
    let Some(hash) = record.password_hash.as_deref() else {
        return Ok(response::ok(share_view(&record, true)));
    };
    if !verify_password(&req.password, hash) {
        return Err(AppError::unauthorized("wrong password"));
    }
    Ok(response::ok(share_view(&record, true)))
}

#[derive(Debug, Deserialize)]
pub(super) struct StreamQuery {
    #[serde(default)]
    download: Option<bool>,
    #[serde(default)]
    password: Option<String>,
}

async fn open_share_stream(
    state: &AppState,
    record: &ShareRecord,
    range: Option<portico_driver_api::ByteRange>,
) -> Result<portico_driver_api::ReadHandle, AppError> {
    match record.kind {
        ShareKind::Text => {
            let body = record.target.clone().into_bytes();
            let total = body.len() as u64;
            Ok(portico_driver_api::ReadHandle {
                stream: Box::pin(futures_util::stream::once(async move {
                    Ok(bytes::Bytes::from(body))
                })),
                content_type: record
                    .content_type
                    .clone()
                    .unwrap_or_else(|| "text/plain; charset=utf-8".to_string()),
                size: total,
                total_size: total,
                etag: None,
                content_range: None,
            })
        }
        ShareKind::File => {
            let config_id = record
                .storage_config_id
                .as_deref()
                .ok_or_else(|| AppError::conflict("share has no storage backing"))?;
            let config = storage_configs_repo::get(&state.db, config_id)
                .await?
                .ok_or_else(|| AppError::gone("the share's storage is gone"))?;
            let settings = state.fs.decrypted_settings(&config)?;
            let driver = state.fs.registry().resolve(&DriverConfig {
                id: config.id.clone(),
                storage_type: config.storage_type.clone(),
                settings,
                version: config.updated_at,
            })?;
            Ok(driver.read(&record.target, range).await.map_err(AppError::from)?)
        }
    }
}

/// `/api/s/:slug`: always same-origin, Range-capable streaming.
pub(super) async fn stream(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let record = live_share(&state, &slug).await?;

    if let Some(hash) = record.password_hash.as_deref() {
        let ok = query
            .password
            .as_deref()
            .is_some_and(|p| verify_password(p, hash));
        if !ok {
            return Err(AppError::unauthorized("password required"));
        }
    }

    // The view budget is consumed atomically; full reads only (range
    // continuations of the same view are free).
    let range = proxy::parse_range(&headers);
    if range.is_none() && !shares_repo::consume_view(&state.db, &slug).await? {
        return Err(AppError::gone("this share has expired"));
    }

    let handle = open_share_stream(&state, &record, range).await?;
    let name = record.filename.clone().unwrap_or_else(|| slug.clone());
    Ok(proxy::stream_response(
        handle,
        query.download.unwrap_or(false),
        &name,
    ))
}

/// Same as `stream`, but for authenticated preview flows.
pub(super) async fn content(
    State(state): State<AppState>,
    CurrentViewer(_viewer): CurrentViewer,
    Path(slug): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let record = live_share(&state, &slug).await?;
    let range = proxy::parse_range(&headers);
    let handle = open_share_stream(&state, &record, range).await?;
    let name = record.filename.clone().unwrap_or_else(|| slug.clone());
    Ok(proxy::stream_response(handle, false, &name))
}

#[derive(Debug, Deserialize)]
pub(super) struct UrlQuery {
    url: String,
}

/// Probe an external URL (size, content type) before a URL-import.
pub(super) async fn url_info(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Query(query): Query<UrlQuery>,
) -> Result<Response, AppError> {
    require_file_share(&viewer)?;
    let _ = &state;
    let url = url::Url::parse(&query.url).map_err(|_| AppError::bad_request("invalid url"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(AppError::bad_request("only http(s) URLs are supported"));
    }

    let client = reqwest_client()?;
    let res = client
        .head(url.clone())
        .send()
        .await
        .map_err(|e| AppError::bad_request(format!("HEAD failed: {e}")))?;
    let size = res
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let content_type = res
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let filename = url
        .path_segments()
        .and_then(|mut s| s.next_back())
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Ok(response::ok(serde_json::json!({
        "size": size,
        "contentType": content_type,
        "filename": filename,
        "status": res.status().as_u16(),
    })))
}

#[derive(Debug, Deserialize)]
pub(super) struct ProxyTicketRequest {
    url: String,
}

/// Short-lived ticket authorizing one URL through the pass-through proxy.
pub(super) async fn url_proxy_ticket(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Json(req): Json<ProxyTicketRequest>,
) -> Result<Response, AppError> {
    require_file_share(&viewer)?;
    url::Url::parse(&req.url).map_err(|_| AppError::bad_request("invalid url"))?;

    let expires_at = time::OffsetDateTime::now_utc().unix_timestamp() + TICKET_TTL_SECS;
    let ticket = state.tickets.sign("GET", &req.url, expires_at);
    Ok(response::ok(serde_json::json!({
        "ticket": ticket,
        "exp": expires_at,
    })))
}

#[derive(Debug, Deserialize)]
pub(super) struct UrlProxyQuery {
    url: String,
    ticket: String,
    exp: i64,
}

/// Ticketed pass-through: stream upstream content same-origin, preserving
/// the upstream content type.
pub(super) async fn url_proxy(
    State(state): State<AppState>,
    Query(query): Query<UrlProxyQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    if !state.tickets.verify("GET", &query.url, query.exp, &query.ticket) {
        return Err(AppError::unauthorized("invalid or expired ticket"));
    }
    let url = url::Url::parse(&query.url).map_err(|_| AppError::bad_request("invalid url"))?;

    let client = reqwest_client()?;
    let mut upstream = client.get(url);
    if let Some(range) = headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        upstream = upstream.header(header::RANGE, range);
    }
    let res = upstream
        .send()
        .await
        .map_err(|e| AppError::bad_request(format!("upstream fetch failed: {e}")))?;
    if !res.status().is_success() {
        return Err(AppError::new(
            axum::http::StatusCode::BAD_GATEWAY,
            format!("upstream returned HTTP {}", res.status()),
        ));
    }

    use futures_util::TryStreamExt as _;
    let size = res.content_length().unwrap_or(0);
    let content_type = res
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let content_range = res
        .headers()
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let handle = portico_driver_api::ReadHandle {
        stream: Box::pin(res.bytes_stream().map_err(std::io::Error::other)),
        content_type,
        size,
        total_size: size,
        etag: None,
        content_range,
    };
    Ok(proxy::stream_response(handle, false, "download"))
}

fn reqwest_client() -> Result<reqwest::Client, AppError> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(60))
        .build()
        .map_err(|e| AppError::from(anyhow::anyhow!("http client: {e}")))
}

// ---- files admin surface ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(super) enum DeleteMode {
    /// Remove the record and the stored object (default).
    Both,
    /// Keep the stored object, drop only the record.
    RecordOnly,
}

impl Default for DeleteMode {
    fn default() -> Self {
        Self::Both
    }
}

pub(super) async fn list_files(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
) -> Result<Response, AppError> {
    let records = match &viewer {
        Viewer::Admin { .. } => shares_repo::list(&state.db).await?,
        Viewer::ApiKey(_) => {
            viewer
                .require_permission(permissions::FILE_MANAGE)
                .map_err(AppError::from)?;
            shares_repo::list_by_creator(&state.db, &viewer.owner_id()).await?
        }
    };
    Ok(response::ok(
        records.iter().map(|r| share_view(r, true)).collect::<Vec<_>>(),
    ))
}

pub(super) async fn get_file(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Path(slug): Path<String>,
) -> Result<Response, AppError> {
    let record = shares_repo::get(&state.db, &slug)
        .await?
        .ok_or_else(|| AppError::not_found("no such share"))?;
    if !viewer.is_admin() && record.created_by != viewer.owner_id() {
        return Err(AppError::forbidden("not your share"));
    }
    Ok(response::ok(share_view(&record, true)))
}

async fn delete_one_share(
    state: &AppState,
    viewer: &Viewer,
    slug: &str,
    mode: DeleteMode,
) -> Result<(), AppError> {
    let record = shares_repo::get(&state.db, slug)
        .await?
        .ok_or_else(|| AppError::not_found("no such share"))?;
    if !viewer.is_admin() && record.created_by != viewer.owner_id() {
        return Err(AppError::forbidden("not your share"));
    }

    if mode == DeleteMode::Both
        && record.kind == ShareKind::File
        && let Some(config_id) = record.storage_config_id.as_deref()
        && let Some(config) = storage_configs_repo::get(&state.db, config_id).await?
    {
        let settings = state.fs.decrypted_settings(&config)?;
        let driver = state.fs.registry().resolve(&DriverConfig {
            id: config.id.clone(),
            storage_type: config.storage_type.clone(),
            settings,
            version: config.updated_at,
        })?;
        if let Err(error) = driver.delete(&record.target, false).await {
            // Record deletion still proceeds; the object may already be gone.
            tracing::warn!(slug, error = %error, "failed to delete share object");
        }
    }

    shares_repo::delete(&state.db, slug).await?;
    Ok(())
}

pub(super) async fn delete_file(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Path(slug): Path<String>,
) -> Result<Response, AppError> {
    delete_one_share(&state, &viewer, &slug, DeleteMode::Both).await?;
    Ok(response::ok_message("deleted"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct BatchDeleteRequest {
    slugs: Vec<String>,
    #[serde(default)]
    delete_mode: DeleteMode,
}

pub(super) async fn batch_delete_files(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Json(req): Json<BatchDeleteRequest>,
) -> Result<Response, AppError> {
    let mut results = Vec::with_capacity(req.slugs.len());
    for slug in &req.slugs {
        let outcome = delete_one_share(&state, &viewer, slug, req.delete_mode).await;
        results.push(serde_json::json!({
            "slug": slug,
            "success": outcome.is_ok(),
            "error": outcome.err().map(|e| e.message().to_string()),
        }));
    }
    Ok(response::ok(results))
}
