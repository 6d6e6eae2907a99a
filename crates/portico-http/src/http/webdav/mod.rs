//! WebDAV server (RFC 4918, class 2). All I/O delegates to the VFS; locks
//! are opaque tokens persisted in the database.

mod props;

use axum::body::Body;
use axum::extract::{Path as AxumPath, State};
use axum::http::{HeaderMap, Method, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::TryStreamExt as _;

use portico_core::{paths, permissions};
use portico_driver_api::ByteStream;
use portico_storage::{locks_repo, settings_repo};
use portico_vfs::Viewer;
use portico_vfs::service::FsListing;

use super::{AppError, AppState, proxy};
use props::DavEntry;

const DAV_PREFIX: &str = "/dav";
const DEFAULT_DEPTH_CAP: i64 = 10_000;

pub(super) async fn handle_root(
    state: State<AppState>,
    req: Request<Body>,
) -> Result<Response, AppError> {
    dispatch(state, "/".to_string(), req).await
}

pub(super) async fn handle(
    state: State<AppState>,
    AxumPath(path): AxumPath<String>,
    req: Request<Body>,
) -> Result<Response, AppError> {
    dispatch(state, format!("/{path}"), req).await
}

fn dav_href(path: &str, is_dir: bool) -> String {
    let mut href = format!("{DAV_PREFIX}{path}");
    if is_dir && !href.ends_with('/') {
        href.push('/');
    }
    href
}

fn viewer_of(req: &Request<Body>) -> Result<Viewer, AppError> {
    req.extensions()
        .get::<Viewer>()
        .cloned()
        .ok_or_else(|| AppError::unauthorized("authentication required"))
}

fn require_dav(viewer: &Viewer, write: bool) -> Result<(), AppError> {
    let bit = if write {
        permissions::WEBDAV_MANAGE
    } else {
        permissions::WEBDAV_READ
    };
    viewer.require_permission(bit).map_err(AppError::from)
}

/// Lock tokens named in an `If` header (`(<opaquelocktoken:...>)`).
fn tokens_from_if_header(headers: &HeaderMap) -> Vec<String> {
    let Some(raw) = headers.get("if").and_then(|v| v.to_str().ok()) else {
        return Vec::new();
    };
    let mut tokens = Vec::new();
    let mut rest = raw;
    while let Some(start) = rest.find('<') {
        let Some(end) = rest[start..].find('>') else {
            break;
        };
        let candidate = &rest[start + 1..start + end];
        if candidate.starts_with("opaquelocktoken:") {
            tokens.push(candidate.to_string());
        }
        rest = &rest[start + end + 1..];
    }
    tokens
}

/// 423 unless every active lock covering `path` is matched by a presented
/// token.
async fn check_locks(
    state: &AppState,
    path: &str,
    headers: &HeaderMap,
) -> Result<(), AppError> {
    let locks = locks_repo::locks_covering(&state.db, path).await?;
    if locks.is_empty() {
        return Ok(());
    }
    let presented = tokens_from_if_header(headers);
    let unmatched = locks
        .iter()
        .any(|lock| !presented.iter().any(|t| *t == lock.token));
    if unmatched {
        return Err(AppError::new(StatusCode::LOCKED, "the resource is locked"));
    }
    Ok(())
}

async fn dispatch(
    State(state): State<AppState>,
    path: String,
    req: Request<Body>,
) -> Result<Response, AppError> {
    let path = paths::normalize(&path).map_err(|e| AppError::bad_request(e.to_string()))?;
    let method = req.method().clone();

    if method == Method::OPTIONS {
        return Ok(options_response());
    }

    let viewer = viewer_of(&req)?;
    match method.as_str() {
        "PROPFIND" => {
            require_dav(&viewer, false)?;
            propfind(&state, &viewer, &path, req.headers()).await
        }
        "GET" | "HEAD" => {
            require_dav(&viewer, false)?;
            get(&state, &viewer, &path, &method, req.headers()).await
        }
        "PUT" => {
            require_dav(&viewer, true)?;
            check_locks(&state, &path, req.headers()).await?;
            put(&state, &viewer, &path, req).await
        }
        "MKCOL" => {
            require_dav(&viewer, true)?;
            check_locks(&state, &path, req.headers()).await?;
            mkcol(&state, &viewer, &path).await
        }
        "DELETE" => {
            require_dav(&viewer, true)?;
            check_locks(&state, &path, req.headers()).await?;
            delete(&state, &viewer, &path).await
        }
        "MOVE" | "COPY" => {
            require_dav(&viewer, true)?;
            check_locks(&state, &path, req.headers()).await?;
            move_or_copy(&state, &viewer, &path, &method, req.headers()).await
        }
        "LOCK" => {
            require_dav(&viewer, true)?;
            lock(&state, &viewer, &path, req).await
        }
        "UNLOCK" => {
            require_dav(&viewer, true)?;
            unlock(&state, req.headers()).await
        }
        "PROPPATCH" => {
            require_dav(&viewer, true)?;
            // Dead properties are not stored; acknowledge without failing
            // class-2 clients.
            Ok((
                StatusCode::MULTI_STATUS,
                [(header::CONTENT_TYPE, "application/xml; charset=utf-8")],
                props::multistatus(&[DavEntry {
                    href: dav_href(&path, false),
                    name: paths::file_name(&path).to_string(),
                    is_dir: false,
                    size: 0,
                    modified_ms: None,
                    content_type: None,
                }]),
            )
                .into_response())
        }
        _ => Ok(StatusCode::METHOD_NOT_ALLOWED.into_response()),
    }
}

fn options_response() -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("DAV", "1, 2")
        .header(
            header::ALLOW,
            "OPTIONS, GET, HEAD, PUT, DELETE, MKCOL, PROPFIND, PROPPATCH, MOVE, COPY, LOCK, UNLOCK",
        )
        .header("MS-Author-Via", "DAV")
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn entry_of(listing: &FsListing) -> Vec<DavEntry> {
    listing
        .entries
        .iter()
        .map(|e| DavEntry {
            href: dav_href(&e.path, e.is_directory),
            name: e.name.clone(),
            is_dir: e.is_directory,
            size: e.size,
            modified_ms: e.modified_ms,
            content_type: e.content_type.clone(),
        })
        .collect()
}

async fn propfind(
    state: &AppState,
    viewer: &Viewer,
    path: &str,
    headers: &HeaderMap,
) -> Result<Response, AppError> {
    let depth = headers
        .get("depth")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("infinity")
        .trim()
        .to_ascii_lowercase();

    let self_entry = if path == "/" {
        DavEntry {
            href: format!("{DAV_PREFIX}/"),
            name: "/".to_string(),
            is_dir: true,
            size: 0,
            modified_ms: None,
            content_type: None,
        }
    } else {
        let entry = state
            .fs
            .stat(viewer, path)
            .await?
            .ok_or_else(|| AppError::not_found("no such path"))?;
        DavEntry {
            href: dav_href(&entry.path, entry.is_directory),
            name: entry.name.clone(),
            is_dir: entry.is_directory,
            size: entry.size,
            modified_ms: entry.modified_ms,
            content_type: entry.content_type.clone(),
        }
    };

    let mut entries = vec![self_entry.clone()];
    match depth.as_str() {
        "0" => {}
        "1" => {
            if self_entry.is_dir {
                let listing = state.fs.list(viewer, path, None).await?;
                entries.extend(entry_of(&listing));
            }
        }
        "infinity" => {
            if self_entry.is_dir {
                let cap = settings_repo::get_i64(&state.db, "webdav_depth_infinity_cap")
                    .await?
                    .unwrap_or(DEFAULT_DEPTH_CAP) as usize;
                let mut queue = vec![path.to_string()];
                while let Some(dir) = queue.pop() {
                    let listing = state.fs.list(viewer, &dir, None).await?;
                    for entry in &listing.entries {
                        if entry.is_directory {
                            queue.push(entry.path.clone());
                        }
                    }
                    entries.extend(entry_of(&listing));
                    if entries.len() > cap {
                        // Bounded infinity: refuse rather than truncate.
                        return Err(AppError::new(
                            StatusCode::INSUFFICIENT_STORAGE,
                            "depth-infinity listing exceeds the configured cap",
                        ));
                    }
                }
            }
        }
        other => {
            return Err(AppError::bad_request(format!("invalid Depth: {other}")));
        }
    }

    Ok((
        StatusCode::MULTI_STATUS,
        [(header::CONTENT_TYPE, "application/xml; charset=utf-8")],
        props::multistatus(&entries),
    )
        .into_response())
}

async fn get(
    state: &AppState,
    viewer: &Viewer,
    path: &str,
    method: &Method,
    headers: &HeaderMap,
) -> Result<Response, AppError> {
    let resolved = state.fs.resolve(viewer, path, 0).await?;

    // Mount policy decides redirect-vs-proxy for DAV GETs.
    if resolved.mount.webdav_policy == portico_storage::mounts_repo::WebdavPolicy::Redirect302
        && !resolved.mount.web_proxy
        && let Some(url) = resolved.driver.public_url(&resolved.key)
    {
        return Ok(axum::response::Redirect::temporary(&url).into_response());
    }

    let range = proxy::parse_range(headers);
    let handle = resolved
        .driver
        .read(&resolved.key, range)
        .await
        .map_err(AppError::from)?;

    if method == Method::HEAD {
        let mut builder = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, handle.content_type)
            .header(header::CONTENT_LENGTH, handle.size)
            .header(header::ACCEPT_RANGES, "bytes");
        if let Some(etag) = handle.etag {
            builder = builder.header(header::ETAG, etag);
        }
        return Ok(builder
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()));
    }

    Ok(proxy::stream_response(handle, false, paths::file_name(path)))
}

async fn put(
    state: &AppState,
    viewer: &Viewer,
    path: &str,
    req: Request<Body>,
) -> Result<Response, AppError> {
    let resolved = state.fs.resolve(viewer, path, 0).await?;
    let size = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| AppError::bad_request("Content-Length is required"))?;
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let existed = resolved
        .driver
        .stat(&resolved.key)
        .await
        .map_err(AppError::from)?
        .is_some();
    let stream: ByteStream = Box::pin(
        req.into_body()
            .into_data_stream()
            .map_err(std::io::Error::other),
    );
    state
        .fs
        .write_resolved(&resolved, stream, size, &content_type)
        .await?;

    Ok(if existed {
        StatusCode::NO_CONTENT.into_response()
    } else {
        StatusCode::CREATED.into_response()
    })
}

async fn mkcol(state: &AppState, viewer: &Viewer, path: &str) -> Result<Response, AppError> {
    if state.fs.stat(viewer, path).await?.is_some() {
        return Ok(StatusCode::METHOD_NOT_ALLOWED.into_response());
    }
    state.fs.mkdir(viewer, path).await?;
    Ok(StatusCode::CREATED.into_response())
}

async fn delete(state: &AppState, viewer: &Viewer, path: &str) -> Result<Response, AppError> {
    let results = state.fs.batch_remove(viewer, &[path.to_string()]).await?;
    match results.first() {
        Some(result) if result.success => Ok(StatusCode::NO_CONTENT.into_response()),
        Some(result) => {
            let message = result.error.clone().unwrap_or_default();
            if message.contains("not_found") {
                Err(AppError::not_found("no such path"))
            } else {
                Err(AppError::from(anyhow::anyhow!(message)))
            }
        }
        None => Err(AppError::not_found("no such path")),
    }
}

fn destination_path(headers: &HeaderMap) -> Result<String, AppError> {
    let raw = headers
        .get("destination")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::bad_request("Destination header is required"))?;

    let path = if let Ok(url) = url::Url::parse(raw) {
        url.path().to_string()
    } else {
        raw.to_string()
    };
    let decoded = percent_encoding::percent_decode_str(&path)
        .decode_utf8_lossy()
        .to_string();
    decoded
        .strip_prefix(DAV_PREFIX)
        .map(|rest| if rest.is_empty() { "/" } else { rest })
        .map(str::to_string)
        .ok_or_else(|| AppError::bad_request("Destination must live under /dav"))
}

async fn move_or_copy(
    state: &AppState,
    viewer: &Viewer,
    path: &str,
    method: &Method,
    headers: &HeaderMap,
) -> Result<Response, AppError> {
    let destination = destination_path(headers)?;
    check_locks(state, &destination, headers).await?;
    let overwrite = headers
        .get("overwrite")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("t"))
        .unwrap_or(true);

    let existed = state.fs.stat(viewer, &destination).await?.is_some();
    if existed && !overwrite {
        return Ok(StatusCode::PRECONDITION_FAILED.into_response());
    }

    if method.as_str() == "MOVE" {
        state.fs.rename(viewer, path, &destination).await?;
    } else {
        let src = state.fs.resolve(viewer, path, 0).await?;
        let dst = state.fs.resolve(viewer, &destination, 0).await?;
        if src.mount.id != dst.mount.id {
            return Err(AppError::bad_request("cross-mount COPY is not supported"));
        }
        src.driver
            .copy(&src.key, &dst.key)
            .await
            .map_err(AppError::from)?;
        state
            .fs
            .note_write(&dst, portico_storage::index_repo::DirtyOp::Upsert)
            .await;
    }

    Ok(if existed {
        StatusCode::NO_CONTENT.into_response()
    } else {
        StatusCode::CREATED.into_response()
    })
}

async fn lock(
    state: &AppState,
    viewer: &Viewer,
    path: &str,
    req: Request<Body>,
) -> Result<Response, AppError> {
    let depth = req
        .headers()
        .get("depth")
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            if v.trim() == "0" {
                "0"
            } else {
                "infinity"
            }
        })
        .unwrap_or("infinity");
    let timeout_secs = req
        .headers()
        .get("timeout")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.split(',')
                .map(str::trim)
                .find_map(|part| part.strip_prefix("Second-"))
                .and_then(|v| v.parse::<i64>().ok())
        })
        .unwrap_or(locks_repo::MAX_LOCK_TTL_SECS);
    let presented = tokens_from_if_header(req.headers());

    // Refresh: an empty-body LOCK with the token in `If`.
    if let Some(token) = presented.first() {
        if locks_repo::refresh(&state.db, token, timeout_secs).await? {
            let lock = locks_repo::get(&state.db, token)
                .await?
                .ok_or_else(|| AppError::gone("lock expired"))?;
            return Ok(lock_response(&lock, StatusCode::OK));
        }
        return Err(AppError::new(StatusCode::PRECONDITION_FAILED, "stale lock token"));
    }

    let body = axum::body::to_bytes(req.into_body(), 64 * 1024)
        .await
        .map_err(|_| AppError::bad_request("unreadable LOCK body"))?;
    let body_text = String::from_utf8_lossy(&body);
    let scope = if body_text.contains("shared") {
        "shared"
    } else {
        "exclusive"
    };
    let owner = extract_lock_owner(&body_text).unwrap_or_else(|| viewer.owner_id());

    // Conflicting exclusive locks reject the request.
    let existing = locks_repo::locks_covering(&state.db, path).await?;
    if existing
        .iter()
        .any(|l| l.scope == "exclusive" || scope == "exclusive")
        && !existing.is_empty()
    {
        return Err(AppError::new(StatusCode::LOCKED, "the resource is locked"));
    }

    let lock = locks_repo::create(&state.db, path, depth, scope, &owner, timeout_secs).await?;
    Ok(lock_response(&lock, StatusCode::OK))
}

fn extract_lock_owner(body: &str) -> Option<String> {
    let start = body.find("<D:href>").or_else(|| body.find("<href>"))?;
    let rest = &body[start..];
    let open_end = rest.find('>')? + 1;
    let close = rest.find("</")?;
    let owner = rest[open_end..close].trim();
    if owner.is_empty() {
        None
    } else {
        Some(owner.to_string())
    }
}

fn lock_response(lock: &portico_storage::locks_repo::Lock, status: StatusCode) -> Response {
    (
        status,
        [
            (
                header::CONTENT_TYPE,
                "application/xml; charset=utf-8".to_string(),
            ),
            (
                header::HeaderName::from_static("lock-token"),
                format!("<{}>", lock.token),
            ),
        ],
        props::lockdiscovery(lock),
    )
        .into_response()
}

async fn unlock(state: &AppState, headers: &HeaderMap) -> Result<Response, AppError> {
    let token = headers
        .get("lock-token")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().trim_start_matches('<').trim_end_matches('>').to_string())
        .ok_or_else(|| AppError::bad_request("Lock-Token header is required"))?;

    if locks_repo::delete(&state.db, &token).await? {
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        Err(AppError::conflict("no such lock"))
    }
}
