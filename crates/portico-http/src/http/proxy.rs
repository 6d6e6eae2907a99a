//! Same-origin content streaming (`/api/p/*`) and the internal link
//! resolver (`/api/proxy/link`).

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use portico_driver_api::{ByteRange, ReadHandle};
use portico_vfs::Viewer;
use portico_vfs::service::Download;

use super::auth::CurrentViewer;
use super::{AppError, AppState, response};

/// Parse a `Range: bytes=start-end` header (single range only).
pub(super) fn parse_range(headers: &HeaderMap) -> Option<ByteRange> {
    let raw = headers.get(header::RANGE)?.to_str().ok()?;
    let spec = raw.trim().strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start = start.trim();
    let end = end.trim();
    if start.is_empty() {
        // Suffix ranges are rare from our clients; unsupported.
        return None;
    }
    Some(ByteRange {
        start: start.parse().ok()?,
        end: if end.is_empty() {
            None
        } else {
            Some(end.parse().ok()?)
        },
    })
}

/// Turn a driver read handle into an HTTP response, honoring range reads
/// with `206` + `Content-Range`.
pub(super) fn stream_response(handle: ReadHandle, force_download: bool, name: &str) -> Response {
    let status = if handle.content_range.is_some() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, handle.content_type)
        .header(header::CONTENT_LENGTH, handle.size)
        .header(header::ACCEPT_RANGES, "bytes");
    if let Some(content_range) = handle.content_range {
        builder = builder.header(header::CONTENT_RANGE, content_range);
    }
    if let Some(etag) = handle.etag {
        builder = builder.header(header::ETAG, etag);
    }
    if force_download {
        builder = builder.header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", name.replace('"', "")),
        );
    }

    builder
        .body(Body::from_stream(handle.stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[derive(Debug, Deserialize)]
pub(super) struct ProxyQuery {
    #[serde(default)]
    sign: Option<String>,
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    download: Option<bool>,
}

/// `/api/p/*`: always proxies (no 302), Range-capable. Mounts with
/// `enable_sign` require a valid `?sign=&exp=` pair; a signed URL also
/// works unauthenticated.
pub(super) async fn serve(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<ProxyQuery>,
    headers: HeaderMap,
    viewer: Option<axum::Extension<Viewer>>,
) -> Result<Response, AppError> {
    let logical = format!("/{path}");
    let logical = portico_core::paths::normalize(&logical)
        .map_err(|e| AppError::bad_request(e.to_string()))?;

    let signed_ok = match (query.sign.as_deref(), query.exp) {
        (Some(sign), Some(exp)) => state.fs.url_signer.verify("GET", &logical, exp, sign),
        _ => false,
    };

    // A valid signature acts as authorization on its own.
    let viewer = match viewer {
        _ if signed_ok => Viewer::Admin {
            admin_id: "signed-url".to_string(),
        },
        Some(axum::Extension(viewer)) => viewer,
        None => return Err(AppError::unauthorized("authentication or signature required")),
    };

    // Signing-required mounts reject unsigned access even when authed.
    if !signed_ok {
        let resolved = state.fs.resolve(&viewer, &logical, 0).await?;
        if resolved.mount.enable_sign {
            return Err(AppError::unauthorized("this mount requires signed URLs"));
        }
    }

    let range = parse_range(&headers);
    let handle = state.fs.content(&viewer, &logical, range).await?;
    let name = portico_core::paths::file_name(&logical).to_string();
    Ok(stream_response(
        handle,
        query.download.unwrap_or(false),
        &name,
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct LinkRequest {
    /// `fs` or `share`.
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    slug: Option<String>,
}

/// `{url, headers}` for an internal reverse proxy. Backend credentials are
/// never included; when the backend has no public URL the gateway's own
/// proxy path is returned instead.
pub(super) async fn link(
    State(state): State<AppState>,
    CurrentViewer(viewer): CurrentViewer,
    Json(req): Json<LinkRequest>,
) -> Result<Response, AppError> {
    match req.kind.as_str() {
        "fs" => {
            let path = req
                .path
                .as_deref()
                .ok_or_else(|| AppError::bad_request("path is required for type=fs"))?;
            let (url, link_type) = state.fs.file_link(&viewer, path, None, false).await?;
            Ok(response::ok(serde_json::json!({
                "url": url,
                "linkType": link_type,
                "headers": {},
            })))
        }
        "share" => {
            let slug = req
                .slug
                .as_deref()
                .ok_or_else(|| AppError::bad_request("slug is required for type=share"))?;
            Ok(response::ok(serde_json::json!({
                "url": format!("/api/s/{slug}"),
                "linkType": "proxy",
                "headers": {},
            })))
        }
        other => Err(AppError::bad_request(format!("unknown link type: {other}"))),
    }
}

/// Download helper shared by fs download handlers.
pub(super) fn download_response(outcome: Download, force_download: bool, name: &str) -> Response {
    match outcome {
        Download::Redirect(url) => axum::response::Redirect::temporary(&url).into_response(),
        Download::Stream(handle) => stream_response(handle, force_download, name),
    }
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap, header};

    use portico_driver_api::ByteRange;

    use super::parse_range;

    #[test]
    fn range_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, "bytes=0-99".parse().unwrap());
        assert_eq!(
            parse_range(&headers),
            Some(ByteRange {
                start: 0,
                end: Some(99)
            })
        );

        headers.insert(header::RANGE, "bytes=500-".parse().unwrap());
        assert_eq!(
            parse_range(&headers),
            Some(ByteRange {
                start: 500,
                end: None
            })
        );

        headers.insert(header::RANGE, "bytes=-500".parse().unwrap());
        assert_eq!(parse_range(&headers), None);

        headers.insert(header::RANGE, "items=0-1".parse().unwrap());
        assert_eq!(parse_range(&headers), None);
    }
}
