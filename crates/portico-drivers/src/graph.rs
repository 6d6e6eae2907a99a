//! Graph-style drive driver (OneDrive and compatible APIs).
//!
//! Uploads above the simple-PUT threshold go through an upload session: the
//! backend hands out one `uploadUrl` and every part is PUT there with a
//! `Content-Range`. Direct client-side signing is impossible, so the
//! multipart capability advertises `single_session` with the gateway
//! recording parts (`server_records`). The session `upload_id` is the
//! opaque upload URL itself.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use url::Url;

use portico_driver_api::{
    ByteRange, ByteStream, Capabilities, Driver, DriverError, Entry, FsCapabilities, ListOptions,
    Listing, MultipartCapability, MultipartInit, MultipartStrategy, PartRecord, PartSizeBounds,
    PartsLedgerPolicy, ReadHandle, ShareCapabilities, SigningMode, UploadPolicy,
    UploadSessionInfo, WriteResult,
};

use crate::util::{collect_stream, error_for_status, send_error, stream_from_response};

#[derive(Debug, Clone, Deserialize)]
pub struct GraphConfig {
    /// Drive root endpoint, e.g. `https://graph.microsoft.com/v1.0/me/drive`.
    pub base_url: String,
    pub access_token: String,
}

pub struct GraphDriver {
    caps: Capabilities,
    http: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItem {
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    last_modified_date_time: Option<String>,
    #[serde(default)]
    folder: Option<serde_json::Value>,
    #[serde(default, rename = "eTag")]
    etag: Option<String>,
    #[serde(default)]
    file: Option<DriveItemFile>,
    #[serde(default, rename = "@microsoft.graph.downloadUrl")]
    download_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItemFile {
    #[serde(default)]
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChildrenPage {
    value: Vec<DriveItem>,
    #[serde(default, rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadSessionResponse {
    upload_url: String,
    #[serde(default)]
    next_expected_ranges: Vec<String>,
}

/// Graph sessions want 320 KiB-aligned chunks; 5 MiB keeps that alignment.
const PART_SIZE: u64 = 5 * 1024 * 1024;

impl GraphDriver {
    pub fn new(config: GraphConfig) -> Result<Self, DriverError> {
        Url::parse(&config.base_url)
            .map_err(|e| DriverError::invalid_input(format!("invalid base_url: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| DriverError::internal(format!("http client: {e}")))?;

        Ok(Self {
            caps: Capabilities {
                storage_type: "onedrive",
                remote: true,
                fs: FsCapabilities {
                    backend_stream: true,
                    multipart: true,
                    list: true,
                    stat: true,
                    read: true,
                    range: true,
                    write: true,
                    delete: true,
                    rename: true,
                    mkdir: true,
                    ..Default::default()
                },
                share: ShareCapabilities {
                    backend_stream: true,
                    ..Default::default()
                },
                multipart: Some(MultipartCapability {
                    strategy: MultipartStrategy::SingleSession,
                    parts_ledger_policy: PartsLedgerPolicy::ServerRecords,
                    signing_mode: SigningMode::OnDemand,
                    server_can_list: false,
                    max_parts_per_request: 1,
                    url_ttl_sec: 3600,
                    max_attempts: 3,
                    part_size: PartSizeBounds {
                        min: 320 * 1024,
                        max: 60 * 1024 * 1024,
                        default: PART_SIZE,
                    },
                }),
                sha256_required_for_presign: false,
            },
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.access_token,
        })
    }

    fn item_url(&self, key: &str, suffix: &str) -> String {
        if key.is_empty() {
            if suffix.is_empty() {
                format!("{}/root", self.base_url)
            } else {
                format!("{}/root/{suffix}", self.base_url)
            }
        } else if suffix.is_empty() {
            format!("{}/root:/{key}", self.base_url)
        } else {
            format!("{}/root:/{key}:/{suffix}", self.base_url)
        }
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.bearer_auth(&self.token)
    }

    fn entry_from_item(&self, key: &str, item: DriveItem) -> Entry {
        let modified_ms = item.last_modified_date_time.as_deref().and_then(|raw| {
            time::OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339)
                .ok()
                .map(|t| (t.unix_timestamp_nanos() / 1_000_000) as i64)
        });
        Entry {
            name: item.name,
            key: key.to_string(),
            size: item.size,
            modified_ms,
            is_directory: item.folder.is_some(),
            etag: item.etag,
            content_type: item.file.and_then(|f| f.mime_type),
        }
    }

    fn policy(&self) -> UploadPolicy {
        let cap = self.caps.multipart.as_ref().expect("graph has multipart cap");
        UploadPolicy {
            parts_ledger_policy: cap.parts_ledger_policy,
            signing_mode: cap.signing_mode,
            server_can_list: cap.server_can_list,
            max_parts_per_request: cap.max_parts_per_request,
            url_ttl_sec: cap.url_ttl_sec,
            max_attempts: cap.max_attempts,
        }
    }
}

#[async_trait]
impl Driver for GraphDriver {
    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    async fn list(&self, key: &str, opts: &ListOptions) -> Result<Listing, DriverError> {
        let url = match opts.cursor.as_deref() {
            Some(next_link) => next_link.to_string(),
            None => self.item_url(key, "children"),
        };
        let res = self
            .authed(self.http.get(&url))
            .send()
            .await
            .map_err(|e| send_error(e, "list"))?;
        if !res.status().is_success() {
            return Err(error_for_status(res.status(), "list"));
        }
        let page: ChildrenPage = res.json().await.map_err(|e| send_error(e, "list"))?;

        let entries = page
            .value
            .into_iter()
            .map(|item| {
                let child_key = if key.is_empty() {
                    item.name.clone()
                } else {
                    format!("{key}/{}", item.name)
                };
                self.entry_from_item(&child_key, item)
            })
            .collect();
        Ok(Listing {
            entries,
            truncated: page.next_link.is_some(),
            next_cursor: page.next_link,
        })
    }

    async fn stat(&self, key: &str) -> Result<Option<Entry>, DriverError> {
        let res = self
            .authed(self.http.get(self.item_url(key, "")))
            .send()
            .await
            .map_err(|e| send_error(e, "stat"))?;
        match res.status() {
            s if s.is_success() => {
                let item: DriveItem = res.json().await.map_err(|e| send_error(e, "stat"))?;
                Ok(Some(self.entry_from_item(key, item)))
            }
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            s => Err(error_for_status(s, "stat")),
        }
    }

    async fn read(&self, key: &str, range: Option<ByteRange>) -> Result<ReadHandle, DriverError> {
        let mut req = self.authed(self.http.get(self.item_url(key, "content")));
        if let Some(range) = range {
            req = req.header(reqwest::header::RANGE, range.header_value());
        }
        let res = req.send().await.map_err(|e| send_error(e, "read"))?;
        if !res.status().is_success() {
            return Err(error_for_status(res.status(), "read"));
        }

        let size = res.content_length().unwrap_or(0);
        let content_type = res
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let content_range = res
            .headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let total_size = content_range
            .as_deref()
            .and_then(|v| v.rsplit('/').next())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(size);

        Ok(ReadHandle {
            stream: stream_from_response(res),
            content_type,
            size,
            total_size,
            etag: None,
            content_range,
        })
    }

    async fn write(
        &self,
        key: &str,
        body: ByteStream,
        _size: u64,
        content_type: &str,
    ) -> Result<WriteResult, DriverError> {
        // Simple upload; big payloads should come through the session path.
        let data = collect_stream(body).await?;
        let res = self
            .authed(
                self.http
                    .put(self.item_url(key, "content"))
                    .header(reqwest::header::CONTENT_TYPE, content_type.to_string())
                    .body(data),
            )
            .send()
            .await
            .map_err(|e| send_error(e, "write"))?;
        if !res.status().is_success() {
            return Err(error_for_status(res.status(), "write"));
        }
        let item: DriveItem = res.json().await.map_err(|e| send_error(e, "write"))?;
        Ok(WriteResult { etag: item.etag })
    }

    async fn delete(&self, key: &str, _recursive: bool) -> Result<(), DriverError> {
        let res = self
            .authed(self.http.delete(self.item_url(key, "")))
            .send()
            .await
            .map_err(|e| send_error(e, "delete"))?;
        if res.status().is_success() || res.status() == reqwest::StatusCode::NO_CONTENT {
            Ok(())
        } else {
            Err(error_for_status(res.status(), "delete"))
        }
    }

    async fn mkdir(&self, key: &str) -> Result<(), DriverError> {
        let (parent, name) = match key.rsplit_once('/') {
            Some((parent, name)) => (parent.to_string(), name),
            None => (String::new(), key),
        };
        let res = self
            .authed(
                self.http
                    .post(self.item_url(&parent, "children"))
                    .json(&json!({
                        "name": name,
                        "folder": {},
                        "@microsoft.graph.conflictBehavior": "replace",
                    })),
            )
            .send()
            .await
            .map_err(|e| send_error(e, "mkdir"))?;
        if res.status().is_success() {
            Ok(())
        } else {
            Err(error_for_status(res.status(), "mkdir"))
        }
    }

    async fn rename(&self, src: &str, dst: &str) -> Result<(), DriverError> {
        let (dst_parent, dst_name) = match dst.rsplit_once('/') {
            Some((parent, name)) => (format!("/drive/root:/{parent}"), name),
            None => ("/drive/root:".to_string(), dst),
        };
        let res = self
            .authed(
                self.http
                    .patch(self.item_url(src, ""))
                    .json(&json!({
                        "name": dst_name,
                        "parentReference": { "path": dst_parent },
                    })),
            )
            .send()
            .await
            .map_err(|e| send_error(e, "rename"))?;
        if res.status().is_success() {
            Ok(())
        } else {
            Err(error_for_status(res.status(), "rename"))
        }
    }

    async fn init_multipart(
        &self,
        key: &str,
        size: u64,
        _content_type: &str,
        part_size_hint: Option<u64>,
        _sha256: Option<&str>,
    ) -> Result<MultipartInit, DriverError> {
        let cap = self.caps.multipart.as_ref().expect("graph has multipart cap");
        let part_size = cap.part_size.clamp(part_size_hint);
        let total_parts = size.div_ceil(part_size).max(1) as u32;

        let res = self
            .authed(
                self.http
                    .post(self.item_url(key, "createUploadSession"))
                    .json(&json!({
                        "item": { "@microsoft.graph.conflictBehavior": "replace" },
                    })),
            )
            .send()
            .await
            .map_err(|e| send_error(e, "create upload session"))?;
        if !res.status().is_success() {
            return Err(error_for_status(res.status(), "create upload session"));
        }
        let session: UploadSessionResponse = res
            .json()
            .await
            .map_err(|e| send_error(e, "create upload session"))?;

        Ok(MultipartInit {
            strategy: MultipartStrategy::SingleSession,
            upload_id: session.upload_url.clone(),
            key: key.to_string(),
            part_size,
            total_parts: Some(total_parts),
            presigned_urls: Vec::new(),
            session: Some(UploadSessionInfo {
                upload_url: session.upload_url,
                next_expected_ranges: session.next_expected_ranges,
            }),
            policy: self.policy(),
            skip_upload: false,
        })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        _upload_id: &str,
        _parts: &[PartRecord],
    ) -> Result<WriteResult, DriverError> {
        // The final Content-Range PUT materializes the item; completing just
        // verifies it landed.
        match self.stat(key).await? {
            Some(entry) => Ok(WriteResult { etag: entry.etag }),
            None => Err(DriverError::session_expired(
                "upload session finished but the item is missing",
            )),
        }
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &str) -> Result<(), DriverError> {
        // Best-effort DELETE of the upload URL.
        if let Ok(url) = Url::parse(upload_id) {
            let _ = self.http.delete(url).send().await;
        }
        Ok(())
    }

    async fn refresh_session(
        &self,
        _key: &str,
        upload_id: &str,
    ) -> Result<UploadSessionInfo, DriverError> {
        let url = Url::parse(upload_id)
            .map_err(|_| DriverError::invalid_input("invalid upload session URL"))?;
        let res = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| send_error(e, "refresh session"))?;
        match res.status() {
            s if s.is_success() => {
                let session: UploadSessionResponse = res
                    .json()
                    .await
                    .map_err(|e| send_error(e, "refresh session"))?;
                Ok(UploadSessionInfo {
                    upload_url: upload_id.to_string(),
                    next_expected_ranges: session.next_expected_ranges,
                })
            }
            reqwest::StatusCode::NOT_FOUND => Err(DriverError::session_expired(
                "upload session no longer exists",
            )),
            s => Err(error_for_status(s, "refresh session")),
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::routing::{get, post};
    use tokio::net::TcpListener;

    use portico_driver_api::{Driver as _, ErrorKind, MultipartStrategy};

    use super::{GraphConfig, GraphDriver};

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/drive")
    }

    #[tokio::test]
    async fn init_multipart_opens_session_with_content_range_math() {
        let app = Router::new().route(
            "/drive/root:/big.bin:/createUploadSession",
            post(|| async {
                axum::Json(serde_json::json!({
                    "uploadUrl": "http://upload.example/session/1",
                    "nextExpectedRanges": ["0-"],
                }))
            }),
        );
        let base = serve(app).await;

        let driver = GraphDriver::new(GraphConfig {
            base_url: base,
            access_token: "tok".to_string(),
        })
        .unwrap();
        let init = driver
            .init_multipart("big.bin", 7 * 1024 * 1024, "application/octet-stream", None, None)
            .await
            .unwrap();

        assert_eq!(init.strategy, MultipartStrategy::SingleSession);
        assert_eq!(init.total_parts, Some(2));
        let session = init.session.unwrap();
        assert_eq!(session.upload_url, "http://upload.example/session/1");
        assert_eq!(session.next_expected_ranges, ["0-"]);
    }

    #[tokio::test]
    async fn refresh_session_maps_404_to_session_expired() {
        let app = Router::new().route(
            "/drive/session/gone",
            get(|| async { axum::http::StatusCode::NOT_FOUND }),
        );
        let base = serve(app).await;
        let session_url = format!("{base}/session/gone");

        let driver = GraphDriver::new(GraphConfig {
            base_url: base,
            access_token: "tok".to_string(),
        })
        .unwrap();
        let err = driver
            .refresh_session("big.bin", &session_url)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionExpired);
    }
}
