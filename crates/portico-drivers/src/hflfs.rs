//! LFS-style content-addressed upload driver (HuggingFace datasets and
//! similar).
//!
//! Uploads are negotiated against a batch endpoint keyed by the object's
//! sha256: the backend either returns presigned PUT URLs or reports the
//! content as already present (`skip_upload` dedupe). The backend cannot
//! enumerate uploaded parts, so the capability advertises `client_keeps`;
//! the gateway's persistent ledger is authoritative on resume.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use url::Url;

use portico_driver_api::{
    ByteRange, ByteStream, Capabilities, CommitRequest, Driver, DriverError, Entry,
    FsCapabilities, ListOptions, Listing, MultipartCapability, MultipartInit, MultipartStrategy,
    PartRecord, PartSizeBounds, PartsLedgerPolicy, PresignedPartUrl, PresignedUpload, ReadHandle,
    ShareCapabilities, SignedParts, SigningMode, UploadPolicy, WriteResult,
};

use crate::util::{error_for_status, guess_content_type, join_key, now_ms, send_error, stream_from_response};

#[derive(Debug, Clone, Deserialize)]
pub struct HfLfsConfig {
    /// Repo API root, e.g. `https://huggingface.co/api/datasets/org/name`.
    pub base_url: String,
    pub token: String,
    #[serde(default = "default_url_ttl")]
    pub url_ttl_sec: u64,
}

fn default_url_ttl() -> u64 {
    3600
}

pub struct HfLfsDriver {
    caps: Capabilities,
    http: reqwest::Client,
    base_url: Url,
    token: String,
    url_ttl_sec: u64,
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    exists: bool,
    #[serde(default)]
    upload_url: Option<String>,
    #[serde(default)]
    headers: Vec<(String, String)>,
    #[serde(default)]
    upload_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    #[serde(default)]
    urls: Vec<SignedUrl>,
    #[serde(default)]
    reset_uploaded_parts: bool,
}

#[derive(Debug, Deserialize)]
struct SignedUrl {
    part_number: u32,
    url: String,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    last_modified_ms: Option<i64>,
    #[serde(default)]
    oid: Option<String>,
}

impl HfLfsDriver {
    pub fn new(config: HfLfsConfig) -> Result<Self, DriverError> {
        let base_url = Url::parse(config.base_url.trim_end_matches('/'))
            .map_err(|e| DriverError::invalid_input(format!("invalid base_url: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| DriverError::internal(format!("http client: {e}")))?;

        Ok(Self {
            caps: Capabilities {
                storage_type: "huggingface",
                remote: true,
                fs: FsCapabilities {
                    presigned_single: true,
                    multipart: true,
                    list: true,
                    stat: true,
                    read: true,
                    range: true,
                    delete: true,
                    ..Default::default()
                },
                share: ShareCapabilities {
                    presigned: true,
                    ..Default::default()
                },
                multipart: Some(MultipartCapability {
                    strategy: MultipartStrategy::PerPartUrl,
                    parts_ledger_policy: PartsLedgerPolicy::ClientKeeps,
                    signing_mode: SigningMode::Batched,
                    server_can_list: false,
                    max_parts_per_request: 8,
                    url_ttl_sec: config.url_ttl_sec,
                    max_attempts: 3,
                    part_size: PartSizeBounds::default(),
                }),
                sha256_required_for_presign: true,
            },
            http,
            base_url,
            token: config.token,
            url_ttl_sec: config.url_ttl_sec,
        })
    }

    fn api_url(&self, suffix: &str) -> Result<Url, DriverError> {
        join_key(&self.base_url, suffix)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.bearer_auth(&self.token)
    }

    fn policy(&self) -> UploadPolicy {
        let cap = self.caps.multipart.as_ref().expect("hflfs has multipart cap");
        UploadPolicy {
            parts_ledger_policy: cap.parts_ledger_policy,
            signing_mode: cap.signing_mode,
            server_can_list: cap.server_can_list,
            max_parts_per_request: cap.max_parts_per_request,
            url_ttl_sec: cap.url_ttl_sec,
            max_attempts: cap.max_attempts,
        }
    }

    fn require_sha256(sha256: Option<&str>) -> Result<&str, DriverError> {
        sha256.filter(|v| !v.is_empty()).ok_or_else(|| {
            DriverError::invalid_input("this backend requires a client-computed sha256")
        })
    }
}

#[async_trait]
impl Driver for HfLfsDriver {
    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    async fn list(&self, key: &str, _opts: &ListOptions) -> Result<Listing, DriverError> {
        let url = self.api_url(&format!("tree/{key}"))?;
        let res = self
            .authed(self.http.get(url))
            .send()
            .await
            .map_err(|e| send_error(e, "list"))?;
        if !res.status().is_success() {
            return Err(error_for_status(res.status(), "list"));
        }
        let items: Vec<TreeEntry> = res.json().await.map_err(|e| send_error(e, "list"))?;

        let entries = items
            .into_iter()
            .map(|item| {
                let name = item.path.rsplit('/').next().unwrap_or(&item.path).to_string();
                Entry {
                    content_type: if item.kind == "directory" {
                        None
                    } else {
                        Some(guess_content_type(&name))
                    },
                    name,
                    key: item.path,
                    size: item.size,
                    modified_ms: item.last_modified_ms,
                    is_directory: item.kind == "directory",
                    etag: item.oid,
                }
            })
            .collect();
        Ok(Listing {
            entries,
            truncated: false,
            next_cursor: None,
        })
    }

    async fn stat(&self, key: &str) -> Result<Option<Entry>, DriverError> {
        let url = self.api_url(&format!("stat/{key}"))?;
        let res = self
            .authed(self.http.get(url))
            .send()
            .await
            .map_err(|e| send_error(e, "stat"))?;
        match res.status() {
            s if s.is_success() => {
                let item: TreeEntry = res.json().await.map_err(|e| send_error(e, "stat"))?;
                let name = item.path.rsplit('/').next().unwrap_or(&item.path).to_string();
                Ok(Some(Entry {
                    content_type: Some(guess_content_type(&name)),
                    name,
                    key: key.to_string(),
                    size: item.size,
                    modified_ms: item.last_modified_ms,
                    is_directory: item.kind == "directory",
                    etag: item.oid,
                }))
            }
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            s => Err(error_for_status(s, "stat")),
        }
    }

    async fn read(&self, key: &str, range: Option<ByteRange>) -> Result<ReadHandle, DriverError> {
        let url = self.api_url(&format!("resolve/{key}"))?;
        let mut req = self.authed(self.http.get(url));
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
        _key: &str,
        _body: ByteStream,
        _size: u64,
        _content_type: &str,
    ) -> Result<WriteResult, DriverError> {
        Err(DriverError::unsupported(
            "this backend only accepts presigned uploads",
        ))
    }

    async fn delete(&self, key: &str, _recursive: bool) -> Result<(), DriverError> {
        let url = self.api_url(&format!("files/{key}"))?;
        let res = self
            .authed(self.http.delete(url))
            .send()
            .await
            .map_err(|e| send_error(e, "delete"))?;
        if res.status().is_success() || res.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(error_for_status(res.status(), "delete"))
        }
    }

    async fn mkdir(&self, _key: &str) -> Result<(), DriverError> {
        // Directories materialize with their first object.
        Ok(())
    }

    async fn presign_single(
        &self,
        key: &str,
        size: u64,
        _content_type: &str,
        sha256: Option<&str>,
    ) -> Result<PresignedUpload, DriverError> {
        let sha256 = Self::require_sha256(sha256)?;
        let url = self.api_url("uploads/batch")?;
        let res = self
            .authed(self.http.post(url).json(&json!({
                "key": key,
                "size": size,
                "oid": sha256,
            })))
            .send()
            .await
            .map_err(|e| send_error(e, "presign"))?;
        if !res.status().is_success() {
            return Err(error_for_status(res.status(), "presign"));
        }
        let batch: BatchResponse = res.json().await.map_err(|e| send_error(e, "presign"))?;

        if batch.exists {
            return Ok(PresignedUpload {
                method: "PUT".to_string(),
                url: String::new(),
                headers: Vec::new(),
                sha256: Some(sha256.to_string()),
                skip_upload: true,
            });
        }
        let upload_url = batch.upload_url.ok_or_else(|| {
            DriverError::upstream_fatal("presign: batch returned neither exists nor upload_url")
        })?;
        Ok(PresignedUpload {
            method: "PUT".to_string(),
            url: upload_url,
            headers: batch.headers,
            sha256: Some(sha256.to_string()),
            skip_upload: false,
        })
    }

    async fn init_multipart(
        &self,
        key: &str,
        size: u64,
        _content_type: &str,
        part_size_hint: Option<u64>,
        sha256: Option<&str>,
    ) -> Result<MultipartInit, DriverError> {
        let sha256 = Self::require_sha256(sha256)?;
        let cap = self.caps.multipart.as_ref().expect("hflfs has multipart cap");
        let part_size = cap.part_size.clamp(part_size_hint);
        let total_parts = size.div_ceil(part_size).max(1) as u32;

        let url = self.api_url("uploads/batch")?;
        let res = self
            .authed(self.http.post(url).json(&json!({
                "key": key,
                "size": size,
                "oid": sha256,
                "transfer": "multipart",
                "part_size": part_size,
            })))
            .send()
            .await
            .map_err(|e| send_error(e, "init multipart"))?;
        if !res.status().is_success() {
            return Err(error_for_status(res.status(), "init multipart"));
        }
        let batch: BatchResponse = res
            .json()
            .await
            .map_err(|e| send_error(e, "init multipart"))?;

        if batch.exists {
            return Ok(MultipartInit {
                strategy: MultipartStrategy::PerPartUrl,
                upload_id: format!("dedupe-{sha256}"),
                key: key.to_string(),
                part_size,
                total_parts: Some(total_parts),
                presigned_urls: Vec::new(),
                session: None,
                policy: self.policy(),
                skip_upload: true,
            });
        }

        let upload_id = batch.upload_id.ok_or_else(|| {
            DriverError::upstream_fatal("init multipart: batch returned no upload_id")
        })?;
        Ok(MultipartInit {
            strategy: MultipartStrategy::PerPartUrl,
            upload_id,
            key: key.to_string(),
            part_size,
            total_parts: Some(total_parts),
            presigned_urls: Vec::new(),
            session: None,
            policy: self.policy(),
            skip_upload: false,
        })
    }

    async fn sign_parts(
        &self,
        key: &str,
        upload_id: &str,
        part_numbers: &[u32],
    ) -> Result<SignedParts, DriverError> {
        let url = self.api_url(&format!("uploads/{upload_id}/sign"))?;
        let res = self
            .authed(self.http.post(url).json(&json!({
                "key": key,
                "parts": part_numbers,
            })))
            .send()
            .await
            .map_err(|e| send_error(e, "sign parts"))?;
        match res.status() {
            s if s.is_success() => {}
            reqwest::StatusCode::NOT_FOUND | reqwest::StatusCode::GONE => {
                return Err(DriverError::session_expired("upload no longer exists"));
            }
            s => return Err(error_for_status(s, "sign parts")),
        }
        let signed: SignResponse = res.json().await.map_err(|e| send_error(e, "sign parts"))?;

        let expires_at_ms = now_ms() + (self.url_ttl_sec as i64) * 1000;
        Ok(SignedParts {
            presigned_urls: signed
                .urls
                .into_iter()
                .map(|u| PresignedPartUrl {
                    part_number: u.part_number,
                    url: u.url,
                    expires_at_ms,
                })
                .collect(),
            reset_uploaded_parts: signed.reset_uploaded_parts,
        })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartRecord],
    ) -> Result<WriteResult, DriverError> {
        if upload_id.starts_with("dedupe-") {
            // Skip-upload path: nothing was transferred, just verify below.
            return self.commit_presigned(&CommitRequest {
                key: key.to_string(),
                etag: None,
                sha256: upload_id.strip_prefix("dedupe-").map(str::to_string),
                content_type: None,
                size: 0,
            })
            .await;
        }

        let url = self.api_url(&format!("uploads/{upload_id}/complete"))?;
        let parts_body: Vec<serde_json::Value> = parts
            .iter()
            .map(|p| json!({ "part_number": p.part_number, "etag": p.etag }))
            .collect();
        let res = self
            .authed(self.http.post(url).json(&json!({
                "key": key,
                "parts": parts_body,
            })))
            .send()
            .await
            .map_err(|e| send_error(e, "complete multipart"))?;
        if res.status().is_success() {
            Ok(WriteResult::default())
        } else {
            Err(error_for_status(res.status(), "complete multipart"))
        }
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &str) -> Result<(), DriverError> {
        if upload_id.starts_with("dedupe-") {
            return Ok(());
        }
        let url = self.api_url(&format!("uploads/{upload_id}"))?;
        let _ = self.authed(self.http.delete(url)).send().await;
        Ok(())
    }

    async fn commit_presigned(&self, req: &CommitRequest) -> Result<WriteResult, DriverError> {
        let url = self.api_url("uploads/verify")?;
        let res = self
            .authed(self.http.post(url).json(&json!({
                "key": req.key,
                "oid": req.sha256,
                "size": req.size,
            })))
            .send()
            .await
            .map_err(|e| send_error(e, "commit"))?;
        if res.status().is_success() {
            Ok(WriteResult {
                etag: req.sha256.clone(),
            })
        } else {
            Err(error_for_status(res.status(), "commit"))
        }
    }
}
