//! S3-compatible object storage driver.
//!
//! Server-side calls (list, multipart control, copy) use SigV4 header
//! signing; uploads are pre-signed so clients PUT directly to the backend.
//! XML responses are parsed with `roxmltree`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use time::OffsetDateTime;
use url::Url;

use portico_driver_api::{
    ByteRange, ByteStream, Capabilities, CommitRequest, Driver, DriverError, Entry,
    FsCapabilities, ListOptions, Listing, MultipartCapability, MultipartInit, MultipartStrategy,
    PartRecord, PartSizeBounds, PartsLedgerPolicy, PresignedPartUrl, PresignedUpload, ReadHandle,
    ShareCapabilities, SignedParts, SigningMode, UploadPolicy, WriteResult,
};

use crate::sigv4::{SigV4, UNSIGNED_PAYLOAD, sha256_hex};
use crate::util::{
    error_for_status, guess_content_type, join_key, now_ms, send_error, stream_from_response,
};

#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Public base URL for direct links (custom domain / public bucket).
    #[serde(default)]
    pub public_domain: Option<String>,
    #[serde(default = "default_presign_ttl")]
    pub presign_ttl_sec: u64,
}

fn default_presign_ttl() -> u64 {
    3600
}

pub struct S3Driver {
    caps: Capabilities,
    http: reqwest::Client,
    signer: SigV4,
    bucket_url: Url,
    config: S3Config,
}

const MAX_PARTS_PER_REQUEST: u32 = 20;

impl S3Driver {
    pub fn new(config: S3Config) -> Result<Self, DriverError> {
        let endpoint = Url::parse(config.endpoint.trim_end_matches('/'))
            .map_err(|e| DriverError::invalid_input(format!("invalid endpoint: {e}")))?;
        let bucket_url = endpoint
            .join(&format!("{}/", config.bucket))
            .map_err(|e| DriverError::invalid_input(format!("invalid bucket: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| DriverError::internal(format!("http client: {e}")))?;

        Ok(Self {
            caps: Capabilities {
                storage_type: "s3",
                remote: true,
                fs: FsCapabilities {
                    backend_stream: true,
                    presigned_single: true,
                    multipart: true,
                    list: true,
                    stat: true,
                    read: true,
                    range: true,
                    write: true,
                    delete: true,
                    rename: true,
                    copy: true,
                    mkdir: true,
                    ..Default::default()
                },
                share: ShareCapabilities {
                    backend_stream: true,
                    presigned: true,
                    url: config.public_domain.is_some(),
                    ..Default::default()
                },
                multipart: Some(MultipartCapability {
                    strategy: MultipartStrategy::PerPartUrl,
                    parts_ledger_policy: PartsLedgerPolicy::ServerCanList,
                    signing_mode: SigningMode::Batched,
                    server_can_list: true,
                    max_parts_per_request: MAX_PARTS_PER_REQUEST,
                    url_ttl_sec: config.presign_ttl_sec,
                    max_attempts: 3,
                    part_size: PartSizeBounds::default(),
                }),
                sha256_required_for_presign: false,
            },
            signer: SigV4 {
                access_key_id: config.access_key_id.clone(),
                secret_access_key: config.secret_access_key.clone(),
                region: config.region.clone(),
            },
            http,
            bucket_url,
            config,
        })
    }

    fn object_url(&self, key: &str) -> Result<Url, DriverError> {
        join_key(&self.bucket_url, key)
    }

    fn policy(&self) -> UploadPolicy {
        let cap = self.caps.multipart.as_ref().expect("s3 has multipart cap");
        UploadPolicy {
            parts_ledger_policy: cap.parts_ledger_policy,
            signing_mode: cap.signing_mode,
            server_can_list: cap.server_can_list,
            max_parts_per_request: cap.max_parts_per_request,
            url_ttl_sec: cap.url_ttl_sec,
            max_attempts: cap.max_attempts,
        }
    }

    async fn send_signed(
        &self,
        method: reqwest::Method,
        url: Url,
        payload: Option<Vec<u8>>,
        extra_amz_headers: &[(String, String)],
        context: &'static str,
    ) -> Result<reqwest::Response, DriverError> {
        let payload_hash = match payload.as_deref() {
            Some(body) => sha256_hex(body),
            None => UNSIGNED_PAYLOAD.to_string(),
        };
        let headers = self.signer.sign_headers(
            method.as_str(),
            &url,
            &payload_hash,
            OffsetDateTime::now_utc(),
            extra_amz_headers,
        );

        let mut req = self.http.request(method, url);
        for (name, value) in headers {
            req = req.header(name, value);
        }
        if let Some(body) = payload {
            req = req.body(body);
        }
        req.send().await.map_err(|e| send_error(e, context))
    }

    fn presign_part(&self, key: &str, upload_id: &str, part_number: u32) -> Result<PresignedPartUrl, DriverError> {
        let mut url = self.object_url(key)?;
        url.query_pairs_mut()
            .append_pair("partNumber", &part_number.to_string())
            .append_pair("uploadId", upload_id);
        let signed = self.signer.presign(
            "PUT",
            &url,
            self.config.presign_ttl_sec,
            OffsetDateTime::now_utc(),
        );
        Ok(PresignedPartUrl {
            part_number,
            url: signed.to_string(),
            expires_at_ms: now_ms() + (self.config.presign_ttl_sec as i64) * 1000,
        })
    }

    async fn list_keys_under(&self, prefix: &str) -> Result<Vec<String>, DriverError> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut url = self.bucket_url.clone();
            {
                let mut qp = url.query_pairs_mut();
                qp.append_pair("list-type", "2");
                qp.append_pair("prefix", prefix);
                if let Some(token) = token.as_deref() {
                    qp.append_pair("continuation-token", token);
                }
            }
            let res = self
                .send_signed(reqwest::Method::GET, url, None, &[], "list")
                .await?;
            if !res.status().is_success() {
                return Err(error_for_status(res.status(), "list"));
            }
            let text = res
                .text()
                .await
                .map_err(|e| send_error(e, "list"))?;
            let doc = parse_xml(&text, "list")?;
            for node in descendants_named(&doc, "Contents") {
                if let Some(key) = child_text(&node, "Key") {
                    keys.push(key);
                }
            }
            let truncated = descendant_text(&doc, "IsTruncated")
                .is_some_and(|v| v == "true");
            token = descendant_text(&doc, "NextContinuationToken");
            if !truncated || token.is_none() {
                break;
            }
        }
        Ok(keys)
    }
}

fn parse_xml<'a>(
    text: &'a str,
    context: &'static str,
) -> Result<roxmltree::Document<'a>, DriverError> {
    roxmltree::Document::parse(text)
        .map_err(|e| DriverError::upstream_fatal(format!("{context}: bad XML: {e}")))
}

fn descendants_named<'a, 'input>(
    doc: &'a roxmltree::Document<'input>,
    name: &'static str,
) -> impl Iterator<Item = roxmltree::Node<'a, 'input>> {
    doc.descendants()
        .filter(move |n| n.is_element() && n.tag_name().name() == name)
}

fn descendant_text(doc: &roxmltree::Document<'_>, name: &'static str) -> Option<String> {
    doc.descendants()
        .find(|n| n.is_element() && n.tag_name().name() == name)
        .and_then(|n| n.text())
        .map(str::to_string)
}

fn child_text(node: &roxmltree::Node<'_, '_>, name: &'static str) -> Option<String> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
        .and_then(|n| n.text())
        .map(str::to_string)
}

fn parse_last_modified(raw: &str) -> Option<i64> {
    OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339)
        .ok()
        .map(|t| (t.unix_timestamp_nanos() / 1_000_000) as i64)
}

#[async_trait]
impl Driver for S3Driver {
    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    async fn list(&self, key: &str, opts: &ListOptions) -> Result<Listing, DriverError> {
        let prefix = if key.is_empty() {
            String::new()
        } else {
            format!("{key}/")
        };

        let mut url = self.bucket_url.clone();
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("list-type", "2");
            qp.append_pair("prefix", &prefix);
            qp.append_pair("delimiter", "/");
            if let Some(limit) = opts.limit {
                qp.append_pair("max-keys", &limit.to_string());
            }
            if let Some(cursor) = opts.cursor.as_deref() {
                qp.append_pair("continuation-token", cursor);
            }
        }

        let res = self
            .send_signed(reqwest::Method::GET, url, None, &[], "list")
            .await?;
        if !res.status().is_success() {
            return Err(error_for_status(res.status(), "list"));
        }
        let text = res.text().await.map_err(|e| send_error(e, "list"))?;
        let doc = parse_xml(&text, "list")?;

        let mut entries = Vec::new();
        for node in descendants_named(&doc, "CommonPrefixes") {
            let Some(dir_prefix) = child_text(&node, "Prefix") else {
                continue;
            };
            let dir_key = dir_prefix.trim_end_matches('/').to_string();
            if dir_key.is_empty() {
                continue;
            }
            entries.push(Entry {
                name: dir_key.rsplit('/').next().unwrap_or(&dir_key).to_string(),
                key: dir_key,
                size: 0,
                modified_ms: None,
                is_directory: true,
                etag: None,
                content_type: None,
            });
        }
        for node in descendants_named(&doc, "Contents") {
            let Some(obj_key) = child_text(&node, "Key") else {
                continue;
            };
            if obj_key == prefix {
                // The directory marker object itself.
                continue;
            }
            let size = child_text(&node, "Size")
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
            let modified_ms =
                child_text(&node, "LastModified").and_then(|v| parse_last_modified(&v));
            let etag = child_text(&node, "ETag");
            entries.push(Entry {
                name: obj_key.rsplit('/').next().unwrap_or(&obj_key).to_string(),
                content_type: Some(guess_content_type(&obj_key)),
                key: obj_key,
                size,
                modified_ms,
                is_directory: false,
                etag,
            });
        }

        let truncated = descendant_text(&doc, "IsTruncated").is_some_and(|v| v == "true");
        Ok(Listing {
            entries,
            truncated,
            next_cursor: descendant_text(&doc, "NextContinuationToken"),
        })
    }

    async fn stat(&self, key: &str) -> Result<Option<Entry>, DriverError> {
        let url = self.object_url(key)?;
        let res = self
            .send_signed(reqwest::Method::HEAD, url, None, &[], "stat")
            .await?;
        match res.status() {
            s if s.is_success() => {
                let size = res
                    .headers()
                    .get(reqwest::header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0);
                let etag = res
                    .headers()
                    .get(reqwest::header::ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let modified_ms = res
                    .headers()
                    .get(reqwest::header::LAST_MODIFIED)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| httpdate::parse_http_date(v).ok())
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as i64);
                let content_type = res
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                Ok(Some(Entry {
                    name: key.rsplit('/').next().unwrap_or(key).to_string(),
                    key: key.to_string(),
                    size,
                    modified_ms,
                    is_directory: false,
                    etag,
                    content_type,
                }))
            }
            reqwest::StatusCode::NOT_FOUND => {
                // Prefixes are directories in spirit; probe with a bounded list.
                let mut url = self.bucket_url.clone();
                url.query_pairs_mut()
                    .append_pair("list-type", "2")
                    .append_pair("prefix", &format!("{key}/"))
                    .append_pair("max-keys", "1");
                let res = self
                    .send_signed(reqwest::Method::GET, url, None, &[], "stat")
                    .await?;
                if !res.status().is_success() {
                    return Err(error_for_status(res.status(), "stat"));
                }
                let text = res.text().await.map_err(|e| send_error(e, "stat"))?;
                let doc = parse_xml(&text, "stat")?;
                let key_count = descendant_text(&doc, "KeyCount")
                    .and_then(|v| v.parse::<u32>().ok())
                    .unwrap_or(0);
                if key_count > 0 {
                    Ok(Some(Entry {
                        name: key.rsplit('/').next().unwrap_or(key).to_string(),
                        key: key.to_string(),
                        size: 0,
                        modified_ms: None,
                        is_directory: true,
                        etag: None,
                        content_type: None,
                    }))
                } else {
                    Ok(None)
                }
            }
            s => Err(error_for_status(s, "stat")),
        }
    }

    async fn read(&self, key: &str, range: Option<ByteRange>) -> Result<ReadHandle, DriverError> {
        let url = self.object_url(key)?;
        let headers = self.signer.sign_headers(
            "GET",
            &url,
            UNSIGNED_PAYLOAD,
            OffsetDateTime::now_utc(),
            &[],
        );

        let mut req = self.http.get(url);
        for (name, value) in headers {
            req = req.header(name, value);
        }
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
        let etag = res
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
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
            etag,
            content_range,
        })
    }

    async fn write(
        &self,
        key: &str,
        body: ByteStream,
        size: u64,
        content_type: &str,
    ) -> Result<WriteResult, DriverError> {
        let url = self.object_url(key)?;
        let headers = self.signer.sign_headers(
            "PUT",
            &url,
            UNSIGNED_PAYLOAD,
            OffsetDateTime::now_utc(),
            &[],
        );

        let mut req = self
            .http
            .put(url)
            .header(reqwest::header::CONTENT_LENGTH, size)
            .header(
                reqwest::header::CONTENT_TYPE,
                if content_type.is_empty() {
                    guess_content_type(key)
                } else {
                    content_type.to_string()
                },
            )
            .body(reqwest::Body::wrap_stream(body));
        for (name, value) in headers {
            req = req.header(name, value);
        }
        let res = req.send().await.map_err(|e| send_error(e, "write"))?;
        if !res.status().is_success() {
            return Err(error_for_status(res.status(), "write"));
        }
        let etag = res
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(WriteResult { etag })
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<(), DriverError> {
        if recursive {
            let keys = self.list_keys_under(&format!("{key}/")).await?;
            for sub_key in keys {
                let url = self.object_url(&sub_key)?;
                let res = self
                    .send_signed(reqwest::Method::DELETE, url, None, &[], "delete")
                    .await?;
                if !res.status().is_success() && res.status() != reqwest::StatusCode::NOT_FOUND {
                    return Err(error_for_status(res.status(), "delete"));
                }
            }
        }

        let url = self.object_url(key)?;
        let res = self
            .send_signed(reqwest::Method::DELETE, url, None, &[], "delete")
            .await?;
        if res.status().is_success() || res.status() == reqwest::StatusCode::NOT_FOUND {
            // Also clear a directory marker, if one exists.
            if recursive {
                let marker = self.object_url(&format!("{key}/"))?;
                let _ = self
                    .send_signed(reqwest::Method::DELETE, marker, None, &[], "delete")
                    .await;
            }
            Ok(())
        } else {
            Err(error_for_status(res.status(), "delete"))
        }
    }

    async fn mkdir(&self, key: &str) -> Result<(), DriverError> {
        let url = self.object_url(&format!("{key}/"))?;
        let res = self
            .send_signed(reqwest::Method::PUT, url, Some(Vec::new()), &[], "mkdir")
            .await?;
        if res.status().is_success() {
            Ok(())
        } else {
            Err(error_for_status(res.status(), "mkdir"))
        }
    }

    async fn rename(&self, src: &str, dst: &str) -> Result<(), DriverError> {
        self.copy(src, dst).await?;
        self.delete(src, false).await
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<(), DriverError> {
        let url = self.object_url(dst)?;
        let copy_source = format!("/{}/{src}", self.config.bucket);
        let res = self
            .send_signed(
                reqwest::Method::PUT,
                url,
                Some(Vec::new()),
                &[("x-amz-copy-source".to_string(), copy_source)],
                "copy",
            )
            .await?;
        if res.status().is_success() {
            Ok(())
        } else {
            Err(error_for_status(res.status(), "copy"))
        }
    }

    async fn presign_single(
        &self,
        key: &str,
        _size: u64,
        content_type: &str,
        _sha256: Option<&str>,
    ) -> Result<PresignedUpload, DriverError> {
        let url = self.object_url(key)?;
        let signed = self.signer.presign(
            "PUT",
            &url,
            self.config.presign_ttl_sec,
            OffsetDateTime::now_utc(),
        );
        Ok(PresignedUpload {
            method: "PUT".to_string(),
            url: signed.to_string(),
            headers: vec![(
                "Content-Type".to_string(),
                if content_type.is_empty() {
                    guess_content_type(key)
                } else {
                    content_type.to_string()
                },
            )],
            sha256: None,
            skip_upload: false,
        })
    }

    async fn init_multipart(
        &self,
        key: &str,
        size: u64,
        content_type: &str,
        part_size_hint: Option<u64>,
        _sha256: Option<&str>,
    ) -> Result<MultipartInit, DriverError> {
        let cap = self.caps.multipart.as_ref().expect("s3 has multipart cap");
        let part_size = cap.part_size.clamp(part_size_hint);
        let total_parts = size.div_ceil(part_size).max(1) as u32;

        let mut url = self.object_url(key)?;
        url.query_pairs_mut().append_pair("uploads", "");

        let res = self
            .send_signed(reqwest::Method::POST, url, Some(Vec::new()), &[], "init multipart")
            .await?;
        if !res.status().is_success() {
            return Err(error_for_status(res.status(), "init multipart"));
        }
        let text = res
            .text()
            .await
            .map_err(|e| send_error(e, "init multipart"))?;
        let doc = parse_xml(&text, "init multipart")?;
        let upload_id = descendant_text(&doc, "UploadId")
            .ok_or_else(|| DriverError::upstream_fatal("init multipart: missing UploadId"))?;

        // Batched signing: hand out the first window up front.
        let window_end = total_parts.min(cap.max_parts_per_request);
        let mut presigned_urls = Vec::with_capacity(window_end as usize);
        for part_number in 1..=window_end {
            presigned_urls.push(self.presign_part(key, &upload_id, part_number)?);
        }

        let _ = content_type;
        Ok(MultipartInit {
            strategy: MultipartStrategy::PerPartUrl,
            upload_id,
            key: key.to_string(),
            part_size,
            total_parts: Some(total_parts),
            presigned_urls,
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
        let mut presigned_urls = Vec::with_capacity(part_numbers.len());
        for &part_number in part_numbers {
            if part_number == 0 {
                return Err(DriverError::invalid_input("part numbers start at 1"));
            }
            presigned_urls.push(self.presign_part(key, upload_id, part_number)?);
        }
        Ok(SignedParts {
            presigned_urls,
            reset_uploaded_parts: false,
        })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartRecord],
    ) -> Result<WriteResult, DriverError> {
        let mut body = String::from("<CompleteMultipartUpload>");
        for part in parts {
            let etag = part.etag.as_deref().ok_or_else(|| {
                DriverError::invalid_input(format!("part {} has no etag", part.part_number))
            })?;
            body.push_str(&format!(
                "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
                part.part_number, etag
            ));
        }
        body.push_str("</CompleteMultipartUpload>");

        let mut url = self.object_url(key)?;
        url.query_pairs_mut().append_pair("uploadId", upload_id);
        let res = self
            .send_signed(
                reqwest::Method::POST,
                url,
                Some(body.into_bytes()),
                &[],
                "complete multipart",
            )
            .await?;
        if !res.status().is_success() {
            return Err(error_for_status(res.status(), "complete multipart"));
        }
        let text = res
            .text()
            .await
            .map_err(|e| send_error(e, "complete multipart"))?;
        // S3 reports some failures inside a 200 body.
        if text.contains("<Error>") {
            return Err(DriverError::upstream_fatal(format!(
                "complete multipart: {text}"
            )));
        }
        let doc = parse_xml(&text, "complete multipart")?;
        Ok(WriteResult {
            etag: descendant_text(&doc, "ETag"),
        })
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), DriverError> {
        let mut url = self.object_url(key)?;
        url.query_pairs_mut().append_pair("uploadId", upload_id);
        let res = self
            .send_signed(reqwest::Method::DELETE, url, None, &[], "abort multipart")
            .await?;
        if res.status().is_success() || res.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(error_for_status(res.status(), "abort multipart"))
        }
    }

    async fn list_parts(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<PartRecord>, DriverError> {
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let mut url = self.object_url(key)?;
            {
                let mut qp = url.query_pairs_mut();
                qp.append_pair("uploadId", upload_id);
                if let Some(marker) = marker.as_deref() {
                    qp.append_pair("part-number-marker", marker);
                }
            }
            let res = self
                .send_signed(reqwest::Method::GET, url, None, &[], "list parts")
                .await?;
            if !res.status().is_success() {
                return Err(error_for_status(res.status(), "list parts"));
            }
            let text = res
                .text()
                .await
                .map_err(|e| send_error(e, "list parts"))?;
            let doc = parse_xml(&text, "list parts")?;
            for node in descendants_named(&doc, "Part") {
                let Some(part_number) =
                    child_text(&node, "PartNumber").and_then(|v| v.parse::<u32>().ok())
                else {
                    continue;
                };
                parts.push(PartRecord {
                    part_number,
                    etag: child_text(&node, "ETag"),
                    size: child_text(&node, "Size")
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(0),
                });
            }
            let truncated = descendant_text(&doc, "IsTruncated").is_some_and(|v| v == "true");
            marker = descendant_text(&doc, "NextPartNumberMarker");
            if !truncated || marker.is_none() {
                break;
            }
        }
        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    async fn commit_presigned(&self, req: &CommitRequest) -> Result<WriteResult, DriverError> {
        // The object already landed via the client's direct PUT; verify it
        // exists so a failed upload cannot be committed.
        match self.stat(&req.key).await? {
            Some(entry) => Ok(WriteResult { etag: entry.etag }),
            None => Err(DriverError::not_found(format!(
                "commit: object missing: {}",
                req.key
            ))),
        }
    }

    fn public_url(&self, key: &str) -> Option<String> {
        let domain = self.config.public_domain.as_deref()?;
        let base = Url::parse(domain).ok()?;
        join_key(&base, key).ok().map(|u| u.to_string())
    }
}

#[cfg(test)]
mod tests {
    use portico_driver_api::{Driver as _, MultipartStrategy, PartsLedgerPolicy};

    use super::{S3Config, S3Driver};

    fn test_driver() -> S3Driver {
        S3Driver::new(S3Config {
            endpoint: "https://s3.example.com".to_string(),
            region: "us-east-1".to_string(),
            bucket: "bucket".to_string(),
            access_key_id: "ak".to_string(),
            secret_access_key: "sk".to_string(),
            public_domain: Some("https://cdn.example.com".to_string()),
            presign_ttl_sec: 3600,
        })
        .unwrap()
    }

    #[test]
    fn capabilities_advertise_per_part_url() {
        let driver = test_driver();
        let cap = driver.capabilities().multipart.as_ref().unwrap();
        assert_eq!(cap.strategy, MultipartStrategy::PerPartUrl);
        assert_eq!(cap.parts_ledger_policy, PartsLedgerPolicy::ServerCanList);
        assert!(cap.server_can_list);
    }

    #[test]
    fn public_url_uses_custom_domain() {
        let driver = test_driver();
        assert_eq!(
            driver.public_url("docs/a b.txt").as_deref(),
            Some("https://cdn.example.com/docs/a%20b.txt")
        );
    }

    #[tokio::test]
    async fn sign_parts_rejects_part_zero() {
        let driver = test_driver();
        assert!(driver.sign_parts("k", "u", &[0]).await.is_err());
        let signed = driver.sign_parts("k", "u", &[1, 2]).await.unwrap();
        assert_eq!(signed.presigned_urls.len(), 2);
        assert!(signed.presigned_urls[0].url.contains("partNumber=1"));
        assert!(signed.presigned_urls[0].url.contains("X-Amz-Signature="));
    }
}
