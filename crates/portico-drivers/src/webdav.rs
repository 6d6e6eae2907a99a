//! WebDAV backend driver.
//!
//! Speaks PROPFIND/GET/PUT/MKCOL/DELETE/MOVE/COPY against a remote DAV
//! server. MKCOL does not create intermediate collections, so writes ensure
//! parents iteratively. 429/503 responses honor `Retry-After` with a capped
//! exponential backoff.

use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, RANGE, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use url::Url;

use portico_driver_api::{
    ByteRange, ByteStream, Capabilities, Driver, DriverError, Entry, FsCapabilities, ListOptions,
    Listing, ReadHandle, ShareCapabilities, WriteResult,
};

use crate::util::{error_for_status, guess_content_type, join_key, send_error, stream_from_response};

#[derive(Debug, Clone, Deserialize)]
pub struct WebdavConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
}

pub struct WebdavDriver {
    caps: Capabilities,
    http: reqwest::Client,
    base_url: Url,
    username: String,
    password: String,
}

const MAX_ATTEMPTS: u32 = 3;

impl WebdavDriver {
    pub fn new(config: WebdavConfig) -> Result<Self, DriverError> {
        let mut base_url = Url::parse(config.base_url.trim())
            .map_err(|e| DriverError::invalid_input(format!("invalid base_url: {e}")))?;
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| DriverError::internal(format!("http client: {e}")))?;

        Ok(Self {
            caps: Capabilities {
                storage_type: "webdav",
                remote: true,
                fs: FsCapabilities {
                    backend_stream: true,
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
                    ..Default::default()
                },
                multipart: None,
                sha256_required_for_presign: false,
            },
            http,
            base_url,
            username: config.username,
            password: config.password,
        })
    }

    fn key_url(&self, key: &str) -> Result<Url, DriverError> {
        join_key(&self.base_url, key)
    }

    fn collection_url(&self, key: &str) -> Result<Url, DriverError> {
        let mut url = self.key_url(key)?;
        if !url.path().ends_with('/') {
            url.set_path(&format!("{}/", url.path()));
        }
        Ok(url)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.basic_auth(self.username.clone(), Some(self.password.clone()))
    }

    /// Send with retries on 429/503, honoring `Retry-After` where present.
    async fn send_retrying(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
        context: &'static str,
    ) -> Result<reqwest::Response, DriverError> {
        let mut attempt = 1u32;
        let mut backoff = Duration::from_secs(1);
        loop {
            let res = self
                .authed(build())
                .send()
                .await
                .map_err(|e| send_error(e, context))?;
            match res.status() {
                StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE
                    if attempt < MAX_ATTEMPTS =>
                {
                    let delay = parse_retry_after(&res)
                        .unwrap_or(backoff)
                        .min(Duration::from_secs(60));
                    tracing::debug!(context, attempt, delay_ms = delay.as_millis() as u64, "webdav retry");
                    tokio::time::sleep(delay).await;
                    backoff = std::cmp::min(backoff * 2, Duration::from_secs(30));
                    attempt += 1;
                }
                _ => return Ok(res),
            }
        }
    }

    async fn propfind(
        &self,
        url: &Url,
        depth: &'static str,
    ) -> Result<Vec<PropfindEntry>, DriverError> {
        const BODY: &str = r#"<?xml version="1.0" encoding="utf-8" ?>
<D:propfind xmlns:D="DAV:">
  <D:prop>
    <D:resourcetype/>
    <D:getcontentlength/>
    <D:getlastmodified/>
    <D:getetag/>
  </D:prop>
</D:propfind>
"#;
        let depth_name = reqwest::header::HeaderName::from_static("depth");
        let res = self
            .send_retrying(
                || {
                    self.http
                        .request(Method::from_bytes(b"PROPFIND").expect("static method"), url.clone())
                        .header(depth_name.clone(), depth)
                        .header(CONTENT_TYPE, "application/xml")
                        .body(BODY)
                },
                "propfind",
            )
            .await?;

        let status = res.status();
        if status != StatusCode::MULTI_STATUS && status != StatusCode::OK {
            return Err(error_for_status(status, "propfind"));
        }
        let text = res.text().await.map_err(|e| send_error(e, "propfind"))?;
        parse_multistatus(&text)
    }

    /// MKCOL the collection and any missing parents (servers answer 409
    /// when parents are absent).
    async fn ensure_collection(&self, key: &str) -> Result<(), DriverError> {
        let mut pending: Vec<String> = Vec::new();
        let mut current = key.to_string();

        loop {
            if current.is_empty() {
                break;
            }
            let url = self.collection_url(&current)?;
            let status = self
                .send_retrying(
                    || {
                        self.http
                            .request(Method::from_bytes(b"MKCOL").expect("static method"), url.clone())
                    },
                    "mkcol",
                )
                .await?
                .status();
            match status {
                StatusCode::CREATED | StatusCode::METHOD_NOT_ALLOWED => break,
                StatusCode::CONFLICT => {
                    let Some((parent, _)) = current.rsplit_once('/') else {
                        return Err(DriverError::conflict("mkcol: missing parent"));
                    };
                    let parent = parent.to_string();
                    pending.push(std::mem::replace(&mut current, parent));
                }
                s => return Err(error_for_status(s, "mkcol")),
            }
        }

        while let Some(next) = pending.pop() {
            let url = self.collection_url(&next)?;
            let status = self
                .send_retrying(
                    || {
                        self.http
                            .request(Method::from_bytes(b"MKCOL").expect("static method"), url.clone())
                    },
                    "mkcol",
                )
                .await?
                .status();
            if status != StatusCode::CREATED && status != StatusCode::METHOD_NOT_ALLOWED {
                return Err(error_for_status(status, "mkcol"));
            }
        }
        Ok(())
    }

    fn entry_from_propfind(&self, key: &str, found: &PropfindEntry) -> Entry {
        let name = key.rsplit('/').next().unwrap_or(key).to_string();
        Entry {
            content_type: if found.is_dir {
                None
            } else {
                Some(guess_content_type(&name))
            },
            name,
            key: key.to_string(),
            size: found.size.unwrap_or(0),
            modified_ms: found.mtime_ms,
            is_directory: found.is_dir,
            etag: found.etag.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PropfindEntry {
    href: String,
    name: String,
    is_dir: bool,
    size: Option<u64>,
    mtime_ms: Option<i64>,
    etag: Option<String>,
}

fn parse_retry_after(res: &reqwest::Response) -> Option<Duration> {
    let v = res.headers().get(RETRY_AFTER)?.to_str().ok()?.trim();
    if v.is_empty() {
        return None;
    }
    if let Ok(secs) = v.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if let Ok(t) = httpdate::parse_http_date(v) {
        return Some(
            t.duration_since(std::time::SystemTime::now())
                .unwrap_or(Duration::from_secs(0)),
        );
    }
    None
}

fn decode_href_path(href: &str) -> Option<String> {
    let raw = href.trim();
    if raw.is_empty() {
        return None;
    }

    let path_raw = if raw.starts_with("http://") || raw.starts_with("https://") {
        Url::parse(raw).ok()?.path().to_string()
    } else {
        raw.to_string()
    };

    let trailing_slash = path_raw.ends_with('/');
    let parts = path_raw
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| percent_decode_str(s).decode_utf8_lossy().to_string())
        .collect::<Vec<_>>();
    let mut out = format!("/{}", parts.join("/"));
    if trailing_slash && !out.ends_with('/') {
        out.push('/');
    }
    Some(out)
}

fn parse_multistatus(xml: &str) -> Result<Vec<PropfindEntry>, DriverError> {
    let doc = roxmltree::Document::parse(xml)
        .map_err(|e| DriverError::upstream_fatal(format!("propfind: bad XML: {e}")))?;

    let mut out = Vec::new();
    for response in doc
        .descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == "response")
    {
        let Some(mut href) = response
            .children()
            .find(|n| n.is_element() && n.tag_name().name() == "href")
            .and_then(|n| n.text())
            .and_then(decode_href_path)
        else {
            continue;
        };

        let mut is_dir = false;
        let mut size = None::<u64>;
        let mut mtime_ms = None::<i64>;
        let mut etag = None::<String>;

        for propstat in response
            .children()
            .filter(|n| n.is_element() && n.tag_name().name() == "propstat")
        {
            let status = propstat
                .children()
                .find(|n| n.is_element() && n.tag_name().name() == "status")
                .and_then(|n| n.text())
                .unwrap_or("");
            if !status.contains(" 200 ") {
                continue;
            }
            let Some(prop) = propstat
                .children()
                .find(|n| n.is_element() && n.tag_name().name() == "prop")
            else {
                continue;
            };

            if let Some(resourcetype) = prop
                .children()
                .find(|n| n.is_element() && n.tag_name().name() == "resourcetype")
                && resourcetype
                    .children()
                    .any(|n| n.is_element() && n.tag_name().name() == "collection")
            {
                is_dir = true;
                if !href.ends_with('/') {
                    href.push('/');
                }
            }

            if let Some(v) = prop
                .children()
                .find(|n| n.is_element() && n.tag_name().name() == "getcontentlength")
                .and_then(|n| n.text())
                .map(str::trim)
                .filter(|v| !v.is_empty())
            {
                size = v.parse::<u64>().ok();
            }

            if let Some(v) = prop
                .children()
                .find(|n| n.is_element() && n.tag_name().name() == "getlastmodified")
                .and_then(|n| n.text())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                && let Ok(t) = httpdate::parse_http_date(v)
                && let Ok(d) = t.duration_since(std::time::UNIX_EPOCH)
            {
                mtime_ms = Some(d.as_millis() as i64);
            }

            if let Some(v) = prop
                .children()
                .find(|n| n.is_element() && n.tag_name().name() == "getetag")
                .and_then(|n| n.text())
                .map(str::trim)
                .filter(|v| !v.is_empty())
            {
                etag = Some(v.to_string());
            }

            break;
        }

        let trimmed = href.trim_end_matches('/');
        let name = if trimmed.is_empty() {
            "/".to_string()
        } else {
            trimmed.rsplit('/').next().unwrap_or(trimmed).to_string()
        };

        out.push(PropfindEntry {
            href,
            name,
            is_dir,
            size,
            mtime_ms,
            etag,
        });
    }

    Ok(out)
}

#[async_trait]
impl Driver for WebdavDriver {
    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    async fn list(&self, key: &str, _opts: &ListOptions) -> Result<Listing, DriverError> {
        let url = self.collection_url(key)?;
        let mut entries = self.propfind(&url, "1").await?;

        // Drop the self entry; a file answering a depth-1 PROPFIND means the
        // key is not a collection.
        let self_path = decode_href_path(url.path()).unwrap_or_else(|| url.path().to_string());
        let self_path_noslash = self_path.trim_end_matches('/').to_string();
        if let Some(self_entry) = entries
            .iter()
            .find(|e| e.href.trim_end_matches('/') == self_path_noslash)
            && !self_entry.is_dir
        {
            return Err(DriverError::conflict(format!("not a directory: {key}")));
        }
        entries.retain(|e| e.href.trim_end_matches('/') != self_path_noslash);

        let listing = entries
            .iter()
            .map(|e| {
                let child_key = if key.is_empty() {
                    e.name.clone()
                } else {
                    format!("{key}/{}", e.name)
                };
                self.entry_from_propfind(&child_key, e)
            })
            .collect();
        Ok(Listing {
            entries: listing,
            truncated: false,
            next_cursor: None,
        })
    }

    async fn stat(&self, key: &str) -> Result<Option<Entry>, DriverError> {
        let url = self.key_url(key)?;
        match self.propfind(&url, "0").await {
            Ok(entries) => Ok(entries.first().map(|e| self.entry_from_propfind(key, e))),
            Err(err) if err.kind() == portico_driver_api::ErrorKind::NotFound => {
                // Some servers want a trailing slash for collections.
                let url = self.collection_url(key)?;
                match self.propfind(&url, "0").await {
                    Ok(entries) => {
                        Ok(entries.first().map(|e| self.entry_from_propfind(key, e)))
                    }
                    Err(err) if err.kind() == portico_driver_api::ErrorKind::NotFound => Ok(None),
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn read(&self, key: &str, range: Option<ByteRange>) -> Result<ReadHandle, DriverError> {
        let url = self.key_url(key)?;
        let res = self
            .send_retrying(
                || {
                    let mut req = self.http.get(url.clone());
                    if let Some(range) = range {
                        req = req.header(RANGE, range.header_value());
                    }
                    req
                },
                "get",
            )
            .await?;
        if !res.status().is_success() {
            return Err(error_for_status(res.status(), "get"));
        }

        let size = res.content_length().unwrap_or(0);
        let content_type = res
            .headers()
            .get(CONTENT_TYPE)
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
        let etag = res
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

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
        if let Some((parent, _)) = key.rsplit_once('/') {
            self.ensure_collection(parent).await?;
        }

        let url = self.key_url(key)?;
        let content_type = if content_type.is_empty() {
            guess_content_type(key)
        } else {
            content_type.to_string()
        };
        // Streaming bodies are not replayable, so the PUT itself is not
        // retried here; transient failures bubble up to the engine.
        let res = self
            .authed(
                self.http
                    .put(url)
                    .header(CONTENT_TYPE, content_type)
                    .header(CONTENT_LENGTH, size)
                    .body(reqwest::Body::wrap_stream(body)),
            )
            .send()
            .await
            .map_err(|e| send_error(e, "put"))?;

        match res.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT => {
                let etag = res
                    .headers()
                    .get(reqwest::header::ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                Ok(WriteResult { etag })
            }
            s => Err(error_for_status(s, "put")),
        }
    }

    async fn delete(&self, key: &str, _recursive: bool) -> Result<(), DriverError> {
        // DAV DELETE on a collection is recursive by protocol.
        let url = self.key_url(key)?;
        let res = self
            .send_retrying(|| self.http.delete(url.clone()), "delete")
            .await?;
        match res.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(DriverError::not_found(format!("no such path: {key}"))),
            s => Err(error_for_status(s, "delete")),
        }
    }

    async fn mkdir(&self, key: &str) -> Result<(), DriverError> {
        self.ensure_collection(key).await
    }

    async fn rename(&self, src: &str, dst: &str) -> Result<(), DriverError> {
        let src_url = self.key_url(src)?;
        let dst_url = self.key_url(dst)?;
        let res = self
            .send_retrying(
                || {
                    self.http
                        .request(Method::from_bytes(b"MOVE").expect("static method"), src_url.clone())
                        .header("Destination", dst_url.as_str())
                        .header("Overwrite", "T")
                },
                "move",
            )
            .await?;
        if res.status().is_success() {
            Ok(())
        } else {
            Err(error_for_status(res.status(), "move"))
        }
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<(), DriverError> {
        let src_url = self.key_url(src)?;
        let dst_url = self.key_url(dst)?;
        let res = self
            .send_retrying(
                || {
                    self.http
                        .request(Method::from_bytes(b"COPY").expect("static method"), src_url.clone())
                        .header("Destination", dst_url.as_str())
                        .header("Overwrite", "T")
                },
                "copy",
            )
            .await?;
        if res.status().is_success() {
            Ok(())
        } else {
            Err(error_for_status(res.status(), "copy"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{decode_href_path, parse_multistatus};

    #[test]
    fn parse_multistatus_extracts_entries() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<d:multistatus xmlns:d="DAV:">
  <d:response>
    <d:href>/dav/docs/</d:href>
    <d:propstat>
      <d:prop><d:resourcetype><d:collection/></d:resourcetype></d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/dav/docs/file.txt</d:href>
    <d:propstat>
      <d:prop>
        <d:resourcetype/>
        <d:getcontentlength>5</d:getcontentlength>
        <d:getlastmodified>Mon, 12 Jan 2026 10:00:00 GMT</d:getlastmodified>
        <d:getetag>"abc"</d:getetag>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
</d:multistatus>
"#;
        let entries = parse_multistatus(xml).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_dir);
        assert_eq!(entries[0].name, "docs");
        assert_eq!(entries[1].name, "file.txt");
        assert_eq!(entries[1].size, Some(5));
        assert_eq!(entries[1].etag.as_deref(), Some("\"abc\""));
        assert!(entries[1].mtime_ms.is_some());
    }

    #[test]
    fn parse_multistatus_skips_non_200_propstat() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<d:multistatus xmlns:d="DAV:">
  <d:response>
    <d:href>/f.txt</d:href>
    <d:propstat>
      <d:prop><d:getcontentlength>999</d:getcontentlength></d:prop>
      <d:status>HTTP/1.1 404 Not Found</d:status>
    </d:propstat>
    <d:propstat>
      <d:prop><d:getcontentlength>5</d:getcontentlength></d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
</d:multistatus>
"#;
        let entries = parse_multistatus(xml).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].size, Some(5));
    }

    #[test]
    fn href_decoding() {
        assert_eq!(decode_href_path("/a/b%20c/").unwrap(), "/a/b c/");
        assert_eq!(
            decode_href_path("https://host/dav/x").unwrap(),
            "/dav/x"
        );
        assert!(decode_href_path("  ").is_none());
    }
}
