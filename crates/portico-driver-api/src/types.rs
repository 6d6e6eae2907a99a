use serde::{Deserialize, Serialize};

use crate::capabilities::{MultipartStrategy, PartsLedgerPolicy, SigningMode};

/// Byte payloads flow through drivers as chunk streams; both axum bodies and
/// reqwest bodies convert to/from this shape without buffering.
pub type ByteStream = futures_util::stream::BoxStream<'static, std::io::Result<bytes::Bytes>>;

#[derive(Debug, Clone, Serialize)]
pub struct Entry {
    pub name: String,
    /// Backend storage key, no leading slash. Empty for the backend root.
    pub key: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_ms: Option<i64>,
    pub is_directory: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ListOptions {
    pub cursor: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Default)]
pub struct Listing {
    pub entries: Vec<Entry>,
    pub truncated: bool,
    pub next_cursor: Option<String>,
}

/// Inclusive byte range; `end = None` means "to the end of the object".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

pub struct ReadHandle {
    pub stream: ByteStream,
    pub content_type: String,
    /// Size of the returned body (the range length for range reads).
    pub size: u64,
    /// Full object size, for `Content-Range` construction.
    pub total_size: u64,
    pub etag: Option<String>,
    pub content_range: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WriteResult {
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresignedUpload {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub skip_upload: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedPartUrl {
    pub part_number: u32,
    pub url: String,
    pub expires_at_ms: i64,
}

/// Single-session uploads: one URL, parts addressed by `Content-Range`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSessionInfo {
    pub upload_url: String,
    #[serde(default)]
    pub next_expected_ranges: Vec<String>,
}

/// Per-upload policy snapshot handed to the engine and echoed to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPolicy {
    pub parts_ledger_policy: PartsLedgerPolicy,
    pub signing_mode: SigningMode,
    pub server_can_list: bool,
    pub max_parts_per_request: u32,
    pub url_ttl_sec: u64,
    pub max_attempts: u32,
}

#[derive(Debug)]
pub struct MultipartInit {
    pub strategy: MultipartStrategy,
    pub upload_id: String,
    pub key: String,
    pub part_size: u64,
    pub total_parts: Option<u32>,
    pub presigned_urls: Vec<PresignedPartUrl>,
    pub session: Option<UploadSessionInfo>,
    pub policy: UploadPolicy,
    pub skip_upload: bool,
}

#[derive(Debug, Default)]
pub struct SignedParts {
    pub presigned_urls: Vec<PresignedPartUrl>,
    /// The backend invalidated the whole upload; the caller must clear its
    /// ledger and surface a restart to the user.
    pub reset_uploaded_parts: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartRecord {
    pub part_number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    pub size: u64,
}

/// Finalizes a presigned upload after the client PUT completed.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub key: String,
    pub etag: Option<String>,
    pub sha256: Option<String>,
    pub content_type: Option<String>,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct QuotaInfo {
    pub used_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::ByteRange;

    #[test]
    fn range_header_forms() {
        assert_eq!(
            ByteRange {
                start: 0,
                end: Some(99)
            }
            .header_value(),
            "bytes=0-99"
        );
        assert_eq!(
            ByteRange {
                start: 100,
                end: None
            }
            .header_value(),
            "bytes=100-"
        );
    }
}
