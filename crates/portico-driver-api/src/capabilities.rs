use serde::{Deserialize, Serialize};

/// How a backend accepts multipart uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultipartStrategy {
    /// One pre-signed URL per part; the client PUTs parts directly to the
    /// backend and collects ETags.
    PerPartUrl,
    /// One upload URL for the whole session; parts are identified by
    /// `Content-Range`.
    SingleSession,
}

impl MultipartStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PerPartUrl => "per_part_url",
            Self::SingleSession => "single_session",
        }
    }
}

/// Who is authoritative for the set of uploaded parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartsLedgerPolicy {
    /// The backend's ListParts is authoritative; the gateway keeps parts in
    /// memory only.
    ServerCanList,
    /// The backend cannot list parts; the client-side persistent ledger is
    /// authoritative.
    ClientKeeps,
    /// The gateway records parts in its own table.
    ServerRecords,
}

impl PartsLedgerPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServerCanList => "server_can_list",
            Self::ClientKeeps => "client_keeps",
            Self::ServerRecords => "server_records",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningMode {
    /// Init returns every presigned URL up front.
    Eager,
    /// URLs are signed in windows of `max_parts_per_request`.
    Batched,
    /// Exactly the requested part number is signed.
    OnDemand,
}

impl SigningMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eager => "eager",
            Self::Batched => "batched",
            Self::OnDemand => "on_demand",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PartSizeBounds {
    pub min: u64,
    pub max: u64,
    pub default: u64,
}

impl PartSizeBounds {
    pub const FIVE_MIB: u64 = 5 * 1024 * 1024;

    /// Clamp a requested part size into the driver's bounds; `None` picks
    /// the default.
    pub fn clamp(&self, requested: Option<u64>) -> u64 {
        requested.unwrap_or(self.default).clamp(self.min, self.max)
    }
}

impl Default for PartSizeBounds {
    fn default() -> Self {
        Self {
            min: Self::FIVE_MIB,
            max: 5 * 1024 * 1024 * 1024,
            default: Self::FIVE_MIB,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultipartCapability {
    pub strategy: MultipartStrategy,
    pub parts_ledger_policy: PartsLedgerPolicy,
    pub signing_mode: SigningMode,
    pub server_can_list: bool,
    pub max_parts_per_request: u32,
    pub url_ttl_sec: u64,
    pub max_attempts: u32,
    pub part_size: PartSizeBounds,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FsCapabilities {
    pub backend_stream: bool,
    pub backend_form: bool,
    pub presigned_single: bool,
    pub multipart: bool,
    pub list: bool,
    pub stat: bool,
    pub read: bool,
    pub range: bool,
    pub write: bool,
    pub delete: bool,
    pub rename: bool,
    pub copy: bool,
    pub mkdir: bool,
    pub quota: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ShareCapabilities {
    pub backend_stream: bool,
    pub backend_form: bool,
    pub presigned: bool,
    pub url: bool,
}

/// Static descriptor every driver exposes. Strategy selection reads this;
/// it never reflects on the concrete driver type.
#[derive(Debug, Clone, Serialize)]
pub struct Capabilities {
    pub storage_type: &'static str,
    /// Content lives on an upstream service (link decisions route remote
    /// content through the ticketed proxy when no direct URL exists).
    pub remote: bool,
    pub fs: FsCapabilities,
    pub share: ShareCapabilities,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multipart: Option<MultipartCapability>,
    pub sha256_required_for_presign: bool,
}

#[cfg(test)]
mod tests {
    use super::PartSizeBounds;

    #[test]
    fn clamp_respects_bounds() {
        let bounds = PartSizeBounds {
            min: 5,
            max: 100,
            default: 10,
        };
        assert_eq!(bounds.clamp(None), 10);
        assert_eq!(bounds.clamp(Some(3)), 5);
        assert_eq!(bounds.clamp(Some(500)), 100);
        assert_eq!(bounds.clamp(Some(50)), 50);
    }
}
