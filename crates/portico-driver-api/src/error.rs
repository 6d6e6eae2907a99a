use serde::Serialize;

/// Failure classification carried from drivers to the HTTP edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    Unauthenticated,
    PermissionDenied,
    NotFound,
    Conflict,
    Gone,
    QuotaExceeded,
    ReadOnly,
    UpstreamTransient,
    UpstreamFatal,
    SessionExpired,
    SignatureExpired,
    Unsupported,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::Unauthenticated => "unauthenticated",
            Self::PermissionDenied => "permission_denied",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Gone => "gone",
            Self::QuotaExceeded => "quota_exceeded",
            Self::ReadOnly => "read_only",
            Self::UpstreamTransient => "upstream_transient",
            Self::UpstreamFatal => "upstream_fatal",
            Self::SessionExpired => "session_expired",
            Self::SignatureExpired => "signature_expired",
            Self::Unsupported => "unsupported",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

/// Typed driver failure. Downcast from `anyhow::Error` at the HTTP edge to
/// pick the response status.
#[derive(Debug)]
pub struct DriverError {
    kind: ErrorKind,
    message: String,
}

impl DriverError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthenticated, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::QuotaExceeded, message)
    }

    pub fn read_only(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ReadOnly, message)
    }

    pub fn upstream_transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamTransient, message)
    }

    pub fn upstream_fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamFatal, message)
    }

    pub fn session_expired(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SessionExpired, message)
    }

    pub fn signature_expired(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SignatureExpired, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Transient errors are retried per the driver retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, ErrorKind::UpstreamTransient)
    }

    /// Signature/credential expiry during a part PUT triggers a silent
    /// re-sign rather than a user-visible failure.
    pub fn is_signature_expired(&self) -> bool {
        matches!(self.kind, ErrorKind::SignatureExpired)
    }
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for DriverError {}

#[cfg(test)]
mod tests {
    use super::{DriverError, ErrorKind};

    #[test]
    fn downcast_through_anyhow_preserves_kind() {
        let err: anyhow::Error = DriverError::not_found("missing object").into();
        let err = err.context("stat failed");
        let driver = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<DriverError>())
            .expect("driver error in chain");
        assert_eq!(driver.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn transient_classification() {
        assert!(DriverError::upstream_transient("503").is_transient());
        assert!(!DriverError::upstream_fatal("400").is_transient());
    }
}
