//! Typed service-level failures, downcast at the HTTP edge.

/// The requested path falls outside the API key's basic-path sandbox.
#[derive(Debug)]
pub struct BasicPathDenied {
    pub path: String,
    pub basic_path: String,
}

impl std::fmt::Display for BasicPathDenied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "path {} is outside the key's basic path {}",
            self.path, self.basic_path
        )
    }
}

impl std::error::Error for BasicPathDenied {}

/// A directory password guards this path and no valid path token was
/// presented.
#[derive(Debug)]
pub struct PasswordRequired {
    /// Prefix that carries the password (tokens are scoped to it).
    pub source_path: String,
}

impl std::fmt::Display for PasswordRequired {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "directory password required for {}", self.source_path)
    }
}

impl std::error::Error for PasswordRequired {}

/// Search was scoped to a mount whose index is not ready.
#[derive(Debug)]
pub struct IndexNotReady {
    pub mount_id: String,
    pub status: String,
}

impl std::fmt::Display for IndexNotReady {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "index for mount {} is {}; rebuild or wait",
            self.mount_id, self.status
        )
    }
}

impl std::error::Error for IndexNotReady {}
