use std::net::SocketAddr;
use std::path::PathBuf;

pub mod data_dir;

/// Resolved runtime configuration for the gateway.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub data_dir: PathBuf,
    /// Bootstraps the first admin account when no admin exists yet.
    pub admin_init_password: Option<String>,
    /// Per-install key for signed `/api/p/*` URLs and path tokens.
    pub sign_secret: String,
    /// Key for short-lived url-proxy tickets.
    pub ticket_secret: String,
    pub cache_ttl_default_secs: i64,
    pub upload_session_timeout_secs: u64,
    pub debug_errors: bool,
}
