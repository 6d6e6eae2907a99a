use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use portico_config::{Config, data_dir};

#[derive(Debug, Parser)]
#[command(name = "portico", version, about = "Self-hosted multi-backend storage gateway")]
pub struct Cli {
    /// Listen address.
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:8080")]
    pub bind: SocketAddr,

    /// Data directory (database, master key, logs).
    #[arg(long, env = "PORTICO_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Password for the initial admin account (`admin`). Only used when no
    /// admin exists yet.
    #[arg(long, env = "ADMIN_INIT_PASSWORD")]
    pub admin_init_password: Option<String>,

    /// Per-install key for signed proxy URLs and path tokens. Generated and
    /// persisted in the data dir when absent.
    #[arg(long, env = "SIGN_SECRET")]
    pub sign_secret: Option<String>,

    /// Key for short-lived url-proxy tickets. Defaults to the sign secret.
    #[arg(long, env = "TICKET_SECRET")]
    pub ticket_secret: Option<String>,

    /// Default directory-listing cache TTL in seconds.
    #[arg(long, env = "CACHE_TTL_DEFAULT", default_value_t = 300)]
    pub cache_ttl_default: i64,

    /// Idle timeout for multipart upload sessions, in seconds.
    #[arg(long, env = "UPLOAD_SESSION_TIMEOUT", default_value_t = 3600)]
    pub upload_session_timeout: u64,

    /// tracing filter, e.g. `info,tower_http=warn`.
    #[arg(long, env = "PORTICO_LOG")]
    pub log: Option<String>,

    /// Also log to a rolling file in the data dir.
    #[arg(long, default_value_t = false)]
    pub log_file: bool,

    /// Include error chains in 500 responses (development only).
    #[arg(long, default_value_t = false)]
    pub debug_errors: bool,
}

impl Cli {
    pub fn into_config(self) -> Result<PorticoConfig, anyhow::Error> {
        if self.cache_ttl_default < 0 {
            anyhow::bail!("cache TTL must be non-negative");
        }
        if self.upload_session_timeout == 0 {
            anyhow::bail!("upload session timeout must be positive");
        }

        let data_dir = data_dir::resolve(self.data_dir)?;
        let sign_secret = match self.sign_secret {
            Some(secret) if !secret.trim().is_empty() => secret,
            _ => load_or_create_secret(&data_dir)?,
        };
        let ticket_secret = self
            .ticket_secret
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| sign_secret.clone());

        Ok(PorticoConfig {
            config: Config {
                bind: self.bind,
                data_dir,
                admin_init_password: self.admin_init_password,
                sign_secret,
                ticket_secret,
                cache_ttl_default_secs: self.cache_ttl_default,
                upload_session_timeout_secs: self.upload_session_timeout,
                debug_errors: self.debug_errors,
            },
            log: self.log,
            log_file: self.log_file,
        })
    }
}

/// Resolved config plus the logging knobs the binary keeps to itself.
pub struct PorticoConfig {
    pub config: Config,
    pub log: Option<String>,
    pub log_file: bool,
}

fn load_or_create_secret(data_dir: &std::path::Path) -> Result<String, anyhow::Error> {
    use rand::RngCore as _;

    let path = data_dir.join("sign.secret");
    if path.exists() {
        let secret = std::fs::read_to_string(&path)?.trim().to_string();
        if !secret.is_empty() {
            return Ok(secret);
        }
    }

    let mut bytes = [0_u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    let mut secret = String::with_capacity(64);
    for b in bytes {
        secret.push_str(&format!("{b:02x}"));
    }

    std::fs::write(&path, &secret)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use clap::Parser as _;

    use super::Cli;

    #[test]
    fn defaults_parse() {
        let cli = Cli::parse_from(["portico"]);
        assert_eq!(cli.bind.port(), 8080);
        assert_eq!(cli.cache_ttl_default, 300);
        assert_eq!(cli.upload_session_timeout, 3600);
    }

    #[test]
    fn zero_session_timeout_is_rejected() {
        let temp = tempfile::TempDir::new().unwrap();
        let cli = Cli::parse_from([
            "portico",
            "--data-dir",
            temp.path().to_str().unwrap(),
            "--upload-session-timeout",
            "0",
        ]);
        assert!(cli.into_config().is_err());
    }

    #[test]
    fn sign_secret_is_persisted_between_runs(){
        let temp = tempfile::TempDir::new().unwrap();
        let args = [
            "portico",
            "--data-dir",
            temp.path().to_str().unwrap(),
        ];
        let first = Cli::parse_from(args).into_config().unwrap();
        let second = Cli::parse_from(args).into_config().unwrap();
        assert_eq!(first.config.sign_secret, second.config.sign_secret);
        assert_eq!(first.config.sign_secret.len(), 64);
    }
}
