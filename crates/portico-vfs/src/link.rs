//! Link-type decisions and HMAC-signed proxy paths.

use base64::Engine as _;
use hmac::{Hmac, Mac as _};
use serde::Serialize;
use sha2::Sha256;

use portico_driver_api::Capabilities;
use portico_storage::mounts_repo::Mount;

type HmacSha256 = Hmac<Sha256>;

/// How a client should fetch content: straight from the backend, through
/// the ticketed URL proxy, or same-origin through the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Direct,
    UrlProxy,
    Proxy,
}

impl LinkType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::UrlProxy => "url_proxy",
            Self::Proxy => "proxy",
        }
    }
}

/// Decide the link type for an entry on `mount`.
///
/// A mount with `web_proxy` always proxies. Otherwise a native public URL
/// wins; remote backends without one go through the ticketed URL proxy and
/// local backends are served same-origin.
pub fn decide(mount: &Mount, caps: &Capabilities, has_public_url: bool) -> LinkType {
    if mount.web_proxy {
        return LinkType::Proxy;
    }
    if has_public_url {
        return LinkType::Direct;
    }
    if caps.remote {
        LinkType::UrlProxy
    } else {
        LinkType::Proxy
    }
}

/// Signs `/api/p/*` paths with the per-install key. The signature covers
/// `(method, path, exp)`.
pub struct UrlSigner {
    secret: Vec<u8>,
}

impl UrlSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn mac(&self, method: &str, path: &str, expires_at: i64) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(method.as_bytes());
        mac.update(b"\n");
        mac.update(path.as_bytes());
        mac.update(b"\n");
        mac.update(expires_at.to_string().as_bytes());
        mac
    }

    pub fn sign(&self, method: &str, path: &str, expires_at: i64) -> String {
        let sig = self.mac(method, path, expires_at).finalize().into_bytes();
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(sig)
    }

    /// Constant-time verification; also rejects expired timestamps.
    pub fn verify(&self, method: &str, path: &str, expires_at: i64, sig: &str) -> bool {
        if expires_at <= time::OffsetDateTime::now_utc().unix_timestamp() {
            return false;
        }
        let Ok(sig) = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(sig) else {
            return false;
        };
        self.mac(method, path, expires_at).verify_slice(&sig).is_ok()
    }

    /// Build a signed same-origin proxy path for a logical path.
    pub fn signed_proxy_path(&self, path: &str, expires_in_secs: i64) -> String {
        let expires_at = time::OffsetDateTime::now_utc().unix_timestamp() + expires_in_secs.max(1);
        let sig = self.sign("GET", path, expires_at);
        format!("/api/p{path}?sign={sig}&exp={expires_at}")
    }
}

#[cfg(test)]
mod tests {
    use portico_storage::mounts_repo::{Mount, WebdavPolicy};

    use super::{LinkType, UrlSigner, decide};

    fn mount(web_proxy: bool) -> Mount {
        Mount {
            id: "m".to_string(),
            name: "m".to_string(),
            mount_path: "/m".to_string(),
            storage_config_id: "c".to_string(),
            is_active: true,
            sort_order: 0,
            cache_ttl_seconds: 300,
            web_proxy,
            webdav_policy: WebdavPolicy::Redirect302,
            enable_sign: false,
            sign_expires_sec: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn caps(remote: bool) -> portico_driver_api::Capabilities {
        portico_driver_api::Capabilities {
            storage_type: "test",
            remote,
            fs: Default::default(),
            share: Default::default(),
            multipart: None,
            sha256_required_for_presign: false,
        }
    }

    #[test]
    fn decision_table() {
        // web_proxy wins over everything.
        assert_eq!(decide(&mount(true), &caps(true), true), LinkType::Proxy);
        // Native URL -> direct.
        assert_eq!(decide(&mount(false), &caps(true), true), LinkType::Direct);
        // Remote without URL -> ticketed proxy.
        assert_eq!(decide(&mount(false), &caps(true), false), LinkType::UrlProxy);
        // Local backend -> same-origin.
        assert_eq!(decide(&mount(false), &caps(false), false), LinkType::Proxy);
    }

    #[test]
    fn signed_paths_verify_and_expire() {
        let signer = UrlSigner::new(b"install-key".to_vec());
        let now = time::OffsetDateTime::now_utc().unix_timestamp();

        let sig = signer.sign("GET", "/m/file.bin", now + 60);
        assert!(signer.verify("GET", "/m/file.bin", now + 60, &sig));
        assert!(!signer.verify("GET", "/m/other.bin", now + 60, &sig));
        assert!(!signer.verify("PUT", "/m/file.bin", now + 60, &sig));
        assert!(!signer.verify("GET", "/m/file.bin", now - 1, &sig));
    }

    #[test]
    fn signed_proxy_path_shape() {
        let signer = UrlSigner::new(b"k".to_vec());
        let url = signer.signed_proxy_path("/m/a.txt", 300);
        assert!(url.starts_with("/api/p/m/a.txt?sign="));
        assert!(url.contains("&exp="));
    }
}
