//! Directory-password path tokens and hide-pattern filtering.

use base64::Engine as _;
use hmac::{Hmac, Mac as _};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_PATH_TOKEN_TTL_SECS: i64 = 24 * 3600;

/// Issues and verifies HMAC-signed directory-password tokens. A token is
/// bound to the path prefix that carries the password and covers the whole
/// subtree under it.
pub struct PathTokenSigner {
    secret: Vec<u8>,
}

impl PathTokenSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn mac(&self, prefix: &str, expires_at: i64) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(prefix.as_bytes());
        mac.update(b"\n");
        mac.update(expires_at.to_string().as_bytes());
        mac
    }

    pub fn issue(&self, prefix: &str, ttl_secs: i64) -> String {
        let expires_at = time::OffsetDateTime::now_utc().unix_timestamp() + ttl_secs.max(1);
        let sig = self.mac(prefix, expires_at).finalize().into_bytes();
        let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        format!(
            "{expires_at}.{}.{}",
            b64.encode(prefix.as_bytes()),
            b64.encode(sig)
        )
    }

    /// Valid when unexpired, signed by us, and scoped to a prefix that
    /// covers `path`.
    pub fn verify(&self, token: &str, path: &str) -> bool {
        let mut parts = token.splitn(3, '.');
        let (Some(exp_raw), Some(prefix_b64), Some(sig_b64)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return false;
        };
        let Ok(expires_at) = exp_raw.parse::<i64>() else {
            return false;
        };
        if expires_at <= time::OffsetDateTime::now_utc().unix_timestamp() {
            return false;
        }

        let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let Ok(prefix_bytes) = b64.decode(prefix_b64) else {
            return false;
        };
        let Ok(prefix) = String::from_utf8(prefix_bytes) else {
            return false;
        };
        let Ok(sig) = b64.decode(sig_b64) else {
            return false;
        };

        if !portico_core::paths::is_within(path, &prefix) {
            return false;
        }
        // Mac::verify_slice is constant-time.
        self.mac(&prefix, expires_at).verify_slice(&sig).is_ok()
    }
}

/// Compile hide patterns, skipping (and logging) invalid ones.
pub fn compile_hide_patterns(patterns: &[String]) -> Vec<regex::Regex> {
    patterns
        .iter()
        .filter_map(|pattern| match regex::Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(error) => {
                tracing::warn!(pattern, error = %error, "invalid hide pattern; skipping");
                None
            }
        })
        .collect()
}

pub fn is_hidden(name: &str, patterns: &[regex::Regex]) -> bool {
    patterns.iter().any(|re| re.is_match(name))
}

#[cfg(test)]
mod tests {
    use super::{PathTokenSigner, compile_hide_patterns, is_hidden};

    #[test]
    fn token_covers_subtree_until_expiry() {
        let signer = PathTokenSigner::new(b"secret".to_vec());
        let token = signer.issue("/docs/private", 600);

        assert!(signer.verify(&token, "/docs/private"));
        assert!(signer.verify(&token, "/docs/private/deep/file.txt"));
        assert!(!signer.verify(&token, "/docs/other"));
        assert!(!signer.verify(&token, "/docs/privateX"));
    }

    #[test]
    fn tampered_tokens_fail() {
        let signer = PathTokenSigner::new(b"secret".to_vec());
        let token = signer.issue("/p", 600);
        let mut forged = token.clone();
        forged.push('x');
        assert!(!signer.verify(&forged, "/p"));

        let other = PathTokenSigner::new(b"other-secret".to_vec());
        assert!(!other.verify(&token, "/p"));
    }

    #[test]
    fn expired_tokens_fail() {
        let signer = PathTokenSigner::new(b"secret".to_vec());
        // ttl clamps to at least 1s; forge an already-expired token instead.
        let token = signer.issue("/p", 1);
        let parts: Vec<&str> = token.splitn(3, '.').collect();
        let stale = format!("1.{}.{}", parts[1], parts[2]);
        assert!(!signer.verify(&stale, "/p"));
    }

    #[test]
    fn hide_patterns_are_regexes_on_names() {
        let patterns = compile_hide_patterns(&[
            r"^\..*".to_string(),
            r"\.tmp$".to_string(),
            "(((".to_string(), // invalid, skipped
        ]);
        assert_eq!(patterns.len(), 2);
        assert!(is_hidden(".git", &patterns));
        assert!(is_hidden("work.tmp", &patterns));
        assert!(!is_hidden("visible.txt", &patterns));
    }
}
