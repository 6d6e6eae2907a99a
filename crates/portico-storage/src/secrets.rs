//! Credentials-at-rest encryption.
//!
//! A single 32-byte master key lives in `master.key` next to the database;
//! storage credentials are sealed with XChaCha20-Poly1305 under a key
//! derived via HKDF-SHA256, with the owning storage config id as AAD so a
//! blob cannot be replayed onto another config row.

use std::io;
use std::path::Path;

use base64::Engine as _;
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

const MASTER_KEY_FILE: &str = "master.key";
const KEY_VERSION: u32 = 1;
const HKDF_INFO: &[u8] = b"portico/storage-credentials/v1";

#[derive(Debug, Serialize, Deserialize)]
struct MasterKeyFile {
    version: u32,
    key_b64: String,
    created_at: i64,
}

#[derive(Debug, Clone)]
pub struct SecretsCrypto {
    key: [u8; 32],
}

impl SecretsCrypto {
    pub fn load_or_create(data_dir: &Path) -> Result<Self, anyhow::Error> {
        let path = data_dir.join(MASTER_KEY_FILE);
        if path.exists() {
            let bytes = std::fs::read(&path)?;
            let file: MasterKeyFile = serde_json::from_slice(&bytes)?;
            if file.version != KEY_VERSION {
                return Err(io::Error::other("unsupported master.key version").into());
            }
            return Ok(Self {
                key: decode_key(&file.key_b64)?,
            });
        }

        let mut key = [0_u8; 32];
        rand::rng().fill_bytes(&mut key);
        let file = MasterKeyFile {
            version: KEY_VERSION,
            key_b64: base64::engine::general_purpose::STANDARD.encode(key),
            created_at: time::OffsetDateTime::now_utc().unix_timestamp(),
        };

        let bytes = serde_json::to_vec_pretty(&file)?;
        let tmp = path.with_extension("key.tmp");
        std::fs::write(&tmp, bytes)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(tmp, path)?;

        Ok(Self { key })
    }

    fn cipher(&self) -> Result<XChaCha20Poly1305, anyhow::Error> {
        let hk = Hkdf::<Sha256>::new(None, &self.key);
        let mut derived = [0_u8; 32];
        hk.expand(HKDF_INFO, &mut derived)
            .map_err(|_| io::Error::other("hkdf expand failed"))?;
        Ok(XChaCha20Poly1305::new((&derived).into()))
    }

    /// Seal a credentials payload for the given storage config.
    /// Output format: `v1:{nonce_b64}:{ciphertext_b64}`.
    pub fn encrypt(&self, config_id: &str, plaintext: &[u8]) -> Result<String, anyhow::Error> {
        let cipher = self.cipher()?;
        let mut nonce = [0_u8; 24];
        rand::rng().fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: config_id.as_bytes(),
                },
            )
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        let b64 = base64::engine::general_purpose::STANDARD;
        Ok(format!(
            "v1:{}:{}",
            b64.encode(nonce),
            b64.encode(ciphertext)
        ))
    }

    pub fn decrypt(&self, config_id: &str, sealed: &str) -> Result<Vec<u8>, anyhow::Error> {
        let mut parts = sealed.splitn(3, ':');
        let (version, nonce_b64, ct_b64) = match (parts.next(), parts.next(), parts.next()) {
            (Some(v), Some(n), Some(c)) => (v, n, c),
            _ => return Err(io::Error::other("malformed sealed credentials").into()),
        };
        if version != "v1" {
            return Err(io::Error::other("unsupported sealed credentials version").into());
        }

        let b64 = base64::engine::general_purpose::STANDARD;
        let nonce = b64.decode(nonce_b64)?;
        let ciphertext = b64.decode(ct_b64)?;
        if nonce.len() != 24 {
            return Err(io::Error::other("bad nonce length").into());
        }

        let cipher = self.cipher()?;
        cipher
            .decrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext.as_slice(),
                    aad: config_id.as_bytes(),
                },
            )
            .map_err(|_| anyhow::anyhow!("credential decryption failed"))
    }
}

fn decode_key(b64: &str) -> Result<[u8; 32], anyhow::Error> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(b64)?;
    let key: [u8; 32] = bytes
        .try_into()
        .map_err(|_| io::Error::other("master key must be 32 bytes"))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::SecretsCrypto;

    #[test]
    fn round_trip_and_aad_binding() {
        let temp = TempDir::new().unwrap();
        let crypto = SecretsCrypto::load_or_create(temp.path()).unwrap();

        let sealed = crypto.encrypt("cfg1", b"{\"token\":\"x\"}").unwrap();
        assert!(sealed.starts_with("v1:"));
        assert_eq!(crypto.decrypt("cfg1", &sealed).unwrap(), b"{\"token\":\"x\"}");

        // Bound to the config id; another id must fail.
        assert!(crypto.decrypt("cfg2", &sealed).is_err());
    }

    #[test]
    fn key_file_survives_reload() {
        let temp = TempDir::new().unwrap();
        let first = SecretsCrypto::load_or_create(temp.path()).unwrap();
        let sealed = first.encrypt("cfg1", b"secret").unwrap();

        let second = SecretsCrypto::load_or_create(temp.path()).unwrap();
        assert_eq!(second.decrypt("cfg1", &sealed).unwrap(), b"secret");
    }
}
