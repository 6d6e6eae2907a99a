//! Resolves storage configurations to cached driver instances.
//!
//! The registry is the only place that knows which `storage_type` maps to
//! which concrete driver. Instances are cached per `(config id, version)`
//! so a config update transparently rebuilds the driver; the registry never
//! holds request-scoped state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Deserialize;

use portico_driver_api::{Capabilities, Driver, DriverError};
use portico_drivers::{
    GraphDriver, HfLfsDriver, LocalDriver, MemoryDriver, S3Driver, WebdavDriver,
    graph::GraphConfig, hflfs::HfLfsConfig, s3::S3Config, webdav::WebdavConfig,
};

pub const STORAGE_TYPES: &[&str] = &["local", "memory", "s3", "webdav", "onedrive", "huggingface"];

/// Decrypted storage configuration as the registry needs it.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub id: String,
    pub storage_type: String,
    /// Connection parameters, credentials already decrypted in.
    pub settings: serde_json::Value,
    /// Monotonic version (the config row's `updated_at`); bumping it evicts
    /// the cached instance.
    pub version: i64,
}

#[derive(Debug, Deserialize)]
struct LocalSettings {
    root: std::path::PathBuf,
}

#[derive(Default)]
pub struct DriverRegistry {
    cache: Mutex<HashMap<String, (i64, Arc<dyn Driver>)>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, config: &DriverConfig) -> Result<Arc<dyn Driver>, DriverError> {
        {
            let cache = self.lock();
            if let Some((version, driver)) = cache.get(&config.id)
                && *version == config.version
            {
                return Ok(driver.clone());
            }
        }

        let driver = build_driver(&config.storage_type, config.settings.clone())?;
        let mut cache = self.lock();
        cache.insert(config.id.clone(), (config.version, driver.clone()));
        Ok(driver)
    }

    pub fn evict(&self, config_id: &str) {
        self.lock().remove(config_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (i64, Arc<dyn Driver>)>> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn build_driver(
    storage_type: &str,
    settings: serde_json::Value,
) -> Result<Arc<dyn Driver>, DriverError> {
    match storage_type {
        "local" => {
            let settings: LocalSettings = parse_settings(settings)?;
            Ok(Arc::new(LocalDriver::new(settings.root)))
        }
        "memory" => Ok(Arc::new(MemoryDriver::new())),
        "s3" => {
            let settings: S3Config = parse_settings(settings)?;
            Ok(Arc::new(S3Driver::new(settings)?))
        }
        "webdav" => {
            let settings: WebdavConfig = parse_settings(settings)?;
            Ok(Arc::new(WebdavDriver::new(settings)?))
        }
        "onedrive" => {
            let settings: GraphConfig = parse_settings(settings)?;
            Ok(Arc::new(GraphDriver::new(settings)?))
        }
        "huggingface" => {
            let settings: HfLfsConfig = parse_settings(settings)?;
            Ok(Arc::new(HfLfsDriver::new(settings)?))
        }
        other => Err(DriverError::invalid_input(format!(
            "unknown storage type: {other}"
        ))),
    }
}

fn parse_settings<T: serde::de::DeserializeOwned>(
    settings: serde_json::Value,
) -> Result<T, DriverError> {
    serde_json::from_value(settings)
        .map_err(|e| DriverError::invalid_input(format!("invalid storage settings: {e}")))
}

/// Capability descriptor for a storage type, built from a representative
/// default configuration. Per-config fields (public domains, TTLs) show
/// their defaults.
pub fn type_capabilities(storage_type: &str) -> Option<Capabilities> {
    let driver: Arc<dyn Driver> = match storage_type {
        "local" => Arc::new(LocalDriver::new("/")),
        "memory" => Arc::new(MemoryDriver::new()),
        "s3" => Arc::new(
            S3Driver::new(S3Config {
                endpoint: "https://s3.example.com".to_string(),
                region: "us-east-1".to_string(),
                bucket: "bucket".to_string(),
                access_key_id: String::new(),
                secret_access_key: String::new(),
                public_domain: None,
                presign_ttl_sec: 3600,
            })
            .ok()?,
        ),
        "webdav" => Arc::new(
            WebdavDriver::new(WebdavConfig {
                base_url: "https://dav.example.com/".to_string(),
                username: String::new(),
                password: String::new(),
            })
            .ok()?,
        ),
        "onedrive" => Arc::new(
            GraphDriver::new(GraphConfig {
                base_url: "https://graph.microsoft.com/v1.0/me/drive".to_string(),
                access_token: String::new(),
            })
            .ok()?,
        ),
        "huggingface" => Arc::new(
            HfLfsDriver::new(HfLfsConfig {
                base_url: "https://huggingface.co/api/datasets/org/name".to_string(),
                token: String::new(),
                url_ttl_sec: 3600,
            })
            .ok()?,
        ),
        _ => return None,
    };
    Some(driver.capabilities().clone())
}

#[cfg(test)]
mod tests {
    use super::{DriverConfig, DriverRegistry, STORAGE_TYPES, type_capabilities};

    #[tokio::test]
    async fn resolve_caches_until_version_changes() {
        let registry = DriverRegistry::new();
        let mut config = DriverConfig {
            id: "cfg1".to_string(),
            storage_type: "memory".to_string(),
            settings: serde_json::json!({}),
            version: 1,
        };

        let a = registry.resolve(&config).unwrap();
        let b = registry.resolve(&config).unwrap();
        assert!(std::sync::Arc::ptr_eq(&a, &b));

        config.version = 2;
        let c = registry.resolve(&config).unwrap();
        assert!(!std::sync::Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn every_known_type_has_capabilities() {
        for storage_type in STORAGE_TYPES {
            let caps = type_capabilities(storage_type)
                .unwrap_or_else(|| panic!("missing capabilities for {storage_type}"));
            assert_eq!(caps.storage_type, *storage_type);
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let registry = DriverRegistry::new();
        let err = registry
            .resolve(&DriverConfig {
                id: "x".to_string(),
                storage_type: "ftp".to_string(),
                settings: serde_json::json!({}),
                version: 1,
            })
            .unwrap_err();
        assert_eq!(err.kind(), portico_driver_api::ErrorKind::InvalidInput);
    }
}
