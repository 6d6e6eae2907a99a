use portico_core::{paths, permissions};
use portico_driver_api::DriverError;

use crate::errors::BasicPathDenied;

/// Authenticated identity attached to a request by the auth middleware.
#[derive(Debug, Clone)]
pub enum Viewer {
    Admin { admin_id: String },
    ApiKey(ApiKeyIdentity),
}

#[derive(Debug, Clone)]
pub struct ApiKeyIdentity {
    pub id: String,
    pub name: String,
    pub permissions: u32,
    pub basic_path: String,
    pub is_guest: bool,
    /// Empty set means "all storage configs".
    pub storage_acl: Vec<String>,
}

impl Viewer {
    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin { .. })
    }

    /// Stable identifier used for job ownership and cache scoping.
    pub fn scope_key(&self) -> String {
        match self {
            Self::Admin { admin_id } => format!("admin:{admin_id}"),
            Self::ApiKey(key) => format!("key:{}:{}", key.id, key.basic_path),
        }
    }

    pub fn owner_id(&self) -> String {
        match self {
            Self::Admin { admin_id } => format!("admin:{admin_id}"),
            Self::ApiKey(key) => format!("key:{}", key.id),
        }
    }

    pub fn require_permission(&self, required: u32) -> Result<(), anyhow::Error> {
        match self {
            Self::Admin { .. } => Ok(()),
            Self::ApiKey(key) => {
                if permissions::has(key.permissions, required) {
                    Ok(())
                } else {
                    Err(DriverError::permission_denied("missing permission").into())
                }
            }
        }
    }

    /// Basic-path sandbox: the request path must equal the key's basic path
    /// or live under it.
    pub fn check_path(&self, path: &str) -> Result<(), anyhow::Error> {
        match self {
            Self::Admin { .. } => Ok(()),
            Self::ApiKey(key) => {
                if paths::is_within(path, &key.basic_path) {
                    Ok(())
                } else {
                    Err(BasicPathDenied {
                        path: path.to_string(),
                        basic_path: key.basic_path.clone(),
                    }
                    .into())
                }
            }
        }
    }

    /// Whether this viewer may use the given storage config at all.
    pub fn allows_storage(&self, storage_config_id: &str) -> bool {
        match self {
            Self::Admin { .. } => true,
            Self::ApiKey(key) => {
                key.storage_acl.is_empty()
                    || key.storage_acl.iter().any(|id| id == storage_config_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use portico_core::permissions;

    use super::{ApiKeyIdentity, Viewer};

    fn key_viewer(basic_path: &str, perms: u32) -> Viewer {
        Viewer::ApiKey(ApiKeyIdentity {
            id: "k1".to_string(),
            name: "test".to_string(),
            permissions: perms,
            basic_path: basic_path.to_string(),
            is_guest: false,
            storage_acl: Vec::new(),
        })
    }

    #[test]
    fn basic_path_sandbox() {
        let viewer = key_viewer("/public", permissions::MOUNT_VIEW);
        assert!(viewer.check_path("/public").is_ok());
        assert!(viewer.check_path("/public/docs").is_ok());
        assert!(viewer.check_path("/private").is_err());
        assert!(viewer.check_path("/publicX").is_err());
    }

    #[test]
    fn admin_bypasses_everything() {
        let admin = Viewer::Admin {
            admin_id: "a".to_string(),
        };
        assert!(admin.check_path("/anything").is_ok());
        assert!(admin.require_permission(permissions::MOUNT_DELETE).is_ok());
        assert!(admin.allows_storage("whatever"));
    }

    #[test]
    fn permission_bits_gate_keys() {
        let viewer = key_viewer("/", permissions::MOUNT_VIEW);
        assert!(viewer.require_permission(permissions::MOUNT_VIEW).is_ok());
        assert!(viewer.require_permission(permissions::MOUNT_UPLOAD).is_err());
    }

    #[test]
    fn storage_acl_empty_means_all() {
        let mut viewer = match key_viewer("/", 0) {
            Viewer::ApiKey(k) => k,
            _ => unreachable!(),
        };
        assert!(Viewer::ApiKey(viewer.clone()).allows_storage("cfg1"));
        viewer.storage_acl = vec!["cfg1".to_string()];
        let viewer = Viewer::ApiKey(viewer);
        assert!(viewer.allows_storage("cfg1"));
        assert!(!viewer.allows_storage("cfg2"));
    }
}
