//! Longest-prefix resolution of logical paths onto mounts.
//!
//! Mount paths are compared byte-wise after syntactic normalization; no
//! Unicode normalization or case folding is applied.

use portico_core::paths;
use portico_storage::mounts_repo::Mount;

use crate::viewer::Viewer;

/// Find the active mount whose `mount_path` is the longest prefix of
/// `path`, plus the mount-relative remainder (no leading slash).
pub fn resolve<'a>(mounts: &'a [Mount], path: &str) -> Option<(&'a Mount, String)> {
    let mut best: Option<(&Mount, String)> = None;
    for mount in mounts.iter().filter(|m| m.is_active) {
        if !paths::is_within(path, &mount.mount_path) {
            continue;
        }
        let relative = paths::strip_mount_prefix(path, &mount.mount_path)?;
        let better = match &best {
            Some((current, _)) => mount.mount_path.len() > current.mount_path.len(),
            None => true,
        };
        if better {
            best = Some((mount, relative.to_string()));
        }
    }
    best
}

/// Mounts this viewer may see: inside the basic path, and with the key's
/// storage ACL (when present) covering the mount's storage config.
pub fn visible_mounts<'a>(mounts: &'a [Mount], viewer: &Viewer) -> Vec<&'a Mount> {
    mounts
        .iter()
        .filter(|m| m.is_active)
        .filter(|m| match viewer {
            Viewer::Admin { .. } => true,
            Viewer::ApiKey(key) => {
                let inside = paths::is_within(&m.mount_path, &key.basic_path)
                    || paths::is_within(&key.basic_path, &m.mount_path);
                inside && viewer.allows_storage(&m.storage_config_id)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use portico_storage::mounts_repo::{Mount, WebdavPolicy};

    use crate::viewer::{ApiKeyIdentity, Viewer};

    use super::{resolve, visible_mounts};

    fn mount(id: &str, path: &str, config: &str) -> Mount {
        Mount {
            id: id.to_string(),
            name: id.to_string(),
            mount_path: path.to_string(),
            storage_config_id: config.to_string(),
            is_active: true,
            sort_order: 0,
            cache_ttl_seconds: 300,
            web_proxy: false,
            webdav_policy: WebdavPolicy::Redirect302,
            enable_sign: false,
            sign_expires_sec: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let mounts = vec![
            mount("root", "/", "c0"),
            mount("data", "/data", "c1"),
            mount("deep", "/data/media", "c2"),
        ];

        let (m, rel) = resolve(&mounts, "/data/media/movie.mkv").unwrap();
        assert_eq!(m.id, "deep");
        assert_eq!(rel, "movie.mkv");

        let (m, rel) = resolve(&mounts, "/data/other.txt").unwrap();
        assert_eq!(m.id, "data");
        assert_eq!(rel, "other.txt");

        let (m, rel) = resolve(&mounts, "/elsewhere").unwrap();
        assert_eq!(m.id, "root");
        assert_eq!(rel, "elsewhere");
    }

    #[test]
    fn prefix_requires_segment_boundary() {
        let mounts = vec![mount("data", "/data", "c1")];
        assert!(resolve(&mounts, "/database").is_none());
        let (_, rel) = resolve(&mounts, "/data").unwrap();
        assert_eq!(rel, "");
    }

    #[test]
    fn inactive_mounts_are_skipped() {
        let mut m = mount("data", "/data", "c1");
        m.is_active = false;
        assert!(resolve(&[m], "/data/x").is_none());
    }

    #[test]
    fn resolved_path_always_begins_with_mount_path() {
        let mounts = vec![
            mount("a", "/a", "c1"),
            mount("ab", "/a/b", "c2"),
            mount("root", "/", "c3"),
        ];
        for path in ["/a", "/a/x", "/a/b/c", "/z/q"] {
            let (m, _) = resolve(&mounts, path).unwrap();
            assert!(portico_core::paths::is_within(path, &m.mount_path));
        }
    }

    #[test]
    fn visibility_honors_basic_path_and_acl() {
        let mounts = vec![mount("pub", "/public", "c1"), mount("priv", "/private", "c2")];
        let viewer = Viewer::ApiKey(ApiKeyIdentity {
            id: "k".to_string(),
            name: "k".to_string(),
            permissions: 0,
            basic_path: "/public".to_string(),
            is_guest: false,
            storage_acl: vec!["c1".to_string()],
        });

        let visible = visible_mounts(&mounts, &viewer);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, "pub");

        let admin = Viewer::Admin {
            admin_id: "a".to_string(),
        };
        assert_eq!(visible_mounts(&mounts, &admin).len(), 2);
    }
}
