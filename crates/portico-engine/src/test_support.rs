//! Shared fixtures for engine tests.

use std::sync::Arc;

use portico_storage::mounts_repo::{self, NewMount, WebdavPolicy};
use portico_storage::{SecretsCrypto, db, storage_configs_repo};
use portico_vfs::FsService;
use portico_vfs::cache::DirectoryCache;
use portico_vfs::link::UrlSigner;
use portico_vfs::meta::PathTokenSigner;

/// An FsService over a fresh in-memory database with one memory-backed
/// mount at `mount_path`.
pub(crate) async fn fs_with_memory_mount(mount_path: &str) -> (FsService, tempfile::TempDir) {
    let tmp = tempfile::TempDir::new().unwrap();
    let pool = db::init_in_memory().await.unwrap();
    let config = storage_configs_repo::create(
        &pool,
        "mem",
        "memory",
        None,
        serde_json::json!({}),
        String::new(),
        "",
        false,
        None,
    )
    .await
    .unwrap();
    mounts_repo::create(
        &pool,
        NewMount {
            name: "mem".to_string(),
            mount_path: mount_path.to_string(),
            storage_config_id: config.id,
            is_active: true,
            sort_order: 0,
            cache_ttl_seconds: 300,
            web_proxy: false,
            webdav_policy: WebdavPolicy::Redirect302,
            enable_sign: false,
            sign_expires_sec: None,
        },
    )
    .await
    .unwrap();

    let fs = FsService::new(
        pool,
        Arc::new(portico_driver_registry::DriverRegistry::new()),
        Arc::new(SecretsCrypto::load_or_create(tmp.path()).unwrap()),
        Arc::new(DirectoryCache::new()),
        Arc::new(PathTokenSigner::new(b"token-secret".to_vec())),
        Arc::new(UrlSigner::new(b"sign-secret".to_vec())),
    );
    (fs, tmp)
}
