//! The FS service: every path-addressed operation the HTTP and WebDAV
//! layers expose, composed from the router, registry, cache, metadata and
//! dirty queue.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;

use portico_core::{FileKind, paths, permissions};
use portico_driver_api::{
    ByteRange, ByteStream, Driver, DriverError, Entry, ListOptions, ReadHandle, WriteResult,
};
use portico_driver_registry::{DriverConfig, DriverRegistry};
use portico_storage::mounts_repo::{self, Mount};
use portico_storage::storage_configs_repo::{self, StorageConfig};
use portico_storage::{SecretsCrypto, fs_meta_repo, index_repo};

use crate::cache::{DirectoryCache, ListingKey};
use crate::errors::PasswordRequired;
use crate::link::{self, LinkType, UrlSigner};
use crate::meta::{self, PathTokenSigner};
use crate::router;
use crate::viewer::Viewer;

pub struct FsService {
    db: SqlitePool,
    registry: Arc<DriverRegistry>,
    secrets: Arc<SecretsCrypto>,
    pub cache: Arc<DirectoryCache>,
    pub path_tokens: Arc<PathTokenSigner>,
    pub url_signer: Arc<UrlSigner>,
}

/// A logical path resolved onto a concrete mount, storage config and
/// driver. `key` is the full backend storage key (default folder applied).
pub struct Resolved {
    pub path: String,
    pub mount: Mount,
    pub config: StorageConfig,
    pub driver: Arc<dyn Driver>,
    pub key: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsEntry {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub is_directory: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub kind: i64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsListing {
    pub path: String,
    pub entries: Vec<FsEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_markdown: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer_markdown: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FsEntryDetail {
    #[serde(flatten)]
    pub entry: FsEntry,
    pub link_type: LinkType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// Outcome of a download request; the HTTP layer turns this into a 302 or
/// a streamed body.
pub enum Download {
    Redirect(String),
    Stream(ReadHandle),
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathResult {
    pub path: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FsService {
    pub fn new(
        db: SqlitePool,
        registry: Arc<DriverRegistry>,
        secrets: Arc<SecretsCrypto>,
        cache: Arc<DirectoryCache>,
        path_tokens: Arc<PathTokenSigner>,
        url_signer: Arc<UrlSigner>,
    ) -> Self {
        Self {
            db,
            registry,
            secrets,
            cache,
            path_tokens,
            url_signer,
        }
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn registry(&self) -> &Arc<DriverRegistry> {
        &self.registry
    }

    /// Seal a credentials payload for storage in the config row.
    pub fn seal_credentials(
        &self,
        config_id: &str,
        credentials: &serde_json::Value,
    ) -> Result<String, anyhow::Error> {
        self.secrets
            .encrypt(config_id, &serde_json::to_vec(credentials)?)
    }

    /// Decrypted credentials overlaid on the connection settings.
    pub fn decrypted_settings(
        &self,
        config: &StorageConfig,
    ) -> Result<serde_json::Value, anyhow::Error> {
        self.merged_settings(config)
    }

    /// Resolve a logical path: permission gate, basic-path gate, mount
    /// routing, storage ACL, driver instantiation.
    pub async fn resolve(
        &self,
        viewer: &Viewer,
        path: &str,
        required_permission: u32,
    ) -> Result<Resolved, anyhow::Error> {
        let path = paths::normalize(path).map_err(|e| DriverError::invalid_input(e.to_string()))?;
        if required_permission != 0 {
            viewer.require_permission(required_permission)?;
        }
        viewer.check_path(&path)?;

        let mounts = mounts_repo::list_active(&self.db).await?;
        let (mount, relative) = router::resolve(&mounts, &path)
            .ok_or_else(|| DriverError::not_found(format!("no mount covers {path}")))?;
        if !viewer.allows_storage(&mount.storage_config_id) {
            return Err(DriverError::permission_denied("storage not allowed for this key").into());
        }

        let config = storage_configs_repo::get(&self.db, &mount.storage_config_id)
            .await?
            .ok_or_else(|| {
                DriverError::internal(format!(
                    "mount {} references missing storage config",
                    mount.id
                ))
            })?;

        let settings = self.merged_settings(&config)?;
        let driver = self.registry.resolve(&DriverConfig {
            id: config.id.clone(),
            storage_type: config.storage_type.clone(),
            settings,
            version: config.updated_at,
        })?;
        let key = paths::storage_key(&config.default_folder, &relative);

        Ok(Resolved {
            path,
            mount: mount.clone(),
            config,
            driver,
            key,
        })
    }

    /// Decrypted credentials overlaid on the connection settings.
    fn merged_settings(&self, config: &StorageConfig) -> Result<serde_json::Value, anyhow::Error> {
        let mut settings = config.settings.clone();
        if config.credentials_enc.is_empty() {
            return Ok(settings);
        }

        let plaintext = self.secrets.decrypt(&config.id, &config.credentials_enc)?;
        let credentials: serde_json::Value = serde_json::from_slice(&plaintext)?;
        if let (Some(base), Some(overlay)) = (settings.as_object_mut(), credentials.as_object()) {
            for (k, v) in overlay {
                base.insert(k.clone(), v.clone());
            }
        }
        Ok(settings)
    }

    fn entry_to_fs(path: &str, entry: &Entry) -> FsEntry {
        let kind = if entry.is_directory {
            FileKind::Folder
        } else {
            FileKind::from_name(&entry.name)
        };
        FsEntry {
            name: entry.name.clone(),
            path: path.to_string(),
            size: entry.size,
            is_directory: entry.is_directory,
            modified_ms: entry.modified_ms,
            content_type: entry.content_type.clone(),
            kind: kind.as_i64(),
        }
    }

    /// Directory-password gate. Admins bypass; everyone else needs a valid
    /// path token scoped to the password-carrying prefix.
    async fn check_directory_password(
        &self,
        viewer: &Viewer,
        path: &str,
        path_token: Option<&str>,
    ) -> Result<(Option<String>, Option<String>, Vec<regex::Regex>), anyhow::Error> {
        let chain = fs_meta_repo::chain_for(&self.db, path).await?;
        let (effective, password_source) = fs_meta_repo::effective_meta(&chain, path);

        if let Some(source) = password_source
            && !viewer.is_admin()
        {
            let ok = path_token.is_some_and(|token| self.path_tokens.verify(token, path));
            if !ok {
                return Err(PasswordRequired {
                    source_path: source,
                }
                .into());
            }
        }

        Ok((
            effective.header_markdown,
            effective.footer_markdown,
            meta::compile_hide_patterns(&effective.hide_patterns),
        ))
    }

    pub async fn list(
        &self,
        viewer: &Viewer,
        path: &str,
        path_token: Option<&str>,
    ) -> Result<FsListing, anyhow::Error> {
        let resolved = self.resolve(viewer, path, permissions::MOUNT_VIEW).await?;
        let (header, footer, hide_patterns) = self
            .check_directory_password(viewer, &resolved.path, path_token)
            .await?;

        let cache_key = ListingKey {
            mount_id: resolved.mount.id.clone(),
            storage_key: resolved.key.clone(),
            viewer_scope: viewer.scope_key(),
        };
        if let Some(cached) = self.cache.get(&cache_key)
            && let Ok(listing) = serde_json::from_value::<FsListing>(cached)
        {
            return Ok(listing);
        }

        let listing = resolved
            .driver
            .list(&resolved.key, &ListOptions::default())
            .await?;

        let mut entries: Vec<FsEntry> = listing
            .entries
            .iter()
            .filter(|e| viewer.is_admin() || !meta::is_hidden(&e.name, &hide_patterns))
            .map(|e| Self::entry_to_fs(&paths::join(&resolved.path, &e.name), e))
            .collect();
        entries.sort_by(|a, b| {
            b.is_directory
                .cmp(&a.is_directory)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });

        let out = FsListing {
            path: resolved.path.clone(),
            entries,
            header_markdown: header,
            footer_markdown: footer,
        };
        if let Ok(value) = serde_json::to_value(&out) {
            self.cache.put(
                cache_key,
                value,
                Duration::from_secs(resolved.mount.cache_ttl_seconds.max(0) as u64),
            );
        }
        Ok(out)
    }

    pub async fn stat(&self, viewer: &Viewer, path: &str) -> Result<Option<FsEntry>, anyhow::Error> {
        let resolved = self.resolve(viewer, path, permissions::MOUNT_VIEW).await?;
        Ok(resolved
            .driver
            .stat(&resolved.key)
            .await?
            .map(|e| Self::entry_to_fs(&resolved.path, &e)))
    }

    pub async fn get(&self, viewer: &Viewer, path: &str) -> Result<FsEntryDetail, anyhow::Error> {
        let resolved = self.resolve(viewer, path, permissions::MOUNT_VIEW).await?;
        let entry = resolved
            .driver
            .stat(&resolved.key)
            .await?
            .ok_or_else(|| DriverError::not_found(format!("no such path: {path}")))?;

        let fs_entry = Self::entry_to_fs(&resolved.path, &entry);
        if entry.is_directory {
            return Ok(FsEntryDetail {
                entry: fs_entry,
                link_type: LinkType::Proxy,
                preview_url: None,
                download_url: None,
                etag: entry.etag,
            });
        }

        let public_url = resolved.driver.public_url(&resolved.key);
        let link_type = link::decide(
            &resolved.mount,
            resolved.driver.capabilities(),
            public_url.is_some(),
        );

        let (preview_url, download_url) = match (link_type, public_url) {
            (LinkType::Direct, Some(url)) => (Some(url.clone()), Some(url)),
            _ => {
                let base = self.proxy_path(&resolved);
                (Some(base.clone()), Some(format!("{base}{}download=true", sep(&base))))
            }
        };

        Ok(FsEntryDetail {
            entry: fs_entry,
            link_type,
            preview_url,
            download_url,
            etag: entry.etag,
        })
    }

    /// Same-origin proxy path, signed when the mount requires signatures.
    fn proxy_path(&self, resolved: &Resolved) -> String {
        if resolved.mount.enable_sign {
            let expires = resolved.mount.sign_expires_sec.unwrap_or(3600);
            self.url_signer.signed_proxy_path(&resolved.path, expires)
        } else {
            format!("/api/p{}", resolved.path)
        }
    }

    /// Download: 302 to an external URL when one exists, else stream.
    pub async fn download(
        &self,
        viewer: &Viewer,
        path: &str,
        range: Option<ByteRange>,
    ) -> Result<Download, anyhow::Error> {
        let resolved = self.resolve(viewer, path, permissions::MOUNT_VIEW).await?;
        if !resolved.mount.web_proxy
            && let Some(url) = resolved.driver.public_url(&resolved.key)
        {
            return Ok(Download::Redirect(url));
        }
        Ok(Download::Stream(resolved.driver.read(&resolved.key, range).await?))
    }

    /// Content: always same-origin streaming, never a redirect.
    pub async fn content(
        &self,
        viewer: &Viewer,
        path: &str,
        range: Option<ByteRange>,
    ) -> Result<ReadHandle, anyhow::Error> {
        let resolved = self.resolve(viewer, path, permissions::MOUNT_VIEW).await?;
        Ok(resolved.driver.read(&resolved.key, range).await?)
    }

    pub async fn file_link(
        &self,
        viewer: &Viewer,
        path: &str,
        expires_in_secs: Option<i64>,
        force_download: bool,
    ) -> Result<(String, LinkType), anyhow::Error> {
        let resolved = self.resolve(viewer, path, permissions::MOUNT_VIEW).await?;
        let public_url = resolved.driver.public_url(&resolved.key);
        let link_type = link::decide(
            &resolved.mount,
            resolved.driver.capabilities(),
            public_url.is_some(),
        );

        if link_type == LinkType::Direct
            && let Some(url) = public_url
        {
            return Ok((url, link_type));
        }

        let url = if resolved.mount.enable_sign {
            let expires = expires_in_secs
                .or(resolved.mount.sign_expires_sec)
                .unwrap_or(3600);
            self.url_signer.signed_proxy_path(&resolved.path, expires)
        } else {
            format!("/api/p{}", resolved.path)
        };
        let url = if force_download {
            format!("{url}{}download=true", sep(&url))
        } else {
            url
        };
        Ok((url, link_type))
    }

    /// Idempotent mkdir: an existing directory is fine, a file conflicts.
    pub async fn mkdir(&self, viewer: &Viewer, path: &str) -> Result<(), anyhow::Error> {
        let resolved = self.resolve(viewer, path, permissions::MOUNT_UPLOAD).await?;
        match resolved.driver.stat(&resolved.key).await? {
            Some(existing) if existing.is_directory => return Ok(()),
            Some(_) => {
                return Err(
                    DriverError::conflict(format!("a file exists at {path}")).into(),
                );
            }
            None => {}
        }
        resolved.driver.mkdir(&resolved.key).await?;
        self.note_write(&resolved, index_repo::DirtyOp::Upsert).await;
        Ok(())
    }

    /// Small full-overwrite textual writes.
    pub async fn update(
        &self,
        viewer: &Viewer,
        path: &str,
        content: Vec<u8>,
        content_type: &str,
    ) -> Result<WriteResult, anyhow::Error> {
        let resolved = self.resolve(viewer, path, permissions::MOUNT_UPLOAD).await?;
        let size = content.len() as u64;
        let stream: ByteStream = Box::pin(futures_util::stream::once(async move {
            Ok(bytes::Bytes::from(content))
        }));
        let result = resolved
            .driver
            .write(&resolved.key, stream, size, content_type)
            .await?;
        self.note_write(&resolved, index_repo::DirtyOp::Upsert).await;
        Ok(result)
    }

    /// Streaming write used by uploads and WebDAV PUT. The caller has
    /// already checked its own permission bit via `resolve`.
    pub async fn write_resolved(
        &self,
        resolved: &Resolved,
        body: ByteStream,
        size: u64,
        content_type: &str,
    ) -> Result<WriteResult, anyhow::Error> {
        let result = resolved
            .driver
            .write(&resolved.key, body, size, content_type)
            .await?;
        self.note_write(resolved, index_repo::DirtyOp::Upsert).await;
        Ok(result)
    }

    pub async fn rename(
        &self,
        viewer: &Viewer,
        source: &str,
        target: &str,
    ) -> Result<(), anyhow::Error> {
        let src = self.resolve(viewer, source, permissions::MOUNT_RENAME).await?;
        let dst = self.resolve(viewer, target, permissions::MOUNT_RENAME).await?;

        if src.mount.id != dst.mount.id {
            // Cross-mount rename would need a server-side copy on both
            // ends; no backend pair supports that.
            return Err(DriverError::invalid_input(
                "cross-mount rename is not supported",
            )
            .into());
        }
        src.driver.rename(&src.key, &dst.key).await?;

        self.note_remove(&src).await;
        self.note_write(&dst, index_repo::DirtyOp::Upsert).await;
        Ok(())
    }

    /// Per-path best-effort removal; failures are recorded, not raised.
    pub async fn batch_remove(
        &self,
        viewer: &Viewer,
        paths_in: &[String],
    ) -> Result<Vec<PathResult>, anyhow::Error> {
        let mut results = Vec::with_capacity(paths_in.len());
        for path in paths_in {
            let outcome = self.remove_one(viewer, path).await;
            results.push(PathResult {
                path: path.clone(),
                success: outcome.is_ok(),
                error: outcome.err().map(|e| e.to_string()),
            });
        }
        Ok(results)
    }

    async fn remove_one(&self, viewer: &Viewer, path: &str) -> Result<(), anyhow::Error> {
        let resolved = self.resolve(viewer, path, permissions::MOUNT_DELETE).await?;
        let entry = resolved
            .driver
            .stat(&resolved.key)
            .await?
            .ok_or_else(|| DriverError::not_found(format!("no such path: {path}")))?;
        resolved
            .driver
            .delete(&resolved.key, entry.is_directory)
            .await?;
        self.note_remove(&resolved).await;
        Ok(())
    }

    /// Record a completed write: invalidate cached listings and enqueue an
    /// index dirty entry. Failures here must not fail the write.
    pub async fn note_write(&self, resolved: &Resolved, op: index_repo::DirtyOp) {
        self.note_change(&resolved.mount.id, &resolved.key, op).await;
    }

    pub async fn note_remove(&self, resolved: &Resolved) {
        self.note_change(&resolved.mount.id, &resolved.key, index_repo::DirtyOp::Delete)
            .await;
    }

    /// Same, for callers that track mount id and storage key directly (the
    /// upload engine's sessions outlive any `Resolved`).
    pub async fn note_change(&self, mount_id: &str, storage_key: &str, op: index_repo::DirtyOp) {
        self.cache.invalidate_write(mount_id, storage_key);
        if let Err(error) = index_repo::enqueue_dirty(&self.db, mount_id, op, storage_key).await {
            tracing::warn!(
                mount_id = %mount_id,
                key = %storage_key,
                error = %error,
                "failed to enqueue index dirty entry"
            );
        }
    }
}

fn sep(url: &str) -> &'static str {
    if url.contains('?') { "&" } else { "?" }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use portico_core::permissions;
    use portico_driver_registry::DriverRegistry;
    use portico_storage::mounts_repo::{self, NewMount, WebdavPolicy};
    use portico_storage::{SecretsCrypto, db, index_repo, storage_configs_repo};
    use tempfile::TempDir;

    use crate::cache::DirectoryCache;
    use crate::link::UrlSigner;
    use crate::meta::PathTokenSigner;
    use crate::viewer::{ApiKeyIdentity, Viewer};

    use super::{Download, FsService};

    pub(crate) async fn service_with_mount(path: &str) -> (FsService, TempDir) {
        let temp = TempDir::new().unwrap();
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
                mount_path: path.to_string(),
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

        let secrets = Arc::new(SecretsCrypto::load_or_create(temp.path()).unwrap());
        let service = FsService::new(
            pool,
            Arc::new(DriverRegistry::new()),
            secrets,
            Arc::new(DirectoryCache::new()),
            Arc::new(PathTokenSigner::new(b"token-secret".to_vec())),
            Arc::new(UrlSigner::new(b"sign-secret".to_vec())),
        );
        (service, temp)
    }

    fn admin() -> Viewer {
        Viewer::Admin {
            admin_id: "a1".to_string(),
        }
    }

    #[tokio::test]
    async fn write_then_list_reflects_change_and_invalidates_cache() {
        let (service, _tmp) = service_with_mount("/data").await;
        let admin = admin();

        service
            .update(&admin, "/data/docs/a.txt", b"hello".to_vec(), "text/plain")
            .await
            .unwrap();

        let listing = service.list(&admin, "/data/docs", None).await.unwrap();
        assert_eq!(listing.entries.len(), 1);
        assert_eq!(listing.entries[0].name, "a.txt");
        assert_eq!(listing.entries[0].path, "/data/docs/a.txt");

        // Listing is now cached; a second write must invalidate it.
        service
            .update(&admin, "/data/docs/b.txt", b"more".to_vec(), "text/plain")
            .await
            .unwrap();
        let listing = service.list(&admin, "/data/docs", None).await.unwrap();
        assert_eq!(listing.entries.len(), 2);

        // Every write enqueued a dirty entry for the exact key.
        let dirty = index_repo::dirty_count(service.db(), None).await.unwrap();
        assert_eq!(dirty, 2);
    }

    #[tokio::test]
    async fn listing_sorts_directories_first_case_insensitive() {
        let (service, _tmp) = service_with_mount("/data").await;
        let admin = admin();
        for name in ["Zebra.txt", "apple.txt"] {
            service
                .update(&admin, &format!("/data/{name}"), b"x".to_vec(), "")
                .await
                .unwrap();
        }
        service.mkdir(&admin, "/data/sub").await.unwrap();

        let listing = service.list(&admin, "/data", None).await.unwrap();
        let names: Vec<&str> = listing.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["sub", "apple.txt", "Zebra.txt"]);
    }

    #[tokio::test]
    async fn basic_path_gate_applies_before_driver_calls() {
        let (service, _tmp) = service_with_mount("/").await;
        let viewer = Viewer::ApiKey(ApiKeyIdentity {
            id: "k".to_string(),
            name: "k".to_string(),
            permissions: permissions::MOUNT_VIEW,
            basic_path: "/public".to_string(),
            is_guest: false,
            storage_acl: Vec::new(),
        });

        let err = service.list(&viewer, "/private", None).await.unwrap_err();
        assert!(err.downcast_ref::<crate::errors::BasicPathDenied>().is_some());
        // Inside the sandbox the same key passes the gate (the path simply
        // does not exist yet).
        let admin = admin();
        service
            .update(&admin, "/public/docs/x.txt", b"x".to_vec(), "")
            .await
            .unwrap();
        assert!(service.list(&viewer, "/public/docs", None).await.is_ok());
    }

    #[tokio::test]
    async fn mkdir_is_idempotent_and_conflicts_with_files() {
        let (service, _tmp) = service_with_mount("/data").await;
        let admin = admin();

        service.mkdir(&admin, "/data/dir").await.unwrap();
        service.mkdir(&admin, "/data/dir").await.unwrap();

        service
            .update(&admin, "/data/file.txt", b"x".to_vec(), "")
            .await
            .unwrap();
        let err = service.mkdir(&admin, "/data/file.txt").await.unwrap_err();
        let driver_err = err
            .downcast_ref::<portico_driver_api::DriverError>()
            .expect("driver error");
        assert_eq!(driver_err.kind(), portico_driver_api::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn rename_within_mount_and_batch_remove() {
        let (service, _tmp) = service_with_mount("/data").await;
        let admin = admin();
        service
            .update(&admin, "/data/a.txt", b"1".to_vec(), "")
            .await
            .unwrap();

        service.rename(&admin, "/data/a.txt", "/data/b.txt").await.unwrap();
        assert!(service.stat(&admin, "/data/a.txt").await.unwrap().is_none());
        assert!(service.stat(&admin, "/data/b.txt").await.unwrap().is_some());

        let results = service
            .batch_remove(&admin, &["/data/b.txt".to_string(), "/data/nope".to_string()])
            .await
            .unwrap();
        assert!(results[0].success);
        assert!(!results[1].success);
        assert!(results[1].error.as_deref().unwrap_or("").contains("not_found"));
    }

    #[tokio::test]
    async fn password_protected_listing_requires_token() {
        let (service, _tmp) = service_with_mount("/data").await;
        let admin = admin();
        service
            .update(&admin, "/data/secret/a.txt", b"x".to_vec(), "")
            .await
            .unwrap();
        portico_storage::fs_meta_repo::upsert(
            service.db(),
            &portico_storage::fs_meta_repo::DirectoryMeta {
                path: "/data/secret".to_string(),
                password_hash: Some("hash".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let viewer = Viewer::ApiKey(ApiKeyIdentity {
            id: "k".to_string(),
            name: "k".to_string(),
            permissions: permissions::MOUNT_VIEW,
            basic_path: "/".to_string(),
            is_guest: false,
            storage_acl: Vec::new(),
        });

        let err = service.list(&viewer, "/data/secret", None).await.unwrap_err();
        assert!(err.downcast_ref::<crate::errors::PasswordRequired>().is_some());

        let token = service.path_tokens.issue("/data/secret", 600);
        assert!(
            service
                .list(&viewer, "/data/secret", Some(&token))
                .await
                .is_ok()
        );
        // Admins bypass the gate entirely.
        assert!(service.list(&admin, "/data/secret", None).await.is_ok());
    }

    #[tokio::test]
    async fn download_streams_when_no_public_url() {
        let (service, _tmp) = service_with_mount("/data").await;
        let admin = admin();
        service
            .update(&admin, "/data/f.bin", vec![7u8; 16], "application/octet-stream")
            .await
            .unwrap();

        match service.download(&admin, "/data/f.bin", None).await.unwrap() {
            Download::Stream(handle) => assert_eq!(handle.size, 16),
            Download::Redirect(url) => panic!("unexpected redirect to {url}"),
        }
    }
}
