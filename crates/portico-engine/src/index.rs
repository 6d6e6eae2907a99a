//! Search-index maintenance: full rebuilds, incremental dirty application
//! and the status/recommended-action model.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::SqlitePool;

use portico_core::FileKind;
use portico_core::jobs::{ItemResult, ItemStatus};
use portico_core::paths;
use portico_driver_api::{Driver, Entry, ListOptions};
use portico_storage::index_repo::{self, DirtyOp, IndexEntry, IndexStatus};
use portico_storage::mounts_repo::{self, Mount};
use portico_storage::settings_repo;
use portico_vfs::{FsService, Viewer};

use crate::jobs::{JobContext, JobHandler};

pub const TASK_REBUILD: &str = "fs_index_rebuild";
pub const TASK_APPLY_DIRTY: &str = "fs_index_apply_dirty";

pub const DEFAULT_BATCH_SIZE: usize = 200;
pub const DEFAULT_MAX_DEPTH: usize = 32;
pub const DEFAULT_DIRTY_REBUILD_THRESHOLD: i64 = 5000;

fn system_viewer() -> Viewer {
    Viewer::Admin {
        admin_id: "system".to_string(),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RebuildOptions {
    pub batch_size: usize,
    pub max_depth: usize,
    pub max_mounts_per_run: Option<usize>,
}

impl Default for RebuildOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_depth: DEFAULT_MAX_DEPTH,
            max_mounts_per_run: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RebuildPayload {
    pub mount_ids: Option<Vec<String>>,
    pub options: RebuildOptions,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApplyDirtyOptions {
    pub batch_size: usize,
    pub max_items: Option<usize>,
    pub rebuild_directory_subtree: bool,
    pub max_depth: usize,
}

impl Default for ApplyDirtyOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_items: None,
            rebuild_directory_subtree: true,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApplyDirtyPayload {
    pub mount_ids: Option<Vec<String>>,
    pub options: ApplyDirtyOptions,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MountIndexStatusView {
    pub mount_id: String,
    pub mount_path: String,
    pub status: IndexStatus,
    pub entry_count: i64,
    pub dirty_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_indexed_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub recommended_action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

pub fn recommended_action(
    status: IndexStatus,
    dirty_count: i64,
    threshold: i64,
) -> (&'static str, Option<&'static str>) {
    match status {
        IndexStatus::Indexing => ("wait", Some("indexing")),
        IndexStatus::NotReady | IndexStatus::Error => ("rebuild", Some("index_not_ready")),
        IndexStatus::Ready if dirty_count > threshold => ("rebuild", Some("dirty_too_large")),
        IndexStatus::Ready if dirty_count > 0 => ("apply-dirty", Some("dirty_pending")),
        IndexStatus::Ready => ("none", None),
    }
}

pub struct IndexService {
    db: SqlitePool,
    fs: Arc<FsService>,
}

impl IndexService {
    pub fn new(db: SqlitePool, fs: Arc<FsService>) -> Self {
        Self { db, fs }
    }

    pub async fn status(&self) -> Result<Vec<MountIndexStatusView>, anyhow::Error> {
        let threshold = settings_repo::get_i64(&self.db, "index_dirty_rebuild_threshold")
            .await?
            .unwrap_or(DEFAULT_DIRTY_REBUILD_THRESHOLD);

        let mounts = mounts_repo::list_active(&self.db).await?;
        let mut out = Vec::with_capacity(mounts.len());
        for mount in mounts {
            let state = index_repo::get_state(&self.db, &mount.id).await?;
            let status = state.as_ref().map(|s| s.status).unwrap_or(IndexStatus::NotReady);
            let dirty_count = index_repo::dirty_count(&self.db, Some(&mount.id)).await?;
            let entry_count = index_repo::count_entries(&self.db, &mount.id).await?;
            let (action, reason) = recommended_action(status, dirty_count, threshold);
            out.push(MountIndexStatusView {
                mount_id: mount.id.clone(),
                mount_path: mount.mount_path.clone(),
                status,
                entry_count,
                dirty_count,
                last_indexed_ms: state.as_ref().and_then(|s| s.last_indexed_ms),
                last_error: state.and_then(|s| s.last_error),
                recommended_action: action,
                reason,
            });
        }
        Ok(out)
    }

    pub async fn clear(&self, mount_ids: Option<&[String]>) -> Result<u64, anyhow::Error> {
        let mounts = mounts_repo::list(&self.db).await?;
        let mut cleared = 0u64;
        for mount in mounts {
            if mount_ids.is_some_and(|ids| !ids.contains(&mount.id)) {
                continue;
            }
            index_repo::clear_mount(&self.db, &mount.id).await?;
            cleared += 1;
        }
        Ok(cleared)
    }

    async fn mounts_for(&self, mount_ids: Option<&Vec<String>>) -> Result<Vec<Mount>, anyhow::Error> {
        let mounts = mounts_repo::list_active(&self.db).await?;
        Ok(match mount_ids {
            Some(ids) => mounts.into_iter().filter(|m| ids.contains(&m.id)).collect(),
            None => mounts,
        })
    }

    fn index_entry(mount: &Mount, default_folder: &str, entry: &Entry) -> IndexEntry {
        let relative = entry
            .key
            .strip_prefix(default_folder)
            .map(|r| r.trim_start_matches('/'))
            .unwrap_or(&entry.key);
        let display_path = if relative.is_empty() {
            mount.mount_path.clone()
        } else {
            paths::join(&mount.mount_path, relative)
        };
        let kind = if entry.is_directory {
            FileKind::Folder
        } else {
            FileKind::from_name(&entry.name)
        };
        IndexEntry {
            mount_id: mount.id.clone(),
            s3_key: entry.key.clone(),
            name: entry.name.clone(),
            path: display_path,
            size: entry.size as i64,
            kind: kind.as_i64(),
            modified_ms: entry.modified_ms,
            is_directory: entry.is_directory,
        }
    }

    /// Depth-first walk of one subtree, upserting in batches. Returns
    /// `(scanned_dirs, discovered, upserted)`.
    async fn index_subtree(
        &self,
        ctx: &JobContext,
        mount: &Mount,
        default_folder: &str,
        driver: &Arc<dyn Driver>,
        root_key: String,
        batch_size: usize,
        max_depth: usize,
    ) -> Result<(u64, u64, u64), anyhow::Error> {
        let mut scanned_dirs = 0u64;
        let mut discovered = 0u64;
        let mut upserted = 0u64;
        let mut batch: Vec<IndexEntry> = Vec::with_capacity(batch_size);
        let mut stack: Vec<(String, usize)> = vec![(root_key, 0)];

        while let Some((key, depth)) = stack.pop() {
            if ctx.is_cancelled() {
                break;
            }

            let listing = driver.list(&key, &ListOptions::default()).await?;
            scanned_dirs += 1;

            for entry in &listing.entries {
                discovered += 1;
                batch.push(Self::index_entry(mount, default_folder, entry));
                if entry.is_directory && depth + 1 < max_depth {
                    stack.push((entry.key.clone(), depth + 1));
                }
                if batch.len() >= batch_size {
                    index_repo::upsert_entries(&self.db, &batch).await?;
                    upserted += batch.len() as u64;
                    batch.clear();
                }
            }
        }

        if !batch.is_empty() {
            index_repo::upsert_entries(&self.db, &batch).await?;
            upserted += batch.len() as u64;
        }
        Ok((scanned_dirs, discovered, upserted))
    }

    async fn rebuild_mount(
        &self,
        ctx: &JobContext,
        mount: &Mount,
        options: &RebuildOptions,
    ) -> Result<serde_json::Value, anyhow::Error> {
        let started = Instant::now();
        index_repo::set_status(&self.db, &mount.id, IndexStatus::Indexing, None).await?;

        let viewer = system_viewer();
        let resolved = self.fs.resolve(&viewer, &mount.mount_path, 0).await?;

        // Point-in-time snapshot: drop stale rows and the dirty backlog the
        // rebuild supersedes, then walk.
        index_repo::clear_mount(&self.db, &mount.id).await?;
        index_repo::set_status(&self.db, &mount.id, IndexStatus::Indexing, None).await?;

        let (scanned_dirs, discovered, upserted) = self
            .index_subtree(
                ctx,
                mount,
                &resolved.config.default_folder,
                &resolved.driver,
                resolved.key.clone(),
                options.batch_size.max(1),
                options.max_depth.max(1),
            )
            .await?;

        if ctx.is_cancelled() {
            index_repo::set_status(&self.db, &mount.id, IndexStatus::NotReady, None).await?;
        } else {
            index_repo::set_status(&self.db, &mount.id, IndexStatus::Ready, None).await?;
        }

        Ok(serde_json::json!({
            "scannedDirs": scanned_dirs,
            "discoveredCount": discovered,
            "upsertedCount": upserted,
            "durationMs": started.elapsed().as_millis() as u64,
        }))
    }

    async fn apply_dirty_mount(
        &self,
        ctx: &JobContext,
        mount: &Mount,
        options: &ApplyDirtyOptions,
    ) -> Result<u64, anyhow::Error> {
        let viewer = system_viewer();
        let resolved = self.fs.resolve(&viewer, &mount.mount_path, 0).await?;
        let mut applied = 0u64;

        loop {
            if ctx.is_cancelled() {
                break;
            }
            if options.max_items.is_some_and(|max| applied >= max as u64) {
                break;
            }

            let batch = index_repo::take_dirty_batch(
                &self.db,
                &mount.id,
                options.batch_size.max(1) as i64,
            )
            .await?;
            if batch.is_empty() {
                break;
            }

            for dirty in batch {
                if ctx.is_cancelled() {
                    break;
                }
                match dirty.op {
                    DirtyOp::Delete => {
                        index_repo::delete_subtree(&self.db, &mount.id, &dirty.s3_key).await?;
                    }
                    DirtyOp::Upsert => {
                        match resolved.driver.stat(&dirty.s3_key).await? {
                            None => {
                                index_repo::delete_subtree(&self.db, &mount.id, &dirty.s3_key)
                                    .await?;
                            }
                            Some(entry) if entry.is_directory => {
                                index_repo::upsert_entries(
                                    &self.db,
                                    &[Self::index_entry(
                                        mount,
                                        &resolved.config.default_folder,
                                        &entry,
                                    )],
                                )
                                .await?;
                                if options.rebuild_directory_subtree {
                                    self.index_subtree(
                                        ctx,
                                        mount,
                                        &resolved.config.default_folder,
                                        &resolved.driver,
                                        dirty.s3_key.clone(),
                                        options.batch_size.max(1),
                                        options.max_depth.max(1),
                                    )
                                    .await?;
                                }
                            }
                            Some(entry) => {
                                index_repo::upsert_entries(
                                    &self.db,
                                    &[Self::index_entry(
                                        mount,
                                        &resolved.config.default_folder,
                                        &entry,
                                    )],
                                )
                                .await?;
                            }
                        }
                    }
                }
                applied += 1;
                ctx.update_stats(|s| {
                    s.processed_items += 1;
                    s.success_count += 1;
                })
                .await;
            }
        }
        Ok(applied)
    }
}

pub struct RebuildHandler {
    pub service: Arc<IndexService>,
}

#[async_trait]
impl JobHandler for RebuildHandler {
    fn task_type(&self) -> &'static str {
        TASK_REBUILD
    }

    async fn run(
        &self,
        ctx: &JobContext,
        payload: serde_json::Value,
    ) -> Result<(), anyhow::Error> {
        let payload: RebuildPayload = serde_json::from_value(payload)?;
        let mut mounts = self
            .service
            .mounts_for(payload.mount_ids.as_ref())
            .await?;
        if let Some(cap) = payload.options.max_mounts_per_run {
            mounts.truncate(cap);
        }
        ctx.update_stats(|s| s.total_items = mounts.len() as u64).await;

        for mount in &mounts {
            if ctx.is_cancelled() {
                break;
            }
            match self.service.rebuild_mount(ctx, mount, &payload.options).await {
                Ok(detail) => {
                    ctx.update_stats(|s| {
                        s.processed_items += 1;
                        s.success_count += 1;
                        s.item_results.push(ItemResult {
                            source_path: mount.mount_path.clone(),
                            target_path: None,
                            status: ItemStatus::Success,
                            error: None,
                            retry_count: 0,
                            detail: Some(detail),
                        });
                    })
                    .await;
                }
                Err(error) => {
                    index_repo::set_status(
                        &self.service.db,
                        &mount.id,
                        IndexStatus::Error,
                        Some(&error.to_string()),
                    )
                    .await?;
                    ctx.update_stats(|s| {
                        s.processed_items += 1;
                        s.failed_count += 1;
                        s.item_results.push(ItemResult {
                            source_path: mount.mount_path.clone(),
                            target_path: None,
                            status: ItemStatus::Failed,
                            error: Some(error.to_string()),
                            retry_count: 0,
                            detail: None,
                        });
                    })
                    .await;
                }
            }
        }
        ctx.flush_stats().await;
        Ok(())
    }
}

pub struct ApplyDirtyHandler {
    pub service: Arc<IndexService>,
}

#[async_trait]
impl JobHandler for ApplyDirtyHandler {
    fn task_type(&self) -> &'static str {
        TASK_APPLY_DIRTY
    }

    async fn run(
        &self,
        ctx: &JobContext,
        payload: serde_json::Value,
    ) -> Result<(), anyhow::Error> {
        let payload: ApplyDirtyPayload = serde_json::from_value(payload)?;
        let mounts = self
            .service
            .mounts_for(payload.mount_ids.as_ref())
            .await?;

        for mount in &mounts {
            if ctx.is_cancelled() {
                break;
            }
            // Only ready mounts apply increments; anything else needs a
            // rebuild first.
            if index_repo::status_of(&self.service.db, &mount.id).await? != IndexStatus::Ready {
                continue;
            }
            let applied = self
                .service
                .apply_dirty_mount(ctx, mount, &payload.options)
                .await?;
            tracing::debug!(mount_id = %mount.id, applied, "applied dirty index entries");
        }
        ctx.flush_stats().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use portico_core::jobs::{JobStatus, TriggerType};
    use portico_storage::index_repo::{self, IndexStatus};
    use portico_vfs::Viewer;

    use crate::jobs::JobRegistry;

    use super::{ApplyDirtyHandler, IndexService, RebuildHandler, recommended_action};

    async fn wait_for_terminal(registry: &JobRegistry, job_id: &str) -> JobStatus {
        for _ in 0..400 {
            let job = registry.get(job_id).await.unwrap().unwrap();
            if job.status.is_terminal() {
                return job.status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job never reached a terminal state");
    }

    #[test]
    fn recommended_action_table() {
        assert_eq!(
            recommended_action(IndexStatus::Indexing, 0, 5000),
            ("wait", Some("indexing"))
        );
        assert_eq!(
            recommended_action(IndexStatus::NotReady, 0, 5000),
            ("rebuild", Some("index_not_ready"))
        );
        assert_eq!(
            recommended_action(IndexStatus::Error, 0, 5000),
            ("rebuild", Some("index_not_ready"))
        );
        assert_eq!(
            recommended_action(IndexStatus::Ready, 0, 5000),
            ("none", None)
        );
        assert_eq!(
            recommended_action(IndexStatus::Ready, 3, 5000),
            ("apply-dirty", Some("dirty_pending"))
        );
        assert_eq!(
            recommended_action(IndexStatus::Ready, 6000, 5000),
            ("rebuild", Some("dirty_too_large"))
        );
    }

    #[tokio::test]
    async fn rebuild_then_search_then_apply_dirty() {
        let (fs, _tmp) = crate::test_support::fs_with_memory_mount("/data").await;
        let fs = Arc::new(fs);
        let admin = Viewer::Admin {
            admin_id: "a".to_string(),
        };

        // Seed some files through the VFS.
        for name in ["docs/report.pdf", "docs/deep/notes.md", "music/song.mp3"] {
            fs.update(&admin, &format!("/data/{name}"), b"x".to_vec(), "")
                .await
                .unwrap();
        }

        let db = fs.db().clone();
        let service = Arc::new(IndexService::new(db.clone(), fs.clone()));
        let registry = Arc::new(JobRegistry::new(db.clone(), CancellationToken::new()));
        registry.register(Arc::new(RebuildHandler {
            service: service.clone(),
        }));
        registry.register(Arc::new(ApplyDirtyHandler {
            service: service.clone(),
        }));

        let job = registry
            .submit(
                super::TASK_REBUILD,
                serde_json::json!({}),
                "system",
                TriggerType::Manual,
            )
            .await
            .unwrap();
        assert_eq!(wait_for_terminal(&registry, &job.job_id).await, JobStatus::Completed);

        let statuses = service.status().await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status, IndexStatus::Ready);
        // Rebuild indexed 3 files + 2 directories and drained the seed
        // writes' dirty backlog.
        assert_eq!(statuses[0].entry_count, 5);
        assert_eq!(statuses[0].dirty_count, 0);
        assert_eq!(statuses[0].recommended_action, "none");

        let job = registry.get(&job.job_id).await.unwrap().unwrap();
        let detail = job.stats.item_results[0].detail.as_ref().unwrap();
        assert_eq!(detail["discoveredCount"], 5);
        assert!(detail["scannedDirs"].as_u64().unwrap() >= 3);

        // A new write enqueues dirty; apply-dirty folds it in.
        fs.update(&admin, "/data/docs/new.txt", b"y".to_vec(), "")
            .await
            .unwrap();
        let statuses = service.status().await.unwrap();
        assert_eq!(statuses[0].recommended_action, "apply-dirty");

        let job = registry
            .submit(
                super::TASK_APPLY_DIRTY,
                serde_json::json!({}),
                "system",
                TriggerType::Manual,
            )
            .await
            .unwrap();
        assert_eq!(wait_for_terminal(&registry, &job.job_id).await, JobStatus::Completed);

        let mount_id = statuses[0].mount_id.clone();
        let hits = index_repo::search(&db, "new.txt", &[mount_id], None, None, 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "/data/docs/new.txt");
    }

    #[tokio::test]
    async fn dirty_delete_prunes_subtree_rows() {
        let (fs, _tmp) = crate::test_support::fs_with_memory_mount("/data").await;
        let fs = Arc::new(fs);
        let admin = Viewer::Admin {
            admin_id: "a".to_string(),
        };
        fs.update(&admin, "/data/dir/a.txt", b"x".to_vec(), "").await.unwrap();
        fs.update(&admin, "/data/dir/b.txt", b"x".to_vec(), "").await.unwrap();

        let db = fs.db().clone();
        let service = Arc::new(IndexService::new(db.clone(), fs.clone()));
        let registry = Arc::new(JobRegistry::new(db.clone(), CancellationToken::new()));
        registry.register(Arc::new(RebuildHandler {
            service: service.clone(),
        }));
        registry.register(Arc::new(ApplyDirtyHandler {
            service: service.clone(),
        }));

        let job = registry
            .submit(super::TASK_REBUILD, serde_json::json!({}), "s", TriggerType::Manual)
            .await
            .unwrap();
        wait_for_terminal(&registry, &job.job_id).await;

        // Remove the directory through the VFS (enqueues a delete dirty).
        fs.batch_remove(&admin, &["/data/dir".to_string()]).await.unwrap();
        let job = registry
            .submit(super::TASK_APPLY_DIRTY, serde_json::json!({}), "s", TriggerType::Manual)
            .await
            .unwrap();
        wait_for_terminal(&registry, &job.job_id).await;

        let statuses = service.status().await.unwrap();
        assert_eq!(statuses[0].entry_count, 0);
    }
}
