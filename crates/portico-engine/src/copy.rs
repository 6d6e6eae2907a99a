//! The `copy` job: batch file copies across (or within) mounts.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt as _;
use serde::{Deserialize, Serialize};

use portico_core::jobs::{ItemResult, ItemStatus, JobStats};
use portico_driver_api::DriverError;
use portico_storage::index_repo::DirtyOp;
use portico_vfs::{FsService, Viewer};

use crate::jobs::{JobContext, JobHandler};

pub const TASK_COPY: &str = "copy";

pub const DEFAULT_MAX_CONCURRENCY: usize = 2;
pub const MAX_CONCURRENCY_CAP: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyItem {
    pub source_path: String,
    pub target_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CopyOptions {
    pub skip_existing: bool,
    pub max_concurrency: usize,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            skip_existing: false,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CopyPayload {
    pub items: Vec<CopyItem>,
    #[serde(default)]
    pub options: CopyOptions,
}

fn system_viewer() -> Viewer {
    Viewer::Admin {
        admin_id: "system".to_string(),
    }
}

pub struct CopyHandler {
    pub fs: Arc<FsService>,
}

enum ItemOutcome {
    Copied { bytes: u64 },
    Skipped,
}

impl CopyHandler {
    /// Copy one item. Same-mount copies prefer the driver's server-side
    /// copy; everything else streams read-to-write.
    async fn copy_item(
        &self,
        ctx: &JobContext,
        item: &CopyItem,
        skip_existing: bool,
    ) -> Result<ItemOutcome, anyhow::Error> {
        if ctx.is_cancelled() {
            return Err(DriverError::cancelled("job cancelled").into());
        }

        let viewer = system_viewer();
        let src = self.fs.resolve(&viewer, &item.source_path, 0).await?;
        let dst = self.fs.resolve(&viewer, &item.target_path, 0).await?;

        if skip_existing && dst.driver.stat(&dst.key).await?.is_some() {
            return Ok(ItemOutcome::Skipped);
        }

        let source_entry = src
            .driver
            .stat(&src.key)
            .await?
            .ok_or_else(|| DriverError::not_found(format!("no such path: {}", item.source_path)))?;
        if source_entry.is_directory {
            return Err(DriverError::invalid_input(
                "directory copies must enumerate files first",
            )
            .into());
        }

        let bytes = if src.mount.id == dst.mount.id && src.driver.capabilities().fs.copy {
            src.driver.copy(&src.key, &dst.key).await?;
            source_entry.size
        } else {
            let handle = src.driver.read(&src.key, None).await?;
            let size = handle.size;
            let content_type = handle.content_type.clone();
            dst.driver
                .write(&dst.key, handle.stream, size, &content_type)
                .await?;
            size
        };

        self.fs.note_change(&dst.mount.id, &dst.key, DirtyOp::Upsert).await;
        Ok(ItemOutcome::Copied { bytes })
    }
}

#[async_trait]
impl JobHandler for CopyHandler {
    fn task_type(&self) -> &'static str {
        TASK_COPY
    }

    async fn run(
        &self,
        ctx: &JobContext,
        payload: serde_json::Value,
    ) -> Result<(), anyhow::Error> {
        let payload: CopyPayload = serde_json::from_value(payload)?;
        let concurrency = payload
            .options
            .max_concurrency
            .clamp(1, MAX_CONCURRENCY_CAP);
        ctx.update_stats(|s| s.total_items = payload.items.len() as u64)
            .await;

        let skip_existing = payload.options.skip_existing;
        // Item results land in completion order, not submission order.
        let mut futures: Vec<
            std::pin::Pin<
                Box<dyn std::future::Future<Output = (CopyItem, Result<ItemOutcome, anyhow::Error>)> + Send + '_>,
            >,
        > = Vec::with_capacity(payload.items.len());
        for item in payload.items.iter() {
            let item = item.clone();
            futures.push(Box::pin(async move {
                let outcome = self.copy_item(ctx, &item, skip_existing).await;
                (item, outcome)
            }));
        }
        let mut stream = futures_util::stream::iter(futures).buffer_unordered(concurrency);

        while let Some((item, outcome)) = stream.next().await {
            match outcome {
                Ok(ItemOutcome::Copied { bytes }) => {
                    ctx.update_stats(|s| {
                        s.processed_items += 1;
                        s.success_count += 1;
                        s.bytes_transferred += bytes;
                        s.item_results.push(ItemResult {
                            source_path: item.source_path.clone(),
                            target_path: Some(item.target_path.clone()),
                            status: ItemStatus::Success,
                            error: None,
                            retry_count: 0,
                            detail: None,
                        });
                    })
                    .await;
                }
                Ok(ItemOutcome::Skipped) => {
                    ctx.update_stats(|s| {
                        s.processed_items += 1;
                        s.skipped_count += 1;
                        s.item_results.push(ItemResult {
                            source_path: item.source_path.clone(),
                            target_path: Some(item.target_path.clone()),
                            status: ItemStatus::Skipped,
                            error: None,
                            retry_count: 0,
                            detail: None,
                        });
                    })
                    .await;
                }
                Err(error) => {
                    ctx.update_stats(|s| {
                        s.processed_items += 1;
                        s.failed_count += 1;
                        s.item_results.push(ItemResult {
                            source_path: item.source_path.clone(),
                            target_path: Some(item.target_path.clone()),
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

    /// A retry carries only the failed items forward.
    fn retry_payload(
        &self,
        payload: &serde_json::Value,
        stats: &JobStats,
    ) -> Option<serde_json::Value> {
        let failed: Vec<CopyItem> = stats
            .item_results
            .iter()
            .filter(|r| r.status == ItemStatus::Failed)
            .map(|r| CopyItem {
                source_path: r.source_path.clone(),
                target_path: r.target_path.clone().unwrap_or_default(),
            })
            .collect();
        if failed.is_empty() {
            return None;
        }

        let mut next = payload.clone();
        if let Some(obj) = next.as_object_mut() {
            obj.insert(
                "items".to_string(),
                serde_json::to_value(&failed).unwrap_or_default(),
            );
        }
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use portico_core::jobs::{ItemStatus, JobStatus, TriggerType};
    use portico_vfs::Viewer;

    use crate::jobs::JobRegistry;

    use super::{CopyHandler, TASK_COPY};

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

    #[tokio::test]
    async fn copy_job_reports_per_item_results() {
        let (fs, _tmp) = crate::test_support::fs_with_memory_mount("/data").await;
        let fs = Arc::new(fs);
        let admin = Viewer::Admin {
            admin_id: "a".to_string(),
        };
        fs.update(&admin, "/data/src/a.txt", b"aaaa".to_vec(), "").await.unwrap();
        fs.update(&admin, "/data/src/b.txt", b"bb".to_vec(), "").await.unwrap();
        // Target for the skip case already exists.
        fs.update(&admin, "/data/dst/b.txt", b"old".to_vec(), "").await.unwrap();

        let registry = Arc::new(JobRegistry::new(fs.db().clone(), CancellationToken::new()));
        registry.register(Arc::new(CopyHandler { fs: fs.clone() }));

        let payload = serde_json::json!({
            "items": [
                {"sourcePath": "/data/src/a.txt", "targetPath": "/data/dst/a.txt"},
                {"sourcePath": "/data/src/b.txt", "targetPath": "/data/dst/b.txt"},
                {"sourcePath": "/data/src/missing.txt", "targetPath": "/data/dst/c.txt"},
            ],
            "options": {"skipExisting": true, "maxConcurrency": 2},
        });
        let job = registry
            .submit(TASK_COPY, payload, "admin:a", TriggerType::Api)
            .await
            .unwrap();

        let status = wait_for_terminal(&registry, &job.job_id).await;
        assert_eq!(status, JobStatus::Partial);

        let job = registry.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(job.stats.total_items, 3);
        assert_eq!(job.stats.success_count, 1);
        assert_eq!(job.stats.skipped_count, 1);
        assert_eq!(job.stats.failed_count, 1);
        assert_eq!(job.stats.bytes_transferred, 4);

        // The copied file is readable; the skipped target kept its content.
        assert!(fs.stat(&admin, "/data/dst/a.txt").await.unwrap().is_some());
        let skipped = fs.stat(&admin, "/data/dst/b.txt").await.unwrap().unwrap();
        assert_eq!(skipped.size, 3);
    }

    #[tokio::test]
    async fn retry_preserves_only_failed_items() {
        let (fs, _tmp) = crate::test_support::fs_with_memory_mount("/data").await;
        let fs = Arc::new(fs);
        let admin = Viewer::Admin {
            admin_id: "a".to_string(),
        };
        fs.update(&admin, "/data/src/ok.txt", b"ok".to_vec(), "").await.unwrap();

        let registry = Arc::new(JobRegistry::new(fs.db().clone(), CancellationToken::new()));
        registry.register(Arc::new(CopyHandler { fs: fs.clone() }));

        let payload = serde_json::json!({
            "items": [
                {"sourcePath": "/data/src/ok.txt", "targetPath": "/data/dst/ok.txt"},
                {"sourcePath": "/data/src/gone.txt", "targetPath": "/data/dst/gone.txt"},
            ],
        });
        let job = registry
            .submit(TASK_COPY, payload, "admin:a", TriggerType::Api)
            .await
            .unwrap();
        assert_eq!(wait_for_terminal(&registry, &job.job_id).await, JobStatus::Partial);

        // Make the failed item copyable, then retry.
        fs.update(&admin, "/data/src/gone.txt", b"late".to_vec(), "").await.unwrap();
        let retried = registry.retry(&job.job_id).await.unwrap();
        assert_eq!(
            wait_for_terminal(&registry, &retried.job_id).await,
            JobStatus::Completed
        );

        let retried = registry.get(&retried.job_id).await.unwrap().unwrap();
        assert_eq!(retried.stats.total_items, 1);
        assert_eq!(
            retried.stats.item_results[0].status,
            ItemStatus::Success
        );
        assert_eq!(retried.stats.item_results[0].source_path, "/data/src/gone.txt");
    }
}
