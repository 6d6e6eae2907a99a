//! Job runtime: cooperative cancellation, debounced progress, per-owner
//! bounds, reconciliation and retry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use portico_core::jobs::{JobStats, JobStatus, TriggerType};
use portico_driver_api::DriverError;
use portico_storage::jobs_repo::{self, Job};

pub const DEFAULT_MAX_JOBS_PER_OWNER: i64 = 50;
const PROGRESS_DEBOUNCE: Duration = Duration::from_millis(500);

/// Raised when an owner exceeds their queued-job bound; maps to 429.
#[derive(Debug)]
pub struct TooManyJobs {
    pub owner: String,
    pub limit: i64,
}

impl std::fmt::Display for TooManyJobs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} has {} queued jobs already", self.owner, self.limit)
    }
}

impl std::error::Error for TooManyJobs {}

/// Handed to a handler for the duration of one job.
pub struct JobContext {
    pub db: SqlitePool,
    pub job_id: String,
    pub cancel: CancellationToken,
    progress: ProgressReporter,
}

impl JobContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Mutate the stats; flushes to the database at most every 500ms.
    /// Counters are merged monotonically.
    pub async fn update_stats(&self, apply: impl FnOnce(&mut JobStats)) {
        self.progress.update(&self.db, &self.job_id, apply).await;
    }

    pub async fn flush_stats(&self) {
        self.progress.flush(&self.db, &self.job_id).await;
    }

    pub fn stats_snapshot(&self) -> JobStats {
        self.progress.snapshot()
    }
}

#[derive(Clone)]
struct ProgressReporter {
    inner: Arc<Mutex<ProgressState>>,
}

struct ProgressState {
    stats: JobStats,
    last_flush: Instant,
}

impl ProgressReporter {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ProgressState {
                stats: JobStats::default(),
                last_flush: Instant::now() - PROGRESS_DEBOUNCE,
            })),
        }
    }

    fn snapshot(&self) -> JobStats {
        self.lock().stats.clone()
    }

    async fn update(
        &self,
        db: &SqlitePool,
        job_id: &str,
        apply: impl FnOnce(&mut JobStats),
    ) {
        let flush = {
            let mut state = self.lock();
            let mut updated = state.stats.clone();
            apply(&mut updated);
            state.stats.absorb(updated);
            if state.last_flush.elapsed() >= PROGRESS_DEBOUNCE {
                state.last_flush = Instant::now();
                Some(state.stats.clone())
            } else {
                None
            }
        };
        if let Some(stats) = flush
            && let Err(error) = jobs_repo::update_stats(db, job_id, &stats).await
        {
            tracing::warn!(job_id, error = %error, "failed to flush job stats");
        }
    }

    async fn flush(&self, db: &SqlitePool, job_id: &str) {
        let stats = {
            let mut state = self.lock();
            state.last_flush = Instant::now();
            state.stats.clone()
        };
        if let Err(error) = jobs_repo::update_stats(db, job_id, &stats).await {
            tracing::warn!(job_id, error = %error, "failed to flush job stats");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProgressState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    fn task_type(&self) -> &'static str;

    async fn run(&self, ctx: &JobContext, payload: serde_json::Value)
    -> Result<(), anyhow::Error>;

    /// Payload for a retry of this job, keeping only failed items. `None`
    /// when there is nothing to retry.
    fn retry_payload(
        &self,
        payload: &serde_json::Value,
        stats: &JobStats,
    ) -> Option<serde_json::Value> {
        if stats.failed_count > 0 {
            Some(payload.clone())
        } else {
            None
        }
    }
}

pub struct JobRegistry {
    db: SqlitePool,
    handlers: Mutex<HashMap<&'static str, Arc<dyn JobHandler>>>,
    running: Mutex<HashMap<String, CancellationToken>>,
    max_per_owner: i64,
    shutdown: CancellationToken,
}

impl JobRegistry {
    pub fn new(db: SqlitePool, shutdown: CancellationToken) -> Self {
        Self {
            db,
            handlers: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            max_per_owner: DEFAULT_MAX_JOBS_PER_OWNER,
            shutdown,
        }
    }

    pub fn with_owner_limit(mut self, limit: i64) -> Self {
        self.max_per_owner = limit;
        self
    }

    pub fn register(&self, handler: Arc<dyn JobHandler>) {
        self.lock_handlers().insert(handler.task_type(), handler);
    }

    /// Reconcile jobs orphaned by a previous process on startup.
    pub async fn reconcile(&self) -> Result<u64, anyhow::Error> {
        let orphaned = jobs_repo::fail_orphaned_running(&self.db).await?;
        if orphaned > 0 {
            tracing::warn!(orphaned, "marked orphaned running jobs as failed");
        }
        Ok(orphaned)
    }

    pub async fn submit(
        self: &Arc<Self>,
        task_type: &str,
        payload: serde_json::Value,
        owner: &str,
        trigger: TriggerType,
    ) -> Result<Job, anyhow::Error> {
        let handler = self
            .lock_handlers()
            .get(task_type)
            .cloned()
            .ok_or_else(|| DriverError::invalid_input(format!("unknown task type: {task_type}")))?;

        let active = jobs_repo::count_active_for_owner(&self.db, owner).await?;
        if active >= self.max_per_owner {
            return Err(TooManyJobs {
                owner: owner.to_string(),
                limit: self.max_per_owner,
            }
            .into());
        }

        let job = jobs_repo::create(&self.db, task_type, payload.clone(), owner, trigger).await?;
        self.spawn_job(handler, job.clone(), payload);
        Ok(job)
    }

    fn spawn_job(self: &Arc<Self>, handler: Arc<dyn JobHandler>, job: Job, payload: serde_json::Value) {
        let cancel = self.shutdown.child_token();
        self.lock_running().insert(job.job_id.clone(), cancel.clone());

        let registry = self.clone();
        tokio::spawn(async move {
            let job_id = job.job_id.clone();
            let ctx = JobContext {
                db: registry.db.clone(),
                job_id: job_id.clone(),
                cancel: cancel.clone(),
                progress: ProgressReporter::new(),
            };

            if let Err(error) = jobs_repo::mark_started(&registry.db, &job_id).await {
                tracing::error!(job_id = %job_id, error = %error, "failed to mark job started");
            }

            let result = handler.run(&ctx, payload).await;
            let stats = ctx.stats_snapshot();

            let (status, error_message) = if cancel.is_cancelled() {
                (JobStatus::Cancelled, None)
            } else {
                match result {
                    Err(error) => (JobStatus::Failed, Some(error.to_string())),
                    Ok(()) if stats.failed_count == 0 => (JobStatus::Completed, None),
                    Ok(()) if stats.success_count > 0 || stats.skipped_count > 0 => {
                        (JobStatus::Partial, None)
                    }
                    Ok(()) => (JobStatus::Failed, Some("all items failed".to_string())),
                }
            };

            if let Err(error) = jobs_repo::finish(
                &registry.db,
                &job_id,
                status,
                &stats,
                error_message.as_deref(),
            )
            .await
            {
                tracing::error!(job_id = %job_id, error = %error, "failed to finish job");
            }
            registry.lock_running().remove(&job_id);
            tracing::info!(
                job_id = %job_id,
                status = status.as_str(),
                processed = stats.processed_items,
                failed = stats.failed_count,
                "job finished"
            );
        });
    }

    /// Request cancellation. Terminal jobs return `false`; a running job
    /// moves to `cancelling` and its token fires.
    pub async fn cancel(&self, job_id: &str) -> Result<bool, anyhow::Error> {
        let job = jobs_repo::get(&self.db, job_id)
            .await?
            .ok_or_else(|| DriverError::not_found("no such job"))?;
        if job.status.is_terminal() {
            return Ok(false);
        }

        jobs_repo::update_status(&self.db, job_id, JobStatus::Cancelling).await?;
        if let Some(token) = self.lock_running().get(job_id) {
            token.cancel();
        } else {
            // Never picked up by a worker (crash window); finalize directly.
            jobs_repo::finish(&self.db, job_id, JobStatus::Cancelled, &job.stats, None).await?;
        }
        Ok(true)
    }

    /// Delete a terminal job; non-terminal deletion is a conflict.
    pub async fn delete(&self, job_id: &str) -> Result<(), anyhow::Error> {
        let job = jobs_repo::get(&self.db, job_id)
            .await?
            .ok_or_else(|| DriverError::not_found("no such job"))?;
        if !job.status.is_terminal() {
            return Err(DriverError::conflict("job is still active").into());
        }
        jobs_repo::delete(&self.db, job_id).await?;
        Ok(())
    }

    /// Retry as a new job carrying only the failed items.
    pub async fn retry(self: &Arc<Self>, job_id: &str) -> Result<Job, anyhow::Error> {
        let job = jobs_repo::get(&self.db, job_id)
            .await?
            .ok_or_else(|| DriverError::not_found("no such job"))?;
        if !job.status.is_terminal() {
            return Err(DriverError::conflict("job is still active").into());
        }

        let handler = self
            .lock_handlers()
            .get(job.task_type.as_str())
            .cloned()
            .ok_or_else(|| {
                DriverError::invalid_input(format!("unknown task type: {}", job.task_type))
            })?;
        let payload = handler
            .retry_payload(&job.payload, &job.stats)
            .ok_or_else(|| DriverError::conflict("job has no failed items to retry"))?;

        self.submit(&job.task_type, payload, &job.owner, job.trigger_type)
            .await
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<Job>, anyhow::Error> {
        jobs_repo::get(&self.db, job_id).await
    }

    pub async fn list(&self, owner: Option<&str>) -> Result<Vec<Job>, anyhow::Error> {
        jobs_repo::list(&self.db, owner).await
    }

    fn lock_handlers(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<&'static str, Arc<dyn JobHandler>>> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use portico_core::jobs::{JobStatus, TriggerType};
    use portico_storage::db;

    use super::{JobContext, JobHandler, JobRegistry};

    struct CountingHandler {
        items: u64,
        delay: Duration,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        fn task_type(&self) -> &'static str {
            "counting"
        }

        async fn run(
            &self,
            ctx: &JobContext,
            _payload: serde_json::Value,
        ) -> Result<(), anyhow::Error> {
            ctx.update_stats(|s| s.total_items = self.items).await;
            for _ in 0..self.items {
                if ctx.is_cancelled() {
                    return Ok(());
                }
                tokio::time::sleep(self.delay).await;
                ctx.update_stats(|s| {
                    s.processed_items += 1;
                    s.success_count += 1;
                })
                .await;
            }
            ctx.flush_stats().await;
            Ok(())
        }
    }

    async fn wait_for_terminal(registry: &JobRegistry, job_id: &str) -> JobStatus {
        for _ in 0..200 {
            let job = registry.get(job_id).await.unwrap().unwrap();
            if job.status.is_terminal() {
                return job.status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never reached a terminal state");
    }

    #[tokio::test]
    async fn job_runs_to_completion_with_progress() {
        let pool = db::init_in_memory().await.unwrap();
        let registry = Arc::new(JobRegistry::new(pool, CancellationToken::new()));
        registry.register(Arc::new(CountingHandler {
            items: 3,
            delay: Duration::from_millis(1),
        }));

        let job = registry
            .submit("counting", serde_json::json!({}), "tester", TriggerType::Api)
            .await
            .unwrap();
        let status = wait_for_terminal(&registry, &job.job_id).await;
        assert_eq!(status, JobStatus::Completed);

        let job = registry.get(&job.job_id).await.unwrap().unwrap();
        assert_eq!(job.stats.processed_items, 3);
        assert!(job.finished_at.is_some());
    }

    #[tokio::test]
    async fn cancel_is_cooperative() {
        let pool = db::init_in_memory().await.unwrap();
        let registry = Arc::new(JobRegistry::new(pool, CancellationToken::new()));
        registry.register(Arc::new(CountingHandler {
            items: 1000,
            delay: Duration::from_millis(5),
        }));

        let job = registry
            .submit("counting", serde_json::json!({}), "tester", TriggerType::Api)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.cancel(&job.job_id).await.unwrap());

        let status = wait_for_terminal(&registry, &job.job_id).await;
        assert_eq!(status, JobStatus::Cancelled);
        let job = registry.get(&job.job_id).await.unwrap().unwrap();
        assert!(job.stats.processed_items < 1000);
    }

    #[tokio::test]
    async fn owner_bound_is_enforced() {
        let pool = db::init_in_memory().await.unwrap();
        let registry =
            Arc::new(JobRegistry::new(pool, CancellationToken::new()).with_owner_limit(1));
        registry.register(Arc::new(CountingHandler {
            items: 1000,
            delay: Duration::from_millis(5),
        }));

        registry
            .submit("counting", serde_json::json!({}), "tester", TriggerType::Api)
            .await
            .unwrap();
        let err = registry
            .submit("counting", serde_json::json!({}), "tester", TriggerType::Api)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<super::TooManyJobs>().is_some());
    }

    #[tokio::test]
    async fn delete_requires_terminal_state() {
        let pool = db::init_in_memory().await.unwrap();
        let registry = Arc::new(JobRegistry::new(pool, CancellationToken::new()));
        registry.register(Arc::new(CountingHandler {
            items: 200,
            delay: Duration::from_millis(5),
        }));

        let job = registry
            .submit("counting", serde_json::json!({}), "tester", TriggerType::Api)
            .await
            .unwrap();
        let err = registry.delete(&job.job_id).await.unwrap_err();
        assert!(err.to_string().contains("active"));

        registry.cancel(&job.job_id).await.unwrap();
        wait_for_terminal(&registry, &job.job_id).await;
        registry.delete(&job.job_id).await.unwrap();
        assert!(registry.get(&job.job_id).await.unwrap().is_none());
    }
}
