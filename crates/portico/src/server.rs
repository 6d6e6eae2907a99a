use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use portico_engine::index::{ApplyDirtyHandler, IndexService, RebuildHandler, TASK_APPLY_DIRTY};
use portico_engine::scheduler::{IntervalTicker, ScheduledHandler, handlers};
use portico_engine::supervision::spawn_supervised;
use portico_engine::upload::sessions::{self, SessionManager};
use portico_engine::{JobRegistry, ScheduledRunner, UploadEngine, copy};
use portico_http::AppState;
use portico_storage::{SecretsCrypto, db};
use portico_vfs::FsService;
use portico_vfs::cache::DirectoryCache;
use portico_vfs::link::UrlSigner;
use portico_vfs::meta::PathTokenSigner;
use portico_vfs::search::SearchService;

use crate::bootstrap;
use crate::cli::PorticoConfig;

/// Drains the index dirty queue on the maintenance schedule by submitting
/// the regular apply-dirty job.
struct ScheduledApplyDirty {
    jobs: Arc<JobRegistry>,
}

#[async_trait]
impl ScheduledHandler for ScheduledApplyDirty {
    fn id(&self) -> &'static str {
        "fs_index_apply_dirty"
    }

    async fn run(
        &self,
        db: &sqlx::SqlitePool,
        config: &serde_json::Value,
    ) -> Result<String, anyhow::Error> {
        let dirty = portico_storage::index_repo::dirty_count(db, None).await?;
        if dirty == 0 {
            return Ok("dirty queue empty".to_string());
        }
        let job = self
            .jobs
            .submit(
                TASK_APPLY_DIRTY,
                serde_json::json!({ "options": config }),
                "system",
                portico_core::jobs::TriggerType::Scheduled,
            )
            .await?;
        Ok(format!("submitted {} for {dirty} dirty entries", job.job_id))
    }
}

pub async fn run(portico: PorticoConfig) -> Result<(), anyhow::Error> {
    let config = Arc::new(portico.config);
    info!(bind = %config.bind, data_dir = %config.data_dir.display(), "starting portico");

    let pool = db::init(&config.data_dir).await?;
    let secrets = Arc::new(SecretsCrypto::load_or_create(&config.data_dir)?);
    bootstrap::run(&pool, &config).await?;

    let shutdown = CancellationToken::new();
    let fs = Arc::new(FsService::new(
        pool.clone(),
        Arc::new(portico_driver_registry::DriverRegistry::new()),
        secrets,
        Arc::new(DirectoryCache::new()),
        Arc::new(PathTokenSigner::new(config.sign_secret.as_bytes().to_vec())),
        Arc::new(UrlSigner::new(config.sign_secret.as_bytes().to_vec())),
    ));

    // Job runtime: reconcile orphans from a previous process, then register
    // every task type.
    let jobs = Arc::new(JobRegistry::new(pool.clone(), shutdown.clone()));
    jobs.reconcile().await?;
    let index = Arc::new(IndexService::new(pool.clone(), fs.clone()));
    jobs.register(Arc::new(copy::CopyHandler { fs: fs.clone() }));
    jobs.register(Arc::new(RebuildHandler {
        service: index.clone(),
    }));
    jobs.register(Arc::new(ApplyDirtyHandler {
        service: index.clone(),
    }));

    // Upload sessions with TTL garbage collection.
    let session_manager = Arc::new(SessionManager::new(Duration::from_secs(
        config.upload_session_timeout_secs,
    )));
    sessions::spawn_gc_loop(session_manager.clone(), shutdown.clone());
    let upload = Arc::new(UploadEngine::new(
        pool.clone(),
        fs.clone(),
        session_manager,
    ));

    // Scheduled runner, driven by the internal minute ticker.
    let scheduler = Arc::new(ScheduledRunner::new(pool.clone()));
    scheduler.register(Arc::new(handlers::ExpiredShareSweeper));
    scheduler.register(Arc::new(handlers::StalePartsSweeper));
    scheduler.register(Arc::new(handlers::ExpiredTokenSweeper));
    scheduler.register(Arc::new(handlers::ExpiredLockSweeper));
    scheduler.register(Arc::new(ScheduledApplyDirty { jobs: jobs.clone() }));
    {
        let runner = scheduler.clone();
        let shutdown = shutdown.clone();
        spawn_supervised("scheduler", shutdown.clone(), async move {
            runner
                .run_loop(
                    Arc::new(IntervalTicker {
                        period: Duration::from_secs(60),
                    }),
                    shutdown,
                )
                .await;
        });
    }

    let state = AppState {
        config: config.clone(),
        db: pool,
        fs,
        search: Arc::new(SearchService::new()),
        upload,
        jobs,
        index,
        scheduler,
        tickets: Arc::new(UrlSigner::new(config.ticket_secret.as_bytes().to_vec())),
    };

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!(addr = %listener.local_addr()?, "listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, portico_http::router(state))
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = server_shutdown.cancelled() => {}
                _ = shutdown_signal() => {
                    info!("shutdown signal received");
                    server_shutdown.cancel();
                }
            }
        })
        .await?;

    shutdown.cancel();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
