//! First-run provisioning: the initial admin account and the default
//! maintenance schedule.

use sqlx::SqlitePool;
use tracing::{info, warn};

use portico_config::Config;
use portico_storage::scheduled_repo::{self, ScheduleType};
use portico_storage::admins_repo;

pub async fn run(db: &SqlitePool, config: &Config) -> Result<(), anyhow::Error> {
    if admins_repo::count(db).await? == 0 {
        match config.admin_init_password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => {
                admins_repo::create(db, "admin", password).await?;
                info!("created initial admin account 'admin'");
            }
            None => {
                warn!(
                    "no admin account exists and ADMIN_INIT_PASSWORD is unset; \
                     the admin API will be unusable until one is provided"
                );
            }
        }
    }

    ensure_default_schedules(db).await?;
    Ok(())
}

/// Maintenance tasks every install carries. Created once; admins can tune
/// or disable them afterwards.
async fn ensure_default_schedules(db: &SqlitePool) -> Result<(), anyhow::Error> {
    const DEFAULTS: &[(&str, i64)] = &[
        ("clear_expired_shares", 3600),
        ("prune_upload_parts", 6 * 3600),
        ("prune_admin_tokens", 3600),
        ("prune_webdav_locks", 600),
        ("fs_index_apply_dirty", 300),
    ];

    let existing = scheduled_repo::list(db).await?;
    for (handler_id, interval_sec) in DEFAULTS {
        if existing.iter().any(|j| j.handler_id == *handler_id) {
            continue;
        }
        scheduled_repo::create(
            db,
            handler_id,
            ScheduleType::Interval,
            Some(*interval_sec),
            None,
            true,
            serde_json::json!({}),
        )
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use portico_storage::{admins_repo, db, scheduled_repo};

    fn config(password: Option<&str>) -> portico_config::Config {
        portico_config::Config {
            bind: "127.0.0.1:0".parse().unwrap(),
            data_dir: std::env::temp_dir(),
            admin_init_password: password.map(str::to_string),
            sign_secret: "s".to_string(),
            ticket_secret: "t".to_string(),
            cache_ttl_default_secs: 300,
            upload_session_timeout_secs: 3600,
            debug_errors: false,
        }
    }

    #[tokio::test]
    async fn bootstrap_creates_admin_and_schedules_once() {
        let pool = db::init_in_memory().await.unwrap();
        super::run(&pool, &config(Some("bootpw"))).await.unwrap();

        assert_eq!(admins_repo::count(&pool).await.unwrap(), 1);
        let schedules = scheduled_repo::list(&pool).await.unwrap();
        assert_eq!(schedules.len(), 5);

        // Idempotent on restart.
        super::run(&pool, &config(Some("other"))).await.unwrap();
        assert_eq!(admins_repo::count(&pool).await.unwrap(), 1);
        assert_eq!(scheduled_repo::list(&pool).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn missing_init_password_is_tolerated() {
        let pool = db::init_in_memory().await.unwrap();
        super::run(&pool, &config(None)).await.unwrap();
        assert_eq!(admins_repo::count(&pool).await.unwrap(), 0);
    }
}
