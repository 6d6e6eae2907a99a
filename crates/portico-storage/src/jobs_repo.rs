use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use portico_core::jobs::{JobStats, JobStatus, TriggerType};

use crate::{now, now_ms};

#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: String,
    pub task_type: String,
    pub status: JobStatus,
    pub stats: JobStats,
    pub payload: serde_json::Value,
    pub owner: String,
    pub trigger_type: TriggerType,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub updated_at_ms: i64,
}

fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Job, anyhow::Error> {
    let stats_json = row.get::<String, _>("stats_json");
    let payload_json = row.get::<String, _>("payload_json");
    Ok(Job {
        job_id: row.get::<String, _>("job_id"),
        task_type: row.get::<String, _>("task_type"),
        status: row.get::<String, _>("status").parse()?,
        stats: serde_json::from_str(&stats_json)?,
        payload: serde_json::from_str(&payload_json)?,
        owner: row.get::<String, _>("owner"),
        trigger_type: row.get::<String, _>("trigger_type").parse()?,
        error_message: row.get::<Option<String>, _>("error_message"),
        created_at: row.get::<i64, _>("created_at"),
        started_at: row.get::<Option<i64>, _>("started_at"),
        finished_at: row.get::<Option<i64>, _>("finished_at"),
        updated_at_ms: row.get::<i64, _>("updated_at_ms"),
    })
}

const COLUMNS: &str = "job_id, task_type, status, stats_json, payload_json, owner, trigger_type, error_message, created_at, started_at, finished_at, updated_at_ms";

pub async fn create(
    db: &SqlitePool,
    task_type: &str,
    payload: serde_json::Value,
    owner: &str,
    trigger_type: TriggerType,
) -> Result<Job, anyhow::Error> {
    let now = now();
    let job_id = Uuid::new_v4().to_string();
    let stats = JobStats::default();

    sqlx::query(
        r#"
        INSERT INTO jobs (job_id, task_type, status, stats_json, payload_json, owner, trigger_type, created_at, updated_at_ms)
        VALUES (?, ?, 'pending', ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&job_id)
    .bind(task_type)
    .bind(serde_json::to_string(&stats)?)
    .bind(serde_json::to_string(&payload)?)
    .bind(owner)
    .bind(trigger_type.as_str())
    .bind(now)
    .bind(now_ms())
    .execute(db)
    .await?;

    Ok(Job {
        job_id,
        task_type: task_type.to_string(),
        status: JobStatus::Pending,
        stats,
        payload,
        owner: owner.to_string(),
        trigger_type,
        error_message: None,
        created_at: now,
        started_at: None,
        finished_at: None,
        updated_at_ms: now_ms(),
    })
}

pub async fn get(db: &SqlitePool, job_id: &str) -> Result<Option<Job>, anyhow::Error> {
    let row = sqlx::query(&format!("SELECT {COLUMNS} FROM jobs WHERE job_id = ? LIMIT 1"))
        .bind(job_id)
        .fetch_optional(db)
        .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn list(db: &SqlitePool, owner: Option<&str>) -> Result<Vec<Job>, anyhow::Error> {
    let rows = match owner {
        Some(owner) => {
            sqlx::query(&format!(
                "SELECT {COLUMNS} FROM jobs WHERE owner = ? ORDER BY created_at DESC"
            ))
            .bind(owner)
            .fetch_all(db)
            .await?
        }
        None => {
            sqlx::query(&format!("SELECT {COLUMNS} FROM jobs ORDER BY created_at DESC"))
                .fetch_all(db)
                .await?
        }
    };
    rows.iter().map(from_row).collect()
}

pub async fn count_active_for_owner(db: &SqlitePool, owner: &str) -> Result<i64, anyhow::Error> {
    let row = sqlx::query(
        "SELECT COUNT(1) AS n FROM jobs WHERE owner = ? AND status IN ('pending', 'running', 'cancelling')",
    )
    .bind(owner)
    .fetch_one(db)
    .await?;
    Ok(row.get::<i64, _>("n"))
}

pub async fn mark_started(db: &SqlitePool, job_id: &str) -> Result<(), anyhow::Error> {
    sqlx::query(
        "UPDATE jobs SET status = 'running', started_at = ?, updated_at_ms = ? WHERE job_id = ?",
    )
    .bind(now())
    .bind(now_ms())
    .bind(job_id)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn update_status(
    db: &SqlitePool,
    job_id: &str,
    status: JobStatus,
) -> Result<(), anyhow::Error> {
    sqlx::query("UPDATE jobs SET status = ?, updated_at_ms = ? WHERE job_id = ?")
        .bind(status.as_str())
        .bind(now_ms())
        .bind(job_id)
        .execute(db)
        .await?;
    Ok(())
}

pub async fn update_stats(
    db: &SqlitePool,
    job_id: &str,
    stats: &JobStats,
) -> Result<(), anyhow::Error> {
    sqlx::query("UPDATE jobs SET stats_json = ?, updated_at_ms = ? WHERE job_id = ?")
        .bind(serde_json::to_string(stats)?)
        .bind(now_ms())
        .bind(job_id)
        .execute(db)
        .await?;
    Ok(())
}

pub async fn finish(
    db: &SqlitePool,
    job_id: &str,
    status: JobStatus,
    stats: &JobStats,
    error_message: Option<&str>,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        r#"
        UPDATE jobs SET status = ?, stats_json = ?, error_message = ?, finished_at = ?, updated_at_ms = ?
        WHERE job_id = ?
        "#,
    )
    .bind(status.as_str())
    .bind(serde_json::to_string(stats)?)
    .bind(error_message)
    .bind(now())
    .bind(now_ms())
    .bind(job_id)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn delete(db: &SqlitePool, job_id: &str) -> Result<bool, anyhow::Error> {
    let result = sqlx::query("DELETE FROM jobs WHERE job_id = ?")
        .bind(job_id)
        .execute(db)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Startup reconciliation: any job still marked running belonged to a dead
/// worker.
pub async fn fail_orphaned_running(db: &SqlitePool) -> Result<u64, anyhow::Error> {
    let result = sqlx::query(
        r#"
        UPDATE jobs SET status = 'failed', error_message = 'worker lost', finished_at = ?, updated_at_ms = ?
        WHERE status IN ('running', 'cancelling')
        "#,
    )
    .bind(now())
    .bind(now_ms())
    .execute(db)
    .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use portico_core::jobs::{JobStats, JobStatus, TriggerType};

    use crate::db;

    #[tokio::test]
    async fn lifecycle_round_trip() {
        let pool = db::init_in_memory().await.unwrap();
        let job = super::create(
            &pool,
            "copy",
            serde_json::json!({"items": []}),
            "admin",
            TriggerType::Api,
        )
        .await
        .unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        super::mark_started(&pool, &job.job_id).await.unwrap();
        let mut stats = JobStats::default();
        stats.total_items = 3;
        stats.processed_items = 3;
        stats.success_count = 3;
        super::finish(&pool, &job.job_id, JobStatus::Completed, &stats, None)
            .await
            .unwrap();

        let loaded = super::get(&pool, &job.job_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Completed);
        assert_eq!(loaded.stats.processed_items, 3);
        assert!(loaded.finished_at.is_some());
    }

    #[tokio::test]
    async fn orphaned_running_jobs_fail_on_reconcile() {
        let pool = db::init_in_memory().await.unwrap();
        let job = super::create(&pool, "copy", serde_json::json!({}), "a", TriggerType::Api)
            .await
            .unwrap();
        super::mark_started(&pool, &job.job_id).await.unwrap();

        assert_eq!(super::fail_orphaned_running(&pool).await.unwrap(), 1);
        let loaded = super::get(&pool, &job.job_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert_eq!(loaded.error_message.as_deref(), Some("worker lost"));
    }
}
