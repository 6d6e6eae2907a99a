use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::now;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Interval,
    Cron,
}

impl ScheduleType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interval => "interval",
            Self::Cron => "cron",
        }
    }
}

impl std::str::FromStr for ScheduleType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interval" => Ok(Self::Interval),
            "cron" => Ok(Self::Cron),
            _ => Err(anyhow::anyhow!("invalid schedule type")),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ScheduledJob {
    pub task_id: String,
    pub handler_id: String,
    pub schedule_type: ScheduleType,
    pub interval_sec: Option<i64>,
    pub cron_expression: Option<String>,
    pub enabled: bool,
    pub config: serde_json::Value,
    pub created_at: i64,
    pub updated_at: i64,
}

fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ScheduledJob, anyhow::Error> {
    let config_json = row.get::<String, _>("config_json");
    Ok(ScheduledJob {
        task_id: row.get::<String, _>("task_id"),
        handler_id: row.get::<String, _>("handler_id"),
        schedule_type: row.get::<String, _>("schedule_type").parse()?,
        interval_sec: row.get::<Option<i64>, _>("interval_sec"),
        cron_expression: row.get::<Option<String>, _>("cron_expression"),
        enabled: row.get::<i64, _>("enabled") != 0,
        config: serde_json::from_str(&config_json)?,
        created_at: row.get::<i64, _>("created_at"),
        updated_at: row.get::<i64, _>("updated_at"),
    })
}

const COLUMNS: &str = "task_id, handler_id, schedule_type, interval_sec, cron_expression, enabled, config_json, created_at, updated_at";

pub async fn create(
    db: &SqlitePool,
    handler_id: &str,
    schedule_type: ScheduleType,
    interval_sec: Option<i64>,
    cron_expression: Option<&str>,
    enabled: bool,
    config: serde_json::Value,
) -> Result<ScheduledJob, anyhow::Error> {
    let now = now();
    let task_id = Uuid::new_v4().to_string();

    sqlx::query(
        r#"
        INSERT INTO scheduled_jobs (task_id, handler_id, schedule_type, interval_sec, cron_expression, enabled, config_json, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&task_id)
    .bind(handler_id)
    .bind(schedule_type.as_str())
    .bind(interval_sec)
    .bind(cron_expression)
    .bind(enabled as i64)
    .bind(serde_json::to_string(&config)?)
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;

    Ok(ScheduledJob {
        task_id,
        handler_id: handler_id.to_string(),
        schedule_type,
        interval_sec,
        cron_expression: cron_expression.map(str::to_string),
        enabled,
        config,
        created_at: now,
        updated_at: now,
    })
}

pub async fn get(db: &SqlitePool, task_id: &str) -> Result<Option<ScheduledJob>, anyhow::Error> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM scheduled_jobs WHERE task_id = ? LIMIT 1"
    ))
    .bind(task_id)
    .fetch_optional(db)
    .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn list(db: &SqlitePool) -> Result<Vec<ScheduledJob>, anyhow::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM scheduled_jobs ORDER BY created_at"
    ))
    .fetch_all(db)
    .await?;
    rows.iter().map(from_row).collect()
}

pub async fn update(
    db: &SqlitePool,
    task_id: &str,
    schedule_type: ScheduleType,
    interval_sec: Option<i64>,
    cron_expression: Option<&str>,
    enabled: bool,
    config: serde_json::Value,
) -> Result<bool, anyhow::Error> {
    let result = sqlx::query(
        r#"
        UPDATE scheduled_jobs SET schedule_type = ?, interval_sec = ?, cron_expression = ?, enabled = ?, config_json = ?, updated_at = ?
        WHERE task_id = ?
        "#,
    )
    .bind(schedule_type.as_str())
    .bind(interval_sec)
    .bind(cron_expression)
    .bind(enabled as i64)
    .bind(serde_json::to_string(&config)?)
    .bind(now())
    .bind(task_id)
    .execute(db)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete(db: &SqlitePool, task_id: &str) -> Result<bool, anyhow::Error> {
    let result = sqlx::query("DELETE FROM scheduled_jobs WHERE task_id = ?")
        .bind(task_id)
        .execute(db)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ScheduledRun {
    pub id: String,
    pub task_id: String,
    pub trigger_type: String,
    pub status: String,
    pub message: Option<String>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

pub async fn record_run_start(
    db: &SqlitePool,
    task_id: &str,
    trigger_type: &str,
) -> Result<String, anyhow::Error> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO scheduled_runs (id, task_id, trigger_type, status, started_at) VALUES (?, ?, ?, 'running', ?)",
    )
    .bind(&id)
    .bind(task_id)
    .bind(trigger_type)
    .bind(now())
    .execute(db)
    .await?;
    Ok(id)
}

pub async fn record_run_finish(
    db: &SqlitePool,
    run_id: &str,
    status: &str,
    message: Option<&str>,
) -> Result<(), anyhow::Error> {
    sqlx::query("UPDATE scheduled_runs SET status = ?, message = ?, finished_at = ? WHERE id = ?")
        .bind(status)
        .bind(message)
        .bind(now())
        .bind(run_id)
        .execute(db)
        .await?;
    Ok(())
}

pub async fn list_runs(
    db: &SqlitePool,
    task_id: &str,
    limit: i64,
) -> Result<Vec<ScheduledRun>, anyhow::Error> {
    let rows = sqlx::query(
        "SELECT id, task_id, trigger_type, status, message, started_at, finished_at FROM scheduled_runs WHERE task_id = ? ORDER BY started_at DESC LIMIT ?",
    )
    .bind(task_id)
    .bind(limit)
    .fetch_all(db)
    .await?;

    Ok(rows
        .iter()
        .map(|row| ScheduledRun {
            id: row.get::<String, _>("id"),
            task_id: row.get::<String, _>("task_id"),
            trigger_type: row.get::<String, _>("trigger_type"),
            status: row.get::<String, _>("status"),
            message: row.get::<Option<String>, _>("message"),
            started_at: row.get::<i64, _>("started_at"),
            finished_at: row.get::<Option<i64>, _>("finished_at"),
        })
        .collect())
}
