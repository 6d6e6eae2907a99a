//! WebDAV lock persistence. Locks live in the database so they survive
//! restarts and gate mutations across workers.

use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::now;

pub const MAX_LOCK_TTL_SECS: i64 = 3600;

#[derive(Debug, Clone, serde::Serialize)]
pub struct Lock {
    pub token: String,
    pub path: String,
    /// `"0"` or `"infinity"`.
    pub depth: String,
    /// `"exclusive"` or `"shared"`.
    pub scope: String,
    pub owner: String,
    pub expires_at: i64,
}

fn from_row(row: &sqlx::sqlite::SqliteRow) -> Lock {
    Lock {
        token: row.get::<String, _>("token"),
        path: row.get::<String, _>("path"),
        depth: row.get::<String, _>("depth"),
        scope: row.get::<String, _>("scope"),
        owner: row.get::<String, _>("owner"),
        expires_at: row.get::<i64, _>("expires_at"),
    }
}

pub async fn create(
    db: &SqlitePool,
    path: &str,
    depth: &str,
    scope: &str,
    owner: &str,
    ttl_secs: i64,
) -> Result<Lock, anyhow::Error> {
    let token = format!("opaquelocktoken:{}", Uuid::new_v4());
    let expires_at = now() + ttl_secs.clamp(1, MAX_LOCK_TTL_SECS);

    sqlx::query(
        "INSERT INTO webdav_locks (token, path, depth, scope, owner, expires_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&token)
    .bind(path)
    .bind(depth)
    .bind(scope)
    .bind(owner)
    .bind(expires_at)
    .execute(db)
    .await?;

    Ok(Lock {
        token,
        path: path.to_string(),
        depth: depth.to_string(),
        scope: scope.to_string(),
        owner: owner.to_string(),
        expires_at,
    })
}

pub async fn get(db: &SqlitePool, token: &str) -> Result<Option<Lock>, anyhow::Error> {
    let row = sqlx::query(
        "SELECT token, path, depth, scope, owner, expires_at FROM webdav_locks WHERE token = ? LIMIT 1",
    )
    .bind(token)
    .fetch_optional(db)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let lock = from_row(&row);
    if lock.expires_at <= now() {
        return Ok(None);
    }
    Ok(Some(lock))
}

/// Active locks covering `path`: a lock on the path itself, or a
/// depth-infinity lock on any ancestor.
pub async fn locks_covering(db: &SqlitePool, path: &str) -> Result<Vec<Lock>, anyhow::Error> {
    let rows = sqlx::query(
        "SELECT token, path, depth, scope, owner, expires_at FROM webdav_locks WHERE expires_at > ?",
    )
    .bind(now())
    .fetch_all(db)
    .await?;

    Ok(rows
        .iter()
        .map(from_row)
        .filter(|lock| {
            lock.path == path
                || (lock.depth == "infinity"
                    && portico_core::paths::is_within(path, &lock.path))
        })
        .collect())
}

pub async fn refresh(db: &SqlitePool, token: &str, ttl_secs: i64) -> Result<bool, anyhow::Error> {
    let result = sqlx::query("UPDATE webdav_locks SET expires_at = ? WHERE token = ? AND expires_at > ?")
        .bind(now() + ttl_secs.clamp(1, MAX_LOCK_TTL_SECS))
        .bind(token)
        .bind(now())
        .execute(db)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete(db: &SqlitePool, token: &str) -> Result<bool, anyhow::Error> {
    let result = sqlx::query("DELETE FROM webdav_locks WHERE token = ?")
        .bind(token)
        .execute(db)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn prune_expired(db: &SqlitePool) -> Result<u64, anyhow::Error> {
    let result = sqlx::query("DELETE FROM webdav_locks WHERE expires_at <= ?")
        .bind(now())
        .execute(db)
        .await?;
    Ok(result.rows_affected())
}
