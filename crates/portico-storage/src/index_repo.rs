//! Search-index persistence: entries, trigram FTS shadow (kept in sync by
//! triggers), per-mount state machine rows and the dirty queue.

use sqlx::{Row, SqlitePool};

use crate::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    NotReady,
    Indexing,
    Ready,
    Error,
}

impl IndexStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotReady => "not_ready",
            Self::Indexing => "indexing",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for IndexStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_ready" => Ok(Self::NotReady),
            "indexing" => Ok(Self::Indexing),
            "ready" => Ok(Self::Ready),
            "error" => Ok(Self::Error),
            _ => Err(anyhow::anyhow!("invalid index status")),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexEntry {
    pub mount_id: String,
    pub s3_key: String,
    pub name: String,
    pub path: String,
    pub size: i64,
    pub kind: i64,
    pub modified_ms: Option<i64>,
    pub is_directory: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MountIndexState {
    pub mount_id: String,
    pub status: IndexStatus,
    pub last_indexed_ms: Option<i64>,
    pub updated_at_ms: i64,
    pub last_error: Option<String>,
    pub dirty_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyOp {
    Upsert,
    Delete,
}

impl DirtyOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Delete => "delete",
        }
    }
}

impl std::str::FromStr for DirtyOp {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upsert" => Ok(Self::Upsert),
            "delete" => Ok(Self::Delete),
            _ => Err(anyhow::anyhow!("invalid dirty op")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirtyEntry {
    pub id: i64,
    pub mount_id: String,
    pub op: DirtyOp,
    pub s3_key: String,
    pub enqueued_at_ms: i64,
}

pub async fn upsert_entries(db: &SqlitePool, entries: &[IndexEntry]) -> Result<(), anyhow::Error> {
    let mut tx = db.begin().await?;
    for entry in entries {
        sqlx::query(
            r#"
            INSERT INTO fs_search_index_entries (mount_id, s3_key, name, path, size, kind, modified_ms, is_directory)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (mount_id, s3_key) DO UPDATE SET
                name = excluded.name, path = excluded.path, size = excluded.size,
                kind = excluded.kind, modified_ms = excluded.modified_ms,
                is_directory = excluded.is_directory
            "#,
        )
        .bind(&entry.mount_id)
        .bind(&entry.s3_key)
        .bind(&entry.name)
        .bind(&entry.path)
        .bind(entry.size)
        .bind(entry.kind)
        .bind(entry.modified_ms)
        .bind(entry.is_directory as i64)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Remove the key and everything under `key + '/'`.
pub async fn delete_subtree(
    db: &SqlitePool,
    mount_id: &str,
    s3_key: &str,
) -> Result<u64, anyhow::Error> {
    let result = sqlx::query(
        "DELETE FROM fs_search_index_entries WHERE mount_id = ? AND (s3_key = ? OR s3_key LIKE ? || '/%')",
    )
    .bind(mount_id)
    .bind(s3_key)
    .bind(s3_key)
    .execute(db)
    .await?;
    Ok(result.rows_affected())
}

pub async fn clear_mount(db: &SqlitePool, mount_id: &str) -> Result<(), anyhow::Error> {
    let mut tx = db.begin().await?;
    sqlx::query("DELETE FROM fs_search_index_entries WHERE mount_id = ?")
        .bind(mount_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM fs_search_index_dirty WHERE mount_id = ?")
        .bind(mount_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM fs_search_index_state WHERE mount_id = ?")
        .bind(mount_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn count_entries(db: &SqlitePool, mount_id: &str) -> Result<i64, anyhow::Error> {
    let row = sqlx::query("SELECT COUNT(1) AS n FROM fs_search_index_entries WHERE mount_id = ?")
        .bind(mount_id)
        .fetch_one(db)
        .await?;
    Ok(row.get::<i64, _>("n"))
}

pub async fn set_status(
    db: &SqlitePool,
    mount_id: &str,
    status: IndexStatus,
    last_error: Option<&str>,
) -> Result<(), anyhow::Error> {
    let now = now_ms();
    let last_indexed = if status == IndexStatus::Ready {
        Some(now)
    } else {
        None
    };
    sqlx::query(
        r#"
        INSERT INTO fs_search_index_state (mount_id, status, last_indexed_ms, updated_at_ms, last_error)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (mount_id) DO UPDATE SET
            status = excluded.status,
            last_indexed_ms = COALESCE(excluded.last_indexed_ms, fs_search_index_state.last_indexed_ms),
            updated_at_ms = excluded.updated_at_ms,
            last_error = excluded.last_error
        "#,
    )
    .bind(mount_id)
    .bind(status.as_str())
    .bind(last_indexed)
    .bind(now)
    .bind(last_error)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn get_state(
    db: &SqlitePool,
    mount_id: &str,
) -> Result<Option<MountIndexState>, anyhow::Error> {
    let row = sqlx::query(
        "SELECT mount_id, status, last_indexed_ms, updated_at_ms, last_error FROM fs_search_index_state WHERE mount_id = ? LIMIT 1",
    )
    .bind(mount_id)
    .fetch_optional(db)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let dirty_count = dirty_count(db, Some(mount_id)).await?;
    Ok(Some(MountIndexState {
        mount_id: row.get::<String, _>("mount_id"),
        status: row.get::<String, _>("status").parse()?,
        last_indexed_ms: row.get::<Option<i64>, _>("last_indexed_ms"),
        updated_at_ms: row.get::<i64, _>("updated_at_ms"),
        last_error: row.get::<Option<String>, _>("last_error"),
        dirty_count,
    }))
}

/// Status for a mount that has no state row yet is `not_ready`.
pub async fn status_of(db: &SqlitePool, mount_id: &str) -> Result<IndexStatus, anyhow::Error> {
    Ok(get_state(db, mount_id)
        .await?
        .map(|s| s.status)
        .unwrap_or(IndexStatus::NotReady))
}

pub async fn enqueue_dirty(
    db: &SqlitePool,
    mount_id: &str,
    op: DirtyOp,
    s3_key: &str,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        "INSERT INTO fs_search_index_dirty (mount_id, op, s3_key, enqueued_at_ms) VALUES (?, ?, ?, ?)",
    )
    .bind(mount_id)
    .bind(op.as_str())
    .bind(s3_key)
    .bind(now_ms())
    .execute(db)
    .await?;
    Ok(())
}

pub async fn dirty_count(db: &SqlitePool, mount_id: Option<&str>) -> Result<i64, anyhow::Error> {
    let row = match mount_id {
        Some(mount_id) => {
            sqlx::query("SELECT COUNT(1) AS n FROM fs_search_index_dirty WHERE mount_id = ?")
                .bind(mount_id)
                .fetch_one(db)
                .await?
        }
        None => {
            sqlx::query("SELECT COUNT(1) AS n FROM fs_search_index_dirty")
                .fetch_one(db)
                .await?
        }
    };
    Ok(row.get::<i64, _>("n"))
}

/// Pop the oldest `limit` dirty entries for a mount (FIFO).
pub async fn take_dirty_batch(
    db: &SqlitePool,
    mount_id: &str,
    limit: i64,
) -> Result<Vec<DirtyEntry>, anyhow::Error> {
    let rows = sqlx::query(
        "SELECT id, mount_id, op, s3_key, enqueued_at_ms FROM fs_search_index_dirty WHERE mount_id = ? ORDER BY id LIMIT ?",
    )
    .bind(mount_id)
    .bind(limit)
    .fetch_all(db)
    .await?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in &rows {
        entries.push(DirtyEntry {
            id: row.get::<i64, _>("id"),
            mount_id: row.get::<String, _>("mount_id"),
            op: row.get::<String, _>("op").parse()?,
            s3_key: row.get::<String, _>("s3_key"),
            enqueued_at_ms: row.get::<i64, _>("enqueued_at_ms"),
        });
    }

    if !entries.is_empty() {
        let mut tx = db.begin().await?;
        for entry in &entries {
            sqlx::query("DELETE FROM fs_search_index_dirty WHERE id = ?")
                .bind(entry.id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
    }
    Ok(entries)
}

/// Escape a user query for an FTS5 MATCH: quoted string, embedded quotes
/// doubled. The trigram tokenizer then does substring matching.
fn fts_match_query(query: &str) -> String {
    format!("\"{}\"", query.replace('"', "\"\""))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCursor {
    pub mount_id: String,
    pub s3_key: String,
}

pub async fn search(
    db: &SqlitePool,
    query: &str,
    mount_ids: &[String],
    key_prefix: Option<&str>,
    cursor: Option<&SearchCursor>,
    limit: i64,
) -> Result<Vec<IndexEntry>, anyhow::Error> {
    if mount_ids.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; mount_ids.len()].join(", ");
    let prefix_clause = if key_prefix.is_some() {
        " AND (e.s3_key = ? OR e.s3_key LIKE ? || '/%')"
    } else {
        ""
    };
    let cursor_clause = if cursor.is_some() {
        " AND (e.mount_id, e.s3_key) > (?, ?)"
    } else {
        ""
    };
    let sql = format!(
        r#"
        SELECT e.mount_id, e.s3_key, e.name, e.path, e.size, e.kind, e.modified_ms, e.is_directory
        FROM fs_search_index_fts f
        JOIN fs_search_index_entries e ON e.rowid = f.rowid
        WHERE fs_search_index_fts MATCH ? AND e.mount_id IN ({placeholders}){prefix_clause}{cursor_clause}
        ORDER BY e.mount_id, e.s3_key
        LIMIT ?
        "#,
    );

    let mut q = sqlx::query(&sql).bind(fts_match_query(query));
    for mount_id in mount_ids {
        q = q.bind(mount_id);
    }
    if let Some(prefix) = key_prefix {
        q = q.bind(prefix).bind(prefix);
    }
    if let Some(cursor) = cursor {
        q = q.bind(&cursor.mount_id).bind(&cursor.s3_key);
    }
    let rows = q.bind(limit).fetch_all(db).await?;

    Ok(rows
        .iter()
        .map(|row| IndexEntry {
            mount_id: row.get::<String, _>("mount_id"),
            s3_key: row.get::<String, _>("s3_key"),
            name: row.get::<String, _>("name"),
            path: row.get::<String, _>("path"),
            size: row.get::<i64, _>("size"),
            kind: row.get::<i64, _>("kind"),
            modified_ms: row.get::<Option<i64>, _>("modified_ms"),
            is_directory: row.get::<i64, _>("is_directory") != 0,
        })
        .collect())
}
