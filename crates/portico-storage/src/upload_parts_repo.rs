//! Persistent parts ledger rows.
//!
//! One table serves both persistence flavors: `client_keeps` ledgers key
//! rows by storage key, `server_records` by upload id. Rows expire after
//! 24 hours of inactivity.

use sqlx::{Row, SqlitePool};

use crate::now;

pub const PART_TTL_SECS: i64 = 24 * 3600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartRow {
    pub part_number: u32,
    pub etag: Option<String>,
    pub size: i64,
}

pub async fn record_part(
    db: &SqlitePool,
    ledger_key: &str,
    part_number: u32,
    etag: Option<&str>,
    size: i64,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        r#"
        INSERT INTO upload_parts (ledger_key, part_number, etag, size, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (ledger_key, part_number) DO UPDATE SET
            etag = excluded.etag, size = excluded.size, updated_at = excluded.updated_at
        "#,
    )
    .bind(ledger_key)
    .bind(part_number as i64)
    .bind(etag)
    .bind(size)
    .bind(now())
    .execute(db)
    .await?;
    Ok(())
}

pub async fn replace_all(
    db: &SqlitePool,
    ledger_key: &str,
    parts: &[PartRow],
) -> Result<(), anyhow::Error> {
    let now = now();
    let mut tx = db.begin().await?;
    sqlx::query("DELETE FROM upload_parts WHERE ledger_key = ?")
        .bind(ledger_key)
        .execute(&mut *tx)
        .await?;
    for part in parts {
        sqlx::query(
            "INSERT INTO upload_parts (ledger_key, part_number, etag, size, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(ledger_key)
        .bind(part.part_number as i64)
        .bind(&part.etag)
        .bind(part.size)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn load(db: &SqlitePool, ledger_key: &str) -> Result<Vec<PartRow>, anyhow::Error> {
    let rows = sqlx::query(
        "SELECT part_number, etag, size FROM upload_parts WHERE ledger_key = ? ORDER BY part_number",
    )
    .bind(ledger_key)
    .fetch_all(db)
    .await?;

    Ok(rows
        .iter()
        .map(|row| PartRow {
            part_number: row.get::<i64, _>("part_number") as u32,
            etag: row.get::<Option<String>, _>("etag"),
            size: row.get::<i64, _>("size"),
        })
        .collect())
}

pub async fn clear(db: &SqlitePool, ledger_key: &str) -> Result<(), anyhow::Error> {
    sqlx::query("DELETE FROM upload_parts WHERE ledger_key = ?")
        .bind(ledger_key)
        .execute(db)
        .await?;
    Ok(())
}

pub async fn prune_stale(db: &SqlitePool) -> Result<u64, anyhow::Error> {
    let result = sqlx::query("DELETE FROM upload_parts WHERE updated_at <= ?")
        .bind(now() - PART_TTL_SECS)
        .execute(db)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use crate::db;

    use super::PartRow;

    #[tokio::test]
    async fn record_load_clear_round_trip() {
        let pool = db::init_in_memory().await.unwrap();
        super::record_part(&pool, "upload-1", 2, Some("e2"), 5).await.unwrap();
        super::record_part(&pool, "upload-1", 1, Some("e1"), 5).await.unwrap();
        super::record_part(&pool, "upload-1", 1, Some("e1b"), 5).await.unwrap();

        let parts = super::load(&pool, "upload-1").await.unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].part_number, 1);
        assert_eq!(parts[0].etag.as_deref(), Some("e1b"));

        super::clear(&pool, "upload-1").await.unwrap();
        assert!(super::load(&pool, "upload-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replace_all_swaps_the_ledger() {
        let pool = db::init_in_memory().await.unwrap();
        super::record_part(&pool, "k", 9, Some("old"), 1).await.unwrap();
        super::replace_all(
            &pool,
            "k",
            &[
                PartRow {
                    part_number: 1,
                    etag: Some("a".to_string()),
                    size: 5,
                },
                PartRow {
                    part_number: 2,
                    etag: Some("b".to_string()),
                    size: 5,
                },
            ],
        )
        .await
        .unwrap();

        let parts = super::load(&pool, "k").await.unwrap();
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|p| p.part_number <= 2));
    }
}
