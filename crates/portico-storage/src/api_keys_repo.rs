use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::now;
use crate::password::{random_token, token_digest};

#[derive(Debug, Clone)]
pub struct ApiKey {
    pub id: String,
    pub name: String,
    pub permissions: u32,
    pub basic_path: String,
    pub is_guest: bool,
    pub expires_at: Option<i64>,
    pub created_at: i64,
    /// Storage configs this key may touch; empty set means "all".
    pub storage_acl: Vec<String>,
}

fn key_from_row(row: &sqlx::sqlite::SqliteRow) -> ApiKey {
    ApiKey {
        id: row.get::<String, _>("id"),
        name: row.get::<String, _>("name"),
        permissions: row.get::<i64, _>("permissions") as u32,
        basic_path: row.get::<String, _>("basic_path"),
        is_guest: row.get::<i64, _>("is_guest") != 0,
        expires_at: row.get::<Option<i64>, _>("expires_at"),
        created_at: row.get::<i64, _>("created_at"),
        storage_acl: Vec::new(),
    }
}

async fn load_acl(db: &SqlitePool, key: &mut ApiKey) -> Result<(), anyhow::Error> {
    let rows =
        sqlx::query("SELECT storage_config_id FROM api_key_storage_acl WHERE api_key_id = ?")
            .bind(&key.id)
            .fetch_all(db)
            .await?;
    key.storage_acl = rows
        .iter()
        .map(|r| r.get::<String, _>("storage_config_id"))
        .collect();
    Ok(())
}

/// Create a key; the plaintext secret is returned exactly once.
pub async fn create(
    db: &SqlitePool,
    name: &str,
    permissions: u32,
    basic_path: &str,
    is_guest: bool,
    expires_at: Option<i64>,
) -> Result<(ApiKey, String), anyhow::Error> {
    let now = now();
    let id = Uuid::new_v4().to_string();
    let secret = format!("pk_{}", random_token(24));

    sqlx::query(
        r#"
        INSERT INTO api_keys (id, name, key_hash, permissions, basic_path, is_guest, expires_at, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(name)
    .bind(token_digest(&secret))
    .bind(permissions as i64)
    .bind(basic_path)
    .bind(is_guest as i64)
    .bind(expires_at)
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;

    Ok((
        ApiKey {
            id,
            name: name.to_string(),
            permissions,
            basic_path: basic_path.to_string(),
            is_guest,
            expires_at,
            created_at: now,
            storage_acl: Vec::new(),
        },
        secret,
    ))
}

pub async fn list(db: &SqlitePool) -> Result<Vec<ApiKey>, anyhow::Error> {
    let rows = sqlx::query(
        "SELECT id, name, permissions, basic_path, is_guest, expires_at, created_at FROM api_keys ORDER BY created_at DESC",
    )
    .fetch_all(db)
    .await?;

    let mut keys = Vec::with_capacity(rows.len());
    for row in rows {
        let mut key = key_from_row(&row);
        load_acl(db, &mut key).await?;
        keys.push(key);
    }
    Ok(keys)
}

pub async fn get(db: &SqlitePool, id: &str) -> Result<Option<ApiKey>, anyhow::Error> {
    let row = sqlx::query(
        "SELECT id, name, permissions, basic_path, is_guest, expires_at, created_at FROM api_keys WHERE id = ? LIMIT 1",
    )
    .bind(id)
    .fetch_optional(db)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let mut key = key_from_row(&row);
    load_acl(db, &mut key).await?;
    Ok(Some(key))
}

/// Look up a key by its plaintext secret; expired keys resolve to `None`.
pub async fn validate(db: &SqlitePool, secret: &str) -> Result<Option<ApiKey>, anyhow::Error> {
    let row = sqlx::query(
        "SELECT id, name, permissions, basic_path, is_guest, expires_at, created_at FROM api_keys WHERE key_hash = ? LIMIT 1",
    )
    .bind(token_digest(secret))
    .fetch_optional(db)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let mut key = key_from_row(&row);
    if key.expires_at.is_some_and(|exp| exp <= now()) {
        return Ok(None);
    }
    load_acl(db, &mut key).await?;
    Ok(Some(key))
}

pub async fn update(
    db: &SqlitePool,
    id: &str,
    name: &str,
    permissions: u32,
    basic_path: &str,
    expires_at: Option<i64>,
) -> Result<bool, anyhow::Error> {
    let result = sqlx::query(
        "UPDATE api_keys SET name = ?, permissions = ?, basic_path = ?, expires_at = ?, updated_at = ? WHERE id = ?",
    )
    .bind(name)
    .bind(permissions as i64)
    .bind(basic_path)
    .bind(expires_at)
    .bind(now())
    .bind(id)
    .execute(db)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete(db: &SqlitePool, id: &str) -> Result<bool, anyhow::Error> {
    let result = sqlx::query("DELETE FROM api_keys WHERE id = ?")
        .bind(id)
        .execute(db)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn set_storage_acl(
    db: &SqlitePool,
    id: &str,
    storage_config_ids: &[String],
) -> Result<(), anyhow::Error> {
    let mut tx = db.begin().await?;
    sqlx::query("DELETE FROM api_key_storage_acl WHERE api_key_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    for config_id in storage_config_ids {
        sqlx::query(
            "INSERT OR IGNORE INTO api_key_storage_acl (api_key_id, storage_config_id) VALUES (?, ?)",
        )
        .bind(id)
        .bind(config_id)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}
