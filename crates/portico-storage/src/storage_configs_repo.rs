use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::now;

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub id: String,
    pub name: String,
    pub storage_type: String,
    pub provider_type: Option<String>,
    pub settings: serde_json::Value,
    /// Sealed blob; decrypt through `SecretsCrypto` before handing to the
    /// driver registry.
    pub credentials_enc: String,
    pub default_folder: String,
    pub is_public: bool,
    pub total_storage_bytes: Option<i64>,
    pub is_default: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<StorageConfig, anyhow::Error> {
    let settings_json = row.get::<String, _>("settings_json");
    Ok(StorageConfig {
        id: row.get::<String, _>("id"),
        name: row.get::<String, _>("name"),
        storage_type: row.get::<String, _>("storage_type"),
        provider_type: row.get::<Option<String>, _>("provider_type"),
        settings: serde_json::from_str(&settings_json)?,
        credentials_enc: row.get::<String, _>("credentials_enc"),
        default_folder: row.get::<String, _>("default_folder"),
        is_public: row.get::<i64, _>("is_public") != 0,
        total_storage_bytes: row.get::<Option<i64>, _>("total_storage_bytes"),
        is_default: row.get::<i64, _>("is_default") != 0,
        created_at: row.get::<i64, _>("created_at"),
        updated_at: row.get::<i64, _>("updated_at"),
    })
}

const COLUMNS: &str = "id, name, storage_type, provider_type, settings_json, credentials_enc, default_folder, is_public, total_storage_bytes, is_default, created_at, updated_at";

#[allow(clippy::too_many_arguments)]
pub async fn create(
    db: &SqlitePool,
    name: &str,
    storage_type: &str,
    provider_type: Option<&str>,
    settings: serde_json::Value,
    credentials_enc: String,
    default_folder: &str,
    is_public: bool,
    total_storage_bytes: Option<i64>,
) -> Result<StorageConfig, anyhow::Error> {
    let now = now();
    let id = Uuid::new_v4().to_string();
    let settings_json = serde_json::to_string(&settings)?;

    sqlx::query(
        r#"
        INSERT INTO storage_configs
            (id, name, storage_type, provider_type, settings_json, credentials_enc, default_folder, is_public, total_storage_bytes, is_default, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(name)
    .bind(storage_type)
    .bind(provider_type)
    .bind(&settings_json)
    .bind(&credentials_enc)
    .bind(default_folder)
    .bind(is_public as i64)
    .bind(total_storage_bytes)
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;

    Ok(StorageConfig {
        id,
        name: name.to_string(),
        storage_type: storage_type.to_string(),
        provider_type: provider_type.map(str::to_string),
        settings,
        credentials_enc,
        default_folder: default_folder.to_string(),
        is_public,
        total_storage_bytes,
        is_default: false,
        created_at: now,
        updated_at: now,
    })
}

pub async fn get(db: &SqlitePool, id: &str) -> Result<Option<StorageConfig>, anyhow::Error> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM storage_configs WHERE id = ? LIMIT 1"
    ))
    .bind(id)
    .fetch_optional(db)
    .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn list(db: &SqlitePool) -> Result<Vec<StorageConfig>, anyhow::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM storage_configs ORDER BY created_at"
    ))
    .fetch_all(db)
    .await?;
    rows.iter().map(from_row).collect()
}

#[allow(clippy::too_many_arguments)]
pub async fn update(
    db: &SqlitePool,
    id: &str,
    name: &str,
    settings: serde_json::Value,
    credentials_enc: Option<String>,
    default_folder: &str,
    is_public: bool,
    total_storage_bytes: Option<i64>,
) -> Result<bool, anyhow::Error> {
    let settings_json = serde_json::to_string(&settings)?;
    let result = match credentials_enc {
        Some(credentials_enc) => {
            sqlx::query(
                "UPDATE storage_configs SET name = ?, settings_json = ?, credentials_enc = ?, default_folder = ?, is_public = ?, total_storage_bytes = ?, updated_at = ? WHERE id = ?",
            )
            .bind(name)
            .bind(&settings_json)
            .bind(&credentials_enc)
            .bind(default_folder)
            .bind(is_public as i64)
            .bind(total_storage_bytes)
            .bind(now())
            .bind(id)
            .execute(db)
            .await?
        }
        None => {
            sqlx::query(
                "UPDATE storage_configs SET name = ?, settings_json = ?, default_folder = ?, is_public = ?, total_storage_bytes = ?, updated_at = ? WHERE id = ?",
            )
            .bind(name)
            .bind(&settings_json)
            .bind(default_folder)
            .bind(is_public as i64)
            .bind(total_storage_bytes)
            .bind(now())
            .bind(id)
            .execute(db)
            .await?
        }
    };
    Ok(result.rows_affected() > 0)
}

pub async fn delete(db: &SqlitePool, id: &str) -> Result<bool, anyhow::Error> {
    let result = sqlx::query("DELETE FROM storage_configs WHERE id = ?")
        .bind(id)
        .execute(db)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Exactly one default config: setting one clears all others in the same
/// transaction.
pub async fn set_default(db: &SqlitePool, id: &str) -> Result<bool, anyhow::Error> {
    let mut tx = db.begin().await?;
    sqlx::query("UPDATE storage_configs SET is_default = 0 WHERE is_default = 1")
        .execute(&mut *tx)
        .await?;
    let result = sqlx::query("UPDATE storage_configs SET is_default = 1, updated_at = ? WHERE id = ?")
        .bind(now())
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(result.rows_affected() > 0)
}
