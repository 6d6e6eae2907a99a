//! Grouped key/value system settings with typed accessors for the knobs
//! other components read.

use std::collections::BTreeMap;

use sqlx::{Row, SqlitePool};

use crate::now;

/// Setting groups; the admin UI fetches and updates by group.
pub const GROUP_GENERAL: i64 = 1;
pub const GROUP_UPLOAD: i64 = 2;
pub const GROUP_INDEX: i64 = 3;
pub const GROUP_WEBDAV: i64 = 4;

#[derive(Debug, Clone, serde::Serialize)]
pub struct Setting {
    pub key: String,
    pub value: String,
    pub group_id: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SettingMeta {
    pub key: &'static str,
    pub group_id: i64,
    pub default: &'static str,
    pub description: &'static str,
}

/// Every known setting with its default. Unknown keys are rejected on write.
pub const METADATA: &[SettingMeta] = &[
    SettingMeta {
        key: "site_name",
        group_id: GROUP_GENERAL,
        default: "Portico",
        description: "Display name for this installation",
    },
    SettingMeta {
        key: "guest_shares_enabled",
        group_id: GROUP_GENERAL,
        default: "true",
        description: "Whether guest API keys may create shares",
    },
    SettingMeta {
        key: "upload_session_timeout_secs",
        group_id: GROUP_UPLOAD,
        default: "3600",
        description: "Idle TTL for multipart upload sessions",
    },
    SettingMeta {
        key: "max_jobs_per_owner",
        group_id: GROUP_UPLOAD,
        default: "50",
        description: "Queued/running job bound per owner",
    },
    SettingMeta {
        key: "index_dirty_rebuild_threshold",
        group_id: GROUP_INDEX,
        default: "5000",
        description: "Dirty-queue size past which a full rebuild is recommended",
    },
    SettingMeta {
        key: "index_batch_size",
        group_id: GROUP_INDEX,
        default: "200",
        description: "Upsert batch size for index jobs",
    },
    SettingMeta {
        key: "index_max_depth",
        group_id: GROUP_INDEX,
        default: "32",
        description: "Maximum traversal depth for index rebuilds",
    },
    SettingMeta {
        key: "webdav_depth_infinity_cap",
        group_id: GROUP_WEBDAV,
        default: "10000",
        description: "Entry cap for Depth: infinity PROPFIND",
    },
];

pub async fn get(db: &SqlitePool, key: &str) -> Result<Option<String>, anyhow::Error> {
    let row = sqlx::query("SELECT value FROM system_settings WHERE key = ? LIMIT 1")
        .bind(key)
        .fetch_optional(db)
        .await?;
    Ok(row.map(|r| r.get::<String, _>("value")))
}

/// Stored value, or the compiled-in default for known keys.
pub async fn get_or_default(db: &SqlitePool, key: &str) -> Result<Option<String>, anyhow::Error> {
    if let Some(value) = get(db, key).await? {
        return Ok(Some(value));
    }
    Ok(METADATA
        .iter()
        .find(|m| m.key == key)
        .map(|m| m.default.to_string()))
}

pub async fn get_i64(db: &SqlitePool, key: &str) -> Result<Option<i64>, anyhow::Error> {
    Ok(get_or_default(db, key).await?.and_then(|v| v.parse().ok()))
}

pub async fn set(db: &SqlitePool, key: &str, value: &str) -> Result<(), anyhow::Error> {
    let meta = METADATA
        .iter()
        .find(|m| m.key == key)
        .ok_or_else(|| anyhow::anyhow!("unknown setting: {key}"))?;

    sqlx::query(
        r#"
        INSERT INTO system_settings (key, value, group_id, updated_at) VALUES (?, ?, ?, ?)
        ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(value)
    .bind(meta.group_id)
    .bind(now())
    .execute(db)
    .await?;
    Ok(())
}

/// Effective settings for a group: stored values over defaults.
pub async fn group(db: &SqlitePool, group_id: i64) -> Result<BTreeMap<String, String>, anyhow::Error> {
    let mut out = BTreeMap::new();
    for meta in METADATA.iter().filter(|m| m.group_id == group_id) {
        out.insert(meta.key.to_string(), meta.default.to_string());
    }

    let rows = sqlx::query("SELECT key, value FROM system_settings WHERE group_id = ?")
        .bind(group_id)
        .fetch_all(db)
        .await?;
    for row in rows {
        out.insert(row.get::<String, _>("key"), row.get::<String, _>("value"));
    }
    Ok(out)
}

pub async fn all(db: &SqlitePool) -> Result<Vec<Setting>, anyhow::Error> {
    let rows =
        sqlx::query("SELECT key, value, group_id, updated_at FROM system_settings ORDER BY key")
            .fetch_all(db)
            .await?;
    Ok(rows
        .iter()
        .map(|row| Setting {
            key: row.get::<String, _>("key"),
            value: row.get::<String, _>("value"),
            group_id: row.get::<i64, _>("group_id"),
            updated_at: row.get::<i64, _>("updated_at"),
        })
        .collect())
}
