//! Configuration backup: JSON export/restore of the durable config tables.
//!
//! Derived state (`fs_search_index_*`) and transient rows (tokens, locks,
//! jobs) are excluded; an index rebuild recreates the former.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::{Column as _, Row, SqlitePool, ValueRef as _};

pub const BACKUP_FORMAT_VERSION: u32 = 1;

/// Tables included in a backup, in restore order (FK parents first).
pub const MODULES: &[&str] = &[
    "admins",
    "storage_configs",
    "api_keys",
    "api_key_storage_acl",
    "mounts",
    "share_records",
    "system_settings",
    "fs_meta",
    "scheduled_jobs",
];

#[derive(Debug, Serialize, Deserialize)]
pub struct BackupFile {
    pub version: u32,
    pub created_at: i64,
    pub modules: BTreeMap<String, Vec<serde_json::Map<String, serde_json::Value>>>,
}

#[derive(Debug, Serialize)]
pub struct RestorePreview {
    pub version: u32,
    pub modules: BTreeMap<String, usize>,
    pub unknown_modules: Vec<String>,
    pub integrity_issues: Vec<String>,
}

fn value_to_json(row: &sqlx::sqlite::SqliteRow, idx: usize) -> serde_json::Value {
    let raw = row.try_get_raw(idx).ok();
    if raw.is_some_and(|r| r.is_null()) {
        return serde_json::Value::Null;
    }
    if let Ok(v) = row.try_get::<i64, _>(idx) {
        return serde_json::Value::from(v);
    }
    if let Ok(v) = row.try_get::<f64, _>(idx) {
        return serde_json::Value::from(v);
    }
    if let Ok(v) = row.try_get::<String, _>(idx) {
        return serde_json::Value::from(v);
    }
    serde_json::Value::Null
}

pub async fn export(db: &SqlitePool, modules: Option<&[String]>) -> Result<BackupFile, anyhow::Error> {
    let selected: Vec<&str> = match modules {
        Some(requested) => MODULES
            .iter()
            .copied()
            .filter(|m| requested.iter().any(|r| r == m))
            .collect(),
        None => MODULES.to_vec(),
    };

    let mut out = BTreeMap::new();
    for table in selected {
        let rows = sqlx::query(&format!("SELECT * FROM {table}"))
            .fetch_all(db)
            .await?;
        let mut dumped = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut object = serde_json::Map::new();
            for (idx, column) in row.columns().iter().enumerate() {
                object.insert(column.name().to_string(), value_to_json(row, idx));
            }
            dumped.push(object);
        }
        out.insert(table.to_string(), dumped);
    }

    Ok(BackupFile {
        version: BACKUP_FORMAT_VERSION,
        created_at: crate::now(),
        modules: out,
    })
}

pub fn preview(backup: &BackupFile) -> RestorePreview {
    let mut modules = BTreeMap::new();
    let mut unknown = Vec::new();
    let mut issues = Vec::new();

    if backup.version != BACKUP_FORMAT_VERSION {
        issues.push(format!(
            "backup version {} differs from supported {BACKUP_FORMAT_VERSION}",
            backup.version
        ));
    }

    for (name, rows) in &backup.modules {
        if MODULES.iter().any(|m| *m == name) {
            modules.insert(name.clone(), rows.len());
        } else {
            unknown.push(name.clone());
        }
    }

    // Cross-module referential sanity: mounts must point at configs that
    // exist inside the same backup (or the restore will fail midway).
    if let (Some(mounts), Some(configs)) =
        (backup.modules.get("mounts"), backup.modules.get("storage_configs"))
    {
        let config_ids: Vec<&str> = configs
            .iter()
            .filter_map(|row| row.get("id").and_then(|v| v.as_str()))
            .collect();
        for mount in mounts {
            if let Some(config_id) = mount.get("storage_config_id").and_then(|v| v.as_str())
                && !config_ids.contains(&config_id)
            {
                issues.push(format!(
                    "mount {} references missing storage config {config_id}",
                    mount.get("mount_path").and_then(|v| v.as_str()).unwrap_or("?")
                ));
            }
        }
    }

    RestorePreview {
        version: backup.version,
        modules,
        unknown_modules: unknown,
        integrity_issues: issues,
    }
}

/// Replace the contents of every module present in the backup. Runs in one
/// transaction; unknown modules are skipped.
pub async fn restore(db: &SqlitePool, backup: &BackupFile) -> Result<u64, anyhow::Error> {
    if backup.version != BACKUP_FORMAT_VERSION {
        anyhow::bail!("unsupported backup version: {}", backup.version);
    }

    let mut restored = 0u64;
    let mut tx = db.begin().await?;

    // Delete in reverse order, insert in forward order.
    for table in MODULES.iter().rev() {
        if backup.modules.contains_key(*table) {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }
    }

    for table in MODULES {
        let Some(rows) = backup.modules.get(*table) else {
            continue;
        };
        for row in rows {
            if row.is_empty() {
                continue;
            }
            let columns: Vec<&str> = row.keys().map(String::as_str).collect();
            let placeholders = vec!["?"; columns.len()].join(", ");
            let sql = format!(
                "INSERT INTO {table} ({}) VALUES ({placeholders})",
                columns.join(", ")
            );
            let mut q = sqlx::query(&sql);
            for column in &columns {
                q = match &row[*column] {
                    serde_json::Value::Null => q.bind(None::<String>),
                    serde_json::Value::Bool(b) => q.bind(*b as i64),
                    serde_json::Value::Number(n) => {
                        if let Some(v) = n.as_i64() {
                            q.bind(v)
                        } else {
                            q.bind(n.as_f64().unwrap_or(0.0))
                        }
                    }
                    serde_json::Value::String(s) => q.bind(s.clone()),
                    other => q.bind(other.to_string()),
                };
            }
            q.execute(&mut *tx).await?;
            restored += 1;
        }
    }

    tx.commit().await?;
    Ok(restored)
}
