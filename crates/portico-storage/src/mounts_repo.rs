use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::now;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebdavPolicy {
    /// GET redirects to an external URL when the driver can mint one.
    #[serde(rename = "302_redirect")]
    Redirect302,
    /// GET always streams through the gateway.
    Proxy,
}

impl WebdavPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Redirect302 => "302_redirect",
            Self::Proxy => "proxy",
        }
    }
}

impl std::str::FromStr for WebdavPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "302_redirect" => Ok(Self::Redirect302),
            "proxy" => Ok(Self::Proxy),
            _ => Err(anyhow::anyhow!("invalid webdav_policy")),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Mount {
    pub id: String,
    pub name: String,
    pub mount_path: String,
    pub storage_config_id: String,
    pub is_active: bool,
    pub sort_order: i64,
    pub cache_ttl_seconds: i64,
    pub web_proxy: bool,
    pub webdav_policy: WebdavPolicy,
    pub enable_sign: bool,
    pub sign_expires_sec: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewMount {
    pub name: String,
    pub mount_path: String,
    pub storage_config_id: String,
    pub is_active: bool,
    pub sort_order: i64,
    pub cache_ttl_seconds: i64,
    pub web_proxy: bool,
    pub webdav_policy: WebdavPolicy,
    pub enable_sign: bool,
    pub sign_expires_sec: Option<i64>,
}

fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Mount, anyhow::Error> {
    Ok(Mount {
        id: row.get::<String, _>("id"),
        name: row.get::<String, _>("name"),
        mount_path: row.get::<String, _>("mount_path"),
        storage_config_id: row.get::<String, _>("storage_config_id"),
        is_active: row.get::<i64, _>("is_active") != 0,
        sort_order: row.get::<i64, _>("sort_order"),
        cache_ttl_seconds: row.get::<i64, _>("cache_ttl_seconds"),
        web_proxy: row.get::<i64, _>("web_proxy") != 0,
        webdav_policy: row.get::<String, _>("webdav_policy").parse()?,
        enable_sign: row.get::<i64, _>("enable_sign") != 0,
        sign_expires_sec: row.get::<Option<i64>, _>("sign_expires_sec"),
        created_at: row.get::<i64, _>("created_at"),
        updated_at: row.get::<i64, _>("updated_at"),
    })
}

const COLUMNS: &str = "id, name, mount_path, storage_config_id, is_active, sort_order, cache_ttl_seconds, web_proxy, webdav_policy, enable_sign, sign_expires_sec, created_at, updated_at";

pub async fn create(db: &SqlitePool, new: NewMount) -> Result<Mount, anyhow::Error> {
    let now = now();
    let id = Uuid::new_v4().to_string();

    sqlx::query(
        r#"
        INSERT INTO mounts
            (id, name, mount_path, storage_config_id, is_active, sort_order, cache_ttl_seconds, web_proxy, webdav_policy, enable_sign, sign_expires_sec, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&new.name)
    .bind(&new.mount_path)
    .bind(&new.storage_config_id)
    .bind(new.is_active as i64)
    .bind(new.sort_order)
    .bind(new.cache_ttl_seconds)
    .bind(new.web_proxy as i64)
    .bind(new.webdav_policy.as_str())
    .bind(new.enable_sign as i64)
    .bind(new.sign_expires_sec)
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;

    Ok(Mount {
        id,
        name: new.name,
        mount_path: new.mount_path,
        storage_config_id: new.storage_config_id,
        is_active: new.is_active,
        sort_order: new.sort_order,
        cache_ttl_seconds: new.cache_ttl_seconds,
        web_proxy: new.web_proxy,
        webdav_policy: new.webdav_policy,
        enable_sign: new.enable_sign,
        sign_expires_sec: new.sign_expires_sec,
        created_at: now,
        updated_at: now,
    })
}

pub async fn get(db: &SqlitePool, id: &str) -> Result<Option<Mount>, anyhow::Error> {
    let row = sqlx::query(&format!("SELECT {COLUMNS} FROM mounts WHERE id = ? LIMIT 1"))
        .bind(id)
        .fetch_optional(db)
        .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn list(db: &SqlitePool) -> Result<Vec<Mount>, anyhow::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM mounts ORDER BY sort_order, mount_path"
    ))
    .fetch_all(db)
    .await?;
    rows.iter().map(from_row).collect()
}

pub async fn list_active(db: &SqlitePool) -> Result<Vec<Mount>, anyhow::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM mounts WHERE is_active = 1 ORDER BY sort_order, mount_path"
    ))
    .fetch_all(db)
    .await?;
    rows.iter().map(from_row).collect()
}

pub async fn update(db: &SqlitePool, id: &str, new: NewMount) -> Result<bool, anyhow::Error> {
    let result = sqlx::query(
        r#"
        UPDATE mounts SET
            name = ?, mount_path = ?, storage_config_id = ?, is_active = ?, sort_order = ?,
            cache_ttl_seconds = ?, web_proxy = ?, webdav_policy = ?, enable_sign = ?,
            sign_expires_sec = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&new.name)
    .bind(&new.mount_path)
    .bind(&new.storage_config_id)
    .bind(new.is_active as i64)
    .bind(new.sort_order)
    .bind(new.cache_ttl_seconds)
    .bind(new.web_proxy as i64)
    .bind(new.webdav_policy.as_str())
    .bind(new.enable_sign as i64)
    .bind(new.sign_expires_sec)
    .bind(now())
    .bind(id)
    .execute(db)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Delete a mount and everything derived from it (index rows, state, dirty
/// queue).
pub async fn delete(db: &SqlitePool, id: &str) -> Result<bool, anyhow::Error> {
    let mut tx = db.begin().await?;
    sqlx::query("DELETE FROM fs_search_index_entries WHERE mount_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM fs_search_index_state WHERE mount_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM fs_search_index_dirty WHERE mount_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    let result = sqlx::query("DELETE FROM mounts WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use crate::{db, storage_configs_repo};

    use super::{NewMount, WebdavPolicy};

    pub(crate) async fn sample_mount(pool: &sqlx::SqlitePool, path: &str) -> super::Mount {
        let config = storage_configs_repo::create(
            pool,
            &format!("cfg-{path}"),
            "memory",
            None,
            serde_json::json!({}),
            String::new(),
            "",
            false,
            None,
        )
        .await
        .unwrap();
        super::create(
            pool,
            NewMount {
                name: path.trim_matches('/').to_string(),
                mount_path: path.to_string(),
                storage_config_id: config.id,
                is_active: true,
                sort_order: 0,
                cache_ttl_seconds: 300,
                web_proxy: false,
                webdav_policy: WebdavPolicy::Redirect302,
                enable_sign: false,
                sign_expires_sec: None,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn mount_path_is_unique() {
        let pool = db::init_in_memory().await.unwrap();
        let mount = sample_mount(&pool, "/data").await;
        assert_eq!(mount.webdav_policy, WebdavPolicy::Redirect302);

        let config_id = mount.storage_config_id.clone();
        let dup = super::create(
            &pool,
            NewMount {
                name: "dup".to_string(),
                mount_path: "/data".to_string(),
                storage_config_id: config_id,
                is_active: true,
                sort_order: 0,
                cache_ttl_seconds: 300,
                web_proxy: false,
                webdav_policy: WebdavPolicy::Proxy,
                enable_sign: false,
                sign_expires_sec: None,
            },
        )
        .await;
        assert!(dup.is_err());
    }

    #[tokio::test]
    async fn delete_clears_index_rows() {
        let pool = db::init_in_memory().await.unwrap();
        let mount = sample_mount(&pool, "/data").await;

        sqlx::query(
            "INSERT INTO fs_search_index_entries (mount_id, s3_key, name, path) VALUES (?, 'k', 'k', '/data/k')",
        )
        .bind(&mount.id)
        .execute(&pool)
        .await
        .unwrap();

        assert!(super::delete(&pool, &mount.id).await.unwrap());
        let remaining =
            sqlx::query("SELECT COUNT(1) AS n FROM fs_search_index_entries WHERE mount_id = ?")
                .bind(&mount.id)
                .fetch_one(&pool)
                .await
                .unwrap();
        use sqlx::Row as _;
        assert_eq!(remaining.get::<i64, _>("n"), 0);
    }
}
