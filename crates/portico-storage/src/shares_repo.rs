use sqlx::{Row, SqlitePool};

use crate::now;
use crate::password::random_token;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareKind {
    File,
    Text,
}

impl ShareKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Text => "text",
        }
    }
}

impl std::str::FromStr for ShareKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(Self::File),
            "text" => Ok(Self::Text),
            _ => Err(anyhow::anyhow!("invalid share kind")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShareRecord {
    pub slug: String,
    pub kind: ShareKind,
    /// Storage key for file shares; inline content for text shares.
    pub target: String,
    pub storage_config_id: Option<String>,
    pub filename: Option<String>,
    pub size: Option<i64>,
    pub content_type: Option<String>,
    pub password_hash: Option<String>,
    pub max_views: Option<i64>,
    pub views: i64,
    pub expires_at: Option<i64>,
    pub created_by: String,
    pub created_at: i64,
}

impl ShareRecord {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
            || self.max_views.is_some_and(|max| self.views >= max)
    }
}

#[derive(Debug, Clone)]
pub struct NewShare {
    pub slug: Option<String>,
    pub kind: ShareKind,
    pub target: String,
    pub storage_config_id: Option<String>,
    pub filename: Option<String>,
    pub size: Option<i64>,
    pub content_type: Option<String>,
    pub password_hash: Option<String>,
    pub max_views: Option<i64>,
    pub expires_at: Option<i64>,
    pub created_by: String,
}

fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ShareRecord, anyhow::Error> {
    Ok(ShareRecord {
        slug: row.get::<String, _>("slug"),
        kind: row.get::<String, _>("kind").parse()?,
        target: row.get::<String, _>("target"),
        storage_config_id: row.get::<Option<String>, _>("storage_config_id"),
        filename: row.get::<Option<String>, _>("filename"),
        size: row.get::<Option<i64>, _>("size"),
        content_type: row.get::<Option<String>, _>("content_type"),
        password_hash: row.get::<Option<String>, _>("password_hash"),
        max_views: row.get::<Option<i64>, _>("max_views"),
        views: row.get::<i64, _>("views"),
        expires_at: row.get::<Option<i64>, _>("expires_at"),
        created_by: row.get::<String, _>("created_by"),
        created_at: row.get::<i64, _>("created_at"),
    })
}

const COLUMNS: &str = "slug, kind, target, storage_config_id, filename, size, content_type, password_hash, max_views, views, expires_at, created_by, created_at";

fn generate_slug() -> String {
    random_token(6).to_lowercase().replace(['-', '_'], "a")
}

/// Create a share. Custom slugs conflict with `Conflict`; generated slugs
/// retry on collision.
pub async fn create(db: &SqlitePool, new: NewShare) -> Result<ShareRecord, anyhow::Error> {
    let now = now();
    let custom = new.slug.is_some();
    let mut attempts = 0u32;

    loop {
        let slug = match new.slug.clone() {
            Some(slug) => slug,
            None => generate_slug(),
        };

        let result = sqlx::query(
            r#"
            INSERT INTO share_records
                (slug, kind, target, storage_config_id, filename, size, content_type, password_hash, max_views, views, expires_at, created_by, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
            "#,
        )
        .bind(&slug)
        .bind(new.kind.as_str())
        .bind(&new.target)
        .bind(&new.storage_config_id)
        .bind(&new.filename)
        .bind(new.size)
        .bind(&new.content_type)
        .bind(&new.password_hash)
        .bind(new.max_views)
        .bind(new.expires_at)
        .bind(&new.created_by)
        .bind(now)
        .execute(db)
        .await;

        match result {
            Ok(_) => {
                return Ok(ShareRecord {
                    slug,
                    kind: new.kind,
                    target: new.target,
                    storage_config_id: new.storage_config_id,
                    filename: new.filename,
                    size: new.size,
                    content_type: new.content_type,
                    password_hash: new.password_hash,
                    max_views: new.max_views,
                    views: 0,
                    expires_at: new.expires_at,
                    created_by: new.created_by,
                    created_at: now,
                });
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                if custom {
                    anyhow::bail!("slug already taken: conflict");
                }
                attempts += 1;
                if attempts >= 5 {
                    anyhow::bail!("could not allocate a unique slug");
                }
            }
            Err(err) => return Err(err.into()),
        }
    }
}

pub async fn get(db: &SqlitePool, slug: &str) -> Result<Option<ShareRecord>, anyhow::Error> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM share_records WHERE slug = ? LIMIT 1"
    ))
    .bind(slug)
    .fetch_optional(db)
    .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn list_by_creator(
    db: &SqlitePool,
    created_by: &str,
) -> Result<Vec<ShareRecord>, anyhow::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM share_records WHERE created_by = ? ORDER BY created_at DESC"
    ))
    .bind(created_by)
    .fetch_all(db)
    .await?;
    rows.iter().map(from_row).collect()
}

pub async fn list(db: &SqlitePool) -> Result<Vec<ShareRecord>, anyhow::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM share_records ORDER BY created_at DESC"
    ))
    .fetch_all(db)
    .await?;
    rows.iter().map(from_row).collect()
}

/// Consume one view. The guarded UPDATE makes the max-views check atomic:
/// it only lands while `views < max_views`, so a share can never be read
/// past its budget under concurrency.
pub async fn consume_view(db: &SqlitePool, slug: &str) -> Result<bool, anyhow::Error> {
    let result = sqlx::query(
        r#"
        UPDATE share_records SET views = views + 1
        WHERE slug = ? AND (max_views IS NULL OR views < max_views)
        "#,
    )
    .bind(slug)
    .execute(db)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete(db: &SqlitePool, slug: &str) -> Result<bool, anyhow::Error> {
    let result = sqlx::query("DELETE FROM share_records WHERE slug = ?")
        .bind(slug)
        .execute(db)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete_expired(db: &SqlitePool) -> Result<u64, anyhow::Error> {
    let result = sqlx::query(
        "DELETE FROM share_records WHERE (expires_at IS NOT NULL AND expires_at <= ?) OR (max_views IS NOT NULL AND views >= max_views)",
    )
    .bind(now())
    .execute(db)
    .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use crate::db;

    use super::{NewShare, ShareKind};

    fn new_share(slug: Option<&str>, max_views: Option<i64>) -> NewShare {
        NewShare {
            slug: slug.map(str::to_string),
            kind: ShareKind::File,
            target: "docs/a.txt".to_string(),
            storage_config_id: Some("cfg".to_string()),
            filename: Some("a.txt".to_string()),
            size: Some(5),
            content_type: Some("text/plain".to_string()),
            password_hash: None,
            max_views,
            expires_at: None,
            created_by: "admin".to_string(),
        }
    }

    #[tokio::test]
    async fn custom_slug_conflict_is_an_error() {
        let pool = db::init_in_memory().await.unwrap();
        super::create(&pool, new_share(Some("mydoc"), None))
            .await
            .unwrap();
        let err = super::create(&pool, new_share(Some("mydoc"), None))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("conflict"));
    }

    #[tokio::test]
    async fn view_budget_is_atomic() {
        let pool = db::init_in_memory().await.unwrap();
        let share = super::create(&pool, new_share(None, Some(2))).await.unwrap();

        assert!(super::consume_view(&pool, &share.slug).await.unwrap());
        assert!(super::consume_view(&pool, &share.slug).await.unwrap());
        assert!(!super::consume_view(&pool, &share.slug).await.unwrap());

        let loaded = super::get(&pool, &share.slug).await.unwrap().unwrap();
        assert_eq!(loaded.views, 2);
        assert!(loaded.is_expired(0));
    }

    #[tokio::test]
    async fn delete_expired_sweeps_consumed_shares() {
        let pool = db::init_in_memory().await.unwrap();
        let spent = super::create(&pool, new_share(Some("spent"), Some(1)))
            .await
            .unwrap();
        super::consume_view(&pool, &spent.slug).await.unwrap();
        super::create(&pool, new_share(Some("alive"), None))
            .await
            .unwrap();

        let removed = super::delete_expired(&pool).await.unwrap();
        assert_eq!(removed, 1);
        assert!(super::get(&pool, "spent").await.unwrap().is_none());
        assert!(super::get(&pool, "alive").await.unwrap().is_some());
    }
}
