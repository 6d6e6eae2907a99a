//! Per-directory metadata (headers, hide patterns, directory passwords),
//! inherited down the tree when the `*_inherit` flags are set.

use sqlx::{Row, SqlitePool};

use crate::now;

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct DirectoryMeta {
    pub path: String,
    pub header_markdown: Option<String>,
    pub header_inherit: bool,
    pub footer_markdown: Option<String>,
    pub footer_inherit: bool,
    pub hide_patterns: Vec<String>,
    pub hide_inherit: bool,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub password_inherit: bool,
}

fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<DirectoryMeta, anyhow::Error> {
    let hide_json = row.get::<String, _>("hide_patterns_json");
    Ok(DirectoryMeta {
        path: row.get::<String, _>("path"),
        header_markdown: row.get::<Option<String>, _>("header_markdown"),
        header_inherit: row.get::<i64, _>("header_inherit") != 0,
        footer_markdown: row.get::<Option<String>, _>("footer_markdown"),
        footer_inherit: row.get::<i64, _>("footer_inherit") != 0,
        hide_patterns: serde_json::from_str(&hide_json)?,
        hide_inherit: row.get::<i64, _>("hide_inherit") != 0,
        password_hash: row.get::<Option<String>, _>("password_hash"),
        password_inherit: row.get::<i64, _>("password_inherit") != 0,
    })
}

const COLUMNS: &str = "path, header_markdown, header_inherit, footer_markdown, footer_inherit, hide_patterns_json, hide_inherit, password_hash, password_inherit";

pub async fn upsert(db: &SqlitePool, meta: &DirectoryMeta) -> Result<(), anyhow::Error> {
    sqlx::query(
        r#"
        INSERT INTO fs_meta (path, header_markdown, header_inherit, footer_markdown, footer_inherit, hide_patterns_json, hide_inherit, password_hash, password_inherit, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (path) DO UPDATE SET
            header_markdown = excluded.header_markdown,
            header_inherit = excluded.header_inherit,
            footer_markdown = excluded.footer_markdown,
            footer_inherit = excluded.footer_inherit,
            hide_patterns_json = excluded.hide_patterns_json,
            hide_inherit = excluded.hide_inherit,
            password_hash = excluded.password_hash,
            password_inherit = excluded.password_inherit,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&meta.path)
    .bind(&meta.header_markdown)
    .bind(meta.header_inherit as i64)
    .bind(&meta.footer_markdown)
    .bind(meta.footer_inherit as i64)
    .bind(serde_json::to_string(&meta.hide_patterns)?)
    .bind(meta.hide_inherit as i64)
    .bind(&meta.password_hash)
    .bind(meta.password_inherit as i64)
    .bind(now())
    .execute(db)
    .await?;
    Ok(())
}

pub async fn get(db: &SqlitePool, path: &str) -> Result<Option<DirectoryMeta>, anyhow::Error> {
    let row = sqlx::query(&format!("SELECT {COLUMNS} FROM fs_meta WHERE path = ? LIMIT 1"))
        .bind(path)
        .fetch_optional(db)
        .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn delete(db: &SqlitePool, path: &str) -> Result<bool, anyhow::Error> {
    let result = sqlx::query("DELETE FROM fs_meta WHERE path = ?")
        .bind(path)
        .execute(db)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Meta rows for a path and all of its ancestors, root first. The caller
/// folds inheritance over this chain.
pub async fn chain_for(db: &SqlitePool, path: &str) -> Result<Vec<DirectoryMeta>, anyhow::Error> {
    let mut paths = vec!["/".to_string()];
    let mut acc = String::new();
    for part in path.split('/').filter(|v| !v.is_empty()) {
        acc.push('/');
        acc.push_str(part);
        paths.push(acc.clone());
    }

    let mut chain = Vec::new();
    for p in paths {
        if let Some(meta) = get(db, &p).await? {
            chain.push(meta);
        }
    }
    Ok(chain)
}

/// Fold an ancestor chain into the effective meta for a directory. The
/// second element is the path that carries the effective password, if any;
/// path tokens are scoped to that prefix.
pub fn effective_meta(chain: &[DirectoryMeta], path: &str) -> (DirectoryMeta, Option<String>) {
    let mut out = DirectoryMeta {
        path: path.to_string(),
        ..Default::default()
    };
    let mut password_source = None;

    for meta in chain {
        let is_self = meta.path == path;
        if meta.header_markdown.is_some() && (is_self || meta.header_inherit) {
            out.header_markdown = meta.header_markdown.clone();
        }
        if meta.footer_markdown.is_some() && (is_self || meta.footer_inherit) {
            out.footer_markdown = meta.footer_markdown.clone();
        }
        if !meta.hide_patterns.is_empty() && (is_self || meta.hide_inherit) {
            out.hide_patterns.extend(meta.hide_patterns.iter().cloned());
        }
        if meta.password_hash.is_some() && (is_self || meta.password_inherit) {
            out.password_hash = meta.password_hash.clone();
            password_source = Some(meta.path.clone());
        }
    }

    (out, password_source)
}

#[cfg(test)]
mod tests {
    use crate::db;

    use super::DirectoryMeta;

    #[tokio::test]
    async fn inheritance_folds_down_the_tree() {
        let pool = db::init_in_memory().await.unwrap();
        super::upsert(
            &pool,
            &DirectoryMeta {
                path: "/docs".to_string(),
                header_markdown: Some("# Docs".to_string()),
                header_inherit: true,
                hide_patterns: vec![r"^\..*".to_string()],
                hide_inherit: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        super::upsert(
            &pool,
            &DirectoryMeta {
                path: "/docs/private".to_string(),
                password_hash: Some("hash".to_string()),
                password_inherit: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let chain = super::chain_for(&pool, "/docs/private/deep").await.unwrap();
        let (effective, source) = super::effective_meta(&chain, "/docs/private/deep");
        assert_eq!(effective.header_markdown.as_deref(), Some("# Docs"));
        assert_eq!(effective.hide_patterns, vec![r"^\..*".to_string()]);
        // Password on /docs/private does not inherit.
        assert!(effective.password_hash.is_none());
        assert!(source.is_none());

        let chain = super::chain_for(&pool, "/docs/private").await.unwrap();
        let (effective, source) = super::effective_meta(&chain, "/docs/private");
        assert!(effective.password_hash.is_some());
        assert_eq!(source.as_deref(), Some("/docs/private"));
    }

    #[tokio::test]
    async fn non_inherited_header_stays_local() {
        let pool = db::init_in_memory().await.unwrap();
        super::upsert(
            &pool,
            &DirectoryMeta {
                path: "/a".to_string(),
                header_markdown: Some("local".to_string()),
                header_inherit: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let chain = super::chain_for(&pool, "/a/b").await.unwrap();
        assert!(super::effective_meta(&chain, "/a/b").0.header_markdown.is_none());
        let chain = super::chain_for(&pool, "/a").await.unwrap();
        assert_eq!(
            super::effective_meta(&chain, "/a").0.header_markdown.as_deref(),
            Some("local")
        );
    }
}
