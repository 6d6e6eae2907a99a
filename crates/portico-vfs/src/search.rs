//! Search planner over the per-mount index.
//!
//! Search is index-only: mounts whose index is not `ready` are skipped
//! (global scope) or fail the request (mount/directory scope). Results are
//! keyset-paginated with an opaque cursor.

use std::time::Duration;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use portico_driver_api::DriverError;
use portico_storage::index_repo::{self, IndexStatus, SearchCursor};
use portico_storage::mounts_repo;

use crate::cache::TtlCache;
use crate::errors::IndexNotReady;
use crate::router;
use crate::viewer::Viewer;

pub const MIN_QUERY_LEN: usize = 3;
pub const DEFAULT_LIMIT: u32 = 50;
pub const MAX_LIMIT: u32 = 200;
const SEARCH_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchScope {
    Global,
    Mount,
    Directory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    #[serde(default = "default_scope")]
    pub scope: SearchScope,
    #[serde(default)]
    pub mount_id: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub cursor: Option<String>,
}

fn default_scope() -> SearchScope {
    SearchScope::Global
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub mount_id: String,
    pub name: String,
    pub path: String,
    pub size: i64,
    pub kind: i64,
    pub is_directory: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedMount {
    pub mount_id: String,
    pub status: String,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    pub index_ready: bool,
    pub index_partial: bool,
    pub searchable_mount_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub skipped_mounts: Vec<SkippedMount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CursorBlob {
    v: u32,
    m: String,
    k: String,
}

fn encode_cursor(cursor: &SearchCursor) -> String {
    let blob = CursorBlob {
        v: 1,
        m: cursor.mount_id.clone(),
        k: cursor.s3_key.clone(),
    };
    let json = serde_json::to_vec(&blob).unwrap_or_default();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json)
}

fn decode_cursor(raw: &str) -> Result<SearchCursor, anyhow::Error> {
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(raw)
        .map_err(|_| DriverError::invalid_input("invalid cursor encoding"))?;
    let blob: CursorBlob = serde_json::from_slice(&bytes)
        .map_err(|_| DriverError::invalid_input("invalid cursor payload"))?;
    if blob.v != 1 {
        return Err(DriverError::invalid_input("unsupported cursor version").into());
    }
    Ok(SearchCursor {
        mount_id: blob.m,
        s3_key: blob.k,
    })
}

/// Independent result cache, 5-minute TTL, keyed by viewer + full query.
pub struct SearchService {
    cache: TtlCache<String, SearchResponse>,
}

impl Default for SearchService {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchService {
    pub fn new() -> Self {
        Self {
            cache: TtlCache::new(),
        }
    }

    pub fn flush(&self) {
        self.cache.clear();
    }

    pub async fn search(
        &self,
        db: &SqlitePool,
        viewer: &Viewer,
        query: &SearchQuery,
    ) -> Result<SearchResponse, anyhow::Error> {
        let q = query.q.trim();
        if q.chars().count() < MIN_QUERY_LEN {
            return Err(DriverError::invalid_input(format!(
                "query must be at least {MIN_QUERY_LEN} characters"
            ))
            .into());
        }
        let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT) as i64;
        let cursor = query.cursor.as_deref().map(decode_cursor).transpose()?;

        let cache_key = format!(
            "{}|{:?}|{}|{}|{}|{}|{}",
            viewer.scope_key(),
            query.scope,
            q,
            query.mount_id.as_deref().unwrap_or(""),
            query.path.as_deref().unwrap_or(""),
            limit,
            query.cursor.as_deref().unwrap_or(""),
        );
        if let Some(cached) = self.cache.get(&cache_key) {
            return Ok(cached);
        }

        let mounts = mounts_repo::list_active(db).await?;
        let visible = router::visible_mounts(&mounts, viewer);

        let mut searchable = Vec::new();
        let mut skipped = Vec::new();
        let mut key_prefix: Option<String> = None;

        match query.scope {
            SearchScope::Global => {
                for mount in &visible {
                    let status = index_repo::status_of(db, &mount.id).await?;
                    if status == IndexStatus::Ready {
                        searchable.push(mount.id.clone());
                    } else {
                        skipped.push(SkippedMount {
                            mount_id: mount.id.clone(),
                            status: status.as_str().to_string(),
                            reason: "index_not_ready",
                        });
                    }
                }
            }
            SearchScope::Mount | SearchScope::Directory => {
                let (mount, prefix) = match query.scope {
                    SearchScope::Mount => {
                        let mount_id = query.mount_id.as_deref().ok_or_else(|| {
                            DriverError::invalid_input("mount scope requires mount_id")
                        })?;
                        let mount = visible
                            .iter()
                            .find(|m| m.id == mount_id)
                            .ok_or_else(|| DriverError::not_found("unknown mount"))?;
                        (*mount, None)
                    }
                    SearchScope::Directory => {
                        let path = query.path.as_deref().ok_or_else(|| {
                            DriverError::invalid_input("directory scope requires path")
                        })?;
                        let path = portico_core::paths::normalize(path)
                            .map_err(|e| DriverError::invalid_input(e.to_string()))?;
                        viewer.check_path(&path)?;
                        let (mount, relative) = router::resolve(&mounts, &path)
                            .ok_or_else(|| DriverError::not_found("no mount covers path"))?;
                        let prefix = if relative.is_empty() {
                            None
                        } else {
                            Some(relative)
                        };
                        (mount, prefix)
                    }
                    SearchScope::Global => unreachable!(),
                };

                let status = index_repo::status_of(db, &mount.id).await?;
                if status != IndexStatus::Ready {
                    let response = SearchResponse {
                        results: Vec::new(),
                        index_ready: false,
                        index_partial: false,
                        searchable_mount_ids: Vec::new(),
                        skipped_mounts: vec![SkippedMount {
                            mount_id: mount.id.clone(),
                            status: status.as_str().to_string(),
                            reason: "index_not_ready",
                        }],
                        next_cursor: None,
                        hint: Some(
                            IndexNotReady {
                                mount_id: mount.id.clone(),
                                status: status.as_str().to_string(),
                            }
                            .to_string(),
                        ),
                    };
                    return Ok(response);
                }
                searchable.push(mount.id.clone());
                key_prefix = prefix;
            }
        }

        // Fetch one extra row to learn whether another page exists.
        let mut rows = index_repo::search(
            db,
            q,
            &searchable,
            key_prefix.as_deref(),
            cursor.as_ref(),
            limit + 1,
        )
        .await?;
        let next_cursor = if rows.len() as i64 > limit {
            rows.truncate(limit as usize);
            rows.last().map(|last| {
                encode_cursor(&SearchCursor {
                    mount_id: last.mount_id.clone(),
                    s3_key: last.s3_key.clone(),
                })
            })
        } else {
            None
        };

        let response = SearchResponse {
            results: rows
                .into_iter()
                .map(|e| SearchHit {
                    mount_id: e.mount_id,
                    name: e.name,
                    path: e.path,
                    size: e.size,
                    kind: e.kind,
                    is_directory: e.is_directory,
                    modified_ms: e.modified_ms,
                })
                .collect(),
            index_ready: !searchable.is_empty(),
            index_partial: !skipped.is_empty(),
            searchable_mount_ids: searchable,
            skipped_mounts: skipped,
            next_cursor,
            hint: None,
        };
        self.cache.put(cache_key, response.clone(), SEARCH_CACHE_TTL);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use portico_storage::index_repo::{self, IndexEntry, IndexStatus};
    use portico_storage::mounts_repo::{self, NewMount, WebdavPolicy};
    use portico_storage::{db, storage_configs_repo};

    use crate::viewer::Viewer;

    use super::{SearchQuery, SearchScope, SearchService};

    async fn mount(pool: &sqlx::SqlitePool, path: &str) -> String {
        let config = storage_configs_repo::create(
            pool,
            &format!("cfg{path}"),
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
        mounts_repo::create(
            pool,
            NewMount {
                name: path.to_string(),
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
        .id
    }

    fn admin() -> Viewer {
        Viewer::Admin {
            admin_id: "a".to_string(),
        }
    }

    fn query(q: &str, scope: SearchScope) -> SearchQuery {
        SearchQuery {
            q: q.to_string(),
            scope,
            mount_id: None,
            path: None,
            limit: None,
            cursor: None,
        }
    }

    #[tokio::test]
    async fn global_search_gates_on_ready_mounts() {
        let pool = db::init_in_memory().await.unwrap();
        let ready = mount(&pool, "/a").await;
        let indexing = mount(&pool, "/b").await;
        let not_ready = mount(&pool, "/c").await;

        index_repo::set_status(&pool, &ready, IndexStatus::Ready, None).await.unwrap();
        index_repo::set_status(&pool, &indexing, IndexStatus::Indexing, None)
            .await
            .unwrap();
        index_repo::upsert_entries(
            &pool,
            &[IndexEntry {
                mount_id: ready.clone(),
                s3_key: "foo-file.txt".to_string(),
                name: "foo-file.txt".to_string(),
                path: "/a/foo-file.txt".to_string(),
                size: 1,
                kind: 0,
                modified_ms: None,
                is_directory: false,
            }],
        )
        .await
        .unwrap();

        let service = SearchService::new();
        let response = service
            .search(&pool, &admin(), &query("foo", SearchScope::Global))
            .await
            .unwrap();

        assert!(response.index_ready);
        assert!(response.index_partial);
        assert_eq!(response.searchable_mount_ids, vec![ready]);
        assert_eq!(response.skipped_mounts.len(), 2);
        assert!(
            response
                .skipped_mounts
                .iter()
                .any(|s| s.mount_id == indexing && s.status == "indexing")
        );
        assert!(
            response
                .skipped_mounts
                .iter()
                .any(|s| s.mount_id == not_ready && s.status == "not_ready")
        );
        assert_eq!(response.results.len(), 1);
    }

    #[tokio::test]
    async fn mount_scope_on_unready_mount_reports_hint() {
        let pool = db::init_in_memory().await.unwrap();
        let mount_id = mount(&pool, "/c").await;

        let service = SearchService::new();
        let mut q = query("foo", SearchScope::Mount);
        q.mount_id = Some(mount_id.clone());
        let response = service.search(&pool, &admin(), &q).await.unwrap();

        assert!(!response.index_ready);
        assert!(response.results.is_empty());
        assert!(response.hint.is_some());
        assert_eq!(response.skipped_mounts[0].mount_id, mount_id);
    }

    #[tokio::test]
    async fn short_queries_are_rejected() {
        let pool = db::init_in_memory().await.unwrap();
        let service = SearchService::new();
        let err = service
            .search(&pool, &admin(), &query("ab", SearchScope::Global))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("at least 3"));
    }

    #[tokio::test]
    async fn pagination_produces_opaque_cursor() {
        let pool = db::init_in_memory().await.unwrap();
        let mount_id = mount(&pool, "/a").await;
        index_repo::set_status(&pool, &mount_id, IndexStatus::Ready, None)
            .await
            .unwrap();
        let entries: Vec<_> = (0..5)
            .map(|i| IndexEntry {
                mount_id: mount_id.clone(),
                s3_key: format!("report-{i}.txt"),
                name: format!("report-{i}.txt"),
                path: format!("/a/report-{i}.txt"),
                size: 1,
                kind: 0,
                modified_ms: None,
                is_directory: false,
            })
            .collect();
        index_repo::upsert_entries(&pool, &entries).await.unwrap();

        let service = SearchService::new();
        let mut q = query("report", SearchScope::Global);
        q.limit = Some(2);
        let page1 = service.search(&pool, &admin(), &q).await.unwrap();
        assert_eq!(page1.results.len(), 2);
        let cursor = page1.next_cursor.clone().expect("cursor");

        q.cursor = Some(cursor);
        let page2 = service.search(&pool, &admin(), &q).await.unwrap();
        assert_eq!(page2.results.len(), 2);
        assert_ne!(page1.results[1].path, page2.results[0].path);
    }
}
