//! In-memory upload session map with TTL garbage collection.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use portico_driver_api::{
    MultipartStrategy, PartsLedgerPolicy, PresignedPartUrl, UploadPolicy, UploadSessionInfo,
};

use super::ledger::PartsLedger;

pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(3600);

pub struct UploadSession {
    pub file_id: String,
    pub strategy: MultipartStrategy,
    pub upload_id: String,
    pub storage_key: String,
    pub target_path: String,
    pub mount_id: String,
    pub storage_config_id: String,
    pub part_size: u64,
    pub total_size: u64,
    pub total_parts: u32,
    pub content_type: String,
    pub policy: UploadPolicy,
    pub session: Option<UploadSessionInfo>,
    pub sha256: Option<String>,
    pub skip_upload: bool,
    pub owner: String,
    pub resumed: bool,
    /// Unexpired presigned part URLs handed out so far.
    pub signed_urls: BTreeMap<u32, PresignedPartUrl>,
}

/// One live upload: session state, a gate serializing sign requests, and
/// the parts ledger.
pub struct SessionHandle {
    pub state: tokio::sync::Mutex<UploadSession>,
    pub sign_gate: tokio::sync::Mutex<()>,
    pub ledger: PartsLedger,
}

struct TrackedSession {
    handle: Arc<SessionHandle>,
    last_access: Instant,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub file_id: String,
    pub target_path: String,
    pub strategy: MultipartStrategy,
    pub part_size: u64,
    pub total_size: u64,
    pub total_parts: u32,
    pub parts_ledger_policy: PartsLedgerPolicy,
    pub skip_upload: bool,
    pub resumed: bool,
}

pub struct SessionManager {
    sessions: Mutex<HashMap<String, TrackedSession>>,
    timeout: Duration,
}

impl SessionManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn insert(&self, session: UploadSession, ledger: PartsLedger) -> Arc<SessionHandle> {
        let file_id = session.file_id.clone();
        let handle = Arc::new(SessionHandle {
            state: tokio::sync::Mutex::new(session),
            sign_gate: tokio::sync::Mutex::new(()),
            ledger,
        });
        self.lock().insert(
            file_id,
            TrackedSession {
                handle: handle.clone(),
                last_access: Instant::now(),
            },
        );
        handle
    }

    /// Fetch a session, refreshing its idle clock.
    pub fn get(&self, file_id: &str) -> Option<Arc<SessionHandle>> {
        let mut sessions = self.lock();
        let tracked = sessions.get_mut(file_id)?;
        tracked.last_access = Instant::now();
        Some(tracked.handle.clone())
    }

    pub fn remove(&self, file_id: &str) -> Option<Arc<SessionHandle>> {
        self.lock().remove(file_id).map(|t| t.handle)
    }

    pub fn contains(&self, file_id: &str) -> bool {
        self.lock().contains_key(file_id)
    }

    pub async fn summaries(&self, owner: Option<&str>) -> Vec<SessionSummary> {
        let handles: Vec<Arc<SessionHandle>> =
            self.lock().values().map(|t| t.handle.clone()).collect();

        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            let state = handle.state.lock().await;
            if owner.is_some_and(|o| o != state.owner) {
                continue;
            }
            out.push(SessionSummary {
                file_id: state.file_id.clone(),
                target_path: state.target_path.clone(),
                strategy: state.strategy,
                part_size: state.part_size,
                total_size: state.total_size,
                total_parts: state.total_parts,
                parts_ledger_policy: state.policy.parts_ledger_policy,
                skip_upload: state.skip_upload,
                resumed: state.resumed,
            });
        }
        out
    }

    /// Drop sessions idle past the timeout; returns the evicted handles so
    /// the caller can clear their ledgers.
    pub fn sweep(&self) -> Vec<Arc<SessionHandle>> {
        let timeout = self.timeout;
        let mut evicted = Vec::new();
        self.lock().retain(|_, tracked| {
            if tracked.last_access.elapsed() >= timeout {
                evicted.push(tracked.handle.clone());
                false
            } else {
                true
            }
        });
        evicted
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TrackedSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Periodic GC for idle sessions.
pub fn spawn_gc_loop(manager: Arc<SessionManager>, shutdown: CancellationToken) {
    crate::supervision::spawn_supervised("upload_session_gc", shutdown.clone(), async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(60)) => {}
            }
            let evicted = manager.sweep();
            for handle in evicted {
                if let Err(error) = handle.ledger.flush_now().await {
                    tracing::debug!(error = %error, "ledger flush during session GC failed");
                }
                let state = handle.state.lock().await;
                tracing::info!(
                    file_id = %state.file_id,
                    target_path = %state.target_path,
                    "expired idle upload session"
                );
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use portico_driver_api::{
        MultipartStrategy, PartsLedgerPolicy, SigningMode, UploadPolicy,
    };
    use portico_storage::db;

    use crate::upload::ledger::PartsLedger;

    use super::{SessionManager, UploadSession};

    fn sample_session(file_id: &str) -> UploadSession {
        UploadSession {
            file_id: file_id.to_string(),
            strategy: MultipartStrategy::PerPartUrl,
            upload_id: "u".to_string(),
            storage_key: "k".to_string(),
            target_path: "/m/k".to_string(),
            mount_id: "m".to_string(),
            storage_config_id: "c".to_string(),
            part_size: 5,
            total_size: 10,
            total_parts: 2,
            content_type: "application/octet-stream".to_string(),
            policy: UploadPolicy {
                parts_ledger_policy: PartsLedgerPolicy::ServerCanList,
                signing_mode: SigningMode::Batched,
                server_can_list: true,
                max_parts_per_request: 8,
                url_ttl_sec: 3600,
                max_attempts: 3,
            },
            session: None,
            sha256: None,
            skip_upload: false,
            owner: "admin:1".to_string(),
            resumed: false,
            signed_urls: Default::default(),
        }
    }

    #[tokio::test]
    async fn sweep_evicts_idle_sessions() {
        let pool = db::init_in_memory().await.unwrap();
        let manager = SessionManager::new(Duration::from_millis(10));
        manager.insert(
            sample_session("f1"),
            PartsLedger::for_policy(PartsLedgerPolicy::ServerCanList, pool, "k", "u"),
        );

        assert!(manager.get("f1").is_some());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let evicted = manager.sweep();
        assert_eq!(evicted.len(), 1);
        assert!(manager.get("f1").is_none());
    }

    #[tokio::test]
    async fn get_refreshes_idle_clock() {
        let pool = db::init_in_memory().await.unwrap();
        let manager = SessionManager::new(Duration::from_millis(50));
        manager.insert(
            sample_session("f1"),
            PartsLedger::for_policy(PartsLedgerPolicy::ServerCanList, pool, "k", "u"),
        );

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(manager.get("f1").is_some());
        }
        assert!(manager.sweep().is_empty());
    }

    #[tokio::test]
    async fn summaries_filter_by_owner() {
        let pool = db::init_in_memory().await.unwrap();
        let manager = SessionManager::new(Duration::from_secs(60));
        manager.insert(
            sample_session("f1"),
            PartsLedger::for_policy(PartsLedgerPolicy::ServerCanList, pool.clone(), "k", "u"),
        );
        let mut other = sample_session("f2");
        other.owner = "key:2".to_string();
        manager.insert(
            other,
            PartsLedger::for_policy(PartsLedgerPolicy::ServerCanList, pool, "k2", "u2"),
        );

        assert_eq!(manager.summaries(None).await.len(), 2);
        let mine = manager.summaries(Some("admin:1")).await;
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].file_id, "f1");
    }
}
