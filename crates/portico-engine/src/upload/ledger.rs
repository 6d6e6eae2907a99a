//! Parts ledgers: who remembers which parts of a multipart upload landed.
//!
//! Three flavors behind one enum, per the advertised ledger policy:
//! in-memory (`server_can_list`: the backend is authoritative), persistent
//! with debounced flushes (`client_keeps`: the backend cannot enumerate
//! parts, so this ledger *is* the source of truth across reloads), and
//! database-backed rows (`server_records`: the gateway tracks every part).

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use sqlx::SqlitePool;

use portico_driver_api::{PartRecord, PartsLedgerPolicy};
use portico_storage::upload_parts_repo::{self, PartRow};

const FLUSH_DEBOUNCE: Duration = Duration::from_millis(250);

pub enum PartsLedger {
    Memory(MemoryLedger),
    Persistent(PersistentLedger),
    Server(ServerLedger),
}

impl PartsLedger {
    /// Build the right ledger for a policy. `storage_key` keys persistent
    /// ledgers (stable across re-inits of the same target); `upload_id`
    /// keys server-recorded rows.
    pub fn for_policy(
        policy: PartsLedgerPolicy,
        db: SqlitePool,
        storage_key: &str,
        upload_id: &str,
    ) -> Self {
        match policy {
            PartsLedgerPolicy::ServerCanList => Self::Memory(MemoryLedger::default()),
            PartsLedgerPolicy::ClientKeeps => Self::Persistent(PersistentLedger {
                db,
                ledger_key: format!("sk:{storage_key}"),
                parts: Mutex::new(BTreeMap::new()),
                dirty: AtomicBool::new(false),
                last_flush: Mutex::new(Instant::now()),
            }),
            PartsLedgerPolicy::ServerRecords => Self::Server(ServerLedger {
                db,
                ledger_key: format!("id:{upload_id}"),
            }),
        }
    }

    pub fn policy(&self) -> PartsLedgerPolicy {
        match self {
            Self::Memory(_) => PartsLedgerPolicy::ServerCanList,
            Self::Persistent(_) => PartsLedgerPolicy::ClientKeeps,
            Self::Server(_) => PartsLedgerPolicy::ServerRecords,
        }
    }

    /// Populate from the persistent store (resume).
    pub async fn load(&self) -> Result<(), anyhow::Error> {
        if let Self::Persistent(ledger) = self {
            let rows = upload_parts_repo::load(&ledger.db, &ledger.ledger_key).await?;
            let mut parts = ledger.lock();
            for row in rows {
                parts.insert(
                    row.part_number,
                    PartRecord {
                        part_number: row.part_number,
                        etag: row.etag,
                        size: row.size as u64,
                    },
                );
            }
        }
        Ok(())
    }

    pub async fn has_part(&self, part_number: u32) -> Result<bool, anyhow::Error> {
        Ok(self.get_part(part_number).await?.is_some())
    }

    pub async fn get_part(&self, part_number: u32) -> Result<Option<PartRecord>, anyhow::Error> {
        match self {
            Self::Memory(ledger) => Ok(ledger.lock().get(&part_number).cloned()),
            Self::Persistent(ledger) => Ok(ledger.lock().get(&part_number).cloned()),
            Self::Server(ledger) => {
                let rows = upload_parts_repo::load(&ledger.db, &ledger.ledger_key).await?;
                Ok(rows
                    .into_iter()
                    .find(|r| r.part_number == part_number)
                    .map(row_to_part))
            }
        }
    }

    pub async fn record_part(&self, part: PartRecord) -> Result<(), anyhow::Error> {
        match self {
            Self::Memory(ledger) => {
                ledger.lock().insert(part.part_number, part);
                Ok(())
            }
            Self::Persistent(ledger) => {
                ledger.lock().insert(part.part_number, part);
                ledger.dirty.store(true, Ordering::Relaxed);
                ledger.maybe_flush().await
            }
            Self::Server(ledger) => {
                upload_parts_repo::record_part(
                    &ledger.db,
                    &ledger.ledger_key,
                    part.part_number,
                    part.etag.as_deref(),
                    part.size as i64,
                )
                .await
            }
        }
    }

    pub async fn replace_all(&self, parts: Vec<PartRecord>) -> Result<(), anyhow::Error> {
        match self {
            Self::Memory(ledger) => {
                let mut map = ledger.lock();
                map.clear();
                map.extend(parts.into_iter().map(|p| (p.part_number, p)));
                Ok(())
            }
            Self::Persistent(ledger) => {
                {
                    let mut map = ledger.lock();
                    map.clear();
                    map.extend(parts.iter().cloned().map(|p| (p.part_number, p)));
                }
                upload_parts_repo::replace_all(
                    &ledger.db,
                    &ledger.ledger_key,
                    &parts.iter().map(part_to_row).collect::<Vec<_>>(),
                )
                .await
            }
            Self::Server(ledger) => {
                upload_parts_repo::replace_all(
                    &ledger.db,
                    &ledger.ledger_key,
                    &parts.iter().map(part_to_row).collect::<Vec<_>>(),
                )
                .await
            }
        }
    }

    /// Fold the client's view in: incoming parts win when they carry an
    /// etag the ledger is missing.
    pub async fn merge_incoming(&self, incoming: &[PartRecord]) -> Result<(), anyhow::Error> {
        for part in incoming {
            let keep_existing = match self.get_part(part.part_number).await? {
                Some(existing) => existing.etag.is_some() && part.etag.is_none(),
                None => false,
            };
            if !keep_existing {
                self.record_part(part.clone()).await?;
            }
        }
        Ok(())
    }

    /// Every recorded part, sorted by part number.
    pub async fn to_complete_parts(&self) -> Result<Vec<PartRecord>, anyhow::Error> {
        match self {
            Self::Memory(ledger) => Ok(ledger.lock().values().cloned().collect()),
            Self::Persistent(ledger) => Ok(ledger.lock().values().cloned().collect()),
            Self::Server(ledger) => {
                let rows = upload_parts_repo::load(&ledger.db, &ledger.ledger_key).await?;
                Ok(rows.into_iter().map(row_to_part).collect())
            }
        }
    }

    pub fn clear_in_memory(&self) {
        match self {
            Self::Memory(ledger) => ledger.lock().clear(),
            Self::Persistent(ledger) => ledger.lock().clear(),
            Self::Server(_) => {}
        }
    }

    pub async fn clear_persistent(&self) -> Result<(), anyhow::Error> {
        match self {
            Self::Memory(_) => Ok(()),
            Self::Persistent(ledger) => {
                upload_parts_repo::clear(&ledger.db, &ledger.ledger_key).await
            }
            Self::Server(ledger) => upload_parts_repo::clear(&ledger.db, &ledger.ledger_key).await,
        }
    }

    pub async fn flush_now(&self) -> Result<(), anyhow::Error> {
        if let Self::Persistent(ledger) = self {
            ledger.flush().await?;
        }
        Ok(())
    }
}

fn row_to_part(row: PartRow) -> PartRecord {
    PartRecord {
        part_number: row.part_number,
        etag: row.etag,
        size: row.size as u64,
    }
}

fn part_to_row(part: &PartRecord) -> PartRow {
    PartRow {
        part_number: part.part_number,
        etag: part.etag.clone(),
        size: part.size as i64,
    }
}

#[derive(Default)]
pub struct MemoryLedger {
    parts: Mutex<BTreeMap<u32, PartRecord>>,
}

impl MemoryLedger {
    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u32, PartRecord>> {
        self.parts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct PersistentLedger {
    db: SqlitePool,
    ledger_key: String,
    parts: Mutex<BTreeMap<u32, PartRecord>>,
    dirty: AtomicBool,
    last_flush: Mutex<Instant>,
}

impl PersistentLedger {
    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u32, PartRecord>> {
        self.parts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn maybe_flush(&self) -> Result<(), anyhow::Error> {
        let due = {
            let mut last = self
                .last_flush
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if last.elapsed() >= FLUSH_DEBOUNCE {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if due { self.flush().await } else { Ok(()) }
    }

    async fn flush(&self) -> Result<(), anyhow::Error> {
        if !self.dirty.swap(false, Ordering::Relaxed) {
            return Ok(());
        }
        let rows: Vec<PartRow> = self.lock().values().map(part_to_row).collect();
        upload_parts_repo::replace_all(&self.db, &self.ledger_key, &rows).await
    }
}

pub struct ServerLedger {
    db: SqlitePool,
    ledger_key: String,
}

#[cfg(test)]
mod tests {
    use portico_driver_api::{PartRecord, PartsLedgerPolicy};
    use portico_storage::db;

    use super::PartsLedger;

    fn part(n: u32, etag: Option<&str>) -> PartRecord {
        PartRecord {
            part_number: n,
            etag: etag.map(str::to_string),
            size: 5,
        }
    }

    #[tokio::test]
    async fn memory_ledger_round_trip() {
        let pool = db::init_in_memory().await.unwrap();
        let ledger = PartsLedger::for_policy(PartsLedgerPolicy::ServerCanList, pool, "k", "u");

        ledger.record_part(part(2, Some("e2"))).await.unwrap();
        ledger.record_part(part(1, Some("e1"))).await.unwrap();
        assert!(ledger.has_part(1).await.unwrap());
        assert!(!ledger.has_part(3).await.unwrap());

        let parts = ledger.to_complete_parts().await.unwrap();
        assert_eq!(parts.iter().map(|p| p.part_number).collect::<Vec<_>>(), [1, 2]);
    }

    #[tokio::test]
    async fn persistent_ledger_survives_reload() {
        let pool = db::init_in_memory().await.unwrap();
        let ledger = PartsLedger::for_policy(
            PartsLedgerPolicy::ClientKeeps,
            pool.clone(),
            "docs/big.bin",
            "u1",
        );
        ledger.record_part(part(1, Some("e1"))).await.unwrap();
        ledger.record_part(part(2, Some("e2"))).await.unwrap();
        ledger.flush_now().await.unwrap();

        // A new ledger for the same storage key (page reload) sees them.
        let reloaded = PartsLedger::for_policy(
            PartsLedgerPolicy::ClientKeeps,
            pool,
            "docs/big.bin",
            "u2",
        );
        reloaded.load().await.unwrap();
        let parts = reloaded.to_complete_parts().await.unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].etag.as_deref(), Some("e1"));
    }

    #[tokio::test]
    async fn server_ledger_reads_rows_directly() {
        let pool = db::init_in_memory().await.unwrap();
        let ledger =
            PartsLedger::for_policy(PartsLedgerPolicy::ServerRecords, pool, "k", "sess-1");
        ledger.record_part(part(1, None)).await.unwrap();
        ledger.record_part(part(2, None)).await.unwrap();

        assert_eq!(ledger.to_complete_parts().await.unwrap().len(), 2);
        ledger.clear_persistent().await.unwrap();
        assert!(ledger.to_complete_parts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn merge_prefers_etag_bearing_records() {
        let pool = db::init_in_memory().await.unwrap();
        let ledger = PartsLedger::for_policy(PartsLedgerPolicy::ServerCanList, pool, "k", "u");
        ledger.record_part(part(1, Some("server-etag"))).await.unwrap();

        ledger
            .merge_incoming(&[part(1, None), part(2, Some("e2"))])
            .await
            .unwrap();
        let parts = ledger.to_complete_parts().await.unwrap();
        assert_eq!(parts[0].etag.as_deref(), Some("server-etag"));
        assert_eq!(parts[1].etag.as_deref(), Some("e2"));
    }
}
