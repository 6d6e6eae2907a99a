//! Upload engine: strategy selection and the server-assisted multipart
//! protocol (init, per-part signing, chunk PUTs with an ETag ledger,
//! complete, abort, resumable sessions).

pub mod ledger;
pub mod sessions;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use portico_core::permissions;
use portico_driver_api::{
    Capabilities, DriverError, MultipartStrategy, PartRecord, PartsLedgerPolicy, PresignedPartUrl,
    PresignedUpload, SigningMode, UploadPolicy, UploadSessionInfo, WriteResult,
};
use portico_storage::index_repo::DirtyOp;
use portico_vfs::cache::TtlCache;
use portico_vfs::{FsService, Viewer};

use ledger::PartsLedger;
use sessions::{SessionHandle, SessionManager, UploadSession};

/// Margin under which a cached presigned URL is considered stale.
const URL_EXPIRY_MARGIN_MS: i64 = 30_000;
const COMMIT_DEDUPE_TTL: Duration = Duration::from_secs(24 * 3600);

/// Upload strategies in fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Multipart,
    PresignedSingle,
    BackendStream,
    BackendForm,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Multipart => "multipart",
            Self::PresignedSingle => "presigned_single",
            Self::BackendStream => "backend_stream",
            Self::BackendForm => "backend_form",
        }
    }
}

const FALLBACK_ORDER: [Strategy; 4] = [
    Strategy::Multipart,
    Strategy::PresignedSingle,
    Strategy::BackendStream,
    Strategy::BackendForm,
];

/// Intersect the requested mode with the driver's capabilities, falling
/// back down the chain when unsupported.
pub fn select_strategy(
    caps: &Capabilities,
    requested: Option<&str>,
) -> Result<Strategy, DriverError> {
    let start = match requested {
        None | Some("") | Some("auto") => 0,
        Some("multipart") => 0,
        Some("presigned") | Some("presigned_single") => 1,
        Some("stream") | Some("backend_stream") => 2,
        Some("form") | Some("backend_form") => 3,
        Some(other) => {
            return Err(DriverError::invalid_input(format!(
                "unknown upload mode: {other}"
            )));
        }
    };

    let supported = |strategy: Strategy| match strategy {
        Strategy::Multipart => caps.fs.multipart,
        Strategy::PresignedSingle => caps.fs.presigned_single,
        Strategy::BackendStream => caps.fs.backend_stream,
        Strategy::BackendForm => caps.fs.backend_form,
    };

    FALLBACK_ORDER[start..]
        .iter()
        .copied()
        .find(|s| supported(*s))
        .ok_or_else(|| {
            DriverError::unsupported(format!(
                "{} supports no upload strategy at or below the requested mode",
                caps.storage_type
            ))
        })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    pub file_id: String,
    pub strategy: MultipartStrategy,
    pub upload_id: String,
    pub part_size: u64,
    pub total_parts: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub presigned_urls: Vec<PresignedPartUrl>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<UploadSessionInfo>,
    pub policy: UploadPolicy,
    pub skip_upload: bool,
    pub resumed: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignResponse {
    pub presigned_urls: Vec<PresignedPartUrl>,
    pub policy: UploadPolicy,
    pub reset_uploaded_parts: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResponse {
    pub part_number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    pub skipped: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartsResponse {
    pub parts: Vec<PartRecord>,
    pub policy: PartsLedgerPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_offset: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResponse {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

pub struct UploadEngine {
    db: SqlitePool,
    fs: Arc<FsService>,
    pub sessions: Arc<SessionManager>,
    http: reqwest::Client,
    committed: TtlCache<String, Option<String>>,
}

impl UploadEngine {
    pub fn new(db: SqlitePool, fs: Arc<FsService>, sessions: Arc<SessionManager>) -> Self {
        Self {
            db,
            fs,
            sessions,
            http: reqwest::Client::new(),
            committed: TtlCache::new(),
        }
    }

    fn now_ms() -> i64 {
        (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
    }

    fn session_of(&self, file_id: &str) -> Result<Arc<SessionHandle>, DriverError> {
        self.sessions
            .get(file_id)
            .ok_or_else(|| DriverError::session_expired("unknown or expired upload session"))
    }

    async fn check_owner(
        &self,
        viewer: &Viewer,
        handle: &SessionHandle,
    ) -> Result<(), DriverError> {
        if viewer.is_admin() {
            return Ok(());
        }
        let state = handle.state.lock().await;
        if state.owner == viewer.owner_id() {
            Ok(())
        } else {
            Err(DriverError::permission_denied("not your upload session"))
        }
    }

    /// Initialize a multipart upload and register the session.
    pub async fn init_multipart(
        &self,
        viewer: &Viewer,
        path: &str,
        size: u64,
        content_type: &str,
        part_size_hint: Option<u64>,
        sha256: Option<&str>,
    ) -> Result<InitResponse, anyhow::Error> {
        let resolved = self
            .fs
            .resolve(viewer, path, permissions::MOUNT_UPLOAD)
            .await?;
        let caps = resolved.driver.capabilities();
        if caps.multipart.is_none() {
            return Err(DriverError::unsupported(format!(
                "{} does not support multipart uploads",
                caps.storage_type
            ))
            .into());
        }
        if caps.sha256_required_for_presign && sha256.is_none() {
            return Err(
                DriverError::invalid_input("this backend requires a client-computed sha256").into(),
            );
        }

        let init = resolved
            .driver
            .init_multipart(&resolved.key, size, content_type, part_size_hint, sha256)
            .await?;
        let total_parts = init
            .total_parts
            .unwrap_or_else(|| size.div_ceil(init.part_size).max(1) as u32);

        let file_id = Uuid::new_v4().to_string();
        let ledger = PartsLedger::for_policy(
            init.policy.parts_ledger_policy,
            self.db.clone(),
            &init.key,
            &init.upload_id,
        );
        ledger.load().await?;
        let resumed = !ledger.to_complete_parts().await?.is_empty();

        let mut signed_urls = std::collections::BTreeMap::new();
        for url in &init.presigned_urls {
            signed_urls.insert(url.part_number, url.clone());
        }

        let session = UploadSession {
            file_id: file_id.clone(),
            strategy: init.strategy,
            upload_id: init.upload_id.clone(),
            storage_key: init.key.clone(),
            target_path: resolved.path.clone(),
            mount_id: resolved.mount.id.clone(),
            storage_config_id: resolved.config.id.clone(),
            part_size: init.part_size,
            total_size: size,
            total_parts,
            content_type: content_type.to_string(),
            policy: init.policy.clone(),
            session: init.session.clone(),
            sha256: sha256.map(str::to_string),
            skip_upload: init.skip_upload,
            owner: viewer.owner_id(),
            resumed,
            signed_urls,
        };
        self.sessions.insert(session, ledger);

        tracing::info!(
            file_id = %file_id,
            path = %resolved.path,
            strategy = init.strategy.as_str(),
            part_size = init.part_size,
            total_parts,
            skip_upload = init.skip_upload,
            "multipart upload initialized"
        );

        Ok(InitResponse {
            file_id,
            strategy: init.strategy,
            upload_id: init.upload_id,
            part_size: init.part_size,
            total_parts,
            presigned_urls: init.presigned_urls,
            session: init.session,
            policy: init.policy,
            skip_upload: init.skip_upload,
            resumed,
        })
    }

    /// Sign part URLs. Concurrent callers for the same session serialize on
    /// a gate and reuse freshly signed, unexpired URLs.
    pub async fn sign_parts(
        &self,
        viewer: &Viewer,
        file_id: &str,
        part_numbers: &[u32],
    ) -> Result<SignResponse, anyhow::Error> {
        if part_numbers.is_empty() {
            return Err(DriverError::invalid_input("no part numbers requested").into());
        }
        let handle = self.session_of(file_id)?;
        self.check_owner(viewer, &handle).await?;

        let _gate = handle.sign_gate.lock().await;

        // Another caller may have signed this window while we waited.
        let (cached, policy) = {
            let state = handle.state.lock().await;
            let fresh_until = Self::now_ms() + URL_EXPIRY_MARGIN_MS;
            let cached: Vec<PresignedPartUrl> = part_numbers
                .iter()
                .filter_map(|pn| state.signed_urls.get(pn))
                .filter(|u| u.expires_at_ms > fresh_until)
                .cloned()
                .collect();
            (cached, state.policy.clone())
        };
        if cached.len() == part_numbers.len() {
            return Ok(SignResponse {
                presigned_urls: cached,
                policy,
                reset_uploaded_parts: false,
            });
        }

        let (target_path, storage_key, upload_id, window) = {
            let state = handle.state.lock().await;
            let window = match state.policy.signing_mode {
                SigningMode::OnDemand => part_numbers.to_vec(),
                SigningMode::Eager | SigningMode::Batched => {
                    let start = part_numbers.iter().copied().min().unwrap_or(1);
                    let end = (start + state.policy.max_parts_per_request - 1)
                        .min(state.total_parts)
                        .max(part_numbers.iter().copied().max().unwrap_or(start));
                    (start..=end).collect()
                }
            };
            (
                state.target_path.clone(),
                state.storage_key.clone(),
                state.upload_id.clone(),
                window,
            )
        };

        let resolved = self
            .fs
            .resolve(viewer, &target_path, permissions::MOUNT_UPLOAD)
            .await?;
        let signed = resolved
            .driver
            .sign_parts(&storage_key, &upload_id, &window)
            .await?;

        if signed.reset_uploaded_parts {
            handle.ledger.clear_in_memory();
            handle.ledger.clear_persistent().await?;
            let mut state = handle.state.lock().await;
            state.signed_urls.clear();
            return Ok(SignResponse {
                presigned_urls: Vec::new(),
                policy,
                reset_uploaded_parts: true,
            });
        }

        let mut state = handle.state.lock().await;
        for url in &signed.presigned_urls {
            state.signed_urls.insert(url.part_number, url.clone());
        }
        let out = part_numbers
            .iter()
            .filter_map(|pn| state.signed_urls.get(pn))
            .cloned()
            .collect::<Vec<_>>();
        if out.len() != part_numbers.len() {
            return Err(
                DriverError::upstream_fatal("backend did not sign every requested part").into(),
            );
        }

        Ok(SignResponse {
            presigned_urls: out,
            policy,
            reset_uploaded_parts: false,
        })
    }

    /// Gateway-assisted part upload. For `per_part_url` the chunk is PUT to
    /// the backend's presigned URL (re-signing silently on signature
    /// expiry); for `single_session` it is PUT to the session URL with a
    /// `Content-Range`.
    pub async fn upload_chunk(
        &self,
        viewer: &Viewer,
        file_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<ChunkResponse, anyhow::Error> {
        let handle = self.session_of(file_id)?;
        self.check_owner(viewer, &handle).await?;

        let (strategy, skip_upload, part_size, total_size, total_parts, session_info, max_attempts) = {
            let state = handle.state.lock().await;
            (
                state.strategy,
                state.skip_upload,
                state.part_size,
                state.total_size,
                state.total_parts,
                state.session.clone(),
                state.policy.max_attempts.max(1),
            )
        };
        if part_number == 0 || part_number > total_parts {
            return Err(DriverError::invalid_input(format!(
                "part number {part_number} out of range 1..={total_parts}"
            ))
            .into());
        }

        if skip_upload {
            handle
                .ledger
                .record_part(PartRecord {
                    part_number,
                    etag: None,
                    size: data.len() as u64,
                })
                .await?;
            return Ok(ChunkResponse {
                part_number,
                etag: None,
                skipped: true,
            });
        }

        match strategy {
            MultipartStrategy::PerPartUrl => {
                let mut attempt = 1u32;
                loop {
                    let url = self.signed_url_for(viewer, &handle, part_number).await?;
                    let res = self
                        .http
                        .put(&url)
                        .header(reqwest::header::CONTENT_LENGTH, data.len() as u64)
                        .body(data.clone())
                        .send()
                        .await;

                    match res {
                        Ok(res) if res.status().is_success() => {
                            let etag = res
                                .headers()
                                .get(reqwest::header::ETAG)
                                .and_then(|v| v.to_str().ok())
                                .map(str::to_string);
                            handle
                                .ledger
                                .record_part(PartRecord {
                                    part_number,
                                    etag: etag.clone(),
                                    size: data.len() as u64,
                                })
                                .await?;
                            return Ok(ChunkResponse {
                                part_number,
                                etag,
                                skipped: false,
                            });
                        }
                        Ok(res) if res.status() == reqwest::StatusCode::NOT_FOUND => {
                            return Err(DriverError::session_expired(
                                "the backend no longer knows this upload",
                            )
                            .into());
                        }
                        Ok(res)
                            if matches!(
                                res.status(),
                                reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN
                            ) =>
                        {
                            let body = res.text().await.unwrap_or_default();
                            if attempt >= max_attempts {
                                return Err(DriverError::signature_expired(format!(
                                    "part {part_number} kept failing auth after {attempt} attempts: {body}"
                                ))
                                .into());
                            }
                            tracing::debug!(
                                file_id,
                                part_number,
                                attempt,
                                "part PUT rejected; re-signing"
                            );
                            handle.state.lock().await.signed_urls.remove(&part_number);
                            attempt += 1;
                        }
                        Ok(res) => {
                            return Err(DriverError::upstream_fatal(format!(
                                "part {part_number} PUT failed: HTTP {}",
                                res.status()
                            ))
                            .into());
                        }
                        Err(error) if attempt < max_attempts => {
                            tracing::debug!(
                                file_id,
                                part_number,
                                attempt,
                                error = %error,
                                "part PUT network failure; retrying"
                            );
                            attempt += 1;
                        }
                        Err(error) => {
                            return Err(DriverError::upstream_transient(format!(
                                "part {part_number} PUT failed: {error}"
                            ))
                            .into());
                        }
                    }
                }
            }
            MultipartStrategy::SingleSession => {
                let session = session_info.ok_or_else(|| {
                    DriverError::internal("single-session upload is missing its session info")
                })?;
                if data.is_empty() {
                    return Err(DriverError::invalid_input("empty chunk").into());
                }
                let start = part_size * (part_number as u64 - 1);
                if start >= total_size {
                    return Err(DriverError::invalid_input("chunk beyond end of file").into());
                }
                let end = (start + data.len() as u64).min(total_size) - 1;
                let content_range = format!("bytes {start}-{end}/{total_size}");

                let res = self
                    .http
                    .put(&session.upload_url)
                    .header(reqwest::header::CONTENT_RANGE, content_range)
                    .header(reqwest::header::CONTENT_LENGTH, data.len() as u64)
                    .body(data.clone())
                    .send()
                    .await
                    .map_err(|e| {
                        DriverError::upstream_transient(format!("session PUT failed: {e}"))
                    })?;

                match res.status() {
                    s if s.is_success() => {
                        handle
                            .ledger
                            .record_part(PartRecord {
                                part_number,
                                etag: None,
                                size: data.len() as u64,
                            })
                            .await?;
                        Ok(ChunkResponse {
                            part_number,
                            etag: None,
                            skipped: false,
                        })
                    }
                    reqwest::StatusCode::NOT_FOUND => Err(DriverError::session_expired(
                        "the upload session was lost; restart the upload",
                    )
                    .into()),
                    s => Err(DriverError::upstream_fatal(format!(
                        "session PUT failed: HTTP {s}"
                    ))
                    .into()),
                }
            }
        }
    }

    async fn signed_url_for(
        &self,
        viewer: &Viewer,
        handle: &Arc<SessionHandle>,
        part_number: u32,
    ) -> Result<String, anyhow::Error> {
        {
            let state = handle.state.lock().await;
            if let Some(url) = state.signed_urls.get(&part_number)
                && url.expires_at_ms > Self::now_ms() + URL_EXPIRY_MARGIN_MS
            {
                return Ok(url.url.clone());
            }
        }
        let file_id = handle.state.lock().await.file_id.clone();
        let signed = self.sign_parts(viewer, &file_id, &[part_number]).await?;
        if signed.reset_uploaded_parts {
            return Err(DriverError::session_expired(
                "the upload session was reset; restart the upload",
            )
            .into());
        }
        signed
            .presigned_urls
            .into_iter()
            .find(|u| u.part_number == part_number)
            .map(|u| u.url)
            .ok_or_else(|| {
                DriverError::upstream_fatal("backend did not sign the requested part").into()
            })
    }

    /// The resume view: parts per the ledger policy, plus the byte offset a
    /// single-session upload should continue from.
    pub async fn list_parts(
        &self,
        viewer: &Viewer,
        file_id: &str,
    ) -> Result<PartsResponse, anyhow::Error> {
        let handle = self.session_of(file_id)?;
        self.check_owner(viewer, &handle).await?;

        let (policy, strategy, target_path, storage_key, upload_id, part_size) = {
            let state = handle.state.lock().await;
            (
                state.policy.parts_ledger_policy,
                state.strategy,
                state.target_path.clone(),
                state.storage_key.clone(),
                state.upload_id.clone(),
                state.part_size,
            )
        };

        let parts = match policy {
            PartsLedgerPolicy::ServerCanList => {
                let resolved = self
                    .fs
                    .resolve(viewer, &target_path, permissions::MOUNT_UPLOAD)
                    .await?;
                resolved.driver.list_parts(&storage_key, &upload_id).await?
            }
            PartsLedgerPolicy::ClientKeeps | PartsLedgerPolicy::ServerRecords => {
                handle.ledger.load().await?;
                handle.ledger.to_complete_parts().await?
            }
        };

        let resume_offset = if strategy == MultipartStrategy::SingleSession {
            let resolved = self
                .fs
                .resolve(viewer, &target_path, permissions::MOUNT_UPLOAD)
                .await?;
            match resolved.driver.refresh_session(&storage_key, &upload_id).await {
                Ok(info) => {
                    let mut state = handle.state.lock().await;
                    state.session = Some(info.clone());
                    info.next_expected_ranges
                        .first()
                        .and_then(|r| r.split('-').next())
                        .and_then(|v| v.parse::<u64>().ok())
                }
                Err(error) if error.kind() == portico_driver_api::ErrorKind::SessionExpired => {
                    return Err(error.into());
                }
                Err(_) => Some(parts.len() as u64 * part_size),
            }
        } else {
            None
        };

        Ok(PartsResponse {
            parts,
            policy,
            resume_offset,
        })
    }

    /// Merge the client's parts with the ledger, verify, and finalize.
    pub async fn complete(
        &self,
        viewer: &Viewer,
        file_id: &str,
        incoming: &[PartRecord],
    ) -> Result<CompleteResponse, anyhow::Error> {
        let handle = self.session_of(file_id)?;
        self.check_owner(viewer, &handle).await?;

        let (strategy, skip_upload, total_parts, target_path, storage_key, upload_id, mount_id) = {
            let state = handle.state.lock().await;
            (
                state.strategy,
                state.skip_upload,
                state.total_parts,
                state.target_path.clone(),
                state.storage_key.clone(),
                state.upload_id.clone(),
                state.mount_id.clone(),
            )
        };

        handle.ledger.merge_incoming(incoming).await?;
        let parts = handle.ledger.to_complete_parts().await?;

        if !skip_upload && strategy == MultipartStrategy::PerPartUrl {
            if parts.len() as u32 != total_parts {
                return Err(DriverError::invalid_input(format!(
                    "expected {total_parts} parts, have {}",
                    parts.len()
                ))
                .into());
            }
            for (idx, part) in parts.iter().enumerate() {
                if part.part_number != idx as u32 + 1 {
                    return Err(DriverError::invalid_input(format!(
                        "parts are not contiguous at {}",
                        part.part_number
                    ))
                    .into());
                }
                if part.etag.as_deref().is_none_or(str::is_empty) {
                    return Err(DriverError::invalid_input(format!(
                        "part {} has no ETag",
                        part.part_number
                    ))
                    .into());
                }
            }
        }

        let resolved = self
            .fs
            .resolve(viewer, &target_path, permissions::MOUNT_UPLOAD)
            .await?;
        let result = resolved
            .driver
            .complete_multipart(&storage_key, &upload_id, &parts)
            .await?;

        handle.ledger.clear_persistent().await?;
        handle.ledger.clear_in_memory();
        self.sessions.remove(file_id);
        self.fs
            .note_change(&mount_id, &storage_key, DirtyOp::Upsert)
            .await;

        tracing::info!(file_id, path = %target_path, "multipart upload completed");
        Ok(CompleteResponse {
            path: target_path,
            etag: result.etag,
        })
    }

    /// Best-effort abort; never raises.
    pub async fn abort(&self, viewer: &Viewer, file_id: &str) {
        let Some(handle) = self.sessions.get(file_id) else {
            return;
        };
        if self.check_owner(viewer, &handle).await.is_err() {
            return;
        }

        let (target_path, storage_key, upload_id) = {
            let state = handle.state.lock().await;
            (
                state.target_path.clone(),
                state.storage_key.clone(),
                state.upload_id.clone(),
            )
        };

        if let Ok(resolved) = self
            .fs
            .resolve(viewer, &target_path, permissions::MOUNT_UPLOAD)
            .await
            && let Err(error) = resolved.driver.abort_multipart(&storage_key, &upload_id).await
        {
            tracing::debug!(file_id, error = %error, "abort_multipart failed (ignored)");
        }

        handle.ledger.clear_in_memory();
        if let Err(error) = handle.ledger.clear_persistent().await {
            tracing::debug!(file_id, error = %error, "ledger clear failed (ignored)");
        }
        self.sessions.remove(file_id);
        tracing::info!(file_id, "multipart upload aborted");
    }

    pub async fn presign_single(
        &self,
        viewer: &Viewer,
        path: &str,
        size: u64,
        content_type: &str,
        sha256: Option<&str>,
    ) -> Result<PresignedUpload, anyhow::Error> {
        let resolved = self
            .fs
            .resolve(viewer, path, permissions::MOUNT_UPLOAD)
            .await?;
        let caps = resolved.driver.capabilities();
        if !caps.fs.presigned_single {
            return Err(DriverError::unsupported(format!(
                "{} does not support presigned uploads",
                caps.storage_type
            ))
            .into());
        }
        if caps.sha256_required_for_presign && sha256.is_none() {
            return Err(
                DriverError::invalid_input("this backend requires a client-computed sha256").into(),
            );
        }
        Ok(resolved
            .driver
            .presign_single(&resolved.key, size, content_type, sha256)
            .await?)
    }

    /// Finalize a presigned upload. Idempotent per `(path, sha256|etag)`:
    /// a duplicate commit returns the first result and enqueues nothing.
    pub async fn commit_presigned(
        &self,
        viewer: &Viewer,
        path: &str,
        etag: Option<&str>,
        sha256: Option<&str>,
        content_type: Option<&str>,
        size: u64,
    ) -> Result<WriteResult, anyhow::Error> {
        let resolved = self
            .fs
            .resolve(viewer, path, permissions::MOUNT_UPLOAD)
            .await?;

        let dedupe_key = format!(
            "{}|{}",
            resolved.path,
            sha256.or(etag).unwrap_or_default()
        );
        if let Some(previous) = self.committed.get(&dedupe_key) {
            return Ok(WriteResult { etag: previous });
        }

        let result = resolved
            .driver
            .commit_presigned(&portico_driver_api::CommitRequest {
                key: resolved.key.clone(),
                etag: etag.map(str::to_string),
                sha256: sha256.map(str::to_string),
                content_type: content_type.map(str::to_string),
                size,
            })
            .await?;

        self.committed
            .put(dedupe_key, result.etag.clone(), COMMIT_DEDUPE_TTL);
        self.fs
            .note_change(&resolved.mount.id, &resolved.key, DirtyOp::Upsert)
            .await;
        Ok(result)
    }
}

#[cfg(test)]
mod tests;
