use std::fmt;

use async_trait::async_trait;

use crate::capabilities::Capabilities;
use crate::error::DriverError;
use crate::types::{
    ByteRange, ByteStream, CommitRequest, Entry, ListOptions, Listing, MultipartInit, PartRecord,
    PresignedUpload, QuotaInfo, ReadHandle, SignedParts, WriteResult,
};

/// Backend adapter contract.
///
/// All keys are backend storage keys (no leading slash). Operations a driver
/// does not support keep the default body and fail with
/// [`DriverError::unsupported`]; callers are expected to consult
/// [`Driver::capabilities`] first, so hitting a default is a programming
/// error surfaced as a clean failure rather than a panic.
#[async_trait]
pub trait Driver: Send + Sync {
    fn capabilities(&self) -> &Capabilities;

    async fn list(&self, key: &str, opts: &ListOptions) -> Result<Listing, DriverError>;

    async fn stat(&self, key: &str) -> Result<Option<Entry>, DriverError>;

    async fn read(&self, key: &str, range: Option<ByteRange>) -> Result<ReadHandle, DriverError>;

    async fn write(
        &self,
        key: &str,
        body: ByteStream,
        size: u64,
        content_type: &str,
    ) -> Result<WriteResult, DriverError>;

    async fn delete(&self, key: &str, recursive: bool) -> Result<(), DriverError>;

    async fn mkdir(&self, key: &str) -> Result<(), DriverError>;

    async fn rename(&self, src: &str, dst: &str) -> Result<(), DriverError> {
        let _ = (src, dst);
        Err(DriverError::unsupported("rename not supported"))
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<(), DriverError> {
        let _ = (src, dst);
        Err(DriverError::unsupported("server-side copy not supported"))
    }

    async fn presign_single(
        &self,
        key: &str,
        size: u64,
        content_type: &str,
        sha256: Option<&str>,
    ) -> Result<PresignedUpload, DriverError> {
        let _ = (key, size, content_type, sha256);
        Err(DriverError::unsupported("presigned upload not supported"))
    }

    async fn init_multipart(
        &self,
        key: &str,
        size: u64,
        content_type: &str,
        part_size_hint: Option<u64>,
        sha256: Option<&str>,
    ) -> Result<MultipartInit, DriverError> {
        let _ = (key, size, content_type, part_size_hint, sha256);
        Err(DriverError::unsupported("multipart upload not supported"))
    }

    async fn sign_parts(
        &self,
        key: &str,
        upload_id: &str,
        part_numbers: &[u32],
    ) -> Result<SignedParts, DriverError> {
        let _ = (key, upload_id, part_numbers);
        Err(DriverError::unsupported("part signing not supported"))
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartRecord],
    ) -> Result<WriteResult, DriverError> {
        let _ = (key, upload_id, parts);
        Err(DriverError::unsupported("multipart upload not supported"))
    }

    /// Best-effort; callers swallow failures, drivers should too where the
    /// backend already forgot the upload.
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), DriverError> {
        let _ = (key, upload_id);
        Ok(())
    }

    async fn list_parts(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<PartRecord>, DriverError> {
        let _ = (key, upload_id);
        Err(DriverError::unsupported("listing parts not supported"))
    }

    /// Re-query a single-session upload (next expected ranges). Used for
    /// resume; only meaningful for `single_session` drivers.
    async fn refresh_session(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Result<crate::types::UploadSessionInfo, DriverError> {
        let _ = (key, upload_id);
        Err(DriverError::unsupported("session refresh not supported"))
    }

    /// Register a presigned upload after the client's direct PUT. Must be
    /// idempotent per `(key, sha256|etag)`.
    async fn commit_presigned(&self, req: &CommitRequest) -> Result<WriteResult, DriverError> {
        let _ = req;
        Err(DriverError::unsupported("presigned commit not supported"))
    }

    /// Native public URL for a key, when the backend exposes one.
    fn public_url(&self, key: &str) -> Option<String> {
        let _ = key;
        None
    }

    async fn quota(&self) -> Result<Option<QuotaInfo>, DriverError> {
        Ok(None)
    }
}

impl fmt::Debug for dyn Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("dyn Driver")
            .field("capabilities", self.capabilities())
            .finish()
    }
}
