//! Capability-typed storage driver contract.
//!
//! Every backend adapter implements [`Driver`] and declares a static
//! [`Capabilities`] descriptor. The upload engine and the VFS pick
//! strategies against those descriptors; nothing dispatches on the concrete
//! driver type at runtime.

mod capabilities;
mod driver;
mod error;
mod types;

pub use capabilities::{
    Capabilities, FsCapabilities, MultipartCapability, MultipartStrategy, PartSizeBounds,
    PartsLedgerPolicy, ShareCapabilities, SigningMode,
};
pub use driver::Driver;
pub use error::{DriverError, ErrorKind};
pub use types::{
    ByteRange, ByteStream, CommitRequest, Entry, ListOptions, Listing, MultipartInit, PartRecord,
    PresignedPartUrl, PresignedUpload, QuotaInfo, ReadHandle, SignedParts, UploadPolicy,
    UploadSessionInfo, WriteResult,
};
