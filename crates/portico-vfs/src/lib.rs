//! Virtual filesystem: the path-addressed façade over mounts.
//!
//! Composes the mount router, the driver registry, the directory cache,
//! per-directory metadata and the search index into the operations the HTTP
//! and WebDAV layers expose.

pub mod cache;
pub mod errors;
pub mod link;
pub mod meta;
pub mod router;
pub mod search;
pub mod service;
pub mod viewer;

pub use cache::DirectoryCache;
pub use errors::{BasicPathDenied, IndexNotReady, PasswordRequired};
pub use link::{LinkType, UrlSigner};
pub use meta::PathTokenSigner;
pub use service::{FsService, Resolved};
pub use viewer::{ApiKeyIdentity, Viewer};
