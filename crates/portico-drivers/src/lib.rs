//! Storage backend drivers.
//!
//! Each driver adapts one backend protocol to the [`portico_driver_api`]
//! contract. Connection parameters arrive as the decrypted
//! `storage_configs.settings_json` payload; drivers own their HTTP clients
//! and never see request-scoped state.

pub mod graph;
pub mod hflfs;
pub mod local;
pub mod memory;
pub mod s3;
mod sigv4;
mod util;
pub mod webdav;

pub use graph::GraphDriver;
pub use hflfs::HfLfsDriver;
pub use local::LocalDriver;
pub use memory::MemoryDriver;
pub use s3::S3Driver;
pub use webdav::WebdavDriver;
