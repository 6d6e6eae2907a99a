//! SQLite persistence: schema, repositories and credential encryption.

pub mod admins_repo;
pub mod api_keys_repo;
pub mod backup;
pub mod db;
pub mod fs_meta_repo;
pub mod index_repo;
pub mod jobs_repo;
pub mod locks_repo;
pub mod mounts_repo;
pub mod password;
pub mod scheduled_repo;
pub mod secrets;
pub mod settings_repo;
pub mod shares_repo;
pub mod storage_configs_repo;
pub mod upload_parts_repo;

pub use secrets::SecretsCrypto;

pub(crate) fn now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

pub(crate) fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
