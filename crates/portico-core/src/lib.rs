pub mod file_kind;
pub mod jobs;
pub mod paths;
pub mod permissions;

pub use file_kind::FileKind;
pub use jobs::{ItemResult, ItemStatus, JobStats, JobStatus, TriggerType};
