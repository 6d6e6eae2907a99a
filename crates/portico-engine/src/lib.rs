//! Background runtime: jobs, the upload engine, index maintenance and the
//! scheduled runner.

pub mod copy;
pub mod index;
pub mod jobs;
pub mod scheduler;
pub mod supervision;
#[cfg(test)]
pub(crate) mod test_support;
pub mod upload;

pub use jobs::{JobContext, JobHandler, JobRegistry, TooManyJobs};
pub use scheduler::{ScheduledRunner, TickSource};
pub use upload::UploadEngine;
