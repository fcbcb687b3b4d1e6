//! Download queue: job model, single-flight manager and its handle

mod handle;
pub mod job;
mod manager;

pub use handle::{EngineError, EngineHandle, Result};
pub use job::{
    CompletedRecord, DownloadJob, JobRequest, JobStatus, QueueRecord, QueueSnapshot,
};
pub(crate) use manager::ManagerSettings;
