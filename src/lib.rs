pub mod config;
pub mod engine;
pub mod humanize;
pub mod ledger;
pub mod observability;
pub mod queue;
pub mod storage;
pub mod transport;

pub use engine::{start, start_with};
pub use queue::{DownloadJob, EngineError, EngineHandle, JobStatus, QueueSnapshot};
