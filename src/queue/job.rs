//! Job, queue and completion records shared by the manager, ledger and CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transport::{SessionState, TransportKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Downloading,
    Completed,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }
}

/// Body sent to the conversion server for one job attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub job_id: String,
    pub item_id: String,
    pub format: String,
    pub quality: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadJob {
    pub id: String,
    pub item_id: String,
    pub format: String,
    pub quality: String,
    pub title: String,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forced_transport: Option<TransportKind>,
}

impl DownloadJob {
    pub fn new(
        id: impl Into<String>,
        item_id: impl Into<String>,
        format: impl Into<String>,
        quality: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            item_id: item_id.into(),
            format: format.into(),
            quality: quality.into(),
            title: title.into(),
            status: JobStatus::Queued,
            progress: 0,
            output_path: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            forced_transport: None,
        }
    }

    /// Pin this job to one transport, bypassing the selector's policy
    pub fn with_transport(mut self, kind: TransportKind) -> Self {
        self.forced_transport = Some(kind);
        self
    }

    pub fn request(&self) -> JobRequest {
        JobRequest {
            job_id: self.id.clone(),
            item_id: self.item_id.clone(),
            format: self.format.clone(),
            quality: self.quality.clone(),
            title: self.title.clone(),
        }
    }

    /// History entry rebuilt from a stored completion
    pub fn from_completed(record: &CompletedRecord) -> Self {
        let completed_at = DateTime::<Utc>::from_timestamp_millis(record.completed_at_epoch_ms);
        Self {
            id: record.id.clone(),
            item_id: record.source_item_id.clone(),
            format: record.format.clone(),
            quality: String::new(),
            title: record.title.clone(),
            status: JobStatus::Completed,
            progress: 100,
            output_path: Some(record.final_path.clone()),
            error: None,
            created_at: completed_at.unwrap_or_else(Utc::now),
            started_at: None,
            completed_at,
            forced_transport: None,
        }
    }

    /// Completion record for a job that just delivered `filename` to `final_path`
    pub fn completed_record(&self, final_path: &str, filename: &str) -> CompletedRecord {
        CompletedRecord {
            id: self.id.clone(),
            source_item_id: self.item_id.clone(),
            title: self.title.clone(),
            format: self.format.clone(),
            final_path: final_path.to_string(),
            filename: filename.to_string(),
            completed_at_epoch_ms: self
                .completed_at
                .unwrap_or_else(Utc::now)
                .timestamp_millis(),
        }
    }

    /// Back to a fresh queued state; keeps identity and the transport override
    pub(crate) fn reset(&mut self) {
        self.status = JobStatus::Queued;
        self.progress = 0;
        self.output_path = None;
        self.error = None;
        self.started_at = None;
        self.completed_at = None;
    }
}

/// Durable form of the queue: written on every mutation, read once at start
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueRecord {
    pub active_job: Option<DownloadJob>,
    #[serde(default)]
    pub wait_list: Vec<DownloadJob>,
}

impl QueueRecord {
    /// Jobs to resume after a restart, in admission order.
    ///
    /// A previously active job goes first with its progress reset; it is
    /// re-requested from the server rather than reattached.
    pub fn into_resumed(self) -> Vec<DownloadJob> {
        let mut jobs = Vec::with_capacity(self.wait_list.len() + 1);
        if let Some(mut active) = self.active_job {
            active.reset();
            jobs.push(active);
        }
        jobs.extend(self.wait_list.into_iter().map(|mut job| {
            job.reset();
            job
        }));
        jobs
    }
}

/// One successfully delivered job, keyed by job id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedRecord {
    pub id: String,
    pub source_item_id: String,
    pub title: String,
    pub format: String,
    pub final_path: String,
    pub filename: String,
    pub completed_at_epoch_ms: i64,
}

/// Full queue state as published to subscribers after every mutation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub active: Option<DownloadJob>,
    pub session: Option<SessionState>,
    pub waiting: Vec<DownloadJob>,
    pub history: Vec<DownloadJob>,
}

impl QueueSnapshot {
    pub fn find(&self, id: &str) -> Option<&DownloadJob> {
        self.active
            .iter()
            .chain(self.waiting.iter())
            .chain(self.history.iter())
            .find(|job| job.id == id)
    }

    pub fn downloading_count(&self) -> usize {
        self.active
            .iter()
            .chain(self.waiting.iter())
            .chain(self.history.iter())
            .filter(|job| job.status == JobStatus::Downloading)
            .count()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.waiting.is_empty()
    }
}
