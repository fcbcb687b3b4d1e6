use std::collections::HashMap;

use parking_lot::Mutex;

use crate::queue::{CompletedRecord, QueueRecord};

use super::error::Result;
use super::store::Ledger;

/// In-process ledger for tests and `--ephemeral` runs
#[derive(Debug, Default)]
pub struct MemoryLedger {
    queue: Mutex<Option<QueueRecord>>,
    completed: Mutex<HashMap<String, CompletedRecord>>,
    queue_writes: Mutex<usize>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with a queue record, as if left behind by a previous run
    pub fn with_queue(record: QueueRecord) -> Self {
        let ledger = Self::default();
        *ledger.queue.lock() = Some(record);
        ledger
    }

    /// Number of queue snapshots written so far
    pub fn queue_writes(&self) -> usize {
        *self.queue_writes.lock()
    }
}

impl Ledger for MemoryLedger {
    fn load_queue(&self) -> Result<Option<QueueRecord>> {
        Ok(self.queue.lock().clone())
    }

    fn save_queue(&self, record: &QueueRecord) -> Result<()> {
        *self.queue.lock() = Some(record.clone());
        *self.queue_writes.lock() += 1;
        Ok(())
    }

    fn put_completed(&self, record: &CompletedRecord) -> Result<()> {
        self.completed
            .lock()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn get_completed(&self, job_id: &str) -> Result<Option<CompletedRecord>> {
        Ok(self.completed.lock().get(job_id).cloned())
    }

    fn list_completed(&self) -> Result<Vec<CompletedRecord>> {
        let mut records: Vec<_> = self.completed.lock().values().cloned().collect();
        records.sort_by_key(|record| record.completed_at_epoch_ms);
        Ok(records)
    }

    fn remove_completed(&self, job_id: &str) -> Result<bool> {
        Ok(self.completed.lock().remove(job_id).is_some())
    }

    fn clear_completed(&self) -> Result<usize> {
        let mut completed = self.completed.lock();
        let removed = completed.len();
        completed.clear();
        Ok(removed)
    }
}
