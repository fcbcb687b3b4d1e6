use std::path::Path;

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use tracing::{debug, info};

use crate::queue::{CompletedRecord, QueueRecord};

use super::error::Result;
use super::partitions::{decode_done_key, encode_done_key, queue_snapshot_key};

/// Durable record store for queue snapshots and completed items
///
/// Calls are synchronous and short; the queue manager invokes them from its
/// own task between events.
pub trait Ledger: Send + Sync {
    /// Latest persisted queue record, if any
    fn load_queue(&self) -> Result<Option<QueueRecord>>;

    /// Replace the persisted queue record
    fn save_queue(&self, record: &QueueRecord) -> Result<()>;

    /// Store a completed item; a later write for the same id wins
    fn put_completed(&self, record: &CompletedRecord) -> Result<()>;

    fn get_completed(&self, job_id: &str) -> Result<Option<CompletedRecord>>;

    /// All completed items, oldest first
    fn list_completed(&self) -> Result<Vec<CompletedRecord>>;

    /// Returns whether a record existed
    fn remove_completed(&self, job_id: &str) -> Result<bool>;

    /// Returns how many records were dropped
    fn clear_completed(&self) -> Result<usize>;

    /// Flush pending writes to durable storage
    fn persist(&self) -> Result<()> {
        Ok(())
    }
}

/// Fjall-backed ledger
#[derive(Clone)]
pub struct FjallLedger {
    keyspace: Keyspace,
    queue: PartitionHandle,
    completed: PartitionHandle,
}

impl FjallLedger {
    /// Open or create a ledger at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening ledger at: {}", path.display());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyspace = Config::new(path).open()?;
        let queue = keyspace.open_partition("queue", PartitionCreateOptions::default())?;
        let completed = keyspace.open_partition("completed", PartitionCreateOptions::default())?;

        Ok(Self {
            keyspace,
            queue,
            completed,
        })
    }
}

impl Ledger for FjallLedger {
    fn load_queue(&self) -> Result<Option<QueueRecord>> {
        match self.queue.get(queue_snapshot_key())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn save_queue(&self, record: &QueueRecord) -> Result<()> {
        let value = serde_json::to_vec(record)?;
        self.queue.insert(queue_snapshot_key(), value)?;
        debug!(
            active = record.active_job.is_some(),
            waiting = record.wait_list.len(),
            "Queue snapshot saved"
        );
        Ok(())
    }

    fn put_completed(&self, record: &CompletedRecord) -> Result<()> {
        let value = serde_json::to_vec(record)?;
        self.completed.insert(encode_done_key(&record.id), value)?;
        debug!(job_id = %record.id, "Completed record stored");
        Ok(())
    }

    fn get_completed(&self, job_id: &str) -> Result<Option<CompletedRecord>> {
        match self.completed.get(encode_done_key(job_id))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn list_completed(&self) -> Result<Vec<CompletedRecord>> {
        let mut records = Vec::new();
        for item in self.completed.iter() {
            let (_, value) = item?;
            records.push(serde_json::from_slice::<CompletedRecord>(&value)?);
        }
        records.sort_by_key(|record| record.completed_at_epoch_ms);
        Ok(records)
    }

    fn remove_completed(&self, job_id: &str) -> Result<bool> {
        let key = encode_done_key(job_id);
        if self.completed.get(&key)?.is_none() {
            return Ok(false);
        }
        self.completed.remove(key)?;
        Ok(true)
    }

    fn clear_completed(&self) -> Result<usize> {
        let mut keys = Vec::new();
        for item in self.completed.iter() {
            let (key, _) = item?;
            if decode_done_key(&key).is_some() {
                keys.push(key);
            }
        }

        let removed = keys.len();
        for key in keys {
            self.completed.remove(key)?;
        }
        info!(removed, "Cleared completed records");
        Ok(removed)
    }

    fn persist(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::DownloadJob;
    use tempfile::TempDir;

    fn create_test_ledger() -> (FjallLedger, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let ledger = FjallLedger::open(temp_dir.path().join("ledger")).unwrap();
        (ledger, temp_dir)
    }

    fn completed(id: &str, at: i64) -> CompletedRecord {
        CompletedRecord {
            id: id.to_string(),
            source_item_id: format!("item-{}", id),
            title: format!("Title {}", id),
            format: "mp3".to_string(),
            final_path: format!("/downloads/{}.mp3", id),
            filename: format!("{}.mp3", id),
            completed_at_epoch_ms: at,
        }
    }

    #[test]
    fn test_queue_record_save_and_load() {
        let (ledger, _temp) = create_test_ledger();
        assert!(ledger.load_queue().unwrap().is_none());

        let record = QueueRecord {
            active_job: Some(DownloadJob::new("a", "item-a", "mp4", "1080p", "A")),
            wait_list: vec![DownloadJob::new("b", "item-b", "mp3", "320", "B")],
        };
        ledger.save_queue(&record).unwrap();

        let loaded = ledger.load_queue().unwrap().unwrap();
        assert_eq!(loaded.active_job.unwrap().id, "a");
        assert_eq!(loaded.wait_list.len(), 1);
    }

    #[test]
    fn test_completed_latest_write_wins() {
        let (ledger, _temp) = create_test_ledger();

        ledger.put_completed(&completed("job1", 10)).unwrap();
        let mut newer = completed("job1", 20);
        newer.final_path = "/elsewhere/job1.mp3".to_string();
        ledger.put_completed(&newer).unwrap();

        let records = ledger.list_completed().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].final_path, "/elsewhere/job1.mp3");
    }

    #[test]
    fn test_list_is_ordered_by_completion() {
        let (ledger, _temp) = create_test_ledger();
        ledger.put_completed(&completed("late", 300)).unwrap();
        ledger.put_completed(&completed("early", 100)).unwrap();

        let ids: Vec<_> = ledger
            .list_completed()
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[test]
    fn test_remove_and_clear() {
        let (ledger, _temp) = create_test_ledger();
        ledger.put_completed(&completed("one", 1)).unwrap();
        ledger.put_completed(&completed("two", 2)).unwrap();
        ledger.put_completed(&completed("three", 3)).unwrap();

        assert!(ledger.remove_completed("two").unwrap());
        assert!(!ledger.remove_completed("two").unwrap());
        assert!(ledger.get_completed("two").unwrap().is_none());

        assert_eq!(ledger.clear_completed().unwrap(), 2);
        assert!(ledger.list_completed().unwrap().is_empty());
    }

    #[test]
    fn test_persistence_across_reopens() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ledger");

        {
            let ledger = FjallLedger::open(&path).unwrap();
            ledger.put_completed(&completed("kept", 5)).unwrap();
            ledger.persist().unwrap();
        }

        let ledger = FjallLedger::open(&path).unwrap();
        assert_eq!(ledger.get_completed("kept").unwrap().unwrap().format, "mp3");
    }
}
