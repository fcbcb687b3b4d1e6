use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use super::job::{DownloadJob, QueueSnapshot};
use super::manager::{Command, ManagerSettings, QueueManager};
use crate::config::ConfigError;
use crate::ledger::LedgerError;
use crate::observability::{Metrics, MetricsSnapshot};
use crate::storage::StorageError;
use crate::transport::{HttpError, TransportKind};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("queue manager is not running")]
    Stopped,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("HTTP client error: {0}")]
    Http(#[from] HttpError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Cloneable front door to the queue manager
///
/// Mutating calls are fire-and-forget: they are queued on the manager's
/// mailbox and applied in order. Observe their effect through
/// [`EngineHandle::subscribe`] or [`EngineHandle::snapshot`].
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<QueueSnapshot>,
    metrics: Arc<Metrics>,
}

impl EngineHandle {
    /// Spawn the manager task and return its handle
    pub(crate) fn spawn(settings: ManagerSettings) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (snapshots_tx, snapshots_rx) = watch::channel(QueueSnapshot::default());
        let metrics = Arc::clone(&settings.metrics);

        let manager = QueueManager::new(settings, commands_rx, snapshots_tx);
        tokio::spawn(manager.run());

        Self {
            commands: commands_tx,
            snapshots: snapshots_rx,
            metrics,
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| EngineError::Stopped)
    }

    pub fn enqueue(&self, job: DownloadJob) -> Result<()> {
        self.send(Command::Enqueue(job))
    }

    pub fn cancel(&self, id: impl Into<String>) -> Result<()> {
        self.send(Command::Cancel(id.into()))
    }

    pub fn retry(&self, id: impl Into<String>) -> Result<()> {
        self.send(Command::Retry(id.into()))
    }

    pub fn move_up(&self, id: impl Into<String>) -> Result<()> {
        self.send(Command::MoveUp(id.into()))
    }

    pub fn move_down(&self, id: impl Into<String>) -> Result<()> {
        self.send(Command::MoveDown(id.into()))
    }

    pub fn clear_completed(&self) -> Result<()> {
        self.send(Command::ClearCompleted)
    }

    /// Drop one finished job from history and from the ledger
    pub fn remove(&self, id: impl Into<String>) -> Result<()> {
        self.send(Command::Remove(id.into()))
    }

    /// The next enqueued job without its own override uses `kind`
    pub fn force_next_transport(&self, kind: TransportKind) -> Result<()> {
        self.send(Command::ForceNextTransport(kind))
    }

    pub fn background(&self) -> Result<()> {
        self.send(Command::Background)
    }

    pub fn foreground(&self) -> Result<()> {
        self.send(Command::Foreground)
    }

    /// State after every previously sent command has been applied
    pub async fn snapshot(&self) -> Result<QueueSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    pub fn subscribe(&self) -> watch::Receiver<QueueSnapshot> {
        self.snapshots.clone()
    }

    /// Resolves once nothing is active or waiting
    pub async fn wait_idle(&self) -> Result<QueueSnapshot> {
        self.snapshot().await?;
        let mut rx = self.subscribe();
        let snapshot = rx
            .wait_for(QueueSnapshot::is_idle)
            .await
            .map_err(|_| EngineError::Stopped)?;
        Ok(snapshot.clone())
    }

    /// Stop the transfer, write the queue record and end the manager
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown(tx))?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
