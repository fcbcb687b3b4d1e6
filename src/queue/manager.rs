//! Single-flight queue manager actor
//!
//! All queue state lives in one task. Caller commands and reports from the
//! running transfer arrive on two mailboxes and are handled one at a time,
//! so at most one job can ever be downloading.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::job::{DownloadJob, JobStatus, QueueRecord, QueueSnapshot};
use crate::ledger::Ledger;
use crate::observability::Metrics;
use crate::transport::{
    Attempt, Delivered, EventSink, MethodSelector, SessionState, TransportError, TransportEvent,
    TransportKind, TransportSet,
};

/// Messages accepted by the queue manager
#[derive(Debug)]
pub(crate) enum Command {
    Enqueue(DownloadJob),
    Cancel(String),
    Retry(String),
    MoveUp(String),
    MoveDown(String),
    ClearCompleted,
    Remove(String),
    ForceNextTransport(TransportKind),
    Background,
    Foreground,
    /// Query current state (response sent via oneshot channel)
    Snapshot(oneshot::Sender<QueueSnapshot>),
    /// Flush and stop; acknowledged once the snapshot is written
    Shutdown(oneshot::Sender<()>),
}

/// Report from a running transfer, tagged with the attempt that produced it
#[derive(Debug)]
struct AttemptReport {
    job_id: String,
    attempt: u64,
    report: Report,
}

#[derive(Debug)]
enum Report {
    Event(TransportEvent),
    Finished(Result<(Delivered, TransportKind), TransportError>),
}

/// The manager's view of the live transfer
#[derive(Debug)]
struct SessionRecord {
    attempt: u64,
    kind: TransportKind,
    state: SessionState,
    cancel: CancellationToken,
    pause: CancellationToken,
    /// Whether the server already has the job request
    submitted: bool,
    /// A spawned task still owns this attempt. A paused session may only be
    /// restarted once its task has reported back.
    running: bool,
}

/// Everything the manager needs besides its mailbox
pub(crate) struct ManagerSettings {
    pub selector: MethodSelector,
    pub transports: TransportSet,
    pub ledger: Arc<dyn Ledger>,
    pub metrics: Arc<Metrics>,
    pub persist_debounce: Duration,
    pub force_next: Option<TransportKind>,
}

pub(crate) struct QueueManager {
    commands: mpsc::UnboundedReceiver<Command>,
    reports_tx: mpsc::UnboundedSender<AttemptReport>,
    reports: mpsc::UnboundedReceiver<AttemptReport>,
    snapshots: watch::Sender<QueueSnapshot>,

    active: Option<DownloadJob>,
    waiting: VecDeque<DownloadJob>,
    history: Vec<DownloadJob>,
    session: Option<SessionRecord>,
    next_attempt: u64,
    force_next: Option<TransportKind>,
    backgrounded: bool,
    persist_at: Option<Instant>,

    selector: MethodSelector,
    transports: TransportSet,
    ledger: Arc<dyn Ledger>,
    metrics: Arc<Metrics>,
    persist_debounce: Duration,
}

impl QueueManager {
    pub(crate) fn new(
        settings: ManagerSettings,
        commands: mpsc::UnboundedReceiver<Command>,
        snapshots: watch::Sender<QueueSnapshot>,
    ) -> Self {
        let (reports_tx, reports) = mpsc::unbounded_channel();
        Self {
            commands,
            reports_tx,
            reports,
            snapshots,
            active: None,
            waiting: VecDeque::new(),
            history: Vec::new(),
            session: None,
            next_attempt: 0,
            force_next: settings.force_next,
            backgrounded: false,
            persist_at: None,
            selector: settings.selector,
            transports: settings.transports,
            ledger: settings.ledger,
            metrics: settings.metrics,
            persist_debounce: settings.persist_debounce,
        }
    }

    pub(crate) async fn run(mut self) {
        self.restore();

        loop {
            let persist_at = self.persist_at;

            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.stop();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.stop();
                        break;
                    }
                },
                Some(report) = self.reports.recv() => self.handle_report(report),
                _ = wait_until(persist_at), if persist_at.is_some() => self.flush(),
            }
        }

        info!("Queue manager stopped");
    }

    /// Load the persisted queue and completion history
    fn restore(&mut self) {
        match self.ledger.list_completed() {
            Ok(records) => {
                self.history = records.iter().map(DownloadJob::from_completed).collect();
            }
            Err(e) => warn!(error = %e, "Failed to load completed records"),
        }

        let resumed = match self.ledger.load_queue() {
            Ok(Some(record)) => record.into_resumed(),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "Failed to load queue snapshot, starting empty");
                Vec::new()
            }
        };

        if !resumed.is_empty() {
            info!(jobs = resumed.len(), "Resuming persisted queue");
            self.waiting.extend(resumed);
            self.admit();
            self.mark_dirty();
        } else {
            self.publish();
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enqueue(job) => self.enqueue(job),
            Command::Cancel(id) => self.cancel(&id),
            Command::Retry(id) => self.retry(&id),
            Command::MoveUp(id) => self.shift(&id, -1),
            Command::MoveDown(id) => self.shift(&id, 1),
            Command::ClearCompleted => self.clear_completed(),
            Command::Remove(id) => self.remove(&id),
            Command::ForceNextTransport(kind) => {
                info!(transport = %kind, "Next job will use a forced transport");
                self.force_next = Some(kind);
            }
            Command::Background => self.background(),
            Command::Foreground => self.foreground(),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            // handled by the run loop
            Command::Shutdown(_) => {}
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.active.as_ref().is_some_and(|job| job.id == id)
            || self.waiting.iter().any(|job| job.id == id)
            || self.history.iter().any(|job| job.id == id)
    }

    fn enqueue(&mut self, mut job: DownloadJob) {
        if self.contains(&job.id) {
            debug!(job_id = %job.id, "Ignoring duplicate enqueue");
            return;
        }

        job.reset();
        job.created_at = Utc::now();
        if job.forced_transport.is_none() {
            job.forced_transport = self.force_next.take();
        }

        info!(job_id = %job.id, title = %job.title, format = %job.format, "Job queued");
        self.metrics.job_enqueued();
        self.waiting.push_back(job);
        self.admit();
        self.mark_dirty();
    }

    fn cancel(&mut self, id: &str) {
        if self.active.as_ref().is_some_and(|job| job.id == id) {
            self.stop_session();
            self.active = None;
            info!(job_id = %id, "Active job cancelled");
            self.admit();
            self.mark_dirty();
        } else if let Some(pos) = self.waiting.iter().position(|job| job.id == id) {
            self.waiting.remove(pos);
            info!(job_id = %id, "Queued job cancelled");
            self.mark_dirty();
        } else {
            debug!(job_id = %id, "Cancel ignored, job not pending");
        }
    }

    fn retry(&mut self, id: &str) {
        let Some(pos) = self
            .history
            .iter()
            .position(|job| job.id == id && job.status == JobStatus::Error)
        else {
            debug!(job_id = %id, "Retry ignored, no failed job with this id");
            return;
        };

        let mut job = self.history.remove(pos);
        job.reset();
        job.created_at = Utc::now();
        info!(job_id = %id, "Retrying failed job");
        self.waiting.push_back(job);
        self.admit();
        self.mark_dirty();
    }

    fn shift(&mut self, id: &str, delta: isize) {
        let Some(pos) = self.waiting.iter().position(|job| job.id == id) else {
            debug!(job_id = %id, "Reorder ignored, job not waiting");
            return;
        };
        let Some(target) = pos.checked_add_signed(delta).filter(|t| *t < self.waiting.len())
        else {
            return;
        };

        self.waiting.swap(pos, target);
        self.mark_dirty();
    }

    fn clear_completed(&mut self) {
        let before = self.history.len();
        self.history.retain(|job| !job.status.is_terminal());
        if let Err(e) = self.ledger.clear_completed() {
            warn!(error = %e, "Failed to clear completed records");
        }
        info!(removed = before - self.history.len(), "History cleared");
        self.publish();
    }

    fn remove(&mut self, id: &str) {
        let Some(pos) = self.history.iter().position(|job| job.id == id) else {
            debug!(job_id = %id, "Remove ignored, job not in history");
            return;
        };
        self.history.remove(pos);
        if let Err(e) = self.ledger.remove_completed(id) {
            warn!(job_id = %id, error = %e, "Failed to delete completed record");
        }
        self.publish();
    }

    fn background(&mut self) {
        self.backgrounded = true;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.kind != TransportKind::EventStream || session.state == SessionState::Paused {
            return;
        }

        session.pause.cancel();
        session.state = SessionState::Paused;
        info!(attempt = session.attempt, "Event session paused");
        self.publish();
    }

    fn foreground(&mut self) {
        self.backgrounded = false;
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.state != SessionState::Paused {
            return;
        }
        if session.running {
            // the task is still delivering or has yet to notice the pause;
            // its report decides whether a new attempt is needed
            debug!(attempt = session.attempt, "Foreground waits for paused task");
            return;
        }

        let resume = session.submitted;
        self.start_attempt(resume);
        self.publish();
    }

    /// Start the head of the wait list if nothing is downloading
    fn admit(&mut self) {
        if self.active.is_some() {
            return;
        }
        let Some(mut job) = self.waiting.pop_front() else {
            return;
        };

        job.status = JobStatus::Downloading;
        job.progress = 0;
        job.started_at = Some(Utc::now());
        info!(job_id = %job.id, "Job admitted");
        self.active = Some(job);
        self.start_attempt(false);
    }

    /// Spawn a transfer for the active job. `resume` reattaches to a job the
    /// server already knows instead of submitting it again.
    fn start_attempt(&mut self, resume: bool) {
        let Some(job) = self.active.as_ref() else {
            return;
        };

        let kind = match (&self.session, resume) {
            (Some(session), true) => session.kind,
            _ => self.selector.select(job),
        };
        self.next_attempt += 1;
        let attempt_no = self.next_attempt;
        let cancel = CancellationToken::new();
        let pause = CancellationToken::new();

        if self.backgrounded && kind == TransportKind::EventStream {
            debug!(job_id = %job.id, "Backgrounded, deferring event session");
            self.session = Some(SessionRecord {
                attempt: attempt_no,
                kind,
                state: SessionState::Paused,
                cancel,
                pause,
                submitted: resume,
                running: false,
            });
            return;
        }

        let events = {
            let tx = self.reports_tx.clone();
            let job_id = job.id.clone();
            EventSink::new(move |event| {
                let _ = tx.send(AttemptReport {
                    job_id: job_id.clone(),
                    attempt: attempt_no,
                    report: Report::Event(event),
                });
            })
        };
        let attempt = Attempt {
            request: job.request(),
            resume,
            resume_progress: job.progress,
            events,
            cancel: cancel.clone(),
            pause: pause.clone(),
        };

        info!(job_id = %job.id, transport = %kind, attempt = attempt_no, resume, "Starting transfer");

        let transports = self.transports.clone();
        let selector = self.selector.clone();
        let tx = self.reports_tx.clone();
        let job_id = job.id.clone();
        tokio::spawn(async move {
            let result = transports.run(&selector, attempt, kind).await;
            let _ = tx.send(AttemptReport {
                job_id,
                attempt: attempt_no,
                report: Report::Finished(result),
            });
        });

        self.session = Some(SessionRecord {
            attempt: attempt_no,
            kind,
            state: SessionState::Connecting,
            cancel,
            pause,
            submitted: true,
            running: true,
        });
    }

    fn stop_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.cancel.cancel();
            debug!(attempt = session.attempt, "Session stopped");
        }
    }

    fn handle_report(&mut self, report: AttemptReport) {
        let current = self.session.as_ref().is_some_and(|s| s.attempt == report.attempt)
            && self
                .active
                .as_ref()
                .is_some_and(|job| job.id == report.job_id);
        if !current {
            debug!(job_id = %report.job_id, attempt = report.attempt, "Dropping stale report");
            return;
        }

        match report.report {
            Report::Event(event) => self.handle_event(event),
            Report::Finished(result) => self.finish(result),
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Progress(value) => {
                if let Some(job) = self.active.as_mut() {
                    if value > job.progress {
                        job.progress = value.min(100);
                        self.publish();
                    }
                }
            }
            TransportEvent::State(state) => {
                if let Some(session) = self.session.as_mut() {
                    // a paused session ignores states still in flight from its task
                    if session.state != SessionState::Paused && session.state != state {
                        session.state = state;
                        self.publish();
                    }
                }
            }
            TransportEvent::Reconnecting { .. } => self.metrics.reconnect(),
            TransportEvent::FallingBack { to, .. } => {
                self.metrics.fallback();
                if let Some(session) = self.session.as_mut() {
                    session.kind = to;
                }
            }
        }
    }

    fn finish(&mut self, result: Result<(Delivered, TransportKind), TransportError>) {
        match result {
            Err(TransportError::Paused) => {
                self.park();
                return;
            }
            Err(TransportError::Cancelled) => return,
            _ => {}
        }

        self.session = None;
        let Some(mut job) = self.active.take() else {
            return;
        };
        job.completed_at = Some(Utc::now());

        match result {
            Ok((delivered, kind)) => {
                job.status = JobStatus::Completed;
                job.progress = 100;
                job.output_path = Some(delivered.path.clone());

                let record = job.completed_record(&delivered.path, &delivered.filename);
                if let Err(e) = self.ledger.put_completed(&record) {
                    warn!(job_id = %job.id, error = %e, "Failed to store completed record");
                }
                self.metrics.job_completed();
                info!(
                    job_id = %job.id,
                    transport = %kind,
                    path = %delivered.path,
                    bytes = delivered.bytes,
                    "Job completed"
                );
            }
            Err(e) => {
                job.status = JobStatus::Error;
                job.error = Some(e.to_string());
                self.metrics.job_failed();
                warn!(job_id = %job.id, error = %e, "Job failed");
            }
        }

        self.history.push(job);
        self.admit();
        self.mark_dirty();
    }

    /// The paused task has exited; restart at once if foreground came first
    fn park(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.running = false;

        if self.backgrounded {
            debug!(attempt = session.attempt, "Session parked until foreground");
        } else {
            let resume = session.submitted;
            self.start_attempt(resume);
            self.publish();
        }
    }

    /// Shutdown: stop the transfer but keep the active job for the next start
    fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            session.cancel.cancel();
        }
        self.flush();
        if let Err(e) = self.ledger.persist() {
            warn!(error = %e, "Failed to persist ledger on shutdown");
        }
    }

    fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            active: self.active.clone(),
            session: self.session.as_ref().map(|s| s.state),
            waiting: self.waiting.iter().cloned().collect(),
            history: self.history.clone(),
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.snapshot());
    }

    /// Publish now, write the queue record once the debounce window closes
    fn mark_dirty(&mut self) {
        self.publish();
        if self.persist_at.is_none() {
            self.persist_at = Some(Instant::now() + self.persist_debounce);
        }
    }

    fn flush(&mut self) {
        self.persist_at = None;
        let record = QueueRecord {
            active_job: self.active.clone(),
            wait_list: self.waiting.iter().cloned().collect(),
        };
        if let Err(e) = self.ledger.save_queue(&record) {
            warn!(error = %e, "Failed to persist queue snapshot");
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
