//! Event-stream transport: one supervised SSE session per job

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tracing::{debug, info, warn};

use super::assembler::{ChunkAssembler, decode_base64};
use super::events::{self, Payload, StreamEvent};
use super::progress::ProgressGuard;
use super::{
    Attempt, Delivered, JobServer, SessionState, SseFrame, Transport, TransportError,
    TransportEvent, TransportKind,
};
use crate::config::SessionConfig;
use crate::storage::{Destination, StorageError, default_filename, sanitize_filename};

pub struct EventStreamTransport {
    server: Arc<dyn JobServer>,
    destination: Arc<dyn Destination>,
    assembler: Arc<Mutex<ChunkAssembler>>,
    config: SessionConfig,
}

/// Why a channel was dropped; picks the backoff ceiling and the final error
#[derive(Debug, Clone, PartialEq, Eq)]
enum DropReason {
    Timeout,
    Channel(String),
}

/// What the completion event told us to deliver
#[derive(Debug, Clone, PartialEq, Eq)]
enum Finished {
    Locator { url: String, filename: Option<String> },
    Inline { data: String, filename: Option<String> },
    Assembled { filename: Option<String> },
}

enum Dispatch {
    Continue,
    Finished(Finished),
}

enum Listen {
    Finished(Finished),
    Dropped(DropReason),
}

/// Per-session state that survives reconnects
struct Listener {
    guard: ProgressGuard,
    chunk_mode: bool,
    /// Set once `complete` arrived while chunks were still outstanding
    chunk_deadline: Option<Instant>,
    filename: Option<String>,
}

impl Listener {
    /// Assemble whatever the buffer holds
    fn assembled(&mut self) -> Finished {
        Finished::Assembled {
            filename: self.filename.take(),
        }
    }
}

/// Discards the job's chunk buffer on every exit path
struct BufferLease {
    assembler: Arc<Mutex<ChunkAssembler>>,
    job_id: String,
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        self.assembler.lock().discard(&self.job_id);
    }
}

impl EventStreamTransport {
    pub fn new(
        server: Arc<dyn JobServer>,
        destination: Arc<dyn Destination>,
        config: SessionConfig,
    ) -> Self {
        Self {
            server,
            destination,
            assembler: Arc::new(Mutex::new(ChunkAssembler::new())),
            config,
        }
    }

    /// Jobs with a live chunk buffer
    pub fn buffered_jobs(&self) -> usize {
        self.assembler.lock().len()
    }

    fn backoff(&self, attempts: u32, reason: &DropReason) -> Duration {
        let ceiling = match reason {
            DropReason::Timeout => self.config.timeout_backoff_ceiling_ms,
            DropReason::Channel(_) => self.config.error_backoff_ceiling_ms,
        };
        let delay = 1u64
            .checked_shl(attempts)
            .map(|factor| self.config.backoff_base_ms.saturating_mul(factor))
            .unwrap_or(u64::MAX);
        Duration::from_millis(delay.min(ceiling))
    }

    async fn drive(&self, attempt: &Attempt) -> Result<Finished, TransportError> {
        let sentinel = self.config.progress_sentinel;
        let mut listener = Listener {
            guard: if attempt.resume {
                ProgressGuard::resume_from(sentinel, attempt.resume_progress)
            } else {
                ProgressGuard::new(sentinel)
            },
            chunk_mode: false,
            chunk_deadline: None,
            filename: None,
        };
        let mut attempts: u32 = 0;

        loop {
            attempt
                .events
                .emit(TransportEvent::State(SessionState::Connecting));

            let reason = match self.listen(attempt, &mut listener, &mut attempts).await? {
                Listen::Finished(finished) => {
                    attempt.events.emit(TransportEvent::State(SessionState::Closed));
                    return Ok(finished);
                }
                Listen::Dropped(reason) => reason,
            };

            let out_of_time = listener.chunk_deadline.is_some_and(|at| {
                at <= Instant::now() || attempts >= self.config.max_reconnect_attempts
            });
            if out_of_time {
                // completion already arrived; assemble what the buffer holds
                warn!(job_id = %attempt.job_id(), reason = ?reason, "Channel lost while waiting for chunks");
                attempt.events.emit(TransportEvent::State(SessionState::Closed));
                return Ok(listener.assembled());
            }

            if attempts >= self.config.max_reconnect_attempts {
                warn!(job_id = %attempt.job_id(), attempts, reason = ?reason, "Reconnect budget exhausted");
                attempt.events.emit(TransportEvent::State(SessionState::Failed));
                return Err(match reason {
                    DropReason::Timeout => TransportError::ConnectionTimeout { attempts },
                    DropReason::Channel(reason) => {
                        TransportError::ConnectionLost { attempts, reason }
                    }
                });
            }

            let delay = self.backoff(attempts, &reason);
            attempts += 1;
            warn!(
                job_id = %attempt.job_id(),
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                reason = ?reason,
                "Event channel dropped, reconnecting"
            );
            attempt.events.emit(TransportEvent::Reconnecting {
                attempt: attempts,
                delay_ms: delay.as_millis() as u64,
            });
            attempt
                .events
                .emit(TransportEvent::State(SessionState::Reconnecting));

            let chunk_deadline = listener.chunk_deadline;
            tokio::select! {
                biased;
                _ = attempt.cancel.cancelled() => return Err(TransportError::Cancelled),
                _ = attempt.pause.cancelled() => return Err(TransportError::Paused),
                _ = wait_until(chunk_deadline), if chunk_deadline.is_some() => {
                    warn!(job_id = %attempt.job_id(), "Gave up waiting for remaining chunks");
                    attempt.events.emit(TransportEvent::State(SessionState::Closed));
                    return Ok(listener.assembled());
                }
                _ = sleep(delay) => {}
            }
        }
    }

    /// One channel lifetime: open, then read until it drops or the job finishes
    async fn listen(
        &self,
        attempt: &Attempt,
        listener: &mut Listener,
        attempts: &mut u32,
    ) -> Result<Listen, TransportError> {
        let heartbeat = self.config.heartbeat_timeout();
        let job_id = attempt.job_id();

        let chunk_deadline = listener.chunk_deadline;
        let opened = tokio::select! {
            biased;
            _ = attempt.cancel.cancelled() => return Err(TransportError::Cancelled),
            _ = attempt.pause.cancelled() => return Err(TransportError::Paused),
            _ = wait_until(chunk_deadline), if chunk_deadline.is_some() => {
                warn!(job_id = %job_id, "Gave up waiting for remaining chunks");
                return Ok(Listen::Finished(listener.assembled()));
            }
            opened = timeout(heartbeat, self.server.open_events(job_id)) => opened,
        };
        let mut stream = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Ok(Listen::Dropped(DropReason::Channel(e.to_string()))),
            Err(_) => return Ok(Listen::Dropped(DropReason::Timeout)),
        };

        *attempts = 0;
        info!(job_id = %job_id, "Event channel open");
        attempt.events.emit(TransportEvent::State(SessionState::Open));

        let mut deadline = Instant::now() + heartbeat;
        let mut receiving = false;

        loop {
            let chunk_deadline = listener.chunk_deadline;

            tokio::select! {
                biased;
                _ = attempt.cancel.cancelled() => return Err(TransportError::Cancelled),
                _ = attempt.pause.cancelled() => return Err(TransportError::Paused),
                _ = sleep_until(deadline) => {
                    debug!(job_id = %job_id, "Heartbeat timeout");
                    return Ok(Listen::Dropped(DropReason::Timeout));
                }
                _ = wait_until(chunk_deadline), if chunk_deadline.is_some() => {
                    warn!(job_id = %job_id, "Gave up waiting for remaining chunks");
                    return Ok(Listen::Finished(listener.assembled()));
                }
                frame = stream.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => return Ok(Listen::Dropped(DropReason::Channel(e.to_string()))),
                        None => {
                            return Ok(Listen::Dropped(DropReason::Channel(
                                "stream ended before completion".to_string(),
                            )));
                        }
                    };

                    deadline = Instant::now() + heartbeat;
                    if !receiving {
                        receiving = true;
                        attempt.events.emit(TransportEvent::State(SessionState::Receiving));
                    }

                    let SseFrame::Data(data) = frame else {
                        continue;
                    };
                    if let Dispatch::Finished(finished) = self.dispatch(attempt, listener, &data)? {
                        return Ok(Listen::Finished(finished));
                    }
                }
            }
        }
    }

    fn dispatch(
        &self,
        attempt: &Attempt,
        listener: &mut Listener,
        data: &str,
    ) -> Result<Dispatch, TransportError> {
        let job_id = attempt.job_id();
        let event = match events::parse(data) {
            Ok(event) => event,
            Err(e) => {
                debug!(job_id = %job_id, error = %e, "Ignoring unrecognised event");
                return Ok(Dispatch::Continue);
            }
        };

        if let Some(other) = event.job_id().filter(|id| *id != job_id) {
            debug!(job_id = %job_id, other = %other, "Ignoring event for another job");
            return Ok(Dispatch::Continue);
        }

        match event {
            StreamEvent::Progress(progress) => {
                if listener.chunk_mode {
                    return Ok(Dispatch::Continue);
                }
                if let Some(value) = progress.progress.and_then(|p| listener.guard.scalar(p)) {
                    attempt.events.emit(TransportEvent::Progress(value));
                }
                Ok(Dispatch::Continue)
            }

            StreamEvent::Chunk(chunk) => {
                let (received, total, complete) = {
                    let mut assembler = self.assembler.lock();
                    if !assembler.is_initialized(job_id) {
                        assembler.initialize(job_id, chunk.total_chunks)?;
                    }
                    let received = assembler.add_chunk(
                        job_id,
                        chunk.chunk_index,
                        chunk.total_chunks,
                        &chunk.chunk_data,
                    )?;
                    let total = assembler.progress(job_id).map_or(0, |(_, total)| total);
                    (received, total, assembler.is_complete(job_id))
                };

                if !listener.chunk_mode {
                    debug!(job_id = %job_id, total, "Switching to chunk mode");
                    listener.chunk_mode = true;
                }
                if let Some(value) = listener.guard.derived(received as u64, total as u64) {
                    attempt.events.emit(TransportEvent::Progress(value));
                }

                if complete && listener.chunk_deadline.is_some() {
                    return Ok(Dispatch::Finished(Finished::Assembled {
                        filename: listener.filename.take(),
                    }));
                }
                Ok(Dispatch::Continue)
            }

            StreamEvent::Complete(complete) => {
                let filename = complete.filename().map(str::to_string);
                match complete.payload() {
                    Some(Payload::Locator(url)) => Ok(Dispatch::Finished(Finished::Locator {
                        url: url.to_string(),
                        filename,
                    })),
                    Some(Payload::Inline(data)) => Ok(Dispatch::Finished(Finished::Inline {
                        data: data.to_string(),
                        filename,
                    })),
                    None if listener.chunk_mode => {
                        if self.assembler.lock().is_complete(job_id) {
                            return Ok(Dispatch::Finished(Finished::Assembled { filename }));
                        }
                        debug!(job_id = %job_id, "Completion before all chunks, waiting");
                        listener.filename = filename;
                        listener.chunk_deadline =
                            Some(Instant::now() + self.config.chunk_wait_timeout());
                        Ok(Dispatch::Continue)
                    }
                    None => Err(TransportError::NoContent),
                }
            }

            StreamEvent::Error(error) => Err(TransportError::Remote(error.message())),
        }
    }

    async fn deliver(
        &self,
        attempt: &Attempt,
        finished: Finished,
    ) -> Result<Delivered, TransportError> {
        let job_id = attempt.job_id();
        let (bytes, filename): (Bytes, Option<String>) = match finished {
            Finished::Locator { url, filename } => {
                let bytes = tokio::select! {
                    biased;
                    _ = attempt.cancel.cancelled() => return Err(TransportError::Cancelled),
                    fetched = self.server.fetch_locator(&url) => fetched.map_err(TransportError::Locator)?,
                };
                (bytes, filename)
            }
            Finished::Inline { data, filename } => (decode_base64(&data)?, filename),
            Finished::Assembled { filename } => {
                let bytes = self.assembler.lock().assemble(job_id)?;
                (bytes, filename)
            }
        };

        if !self.destination.has_permission().await {
            return Err(StorageError::PermissionDenied {
                target: self.destination.describe(),
                reason: "write access not granted".to_string(),
            }
            .into());
        }

        let filename = filename
            .map(|name| sanitize_filename(&name))
            .unwrap_or_else(|| default_filename(&attempt.request.title, &attempt.request.format));
        let size = bytes.len() as u64;
        let path = self.destination.write(&filename, bytes).await?;

        Ok(Delivered {
            path,
            filename,
            bytes: size,
        })
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl Transport for EventStreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::EventStream
    }

    async fn run(&self, attempt: Attempt) -> Result<Delivered, TransportError> {
        let _lease = BufferLease {
            assembler: Arc::clone(&self.assembler),
            job_id: attempt.job_id().to_string(),
        };

        if !attempt.resume {
            attempt
                .events
                .emit(TransportEvent::State(SessionState::Connecting));
            tokio::select! {
                biased;
                _ = attempt.cancel.cancelled() => return Err(TransportError::Cancelled),
                submitted = self.server.submit(&attempt.request) => submitted?,
            }
            info!(job_id = %attempt.job_id(), "Job submitted");
        }

        let finished = self.drive(&attempt).await?;
        self.deliver(&attempt, finished).await
    }
}
