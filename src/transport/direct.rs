//! Direct-stream transport: the finished file as one streamed HTTP body

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::http::HttpError;
use super::progress::ProgressGuard;
use super::{
    Attempt, Delivered, DirectBody, JobServer, SessionState, Transport, TransportError,
    TransportEvent, TransportKind,
};
use crate::storage::{Destination, StorageError, default_filename, sanitize_filename};

/// Share of the progress bar used by the download when a block copy follows
const FETCH_SPAN_WITH_COPY: u64 = 90;

pub struct DirectStreamTransport {
    server: Arc<dyn JobServer>,
    destination: Arc<dyn Destination>,
    staging_dir: PathBuf,
}

impl DirectStreamTransport {
    pub fn new(
        server: Arc<dyn JobServer>,
        destination: Arc<dyn Destination>,
        staging_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            server,
            destination,
            staging_dir: staging_dir.into(),
        }
    }

    /// Stream the body to `staging`, returning the number of bytes written
    async fn fetch(
        &self,
        attempt: &Attempt,
        body: DirectBody,
        staging: &Path,
        span: u64,
        guard: &mut ProgressGuard,
    ) -> Result<u64, TransportError> {
        let mut file = tokio::fs::File::create(staging)
            .await
            .map_err(|e| StorageError::io(staging, e))?;

        let total = body.content_length.filter(|len| *len > 0);
        let mut stream = body.body;
        let mut received = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = attempt.cancel.cancelled() => return Err(TransportError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };

            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| StorageError::io(staging, e))?;
            received += chunk.len() as u64;

            if let Some(total) = total {
                let scaled = received.min(total) * span / total;
                if let Some(value) = guard.advance(scaled as u8) {
                    attempt.events.emit(TransportEvent::Progress(value));
                }
            }
        }

        file.flush()
            .await
            .map_err(|e| StorageError::io(staging, e))?;

        if let Some(total) = total {
            if received < total {
                return Err(HttpError::Body(format!(
                    "body ended after {} of {} bytes",
                    received, total
                ))
                .into());
            }
        }
        Ok(received)
    }
}

#[async_trait]
impl Transport for DirectStreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::DirectStream
    }

    async fn run(&self, attempt: Attempt) -> Result<Delivered, TransportError> {
        let job_id = attempt.job_id().to_string();

        if !self.destination.has_permission().await {
            return Err(StorageError::PermissionDenied {
                target: self.destination.describe(),
                reason: "write access not granted".to_string(),
            }
            .into());
        }

        attempt
            .events
            .emit(TransportEvent::State(SessionState::Connecting));
        let body = tokio::select! {
            biased;
            _ = attempt.cancel.cancelled() => return Err(TransportError::Cancelled),
            opened = self.server.open_direct(&attempt.request) => opened?,
        };
        attempt
            .events
            .emit(TransportEvent::State(SessionState::Receiving));

        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|e| StorageError::io(&self.staging_dir, e))?;
        let staging = self
            .staging_dir
            .join(format!("{}.part", sanitize_filename(&job_id)));

        let filename = body
            .filename
            .as_deref()
            .map(sanitize_filename)
            .unwrap_or_else(|| default_filename(&attempt.request.title, &attempt.request.format));

        let block_copy = self.destination.requires_block_copy();
        let span = if block_copy { FETCH_SPAN_WITH_COPY } else { 100 };
        let mut guard = ProgressGuard::plain();
        guard.advance(attempt.resume_progress);

        let size = match self.fetch(&attempt, body, &staging, span, &mut guard).await {
            Ok(size) => size,
            Err(e) => {
                if let Err(remove_err) = tokio::fs::remove_file(&staging).await {
                    debug!(path = %staging.display(), error = %remove_err, "No staging file to remove");
                }
                return Err(e);
            }
        };
        debug!(job_id = %job_id, size, "Direct stream staged");

        let events = attempt.events.clone();
        let mut on_copy = |copied: u64, total: u64| {
            if total == 0 {
                return;
            }
            let scaled = span + copied.min(total) * (100 - span) / total;
            if let Some(value) = guard.advance(scaled as u8) {
                events.emit(TransportEvent::Progress(value));
            }
        };

        // staging file is kept when the destination refuses it
        let path = match self.destination.import(&staging, &filename, &mut on_copy).await {
            Ok(path) => path,
            Err(e) => {
                warn!(
                    job_id = %job_id,
                    staging = %staging.display(),
                    permission = e.is_permission(),
                    error = %e,
                    "Destination rejected download"
                );
                return Err(e.into());
            }
        };

        attempt.events.emit(TransportEvent::State(SessionState::Closed));
        info!(job_id = %job_id, path = %path, size, "Direct stream delivered");

        Ok(Delivered {
            path,
            filename,
            bytes: size,
        })
    }
}
