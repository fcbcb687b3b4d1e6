//! Transfer of finished jobs from the conversion server
//!
//! Two transports exist:
//!
//! - event stream: submits the job, then listens on a Server-Sent Events
//!   channel for progress, base64 chunks and a completion event. The channel
//!   is supervised by a heartbeat and reconnected with capped backoff.
//! - direct stream: requests the finished file as one streamed HTTP body,
//!   staged on disk and then handed to the destination.
//!
//! The [`selector::MethodSelector`] picks one per job and
//! [`selector::TransportSet::run`] applies the configured fallback.

pub mod assembler;
mod direct;
pub mod events;
pub mod http;
pub mod progress;
pub mod selector;
mod session;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::queue::JobRequest;
use crate::storage::StorageError;

pub use assembler::{AssemblyError, ChunkAssembler};
pub use direct::DirectStreamTransport;
pub use http::{HttpClient, HttpError};
pub use selector::{MethodSelector, TransportSet};
pub use session::EventStreamTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    EventStream,
    DirectStream,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::EventStream => write!(f, "event-stream"),
            TransportKind::DirectStream => write!(f, "direct-stream"),
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown transport '{0}' (expected event-stream or direct-stream)")]
pub struct ParseTransportError(String);

impl FromStr for TransportKind {
    type Err = ParseTransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "event_stream" | "event-stream" | "events" | "sse" => Ok(TransportKind::EventStream),
            "direct_stream" | "direct-stream" | "direct" | "stream" => {
                Ok(TransportKind::DirectStream)
            }
            other => Err(ParseTransportError(other.to_string())),
        }
    }
}

/// Lifecycle of one transfer session as seen by the queue manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Open,
    Receiving,
    Reconnecting,
    Paused,
    Closed,
    Failed,
}

/// Notifications a running transport sends back while it works
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Progress(u8),
    State(SessionState),
    Reconnecting { attempt: u32, delay_ms: u64 },
    FallingBack { from: TransportKind, to: TransportKind },
}

/// Callback used by transports to report [`TransportEvent`]s
#[derive(Clone)]
pub struct EventSink(Arc<dyn Fn(TransportEvent) + Send + Sync>);

impl EventSink {
    pub fn new(f: impl Fn(TransportEvent) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Sink that forwards into an unbounded channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self::new(move |event| {
            let _ = tx.send(event);
        });
        (sink, rx)
    }

    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn emit(&self, event: TransportEvent) {
        (self.0)(event)
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventSink")
    }
}

/// Everything a transport needs for one run
#[derive(Debug, Clone)]
pub struct Attempt {
    pub request: JobRequest,
    /// Reattach to a job the server already has instead of submitting it
    pub resume: bool,
    /// Progress already shown for this job
    pub resume_progress: u8,
    pub events: EventSink,
    pub cancel: CancellationToken,
    /// Cancelled when the engine is backgrounded
    pub pause: CancellationToken,
}

impl Attempt {
    pub fn new(request: JobRequest, events: EventSink) -> Self {
        Self {
            request,
            resume: false,
            resume_progress: 0,
            events,
            cancel: CancellationToken::new(),
            pause: CancellationToken::new(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.request.job_id
    }
}

/// Result of a successful transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub path: String,
    pub filename: String,
    pub bytes: u64,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection timeout: no data after {attempts} reconnect attempts")]
    ConnectionTimeout { attempts: u32 },

    #[error("connection error after {attempts} reconnect attempts: {reason}")]
    ConnectionLost { attempts: u32, reason: String },

    #[error("{0}")]
    Http(#[from] HttpError),

    #[error("{0}")]
    Remote(String),

    #[error("failed to fetch download: {0}")]
    Locator(HttpError),

    #[error("no downloadable content")]
    NoContent,

    #[error("payload integrity error: {0}")]
    Integrity(#[from] AssemblyError),

    #[error("destination error: {0}")]
    Destination(#[from] StorageError),

    #[error("{from} failed: {first}; {to} fallback failed: {second}")]
    FallbackFailed {
        from: TransportKind,
        to: TransportKind,
        first: Box<TransportError>,
        second: Box<TransportError>,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("paused")]
    Paused,
}

impl TransportError {
    /// Failures of the channel that another transport may avoid.
    /// A server-reported error belongs to the job and is final.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionTimeout { .. }
                | TransportError::ConnectionLost { .. }
                | TransportError::Http(_)
        )
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, TransportError::Cancelled | TransportError::Paused)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn run(&self, attempt: Attempt) -> Result<Delivered, TransportError>;
}

/// One dispatched Server-Sent Events message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// `data` of one event, multi-line payloads joined with `\n`
    Data(String),
    /// Event without data; carries nothing but proves the channel is alive
    Keepalive,
}

/// Inbound SSE frames for one job
pub type EventStream = BoxStream<'static, Result<SseFrame, HttpError>>;

/// Streamed body of a direct download
pub struct DirectBody {
    pub filename: Option<String>,
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes, HttpError>>,
}

/// Conversion server API used by both transports
#[async_trait]
pub trait JobServer: Send + Sync {
    async fn submit(&self, request: &JobRequest) -> Result<(), HttpError>;

    async fn open_events(&self, job_id: &str) -> Result<EventStream, HttpError>;

    /// Fetch a completion `downloadUrl`, absolute or relative to the server
    async fn fetch_locator(&self, locator: &str) -> Result<Bytes, HttpError>;

    async fn open_direct(&self, request: &JobRequest) -> Result<DirectBody, HttpError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_parsing() {
        assert_eq!("sse".parse::<TransportKind>().unwrap(), TransportKind::EventStream);
        assert_eq!(
            "Direct-Stream".parse::<TransportKind>().unwrap(),
            TransportKind::DirectStream
        );
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_transport_kind_serde_and_display() {
        let json = serde_json::to_string(&TransportKind::DirectStream).unwrap();
        assert_eq!(json, "\"direct_stream\"");
        assert_eq!(TransportKind::EventStream.to_string(), "event-stream");
    }

    #[test]
    fn test_failure_classification() {
        assert!(TransportError::ConnectionTimeout { attempts: 5 }.is_transport_failure());
        assert!(TransportError::Http(HttpError::Timeout).is_transport_failure());
        assert!(!TransportError::Remote("boom".into()).is_transport_failure());
        assert!(!TransportError::NoContent.is_transport_failure());
        assert!(
            !TransportError::Integrity(AssemblyError::MissingChunk(2)).is_transport_failure()
        );
        assert!(TransportError::Paused.is_interrupt());
    }

    #[test]
    fn test_fallback_message_names_both_transports() {
        let err = TransportError::FallbackFailed {
            from: TransportKind::EventStream,
            to: TransportKind::DirectStream,
            first: Box::new(TransportError::ConnectionTimeout { attempts: 5 }),
            second: Box::new(TransportError::Remote("gone".into())),
        };
        let message = err.to_string();
        assert!(message.starts_with("event-stream failed: connection timeout"));
        assert!(message.ends_with("direct-stream fallback failed: gone"));
    }

    #[tokio::test]
    async fn test_event_sink_channel() {
        let (sink, mut rx) = EventSink::channel();
        sink.emit(TransportEvent::Progress(12));
        assert_eq!(rx.recv().await, Some(TransportEvent::Progress(12)));
    }
}
