//! Per-job transport choice and fallback

use std::sync::Arc;

use tracing::{info, warn};

use super::{Attempt, Delivered, Transport, TransportError, TransportEvent, TransportKind};
use crate::config::TransportConfig;
use crate::humanize::ByteSize;
use crate::queue::DownloadJob;

const AUDIO_FORMATS: &[&str] = &["mp3", "m4a", "aac", "opus", "ogg"];
const LOSSLESS_AUDIO_FORMATS: &[&str] = &["wav", "flac"];

#[derive(Debug, Clone)]
pub struct MethodSelector {
    default: TransportKind,
    fallback: Option<TransportKind>,
    threshold: Option<ByteSize>,
}

impl MethodSelector {
    pub fn new(
        default: TransportKind,
        fallback: Option<TransportKind>,
        threshold: Option<ByteSize>,
    ) -> Self {
        Self {
            default,
            fallback,
            threshold,
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.default, config.fallback, config.auto_switch_threshold)
    }

    pub fn select(&self, job: &DownloadJob) -> TransportKind {
        if let Some(forced) = job.forced_transport {
            return forced;
        }

        if let Some(threshold) = self.threshold {
            let estimate = estimate_size(&job.format, &job.quality);
            if estimate > threshold {
                info!(
                    job_id = %job.id,
                    estimate = %estimate,
                    threshold = %threshold,
                    "Large payload, using direct stream"
                );
                return TransportKind::DirectStream;
            }
        }

        self.default
    }

    /// Fallback for a failed transport, never the transport itself
    pub fn fallback_for(&self, failed: TransportKind) -> Option<TransportKind> {
        self.fallback.filter(|fallback| *fallback != failed)
    }
}

/// Rough output size for a (format, quality) pair
pub fn estimate_size(format: &str, quality: &str) -> ByteSize {
    let format = format.trim().to_ascii_lowercase();
    if AUDIO_FORMATS.contains(&format.as_str()) {
        return ByteSize::mib(5);
    }
    if LOSSLESS_AUDIO_FORMATS.contains(&format.as_str()) {
        return ByteSize::mib(40);
    }

    let height: Option<u32> = {
        let digits: String = quality.chars().filter(|c| c.is_ascii_digit()).collect();
        digits.parse().ok()
    };
    let mib = match height {
        Some(h) if h <= 144 => 10,
        Some(h) if h <= 240 => 15,
        Some(h) if h <= 360 => 25,
        Some(h) if h <= 480 => 40,
        Some(h) if h <= 720 => 70,
        Some(h) if h <= 1080 => 150,
        Some(h) if h <= 1440 => 300,
        Some(_) => 600,
        None => 100,
    };
    ByteSize::mib(mib)
}

/// The transport implementations, one per kind
#[derive(Clone)]
pub struct TransportSet {
    event_stream: Arc<dyn Transport>,
    direct_stream: Arc<dyn Transport>,
}

impl TransportSet {
    pub fn new(event_stream: Arc<dyn Transport>, direct_stream: Arc<dyn Transport>) -> Self {
        Self {
            event_stream,
            direct_stream,
        }
    }

    pub fn get(&self, kind: TransportKind) -> Arc<dyn Transport> {
        match kind {
            TransportKind::EventStream => Arc::clone(&self.event_stream),
            TransportKind::DirectStream => Arc::clone(&self.direct_stream),
        }
    }

    /// Run `primary`, retrying once over the fallback on a transport failure.
    /// Returns the transport that delivered.
    pub async fn run(
        &self,
        selector: &MethodSelector,
        attempt: Attempt,
        primary: TransportKind,
    ) -> Result<(Delivered, TransportKind), TransportError> {
        let first = match self.get(primary).run(attempt.clone()).await {
            Ok(delivered) => return Ok((delivered, primary)),
            Err(e) => e,
        };

        if !first.is_transport_failure() {
            return Err(first);
        }
        let Some(fallback) = selector.fallback_for(primary) else {
            return Err(first);
        };

        warn!(
            job_id = %attempt.job_id(),
            from = %primary,
            to = %fallback,
            error = %first,
            "Transport failed, trying fallback"
        );
        attempt.events.emit(TransportEvent::FallingBack {
            from: primary,
            to: fallback,
        });

        let retry = Attempt {
            resume: false,
            ..attempt
        };
        match self.get(fallback).run(retry).await {
            Ok(delivered) => Ok((delivered, fallback)),
            Err(second) if second.is_interrupt() => Err(second),
            Err(second) => Err(TransportError::FallbackFailed {
                from: primary,
                to: fallback,
                first: Box::new(first),
                second: Box::new(second),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::EventSink;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    fn job(format: &str, quality: &str) -> DownloadJob {
        DownloadJob::new("j", "item", format, quality, "Title")
    }

    #[test]
    fn test_estimates() {
        assert!(estimate_size("mp3", "320") < estimate_size("flac", ""));
        assert!(estimate_size("mp4", "1080p") > ByteSize::mib(50));
        assert!(estimate_size("mp4", "360p") < estimate_size("mp4", "720p"));
        assert_eq!(estimate_size("webm", "best"), ByteSize::mib(100));
        assert_eq!(estimate_size("mp4", "2160p"), ByteSize::mib(600));
    }

    #[test]
    fn test_threshold_switches_large_video_to_direct() {
        let selector = MethodSelector::new(
            TransportKind::EventStream,
            None,
            Some("50MB".parse().unwrap()),
        );

        assert_eq!(selector.select(&job("mp4", "1080p")), TransportKind::DirectStream);
        assert_eq!(selector.select(&job("mp3", "320")), TransportKind::EventStream);
    }

    #[test]
    fn test_forced_transport_wins() {
        let selector = MethodSelector::new(
            TransportKind::EventStream,
            None,
            Some(ByteSize::mib(1)),
        );
        let job = job("mp4", "2160p").with_transport(TransportKind::EventStream);

        assert_eq!(selector.select(&job), TransportKind::EventStream);
    }

    #[test]
    fn test_fallback_never_repeats_failed_kind() {
        let selector = MethodSelector::new(
            TransportKind::EventStream,
            Some(TransportKind::DirectStream),
            None,
        );
        assert_eq!(
            selector.fallback_for(TransportKind::EventStream),
            Some(TransportKind::DirectStream)
        );
        assert_eq!(selector.fallback_for(TransportKind::DirectStream), None);
    }

    struct Canned {
        kind: TransportKind,
        outcome: fn() -> Result<Delivered, TransportError>,
        calls: Mutex<usize>,
    }

    impl Canned {
        fn new(kind: TransportKind, outcome: fn() -> Result<Delivered, TransportError>) -> Arc<Self> {
            Arc::new(Self {
                kind,
                outcome,
                calls: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl Transport for Canned {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        async fn run(&self, _attempt: Attempt) -> Result<Delivered, TransportError> {
            *self.calls.lock() += 1;
            (self.outcome)()
        }
    }

    fn delivered() -> Result<Delivered, TransportError> {
        Ok(Delivered {
            path: "/out/a.mp3".into(),
            filename: "a.mp3".into(),
            bytes: 3,
        })
    }

    fn timed_out() -> Result<Delivered, TransportError> {
        Err(TransportError::ConnectionTimeout { attempts: 5 })
    }

    fn corrupt() -> Result<Delivered, TransportError> {
        Err(TransportError::NoContent)
    }

    fn unavailable() -> Result<Delivered, TransportError> {
        Err(TransportError::Remote("Video unavailable".into()))
    }

    fn attempt() -> Attempt {
        Attempt::new(job("mp3", "320").request(), EventSink::noop())
    }

    fn with_fallback() -> MethodSelector {
        MethodSelector::new(
            TransportKind::EventStream,
            Some(TransportKind::DirectStream),
            None,
        )
    }

    #[tokio::test]
    async fn test_fallback_after_transport_failure() {
        let events = Canned::new(TransportKind::EventStream, timed_out);
        let direct = Canned::new(TransportKind::DirectStream, delivered);
        let set = TransportSet::new(events.clone(), direct.clone());
        let (sink, mut rx) = EventSink::channel();
        let attempt = Attempt::new(job("mp3", "320").request(), sink);

        let (_, used) = set
            .run(&with_fallback(), attempt, TransportKind::EventStream)
            .await
            .unwrap();

        assert_eq!(used, TransportKind::DirectStream);
        assert_eq!(*direct.calls.lock(), 1);
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportEvent::FallingBack {
                from: TransportKind::EventStream,
                to: TransportKind::DirectStream
            }
        );
    }

    #[tokio::test]
    async fn test_no_fallback_for_content_errors() {
        let events = Canned::new(TransportKind::EventStream, corrupt);
        let direct = Canned::new(TransportKind::DirectStream, delivered);
        let set = TransportSet::new(events, direct.clone());

        let err = set
            .run(&with_fallback(), attempt(), TransportKind::EventStream)
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::NoContent));
        assert_eq!(*direct.calls.lock(), 0);
    }

    #[tokio::test]
    async fn test_server_error_is_not_retried_over_fallback() {
        let events = Canned::new(TransportKind::EventStream, unavailable);
        let direct = Canned::new(TransportKind::DirectStream, delivered);
        let set = TransportSet::new(events, direct.clone());

        let err = set
            .run(&with_fallback(), attempt(), TransportKind::EventStream)
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Video unavailable");
        assert_eq!(*direct.calls.lock(), 0);
    }

    #[tokio::test]
    async fn test_both_transports_failing_names_both() {
        let events = Canned::new(TransportKind::EventStream, timed_out);
        let direct = Canned::new(TransportKind::DirectStream, timed_out);
        let set = TransportSet::new(events, direct);

        let err = set
            .run(&with_fallback(), attempt(), TransportKind::EventStream)
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("event-stream failed"));
        assert!(message.contains("direct-stream fallback failed"));
    }
}
