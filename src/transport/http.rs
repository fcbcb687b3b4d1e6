//! HTTP client for the conversion server

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures::{Stream, StreamExt};
use reqwest::{Client, Response, Url, header};
use thiserror::Error;
use tracing::debug;

use super::{DirectBody, EventStream, JobServer, SseFrame};
use crate::config::ServerConfig;
use crate::queue::JobRequest;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out")]
    Timeout,

    #[error("HTTP {status}: {reason}")]
    Status { status: u16, reason: String },

    #[error("failed to read body: {0}")]
    Body(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),
}

impl HttpError {
    fn classify(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HttpError::Timeout
        } else if err.is_connect() {
            HttpError::Connect(err.to_string())
        } else if err.is_body() || err.is_decode() {
            HttpError::Body(err.to_string())
        } else {
            HttpError::RequestFailed(err.to_string())
        }
    }
}

impl From<reqwest::Error> for HttpError {
    fn from(err: reqwest::Error) -> Self {
        HttpError::classify(err)
    }
}

pub type Result<T> = std::result::Result<T, HttpError>;

/// Client for the job, event and direct-download endpoints
///
/// Only the connect phase carries a timeout: event channels stay open for
/// as long as the server keeps them alive and are supervised by the session.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    base: Url,
}

impl HttpClient {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let base = normalize_base(&config.base_url)?;

        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| HttpError::RequestFailed(e.to_string()))?;

        Ok(Self { client, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| HttpError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Resolve a completion locator against the base URL
    pub fn resolve(&self, locator: &str) -> Result<Url> {
        self.base
            .join(locator)
            .map_err(|e| HttpError::InvalidUrl(format!("{}: {}", locator, e)))
    }
}

#[async_trait]
impl JobServer for HttpClient {
    async fn submit(&self, request: &JobRequest) -> Result<()> {
        let url = self.endpoint(&["jobs"])?;
        debug!(url = %url, job_id = %request.job_id, "Submitting job");

        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(HttpError::classify)?;
        check_status(response)?;
        Ok(())
    }

    async fn open_events(&self, job_id: &str) -> Result<EventStream> {
        let url = self.endpoint(&["jobs", job_id, "events"])?;
        debug!(url = %url, "Opening event channel");

        let response = self
            .client
            .get(url)
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(HttpError::classify)?;
        let response = check_status(response)?;

        Ok(sse_frames(response.bytes_stream()))
    }

    async fn fetch_locator(&self, locator: &str) -> Result<Bytes> {
        let url = self.resolve(locator)?;
        debug!(url = %url, "Fetching completed download");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(HttpError::classify)?;
        let bytes = check_status(response)?
            .bytes()
            .await
            .map_err(|e| HttpError::Body(e.to_string()))?;

        debug!(size = bytes.len(), "Download fetched");
        Ok(bytes)
    }

    async fn open_direct(&self, request: &JobRequest) -> Result<DirectBody> {
        let url = self.endpoint(&["jobs", "direct"])?;
        debug!(url = %url, job_id = %request.job_id, "Requesting direct stream");

        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(HttpError::classify)?;
        let response = check_status(response)?;

        let filename = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .and_then(disposition_filename);
        let content_length = response.content_length();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(HttpError::classify))
            .boxed();

        Ok(DirectBody {
            filename,
            content_length,
            body,
        })
    }
}

/// Parse a raw event-stream body into frames
fn sse_frames<S, B, E>(body: S) -> EventStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<HttpError> + fmt::Display + Send + 'static,
{
    body.eventsource()
        .map(|event| match event {
            Ok(event) => Ok(frame(event)),
            Err(EventStreamError::Transport(e)) => Err(e.into()),
            Err(e) => Err(HttpError::Body(e.to_string())),
        })
        .boxed()
}

fn frame(event: Event) -> SseFrame {
    if event.data.trim().is_empty() {
        SseFrame::Keepalive
    } else {
        SseFrame::Data(event.data)
    }
}

fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if !status.is_success() {
        return Err(HttpError::Status {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
        });
    }
    Ok(response)
}

/// Parse the base URL, making sure relative joins stay under its path
fn normalize_base(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw).map_err(|e| HttpError::InvalidUrl(format!("{}: {}", raw, e)))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// `attachment; filename="clip.mp4"` -> `clip.mp4`
fn disposition_filename(value: &str) -> Option<String> {
    value
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))
        .map(|name| name.trim_matches('"').to_string())
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> HttpClient {
        HttpClient::new(&ServerConfig {
            base_url: base.to_string(),
            ..ServerConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let client = client("http://localhost:8000/api");
        assert_eq!(client.base_url().as_str(), "http://localhost:8000/api/");
    }

    #[test]
    fn test_endpoints_are_built_from_segments() {
        let client = client("http://localhost:8000/api/");
        let url = client.endpoint(&["jobs", "job-1", "events"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:8000/api/jobs/job-1/events");
    }

    #[test]
    fn test_relative_locator_resolves_against_base() {
        let client = client("http://localhost:8000/api/");
        assert_eq!(
            client.resolve("files/abc.mp3").unwrap().as_str(),
            "http://localhost:8000/api/files/abc.mp3"
        );
        assert_eq!(
            client.resolve("/static/abc.mp3").unwrap().as_str(),
            "http://localhost:8000/static/abc.mp3"
        );
        assert_eq!(
            client.resolve("https://cdn.example.com/x.mp4").unwrap().as_str(),
            "https://cdn.example.com/x.mp4"
        );
    }

    #[test]
    fn test_disposition_filename() {
        assert_eq!(
            disposition_filename("attachment; filename=\"clip.mp4\"").as_deref(),
            Some("clip.mp4")
        );
        assert_eq!(disposition_filename("inline"), None);
        assert_eq!(disposition_filename("attachment; filename=\"\""), None);
    }

    async fn decode(reads: Vec<&'static str>) -> Vec<Result<SseFrame>> {
        let body = futures::stream::iter(
            reads
                .into_iter()
                .map(|read| Ok::<_, HttpError>(Bytes::from_static(read.as_bytes()))),
        );
        sse_frames(body).collect().await
    }

    #[tokio::test]
    async fn test_frames_split_across_reads() {
        let frames = decode(vec!["data: {\"type\":", "\"progress\"}\n", "\n"]).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0].as_ref().unwrap(),
            &SseFrame::Data("{\"type\":\"progress\"}".into())
        );
    }

    #[tokio::test]
    async fn test_multiline_data_and_line_endings() {
        let frames = decode(vec![
            "event: message\r\ndata: one\r\ndata: two\r\n\r\n",
            "data: three\r\rdata: four\n\n",
        ])
        .await;
        let frames: Vec<_> = frames.into_iter().map(|f| f.unwrap()).collect();
        assert_eq!(
            frames,
            vec![
                SseFrame::Data("one\ntwo".into()),
                SseFrame::Data("three".into()),
                SseFrame::Data("four".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_events_are_keepalives() {
        let frames = decode(vec![": ping\n\nevent: ping\ndata:\n\ndata: x\n\n"]).await;
        let frames: Vec<_> = frames.into_iter().map(|f| f.unwrap()).collect();
        assert_eq!(frames.last(), Some(&SseFrame::Data("x".into())));
        assert!(frames[..frames.len() - 1].iter().all(|f| *f == SseFrame::Keepalive));
    }

    #[tokio::test]
    async fn test_transport_errors_pass_through() {
        let body = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"data: a\n\n")),
            Err(HttpError::Body("connection reset".into())),
        ]);
        let frames: Vec<_> = sse_frames(body).collect().await;
        assert_eq!(frames[0].as_ref().unwrap(), &SseFrame::Data("a".into()));
        assert!(matches!(frames[1], Err(HttpError::Body(_))));
    }

    #[test]
    fn test_invalid_base_url() {
        let result = HttpClient::new(&ServerConfig {
            base_url: "not a url".to_string(),
            ..ServerConfig::default()
        });
        assert!(matches!(result, Err(HttpError::InvalidUrl(_))));
    }
}
