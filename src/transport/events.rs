//! Event payloads carried on the job event channel

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Progress(ProgressEvent),
    Chunk(ChunkEvent),
    #[serde(alias = "completed")]
    Complete(CompleteEvent),
    Error(ErrorEvent),
}

impl StreamEvent {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            StreamEvent::Progress(e) => e.job_id.as_deref(),
            StreamEvent::Chunk(e) => e.job_id.as_deref(),
            StreamEvent::Complete(e) => e.job_id.as_deref(),
            StreamEvent::Error(e) => e.job_id.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProgressEvent {
    pub job_id: Option<String>,
    pub status: Option<String>,
    pub progress: Option<f64>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkEvent {
    #[serde(default)]
    pub job_id: Option<String>,
    pub chunk_index: i64,
    pub total_chunks: i64,
    pub chunk_data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompleteEvent {
    pub job_id: Option<String>,
    pub progress: Option<f64>,
    pub download_url: Option<String>,
    pub file_data: Option<String>,
    pub file: Option<InlineFile>,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InlineFile {
    pub filename: Option<String>,
    pub file_size: Option<u64>,
    pub mime_type: Option<String>,
    pub file_content: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorEvent {
    pub job_id: Option<String>,
    pub message: Option<String>,
}

impl ErrorEvent {
    pub fn message(&self) -> String {
        self.message
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "server reported an error".to_string())
    }
}

/// Where the bytes of a completed job come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload<'a> {
    Locator(&'a str),
    Inline(&'a str),
}

impl CompleteEvent {
    /// `downloadUrl` wins over `fileData`, which wins over `file.fileContent`
    pub fn payload(&self) -> Option<Payload<'_>> {
        if let Some(url) = non_empty(&self.download_url) {
            return Some(Payload::Locator(url));
        }
        if let Some(data) = non_empty(&self.file_data) {
            return Some(Payload::Inline(strip_data_uri(data)));
        }
        self.file
            .as_ref()
            .and_then(|file| non_empty(&file.file_content))
            .map(|data| Payload::Inline(strip_data_uri(data)))
    }

    pub fn filename(&self) -> Option<&str> {
        non_empty(&self.filename)
            .or_else(|| self.file.as_ref().and_then(|file| non_empty(&file.filename)))
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

/// `data:audio/mpeg;base64,AAAA` -> `AAAA`
fn strip_data_uri(data: &str) -> &str {
    if data.starts_with("data:") {
        if let Some((_, rest)) = data.split_once(";base64,") {
            return rest;
        }
    }
    data
}

pub fn parse(data: &str) -> Result<StreamEvent, serde_json::Error> {
    serde_json::from_str(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_progress_integer_and_float() {
        let event = parse(r#"{"type":"progress","jobId":"j1","progress":40}"#).unwrap();
        let StreamEvent::Progress(p) = event else { panic!("expected progress") };
        assert_eq!(p.progress, Some(40.0));

        let event = parse(r#"{"type":"progress","progress":12.5,"status":"converting"}"#).unwrap();
        assert!(matches!(event, StreamEvent::Progress(ProgressEvent { progress: Some(p), .. }) if p == 12.5));
    }

    #[test]
    fn test_parse_chunk() {
        let event =
            parse(r#"{"type":"chunk","jobId":"j1","chunkIndex":2,"totalChunks":3,"chunkData":"QUJD"}"#)
                .unwrap();
        assert_eq!(event.job_id(), Some("j1"));
        let StreamEvent::Chunk(c) = event else { panic!("expected chunk") };
        assert_eq!((c.chunk_index, c.total_chunks), (2, 3));
    }

    #[test]
    fn test_complete_payload_priority() {
        let event: CompleteEvent = serde_json::from_str(
            r#"{"downloadUrl":"files/a.mp3","fileData":"QUJD","file":{"fileContent":"REVG"}}"#,
        )
        .unwrap();
        assert_eq!(event.payload(), Some(Payload::Locator("files/a.mp3")));

        let event: CompleteEvent = serde_json::from_str(
            r#"{"downloadUrl":"","file":{"filename":"b.mp3","fileContent":"data:audio/mpeg;base64,REVG"}}"#,
        )
        .unwrap();
        assert_eq!(event.payload(), Some(Payload::Inline("REVG")));
        assert_eq!(event.filename(), Some("b.mp3"));

        let event: CompleteEvent = serde_json::from_str(r#"{"progress":100}"#).unwrap();
        assert_eq!(event.payload(), None);
    }

    #[test]
    fn test_completed_alias_and_error() {
        let event = parse(r#"{"type":"completed","jobId":"j","fileData":"QQ=="}"#).unwrap();
        assert!(matches!(event, StreamEvent::Complete(_)));

        let event = parse(r#"{"type":"error","jobId":"j","message":"Video unavailable"}"#).unwrap();
        let StreamEvent::Error(e) = event else { panic!("expected error") };
        assert_eq!(e.message(), "Video unavailable");
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(parse(r#"{"type":"heartbeat"}"#).is_err());
        assert!(parse("not json").is_err());
    }
}
