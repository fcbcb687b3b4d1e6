use crate::humanize::ByteSize;
use crate::transport::TransportKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Raise the crate's log level to debug
    #[serde(default)]
    pub debug_log: bool,
}

/// Conversion server endpoint
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl ServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000/api/".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_user_agent() -> String {
    concat!("mediafetch/", env!("CARGO_PKG_VERSION")).to_string()
}

/// Transport selection policy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    #[serde(default = "default_transport")]
    pub default: TransportKind,
    /// Retried once with this transport when the selected one fails
    pub fallback: Option<TransportKind>,
    /// Estimated payloads above this size go over the direct stream
    pub auto_switch_threshold: Option<ByteSize>,
    /// One-shot override applied to the next enqueued job only
    pub force_next: Option<TransportKind>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            default: default_transport(),
            fallback: None,
            auto_switch_threshold: None,
            force_next: None,
        }
    }
}

fn default_transport() -> TransportKind {
    TransportKind::EventStream
}

/// Event-stream session timing
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SessionConfig {
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_timeout_backoff_ceiling_ms")]
    pub timeout_backoff_ceiling_ms: u64,
    #[serde(default = "default_error_backoff_ceiling_ms")]
    pub error_backoff_ceiling_ms: u64,
    #[serde(default = "default_chunk_wait_timeout_ms")]
    pub chunk_wait_timeout_ms: u64,
    /// First progress value the upstream pipeline emits while still processing
    #[serde(default = "default_progress_sentinel")]
    pub progress_sentinel: u8,
}

impl SessionConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn chunk_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_wait_timeout_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            timeout_backoff_ceiling_ms: default_timeout_backoff_ceiling_ms(),
            error_backoff_ceiling_ms: default_error_backoff_ceiling_ms(),
            chunk_wait_timeout_ms: default_chunk_wait_timeout_ms(),
            progress_sentinel: default_progress_sentinel(),
        }
    }
}

fn default_heartbeat_timeout_ms() -> u64 {
    30_000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_timeout_backoff_ceiling_ms() -> u64 {
    5_000
}

fn default_error_backoff_ceiling_ms() -> u64 {
    10_000
}

fn default_chunk_wait_timeout_ms() -> u64 {
    15_000
}

fn default_progress_sentinel() -> u8 {
    95
}

/// Queue manager settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    #[serde(default = "default_persist_debounce_ms")]
    pub persist_debounce_ms: u64,
}

impl QueueConfig {
    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            persist_debounce_ms: default_persist_debounce_ms(),
        }
    }
}

fn default_persist_debounce_ms() -> u64 {
    250
}

/// Local paths and destination behaviour
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    #[serde(default = "default_copy_block_size")]
    pub copy_block_size: ByteSize,
    /// Write through the object-store destination instead of renaming into place
    #[serde(default)]
    pub sandboxed: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            ledger_path: default_ledger_path(),
            output_dir: default_output_dir(),
            staging_dir: default_staging_dir(),
            copy_block_size: default_copy_block_size(),
            sandboxed: false,
        }
    }
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("data/ledger")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("data/staging")
}

fn default_copy_block_size() -> ByteSize {
    ByteSize::mib(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.transport.default, TransportKind::EventStream);
        assert!(config.transport.fallback.is_none());
        assert_eq!(config.session.heartbeat_timeout(), Duration::from_secs(30));
        assert_eq!(config.session.max_reconnect_attempts, 5);
        assert_eq!(config.session.progress_sentinel, 95);
        assert_eq!(config.queue.persist_debounce(), Duration::from_millis(250));
        assert_eq!(config.storage.copy_block_size, ByteSize::mib(1));
        assert!(!config.debug_log);
    }

    #[test]
    fn test_partial_session_section_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
[session]
heartbeat_timeout_ms = 500
"#,
        )
        .unwrap();

        assert_eq!(config.session.heartbeat_timeout_ms, 500);
        assert_eq!(config.session.backoff_base_ms, 1_000);
        assert_eq!(config.session.error_backoff_ceiling_ms, 10_000);
    }
}
