//! Configuration management for mediafetch
//!
//! Settings are layered from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use mediafetch::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Converter at: {}", config.server.base_url);
//! ```
//!
//! # Environment Variables
//!
//! Any key can be overridden with `MEDIAFETCH__<section>__<key>`:
//! - `MEDIAFETCH__SERVER__BASE_URL=https://convert.example.com/api/`
//! - `MEDIAFETCH__TRANSPORT__DEFAULT=direct_stream`
//! - `MEDIAFETCH__TRANSPORT__AUTO_SWITCH_THRESHOLD=50MB`
//! - `MEDIAFETCH__DEBUG_LOG=true`
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/mediafetch.toml`.
//! This can be overridden using the `MEDIAFETCH_CONFIG` environment variable.

mod models;
mod sources;
mod validation;

pub use crate::humanize::ByteSize;
pub use models::{
    Config, QueueConfig, ServerConfig, SessionConfig, StorageConfig, TransportConfig,
};
pub use validation::ValidationError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// # Errors
    ///
    /// Returns an error if the file is malformed or a cross-field check fails.
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Re-check invariants after programmatic edits
    pub fn validate(&self) -> Result<(), ConfigError> {
        validation::validate(self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportKind;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_minimal_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        fs::write(
            &config_path,
            r#"
[transport]
default = "direct_stream"
"#,
        )
        .unwrap();

        let config = Config::load_from_path(config_path).unwrap();
        assert_eq!(config.transport.default, TransportKind::DirectStream);
    }

    #[test]
    fn test_validation_catches_fallback_loop() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        fs::write(
            &config_path,
            r#"
[transport]
default = "event_stream"
fallback = "event_stream"
"#,
        )
        .unwrap();

        let result = Config::load_from_path(config_path);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::ValidationError(ValidationError::FallbackEqualsDefault(_))
        ));
    }

    #[test]
    fn test_full_config_example() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
debug_log = false

[server]
base_url = "https://convert.example.com/api/"
connect_timeout_ms = 5000

[transport]
default = "event_stream"
fallback = "direct_stream"
auto_switch_threshold = "50MB"

[session]
heartbeat_timeout_ms = 20000
max_reconnect_attempts = 3
backoff_base_ms = 500
timeout_backoff_ceiling_ms = 4000
error_backoff_ceiling_ms = 8000
chunk_wait_timeout_ms = 10000

[queue]
persist_debounce_ms = 100

[storage]
ledger_path = "state/ledger"
output_dir = "music"
staging_dir = "state/staging"
copy_block_size = "2MB"
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let config = Config::load_from_path(config_path).unwrap();
        assert_eq!(config.server.connect_timeout_ms, 5000);
        assert_eq!(config.session.max_reconnect_attempts, 3);
        assert_eq!(config.session.error_backoff_ceiling_ms, 8000);
        assert_eq!(config.queue.persist_debounce_ms, 100);
        assert_eq!(config.storage.copy_block_size, ByteSize::mib(2));
        assert_eq!(config.storage.output_dir.to_str(), Some("music"));
    }
}
