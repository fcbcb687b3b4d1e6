use super::models::Config;
use config::{ConfigError, Environment, File};
use std::env;
use std::path::PathBuf;

const CONFIG_ENV_VAR: &str = "MEDIAFETCH_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/mediafetch.toml";
const ENV_PREFIX: &str = "MEDIAFETCH";
const ENV_SEPARATOR: &str = "__";

/// Load configuration from multiple sources with priority:
/// 1. Defaults (embedded in structs)
/// 2. TOML file (if exists)
/// 3. Environment variables from .env file (via dotenvy)
/// 4. System environment variables (highest priority)
pub fn load() -> Result<Config, ConfigError> {
    let _ = dotenvy::dotenv();

    let config_path = env::var(CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    load_from_sources(config_path)
}

/// Load configuration from a specific path and environment
pub fn load_from_sources(config_path: PathBuf) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();

    if config_path.exists() {
        tracing::info!("Loading configuration from: {}", config_path.display());
        builder = builder.add_source(File::from(config_path).required(false));
    } else {
        tracing::debug!(
            "Configuration file not found at {}, using defaults and environment overrides",
            config_path.display()
        );
    }

    // MEDIAFETCH__SESSION__HEARTBEAT_TIMEOUT_MS -> session.heartbeat_timeout_ms
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::humanize::ByteSize;
    use crate::transport::TransportKind;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_defaults_only() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nonexistent.toml");

        let config = load_from_sources(config_path).unwrap();
        assert_eq!(config.transport.default, TransportKind::EventStream);
        assert_eq!(config.session.max_reconnect_attempts, 5);
    }

    #[test]
    fn test_load_transport_section() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
debug_log = true

[server]
base_url = "http://converter.local:9000/api/"

[transport]
default = "event_stream"
fallback = "direct_stream"
auto_switch_threshold = "50MB"

[storage]
output_dir = "/tmp/mediafetch-out"
copy_block_size = "256KB"
sandboxed = true
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let config = load_from_sources(config_path).unwrap();
        assert!(config.debug_log);
        assert_eq!(config.server.base_url, "http://converter.local:9000/api/");
        assert_eq!(config.transport.fallback, Some(TransportKind::DirectStream));
        assert_eq!(
            config.transport.auto_switch_threshold,
            Some(ByteSize::mib(50))
        );
        assert_eq!(config.storage.copy_block_size, ByteSize::kib(256));
        assert!(config.storage.sandboxed);
    }

    // Environment overrides are not exercised here: env::set_var is unsafe in
    // edition 2024 and racy across parallel tests.
}
