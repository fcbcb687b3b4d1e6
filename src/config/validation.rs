use super::models::Config;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("server.base_url '{url}' is not a valid http(s) URL: {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("session.heartbeat_timeout_ms must be greater than zero")]
    ZeroHeartbeat,

    #[error("session.{field} ({ceiling}ms) must not be below session.backoff_base_ms ({base}ms)")]
    CeilingBelowBase {
        field: &'static str,
        ceiling: u64,
        base: u64,
    },

    #[error("transport.fallback must differ from transport.default ({0})")]
    FallbackEqualsDefault(String),

    #[error("transport.auto_switch_threshold must be greater than zero")]
    ZeroThreshold,

    #[error("storage.copy_block_size must be greater than zero")]
    ZeroBlockSize,

    #[error("session.progress_sentinel must be within 0..=100, got {0}")]
    SentinelOutOfRange(u8),
}

/// Validate cross-field constraints that serde defaults cannot express
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_base_url(&config.server.base_url)?;

    let session = &config.session;
    if session.heartbeat_timeout_ms == 0 {
        return Err(ValidationError::ZeroHeartbeat);
    }
    for (field, ceiling) in [
        ("timeout_backoff_ceiling_ms", session.timeout_backoff_ceiling_ms),
        ("error_backoff_ceiling_ms", session.error_backoff_ceiling_ms),
    ] {
        if ceiling < session.backoff_base_ms {
            return Err(ValidationError::CeilingBelowBase {
                field,
                ceiling,
                base: session.backoff_base_ms,
            });
        }
    }
    if session.progress_sentinel > 100 {
        return Err(ValidationError::SentinelOutOfRange(session.progress_sentinel));
    }

    let transport = &config.transport;
    if transport.fallback == Some(transport.default) {
        return Err(ValidationError::FallbackEqualsDefault(
            transport.default.to_string(),
        ));
    }
    if transport
        .auto_switch_threshold
        .is_some_and(|threshold| threshold.as_u64() == 0)
    {
        return Err(ValidationError::ZeroThreshold);
    }

    if config.storage.copy_block_size.as_u64() == 0 {
        return Err(ValidationError::ZeroBlockSize);
    }

    Ok(())
}

fn validate_base_url(url: &str) -> Result<(), ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidBaseUrl {
        url: url.to_string(),
        reason,
    };

    let parsed = reqwest::Url::parse(url).map_err(|e| invalid(e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(invalid(format!("unsupported scheme '{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::humanize::ByteSize;
    use crate::transport::TransportKind;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_invalid_base_url() {
        let mut config = Config::default();
        config.server.base_url = "not a url".to_string();
        assert!(matches!(
            validate(&config),
            Err(ValidationError::InvalidBaseUrl { .. })
        ));

        config.server.base_url = "ftp://converter/".to_string();
        assert!(matches!(
            validate(&config),
            Err(ValidationError::InvalidBaseUrl { .. })
        ));
    }

    #[test]
    fn test_fallback_equal_to_default() {
        let mut config = Config::default();
        config.transport.fallback = Some(TransportKind::EventStream);
        assert!(matches!(
            validate(&config),
            Err(ValidationError::FallbackEqualsDefault(_))
        ));
    }

    #[test]
    fn test_ceiling_below_base() {
        let mut config = Config::default();
        config.session.backoff_base_ms = 6_000;
        assert!(matches!(
            validate(&config),
            Err(ValidationError::CeilingBelowBase {
                field: "timeout_backoff_ceiling_ms",
                ..
            })
        ));
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let mut config = Config::default();
        config.transport.auto_switch_threshold = Some(ByteSize(0));
        assert!(matches!(
            validate(&config),
            Err(ValidationError::ZeroThreshold)
        ));

        let mut config = Config::default();
        config.storage.copy_block_size = ByteSize(0);
        assert!(matches!(
            validate(&config),
            Err(ValidationError::ZeroBlockSize)
        ));

        let mut config = Config::default();
        config.session.heartbeat_timeout_ms = 0;
        assert!(matches!(validate(&config), Err(ValidationError::ZeroHeartbeat)));
    }
}
