use std::env;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Agent configuration.
///
/// Construction is the one place the agent is allowed to fail loudly: a
/// missing key or out-of-range cap means the setup is unusable, so
/// `validate()` rejects it before anything is wired up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Static key presented during the connection handshake
    pub api_key: String,
    /// Collector endpoint, `ws://` or `wss://`
    pub backend_url: String,
    /// Reported with `register` so the collector can group agents
    pub application_name: String,
    /// Deployment environment label, e.g. `production`
    pub environment: String,
    /// Probability that a passively observed fault is reported, in [0, 1]
    pub sampling_rate: f64,
    /// Maximum depth of any variable tree
    pub max_variable_depth: usize,
    /// Maximum characters kept from any string value
    pub max_string_length: usize,
    /// Maximum entries expanded (or counted) per collection
    pub max_collection_size: usize,
    /// Interval between heartbeat frames while live
    pub heartbeat_interval_ms: u64,
    /// Consecutive failed reconnect attempts before giving up
    pub max_reconnect_attempts: u32,
    /// Report capture-local failures to the log instead of staying silent
    pub debug_logging: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            backend_url: String::new(),
            application_name: "unknown".to_string(),
            environment: "production".to_string(),
            sampling_rate: 1.0,
            max_variable_depth: 5,
            max_string_length: 512,
            max_collection_size: 25,
            heartbeat_interval_ms: 30_000,
            max_reconnect_attempts: 10,
            debug_logging: false,
        }
    }
}

impl AgentConfig {
    /// Load configuration from `SENTINEL_*` environment variables.
    ///
    /// `SENTINEL_API_KEY` and `SENTINEL_BACKEND_URL` are required; everything
    /// else falls back to the defaults above.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let defaults = Self::default();
        let config = Self {
            api_key: env::var("SENTINEL_API_KEY").unwrap_or_default(),
            backend_url: env::var("SENTINEL_BACKEND_URL").unwrap_or_default(),
            application_name: env::var("SENTINEL_APP_NAME")
                .unwrap_or(defaults.application_name),
            environment: env::var("SENTINEL_ENVIRONMENT").unwrap_or(defaults.environment),
            sampling_rate: parse_env("SENTINEL_SAMPLING_RATE", defaults.sampling_rate)?,
            max_variable_depth: parse_env("SENTINEL_MAX_DEPTH", defaults.max_variable_depth)?,
            max_string_length: parse_env(
                "SENTINEL_MAX_STRING_LENGTH",
                defaults.max_string_length,
            )?,
            max_collection_size: parse_env(
                "SENTINEL_MAX_COLLECTION_SIZE",
                defaults.max_collection_size,
            )?,
            heartbeat_interval_ms: parse_env(
                "SENTINEL_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval_ms,
            )?,
            max_reconnect_attempts: parse_env(
                "SENTINEL_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            )?,
            debug_logging: env::var("SENTINEL_DEBUG")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.debug_logging),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject unusable configuration up front.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.is_empty() {
            return Err(ConfigError::MissingApiKey);
        }

        let parsed = url::Url::parse(&self.backend_url)
            .map_err(|e| ConfigError::InvalidBackendUrl(format!("{}: {}", self.backend_url, e)))?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(ConfigError::InvalidBackendUrl(format!(
                "{}: expected ws:// or wss:// scheme",
                self.backend_url
            )));
        }

        if !(0.0..=1.0).contains(&self.sampling_rate) {
            return Err(ConfigError::OutOfRange {
                field: "sampling_rate",
                detail: format!("{} is outside [0, 1]", self.sampling_rate),
            });
        }
        if self.max_variable_depth == 0 {
            return Err(ConfigError::OutOfRange {
                field: "max_variable_depth",
                detail: "must be at least 1".to_string(),
            });
        }
        if self.max_string_length == 0 {
            return Err(ConfigError::OutOfRange {
                field: "max_string_length",
                detail: "must be at least 1".to_string(),
            });
        }
        if self.max_collection_size == 0 {
            return Err(ConfigError::OutOfRange {
                field: "max_collection_size",
                detail: "must be at least 1".to_string(),
            });
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::OutOfRange {
                field: "heartbeat_interval_ms",
                detail: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::OutOfRange {
            field: name,
            detail: format!("'{}' is not a valid value", raw),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AgentConfig {
        AgentConfig {
            api_key: "key".to_string(),
            backend_url: "wss://collector.example.com/agent".to_string(),
            ..AgentConfig::default()
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_missing_api_key_rejected() {
        let config = AgentConfig {
            api_key: String::new(),
            ..valid_config()
        };
        assert!(matches!(config.validate(), Err(ConfigError::MissingApiKey)));
    }

    #[test]
    fn test_http_backend_url_rejected() {
        let config = AgentConfig {
            backend_url: "https://collector.example.com".to_string(),
            ..valid_config()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBackendUrl(_))
        ));
    }

    #[test]
    fn test_sampling_rate_out_of_range_rejected() {
        for rate in [-0.1, 1.5] {
            let config = AgentConfig {
                sampling_rate: rate,
                ..valid_config()
            };
            assert!(matches!(
                config.validate(),
                Err(ConfigError::OutOfRange { field: "sampling_rate", .. })
            ));
        }
    }

    #[test]
    fn test_zero_depth_rejected() {
        let config = AgentConfig {
            max_variable_depth: 0,
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }
}
