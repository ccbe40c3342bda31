//! Public error types.
//!
//! Only construction and explicit connect/disconnect calls surface errors;
//! the capture and transport paths swallow their own failures so telemetry
//! can never alter the host application's control flow.

use std::fmt;

/// Unusable agent configuration, rejected at construction.
#[derive(Debug)]
pub enum ConfigError {
    /// No API key configured
    MissingApiKey,
    /// Backend URL missing, unparseable, or not a ws:// / wss:// endpoint
    InvalidBackendUrl(String),
    /// A numeric setting is outside its allowed range
    OutOfRange {
        field: &'static str,
        detail: String,
    },
    /// The process-wide registry already holds an agent
    AlreadyInitialized,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingApiKey => write!(f, "missing API key"),
            ConfigError::InvalidBackendUrl(detail) => {
                write!(f, "invalid backend URL: {}", detail)
            }
            ConfigError::OutOfRange { field, detail } => {
                write!(f, "invalid value for {}: {}", field, detail)
            }
            ConfigError::AlreadyInitialized => {
                write!(f, "global agent already initialized")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Connection lifecycle errors surfaced by explicit connect requests.
#[derive(Debug)]
pub enum ConnectionError {
    /// `connect()` called while a session supervisor is already running
    AlreadyConnected,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::AlreadyConnected => write!(f, "connection already active"),
        }
    }
}

impl std::error::Error for ConnectionError {}
