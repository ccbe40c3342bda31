//! In-process failure telemetry agent.
//!
//! Observes faults inside a running application, extracts diagnostic context
//! (stack, variables, cause chain), deduplicates and rate-limits what it
//! reports, and streams the result to a remote collector over a persistent
//! WebSocket that survives network interruption. The agent never suspends
//! program execution, never guarantees delivery, and never lets a telemetry
//! failure escape into the host's control flow.
//!
//! # Example
//!
//! ```rust,no_run
//! use sentinel_agent::{Agent, AgentConfig, Severity};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = AgentConfig::from_env().expect("unusable sentinel config");
//!     let agent = Agent::new(config).expect("unusable sentinel config");
//!     agent.connect().ok();
//!
//!     if let Err(e) = std::fs::read_to_string("orders.db") {
//!         agent.capture_error(&e, Severity::Error);
//!     }
//!
//!     agent.shutdown().await;
//! }
//! ```

pub mod breakpoints;
pub mod capture;
pub mod config;
pub mod connection;
pub mod error;
pub mod fault;
pub mod registry;
pub mod snapshot;

use std::sync::Arc;

pub use config::AgentConfig;
pub use error::{ConfigError, ConnectionError};
pub use fault::{ChainFault, Fault, FieldValue};
pub use sentinel_types::{
    CapturedEvent, Envelope, RequestContext, Severity, StackFrame, VariableNode,
};

use breakpoints::BreakpointManager;
use capture::CaptureEngine;
use connection::{ConnectionManager, ConnectionState};

/// An owned telemetry agent handle.
///
/// Hosts create one of these, keep it wherever they keep their other
/// long-lived services, and call `capture`/`hit` at the right moments. The
/// process-wide slot in [`registry`] exists only for hosts that cannot
/// thread a handle through.
pub struct Agent {
    config: Arc<AgentConfig>,
    connection: Arc<ConnectionManager>,
    capture: CaptureEngine,
    breakpoints: Arc<BreakpointManager>,
}

impl Agent {
    /// Build an agent from validated configuration. Unusable configuration
    /// is rejected here, before anything is wired up.
    pub fn new(config: AgentConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);

        let connection = Arc::new(ConnectionManager::new(Arc::clone(&config)));
        let breakpoints = Arc::new(BreakpointManager::new(Arc::clone(&connection)));
        connection.attach_control(Arc::clone(&breakpoints));
        let capture = CaptureEngine::new(Arc::clone(&config), Arc::clone(&connection));

        Ok(Self {
            config,
            connection,
            capture,
            breakpoints,
        })
    }

    /// Start the collector connection. Must be called within a tokio runtime.
    pub fn connect(&self) -> Result<(), ConnectionError> {
        Arc::clone(&self.connection).connect()
    }

    /// Tear everything down: drop breakpoints, cancel the connection loops,
    /// and best-effort drain the outbound queue. Idempotent.
    pub async fn shutdown(&self) {
        self.breakpoints.clear();
        self.connection.disconnect().await;
    }

    /// Report an explicitly captured fault.
    pub fn capture(&self, fault: &dyn Fault, severity: Severity) {
        self.capture.capture(fault, severity, None);
    }

    /// Report an explicitly captured fault with request context attached.
    pub fn capture_with_context(
        &self,
        fault: &dyn Fault,
        severity: Severity,
        context: RequestContext,
    ) {
        self.capture.capture(fault, severity, Some(context));
    }

    /// Report a passively observed (first-chance) fault; the skip-list and
    /// sampling rate apply.
    pub fn capture_passive(&self, fault: &dyn Fault, severity: Severity) {
        self.capture.capture_passive(fault, severity, None);
    }

    /// Report any `std::error::Error` and its source chain.
    pub fn capture_error<E: std::error::Error>(&self, error: &E, severity: Severity) {
        let fault = ChainFault::from_error(error);
        self.capture.capture(&fault, severity, None);
    }

    /// Ship a stack + variables snapshot with no fault attached.
    pub fn capture_snapshot(&self, label: &str, fields: Vec<(String, FieldValue)>) {
        self.capture.capture_snapshot(label, fields, None);
    }

    /// Record a conditional-capture trigger at the call site.
    pub fn hit(&self, breakpoint_id: &str) {
        self.breakpoints.hit(breakpoint_id);
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn breakpoints(&self) -> &Arc<BreakpointManager> {
        &self.breakpoints
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AgentConfig {
        AgentConfig {
            api_key: "k".to_string(),
            backend_url: "ws://127.0.0.1:1/agent".to_string(),
            ..AgentConfig::default()
        }
    }

    #[test]
    fn test_agent_rejects_bad_config() {
        let config = AgentConfig {
            sampling_rate: 2.0,
            ..test_config()
        };
        assert!(Agent::new(config).is_err());
    }

    #[tokio::test]
    async fn test_capture_error_flows_to_queue() {
        let agent = Agent::new(test_config()).unwrap();
        let error = std::io::Error::other("disk on fire");
        agent.capture_error(&error, Severity::Error);
        assert_eq!(agent.connection().queued_len(), 1);
    }

    #[tokio::test]
    async fn test_hit_without_breakpoints_is_noop() {
        let agent = Agent::new(test_config()).unwrap();
        agent.hit("nothing-registered");
        assert_eq!(agent.connection().queued_len(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let agent = Agent::new(test_config()).unwrap();
        agent.shutdown().await;
        agent.shutdown().await;
        assert_eq!(agent.connection_state(), ConnectionState::Disconnected);
    }
}
