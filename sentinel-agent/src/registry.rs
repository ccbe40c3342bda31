//! Optional process-wide agent registry.
//!
//! The core hands out owned [`Agent`](crate::Agent) handles; this module is
//! the one sanctioned global slot for hosts that cannot thread a handle to
//! every call site. Init and teardown are explicit, and double-init is an
//! error rather than a silent replace.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::config::AgentConfig;
use crate::error::ConfigError;
use crate::Agent;

static REGISTRY: Lazy<Mutex<Option<Arc<Agent>>>> = Lazy::new(|| Mutex::new(None));

/// Install a process-wide agent built from the given config.
///
/// Fails with the config's own error when the setup is unusable, or with
/// `OutOfRange` on double-init.
pub fn init(config: AgentConfig) -> Result<Arc<Agent>, ConfigError> {
    let mut slot = REGISTRY.lock();
    if slot.is_some() {
        return Err(ConfigError::AlreadyInitialized);
    }
    let agent = Arc::new(Agent::new(config)?);
    *slot = Some(Arc::clone(&agent));
    log::info!("[REGISTRY] Global agent installed");
    Ok(agent)
}

/// The installed agent, if any.
pub fn get() -> Option<Arc<Agent>> {
    REGISTRY.lock().clone()
}

/// Remove and return the installed agent so the caller can shut it down.
pub fn teardown() -> Option<Arc<Agent>> {
    let agent = REGISTRY.lock().take();
    if agent.is_some() {
        log::info!("[REGISTRY] Global agent removed");
    }
    agent
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
    fn test_init_get_teardown_cycle() {
        // Single test covering the full cycle: registry state is process-wide,
        // so the steps cannot be split across parallel test fns.
        assert!(get().is_none());

        let agent = init(test_config()).unwrap();
        assert!(Arc::ptr_eq(&agent, &get().unwrap()));

        // Double-init is rejected while a global agent is installed.
        assert!(init(test_config()).is_err());

        assert!(teardown().is_some());
        assert!(get().is_none());
        assert!(teardown().is_none());

        // A fresh init succeeds after teardown.
        let again = init(test_config()).unwrap();
        assert!(get().is_some());
        drop(again);
        teardown();
    }
}
