//! Inbound frame fan-out.
//!
//! Every inbound envelope — control or otherwise — is offered to generic
//! observers so integrations can extend the protocol without touching the
//! dispatch table.

use dashmap::DashMap;
use sentinel_types::Envelope;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Per-observer channel capacity; slow observers drop frames rather than
/// stalling the receive loop.
const OBSERVER_BUFFER_SIZE: usize = 256;

/// Broadcasts inbound envelopes to all subscribed observers.
pub struct InboundBroadcaster {
    observers: DashMap<String, mpsc::Sender<Envelope>>,
}

impl InboundBroadcaster {
    pub fn new() -> Self {
        Self {
            observers: DashMap::new(),
        }
    }

    /// Subscribe a new observer and return (observer_id, receiver).
    pub fn subscribe(&self) -> (String, mpsc::Receiver<Envelope>) {
        let observer_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(OBSERVER_BUFFER_SIZE);
        self.observers.insert(observer_id.clone(), tx);
        log::debug!("[CONNECTION] Observer {} subscribed", observer_id);
        (observer_id, rx)
    }

    /// Unsubscribe an observer.
    pub fn unsubscribe(&self, observer_id: &str) {
        self.observers.remove(observer_id);
        log::debug!("[CONNECTION] Observer {} unsubscribed", observer_id);
    }

    /// Offer an envelope to every observer. Non-blocking: a full observer
    /// channel drops the frame for that observer, a closed one is removed.
    pub fn broadcast(&self, envelope: &Envelope) {
        let mut closed = Vec::new();

        for entry in self.observers.iter() {
            match entry.value().try_send(envelope.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!(
                        "[CONNECTION] Observer {} channel full, dropping '{}' frame",
                        entry.key(),
                        envelope.kind
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    closed.push(entry.key().clone());
                }
            }
        }

        for observer_id in closed {
            self.observers.remove(&observer_id);
            log::debug!("[CONNECTION] Removed closed observer {}", observer_id);
        }
    }

    /// Number of subscribed observers.
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }
}

impl Default for InboundBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_subscribe_broadcast_unsubscribe() {
        let broadcaster = InboundBroadcaster::new();
        let (id, mut rx) = broadcaster.subscribe();
        assert_eq!(broadcaster.observer_count(), 1);

        broadcaster.broadcast(&Envelope::control("registered", json!({"agentId": "a-1"})));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind, "registered");

        broadcaster.unsubscribe(&id);
        assert_eq!(broadcaster.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_observers_pruned_on_broadcast() {
        let broadcaster = InboundBroadcaster::new();
        let (_id, rx) = broadcaster.subscribe();
        drop(rx);

        broadcaster.broadcast(&Envelope::control("error", json!({"message": "x"})));
        assert_eq!(broadcaster.observer_count(), 0);
    }
}
