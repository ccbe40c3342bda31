//! Resilient collector connection.
//!
//! One supervisor task owns the transport for the life of a session: it
//! connects, registers, runs the send/heartbeat/receive loops, and reconnects
//! with exponential backoff until the attempt budget is exhausted. No other
//! component touches the socket.

pub mod events;

pub use events::InboundBroadcaster;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use sentinel_types::{Envelope, HeartbeatPayload, RegisterPayload, ServerMessage};
use tokio::net::TcpStream;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::breakpoints::BreakpointManager;
use crate::config::AgentConfig;
use crate::error::ConnectionError;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Header carrying the agent key during the handshake.
const AUTH_HEADER: &str = "x-agent-key";

/// Base reconnect delay, doubled each attempt.
const BACKOFF_BASE_MS: u64 = 1000;

/// Reconnect delay ceiling.
const BACKOFF_CAP_MS: u64 = 60_000;

/// How long the send loop sleeps when the outbound queue is empty.
const QUEUE_IDLE_POLL_MS: u64 = 50;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Registering,
    Live,
    Reconnecting,
}

impl ConnectionState {
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Live)
    }
}

/// Mutable session record, owned exclusively by the manager.
struct SessionState {
    state: ConnectionState,
    agent_id: Option<String>,
    reconnect_attempts: u32,
    /// Root cancellation token of the running supervisor, if any
    supervisor: Option<CancellationToken>,
    /// Bumped per connect() so a stale supervisor never clears a new slot
    generation: u64,
}

/// Owns the outbound transport: handshake, queue, loops, reconnection.
pub struct ConnectionManager {
    config: Arc<AgentConfig>,
    /// Unbounded FIFO of data envelopes awaiting the send loop
    queue: Mutex<VecDeque<Envelope>>,
    session: Mutex<SessionState>,
    /// Write-exclusion guard: every transport write goes through here
    writer: tokio::sync::Mutex<Option<WsSink>>,
    broadcaster: InboundBroadcaster,
    /// Target for set_breakpoint / remove_breakpoint control messages
    control: OnceCell<Arc<BreakpointManager>>,
}

impl ConnectionManager {
    pub fn new(config: Arc<AgentConfig>) -> Self {
        Self {
            config,
            queue: Mutex::new(VecDeque::new()),
            session: Mutex::new(SessionState {
                state: ConnectionState::Disconnected,
                agent_id: None,
                reconnect_attempts: 0,
                supervisor: None,
                generation: 0,
            }),
            writer: tokio::sync::Mutex::new(None),
            broadcaster: InboundBroadcaster::new(),
            control: OnceCell::new(),
        }
    }

    /// Wire the breakpoint manager that inbound control messages target.
    pub fn attach_control(&self, control: Arc<BreakpointManager>) {
        let _ = self.control.set(control);
    }

    pub fn state(&self) -> ConnectionState {
        self.session.lock().state
    }

    /// Server-assigned identity from the `registered` ack, once received.
    pub fn agent_id(&self) -> Option<String> {
        self.session.lock().agent_id.clone()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.session.lock().reconnect_attempts
    }

    /// Observer feed of every inbound envelope.
    pub fn broadcaster(&self) -> &InboundBroadcaster {
        &self.broadcaster
    }

    /// Number of messages waiting in the outbound queue.
    pub fn queued_len(&self) -> usize {
        self.queue.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn drain_queued_for_test(&self) -> Vec<Envelope> {
        self.queue.lock().drain(..).collect()
    }

    /// Enqueue a data payload for the send loop. Fire-and-forget: the queue
    /// is unbounded and survives reconnects, but not process death.
    pub fn enqueue(&self, kind: &str, payload: serde_json::Value) {
        let envelope = Envelope::data(kind, payload, Utc::now().timestamp_millis());
        let mut queue = self.queue.lock();
        queue.push_back(envelope);
        log::debug!("[CONNECTION] Queued '{}' ({} pending)", kind, queue.len());
    }

    /// Start the session supervisor. Must be called from within a tokio
    /// runtime; returns an error if a supervisor is already running.
    pub fn connect(self: Arc<Self>) -> Result<(), ConnectionError> {
        let (token, generation) = {
            let mut session = self.session.lock();
            if session.supervisor.is_some() {
                return Err(ConnectionError::AlreadyConnected);
            }
            let token = CancellationToken::new();
            session.supervisor = Some(token.clone());
            session.generation += 1;
            session.reconnect_attempts = 0;
            (token, session.generation)
        };

        tokio::spawn(Self::run(self, token, generation));
        Ok(())
    }

    /// Stop the session: cancel all loops, best-effort drain the queue onto
    /// the transport, then close it. Idempotent.
    pub async fn disconnect(&self) {
        let token = self.session.lock().supervisor.take();
        if let Some(token) = token {
            log::info!("[CONNECTION] Disconnecting");
            token.cancel();
        }

        let drained: Vec<Envelope> = self.queue.lock().drain(..).collect();
        let mut guard = self.writer.lock().await;
        if let Some(mut sink) = guard.take() {
            for envelope in &drained {
                if let Ok(text) = serde_json::to_string(envelope) {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            }
            let _ = sink.close().await;
        }
        drop(guard);

        let mut session = self.session.lock();
        session.state = ConnectionState::Disconnected;
        session.agent_id = None;
        session.reconnect_attempts = 0;
    }

    fn set_state(&self, state: ConnectionState) {
        self.session.lock().state = state;
    }

    // ── supervisor ───────────────────────────────────────────────────

    async fn run(manager: Arc<Self>, token: CancellationToken, generation: u64) {
        log::info!("[CONNECTION] Supervisor started for {}", manager.config.backend_url);

        loop {
            if token.is_cancelled() {
                break;
            }
            manager.set_state(ConnectionState::Connecting);

            match manager.open_transport().await {
                Ok(ws) => {
                    let (sink, stream) = ws.split();
                    *manager.writer.lock().await = Some(sink);

                    manager.set_state(ConnectionState::Registering);
                    match manager.send_register().await {
                        Ok(()) => {
                            manager.set_state(ConnectionState::Live);
                            {
                                let mut session = manager.session.lock();
                                session.reconnect_attempts = 0;
                            }
                            log::info!(
                                "[CONNECTION] Live ({} message(s) pending)",
                                manager.queued_len()
                            );

                            let session_token = token.child_token();
                            let send_task = tokio::spawn(Self::send_loop(
                                Arc::clone(&manager),
                                session_token.clone(),
                            ));
                            let heartbeat_task = tokio::spawn(Self::heartbeat_loop(
                                Arc::clone(&manager),
                                session_token.clone(),
                            ));

                            manager.receive_loop(stream, session_token.clone()).await;

                            session_token.cancel();
                            let _ = send_task.await;
                            let _ = heartbeat_task.await;
                        }
                        Err(e) => {
                            log::warn!("[CONNECTION] Register handshake failed: {}", e);
                        }
                    }

                    // On session failure the dead transport is released here;
                    // on explicit disconnect it is left for the drain.
                    if !token.is_cancelled() {
                        manager.writer.lock().await.take();
                    }
                }
                Err(e) => {
                    log::warn!("[CONNECTION] Connect failed: {}", e);
                }
            }

            if token.is_cancelled() {
                break;
            }
            manager.set_state(ConnectionState::Reconnecting);

            let attempt = {
                let mut session = manager.session.lock();
                session.reconnect_attempts += 1;
                session.reconnect_attempts
            };
            if attempt > manager.config.max_reconnect_attempts {
                log::error!(
                    "[CONNECTION] Reconnect attempts exhausted ({}), giving up",
                    manager.config.max_reconnect_attempts
                );
                break;
            }

            let delay = Duration::from_millis(backoff_delay_ms(attempt));
            log::info!(
                "[CONNECTION] Reconnecting in {}ms (attempt {}/{})",
                delay.as_millis(),
                attempt,
                manager.config.max_reconnect_attempts
            );
            tokio::select! {
                _ = token.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        manager.set_state(ConnectionState::Disconnected);
        let mut session = manager.session.lock();
        if session.generation == generation {
            session.supervisor = None;
        }
        log::info!("[CONNECTION] Supervisor stopped");
    }

    async fn open_transport(
        &self,
    ) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, String> {
        let mut request = self
            .config
            .backend_url
            .as_str()
            .into_client_request()
            .map_err(|e| e.to_string())?;
        let key = HeaderValue::from_str(&self.config.api_key)
            .map_err(|_| "API key is not a valid header value".to_string())?;
        request.headers_mut().insert(AUTH_HEADER, key);

        let (ws, _response) = connect_async(request).await.map_err(|e| e.to_string())?;
        Ok(ws)
    }

    /// Serialize and write one envelope under the write-exclusion guard.
    /// Register and heartbeat frames come through here directly, bypassing
    /// the queue, so control and data never interleave mid-frame.
    async fn write_direct(&self, envelope: &Envelope) -> Result<(), String> {
        let text = serde_json::to_string(envelope).map_err(|e| e.to_string())?;
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(sink) => {
                log::debug!("[DATAGRAM] >>> {}", text);
                sink.send(Message::Text(text)).await.map_err(|e| e.to_string())
            }
            None => Err("transport not open".to_string()),
        }
    }

    async fn send_register(&self) -> Result<(), String> {
        let payload = RegisterPayload {
            agent_key: self.config.api_key.clone(),
            runtime: "rust".to_string(),
            runtime_version: runtime_version(),
            hostname: hostname(),
            environment: self.config.environment.clone(),
            application_name: self.config.application_name.clone(),
        };
        let payload = serde_json::to_value(&payload).map_err(|e| e.to_string())?;
        self.write_direct(&Envelope::control("register", payload)).await
    }

    // ── session loops ────────────────────────────────────────────────

    /// Drains the outbound queue one message at a time. A failed write
    /// requeues the message at the front and tears the session down.
    async fn send_loop(manager: Arc<Self>, token: CancellationToken) {
        loop {
            if token.is_cancelled() {
                return;
            }
            let next = manager.queue.lock().pop_front();
            match next {
                Some(envelope) => {
                    if let Err(e) = manager.write_direct(&envelope).await {
                        log::warn!(
                            "[CONNECTION] Send failed, requeueing '{}': {}",
                            envelope.kind,
                            e
                        );
                        manager.queue.lock().push_front(envelope);
                        token.cancel();
                        return;
                    }
                }
                None => {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = sleep(Duration::from_millis(QUEUE_IDLE_POLL_MS)) => {}
                    }
                }
            }
        }
    }

    /// Writes a heartbeat frame every interval. Failures are logged but not
    /// fatal by themselves; the send/receive loops detect real transport
    /// failure on their own.
    async fn heartbeat_loop(manager: Arc<Self>, token: CancellationToken) {
        let interval = Duration::from_millis(manager.config.heartbeat_interval_ms);
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // skip first immediate tick

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    let payload = HeartbeatPayload {
                        timestamp: Utc::now().timestamp_millis(),
                    };
                    let payload = match serde_json::to_value(&payload) {
                        Ok(v) => v,
                        Err(_) => continue,
                    };
                    if let Err(e) = manager
                        .write_direct(&Envelope::control("heartbeat", payload))
                        .await
                    {
                        log::warn!("[CONNECTION] Heartbeat failed: {}", e);
                    }
                }
            }
        }
    }

    /// Reads inbound frames until cancellation, peer close, or error.
    async fn receive_loop(&self, mut stream: WsStream, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.dispatch_inbound(&text),
                    Some(Ok(Message::Ping(data))) => {
                        let mut guard = self.writer.lock().await;
                        if let Some(sink) = guard.as_mut() {
                            let _ = sink.send(Message::Pong(data)).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        log::info!("[CONNECTION] Closed by peer");
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::error!("[CONNECTION] Receive error: {}", e);
                        return;
                    }
                    None => {
                        log::info!("[CONNECTION] Stream ended");
                        return;
                    }
                }
            }
        }
    }

    /// Parse and route one inbound frame. Malformed frames are logged and
    /// dropped; the receive loop stays up.
    fn dispatch_inbound(&self, text: &str) {
        log::debug!("[DATAGRAM] <<< {}", text);

        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("[CONNECTION] Dropping malformed frame: {}", e);
                return;
            }
        };

        self.broadcaster.broadcast(&envelope);

        match ServerMessage::decode(&envelope) {
            Ok(Some(ServerMessage::Registered(payload))) => {
                log::info!("[CONNECTION] Registered as agent {}", payload.agent_id);
                self.session.lock().agent_id = Some(payload.agent_id);
            }
            Ok(Some(ServerMessage::SetBreakpoint(spec))) => match self.control.get() {
                Some(control) => control.set(spec),
                None => log::warn!("[CONNECTION] set_breakpoint received with no control target"),
            },
            Ok(Some(ServerMessage::RemoveBreakpoint { id })) => {
                if let Some(control) = self.control.get() {
                    control.remove(&id);
                }
            }
            Ok(Some(ServerMessage::Error(payload))) => {
                log::error!("[CONNECTION] Server error: {}", payload.message);
            }
            Ok(None) => {
                log::debug!(
                    "[CONNECTION] Ignoring unknown message type '{}'",
                    envelope.kind
                );
            }
            Err(e) => {
                log::warn!(
                    "[CONNECTION] Dropping malformed '{}' payload: {}",
                    envelope.kind,
                    e
                );
            }
        }
    }
}

/// Reconnect delay for the given attempt: `min(1000ms * 2^attempt, 60s)`.
pub(crate) fn backoff_delay_ms(attempt: u32) -> u64 {
    (BACKOFF_BASE_MS << attempt.min(6)).min(BACKOFF_CAP_MS)
}

fn runtime_version() -> String {
    option_env!("RUSTC_VERSION").unwrap_or("unknown").to_string()
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    fn test_config(backend_url: String, max_reconnect_attempts: u32) -> AgentConfig {
        AgentConfig {
            api_key: "test-key".to_string(),
            backend_url,
            application_name: "sentinel-tests".to_string(),
            heartbeat_interval_ms: 100,
            max_reconnect_attempts,
            ..AgentConfig::default()
        }
    }

    #[test]
    fn test_backoff_sequence_and_cap() {
        let delays: Vec<u64> = (1..=6).map(backoff_delay_ms).collect();
        assert_eq!(delays, vec![2000, 4000, 8000, 16000, 32000, 60000]);
        assert_eq!(backoff_delay_ms(7), 60000);
        assert_eq!(backoff_delay_ms(30), 60000);
    }

    #[test]
    fn test_enqueue_is_fifo_with_timestamps() {
        let manager = ConnectionManager::new(Arc::new(test_config(
            "ws://127.0.0.1:1/agent".to_string(),
            1,
        )));
        manager.enqueue("exception", json!({"n": 1}));
        manager.enqueue("snapshot", json!({"n": 2}));
        assert_eq!(manager.queued_len(), 2);

        let mut queue = manager.queue.lock();
        let first = queue.pop_front().unwrap();
        let second = queue.pop_front().unwrap();
        assert_eq!(first.kind, "exception");
        assert_eq!(second.kind, "snapshot");
        assert!(first.timestamp.is_some());
    }

    #[test]
    fn test_initial_state_disconnected() {
        let manager = ConnectionManager::new(Arc::new(test_config(
            "ws://127.0.0.1:1/agent".to_string(),
            1,
        )));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.reconnect_attempts(), 0);
        assert!(manager.agent_id().is_none());
    }

    #[tokio::test]
    async fn test_dispatch_malformed_and_unknown_frames_survive() {
        let manager = ConnectionManager::new(Arc::new(test_config(
            "ws://127.0.0.1:1/agent".to_string(),
            1,
        )));
        manager.dispatch_inbound("not json at all");
        manager.dispatch_inbound(r#"{"type":"brand_new","payload":{}}"#);
        manager.dispatch_inbound(r#"{"type":"registered","payload":{"agentId":"a-7"}}"#);
        assert_eq!(manager.agent_id().as_deref(), Some("a-7"));
    }

    #[tokio::test]
    async fn test_breakpoint_control_messages_routed() {
        let manager = Arc::new(ConnectionManager::new(Arc::new(test_config(
            "ws://127.0.0.1:1/agent".to_string(),
            1,
        ))));
        let control = Arc::new(BreakpointManager::new(Arc::clone(&manager)));
        manager.attach_control(Arc::clone(&control));

        manager.dispatch_inbound(
            r#"{"type":"set_breakpoint","payload":{"id":"bp-1","file":"src/orders.rs","line":10,"maxHits":2}}"#,
        );
        assert_eq!(control.count(), 1);

        control.hit("bp-1");
        let queued = manager.drain_queued_for_test();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].kind, "breakpoint_hit");
        assert_eq!(queued[0].payload["breakpointId"], "bp-1");
        assert_eq!(queued[0].payload["lineNumber"], 10);

        manager.dispatch_inbound(r#"{"type":"remove_breakpoint","payload":{"id":"bp-1"}}"#);
        assert_eq!(control.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_exhaustion_is_terminal() {
        // Port 1 refuses connections immediately; paused time fast-forwards
        // through the backoff sleeps.
        let manager = Arc::new(ConnectionManager::new(Arc::new(test_config(
            "ws://127.0.0.1:1/agent".to_string(),
            2,
        ))));
        Arc::clone(&manager).connect().unwrap();
        assert!(matches!(
            Arc::clone(&manager).connect(),
            Err(ConnectionError::AlreadyConnected)
        ));

        let mut terminal = false;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let session_done = manager.session.lock().supervisor.is_none();
            if session_done && manager.state() == ConnectionState::Disconnected {
                terminal = true;
                break;
            }
        }
        assert!(terminal, "supervisor should give up after the attempt budget");
        // Manual restart is allowed after exhaustion.
        Arc::clone(&manager).connect().unwrap();
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_register_and_payload_roundtrip() {
        let _ = env_logger::builder().is_test(true).try_init();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Collector stand-in: accept one agent, answer the register, and
        // relay everything it sees over a channel. Stays up until aborted so
        // the session cannot flip into Reconnecting mid-assertion.
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel::<Envelope>();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                let Message::Text(text) = message else { continue };
                let envelope: Envelope = serde_json::from_str(&text).unwrap();
                if envelope.kind == "register" {
                    let ack = Envelope::control("registered", json!({"agentId": "agent-42"}));
                    ws.send(Message::Text(serde_json::to_string(&ack).unwrap()))
                        .await
                        .unwrap();
                }
                seen_tx.send(envelope).unwrap();
            }
        });

        let manager = Arc::new(ConnectionManager::new(Arc::new(test_config(
            format!("ws://{}/agent", addr),
            3,
        ))));
        Arc::clone(&manager).connect().unwrap();
        manager.enqueue("exception", json!({"type": "TestError"}));

        // Heartbeats may interleave; collect until both frames are in.
        let mut register = None;
        let mut exception = None;
        while register.is_none() || exception.is_none() {
            let envelope = seen_rx.recv().await.unwrap();
            match envelope.kind.as_str() {
                "register" => register = Some(envelope),
                "exception" => exception = Some(envelope),
                _ => {}
            }
        }

        let register = register.unwrap();
        assert_eq!(register.payload["agentKey"], "test-key");
        assert!(register.timestamp.is_none());
        assert!(exception.unwrap().timestamp.is_some());

        // The registered ack was dispatched back into the session.
        for _ in 0..50 {
            if manager.agent_id().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.agent_id().as_deref(), Some("agent-42"));
        assert!(manager.state().is_live());

        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        server.abort();
    }
}
