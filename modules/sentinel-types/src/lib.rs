//! Shared wire types for the sentinel agent and its collector.
//!
//! Everything that crosses the WebSocket is defined here so a collector or
//! test harness can decode agent traffic without pulling in the agent runtime.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =====================================================
// Envelope
// =====================================================

/// Wire envelope framing every message in both directions.
///
/// `register` and `heartbeat` omit the top-level timestamp (the heartbeat
/// carries its timestamp inside the payload instead).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type tag, e.g. `exception`, `heartbeat`, `set_breakpoint`
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific payload object
    pub payload: Value,
    /// Client clock in epoch milliseconds, absent on control messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Envelope {
    /// Envelope for a data payload, stamped with the given client clock.
    pub fn data(kind: impl Into<String>, payload: Value, timestamp_ms: i64) -> Self {
        Self {
            kind: kind.into(),
            payload,
            timestamp: Some(timestamp_ms),
        }
    }

    /// Envelope for a control message (`register`, `heartbeat`) with no
    /// top-level timestamp.
    pub fn control(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            timestamp: None,
        }
    }
}

// =====================================================
// Captured Event Model
// =====================================================

/// Severity of a captured event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Process-fatal unhandled paths
    Critical,
    /// Caught, explicit, or unobserved-async paths
    Error,
}

/// Where in the monitored code an event originated (innermost frame).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventOrigin {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
}

/// A single stack frame, innermost frames first in any frame list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    /// Module path of the enclosing type/module, when symbolication found one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    pub line: u32,
    pub column: u32,
    /// True for runtime/toolchain frames with no user source location
    pub is_native: bool,
    /// Live locals are unobtainable without a debugger attach; populated only
    /// where a caller supplied placeholder variables explicitly
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_variables: Option<Vec<VariableNode>>,
}

/// Bounded tree representation of a runtime value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableNode {
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: String,
    /// Stringified value, possibly truncated
    pub value: String,
    #[serde(default)]
    pub is_null: bool,
    #[serde(default)]
    pub is_truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<VariableNode>>,
}

impl VariableNode {
    /// Leaf node with a stringified value.
    pub fn leaf(name: impl Into<String>, var_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            var_type: var_type.into(),
            value: value.into(),
            is_null: false,
            is_truncated: false,
            children: None,
        }
    }

    /// Find a direct child by name.
    pub fn child(&self, name: &str) -> Option<&VariableNode> {
        self.children.as_ref()?.iter().find(|c| c.name == name)
    }
}

/// Request-scoped context attached by a web-framework adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_address: Option<String>,
}

/// A fully extracted failure event, immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedEvent {
    /// Fault type name, e.g. `std::io::Error`
    #[serde(rename = "type")]
    pub event_type: String,
    pub message: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<EventOrigin>,
    pub runtime: String,
    pub runtime_version: String,
    pub stack_frames: Vec<StackFrame>,
    pub variables: Vec<VariableNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_context: Option<RequestContext>,
    pub timestamp_ms: i64,
}

impl CapturedEvent {
    /// Find a top-level variable node by name.
    pub fn variable(&self, name: &str) -> Option<&VariableNode> {
        self.variables.iter().find(|v| v.name == name)
    }
}

// =====================================================
// Client → Server Payloads
// =====================================================

/// `register` payload advertising the runtime identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub agent_key: String,
    pub runtime: String,
    pub runtime_version: String,
    pub hostname: String,
    pub environment: String,
    pub application_name: String,
}

/// `heartbeat` payload; the timestamp lives here, not on the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub timestamp: i64,
}

/// `breakpoint_hit` payload produced by a triggered conditional capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointHitPayload {
    pub breakpoint_id: String,
    /// Epoch milliseconds at the moment of the hit
    pub captured_at: i64,
    pub file_path: String,
    pub line_number: u32,
    pub stack_trace: Vec<StackFrame>,
    pub hit_count: u32,
}

/// `snapshot` payload: a stack + variables capture with no fault attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPayload {
    pub label: String,
    pub stack_frames: Vec<StackFrame>,
    pub variables: Vec<VariableNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_context: Option<RequestContext>,
    pub timestamp_ms: i64,
}

// =====================================================
// Server → Client Messages
// =====================================================

/// Registration request for a conditional capture point.
///
/// Collectors in the wild disagree on field names, so `from_value` probes
/// each field under a documented precedence order instead of relying on a
/// single serde shape: `filePath` → `file_path` → `file`, and
/// `lineNumber` → `line_number` → `line`, `maxHits` → `max_hits`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointSpec {
    pub id: String,
    pub file_path: String,
    pub line_number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_hits: Option<u32>,
}

impl BreakpointSpec {
    /// Decode a `set_breakpoint` payload with explicit field precedence.
    pub fn from_value(payload: &Value) -> Result<Self, String> {
        let id = payload
            .get("id")
            .and_then(Value::as_str)
            .ok_or("set_breakpoint payload missing 'id'")?
            .to_string();

        let file_path = payload
            .get("filePath")
            .or_else(|| payload.get("file_path"))
            .or_else(|| payload.get("file"))
            .and_then(Value::as_str)
            .ok_or("set_breakpoint payload missing file path")?
            .to_string();

        let line_number = payload
            .get("lineNumber")
            .or_else(|| payload.get("line_number"))
            .or_else(|| payload.get("line"))
            .and_then(Value::as_u64)
            .ok_or("set_breakpoint payload missing line number")? as u32;

        let condition = payload
            .get("condition")
            .and_then(Value::as_str)
            .map(str::to_string);

        let max_hits = payload
            .get("maxHits")
            .or_else(|| payload.get("max_hits"))
            .and_then(Value::as_u64)
            .map(|v| v as u32);

        Ok(Self {
            id,
            file_path,
            line_number,
            condition,
            max_hits,
        })
    }
}

/// `registered` acknowledgement carrying the server-assigned identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredPayload {
    pub agent_id: String,
}

/// `error` message from the collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerErrorPayload {
    pub message: String,
}

/// Decoded inbound control message.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    Registered(RegisteredPayload),
    SetBreakpoint(BreakpointSpec),
    RemoveBreakpoint { id: String },
    Error(ServerErrorPayload),
}

impl ServerMessage {
    /// Decode an inbound envelope.
    ///
    /// Returns `Ok(None)` for unknown message types (ignored without error)
    /// and `Err` for a recognized type with a malformed payload.
    pub fn decode(envelope: &Envelope) -> Result<Option<ServerMessage>, String> {
        match envelope.kind.as_str() {
            "registered" => {
                let payload: RegisteredPayload = serde_json::from_value(envelope.payload.clone())
                    .map_err(|e| format!("invalid registered payload: {}", e))?;
                Ok(Some(ServerMessage::Registered(payload)))
            }
            "set_breakpoint" => {
                let spec = BreakpointSpec::from_value(&envelope.payload)?;
                Ok(Some(ServerMessage::SetBreakpoint(spec)))
            }
            "remove_breakpoint" => {
                let id = envelope
                    .payload
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or("remove_breakpoint payload missing 'id'")?
                    .to_string();
                Ok(Some(ServerMessage::RemoveBreakpoint { id }))
            }
            "error" => {
                let payload: ServerErrorPayload = serde_json::from_value(envelope.payload.clone())
                    .map_err(|e| format!("invalid error payload: {}", e))?;
                Ok(Some(ServerMessage::Error(payload)))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_control_omits_timestamp() {
        let env = Envelope::control("heartbeat", json!({"timestamp": 123}));
        let wire = serde_json::to_value(&env).unwrap();
        assert_eq!(wire["type"], "heartbeat");
        assert!(wire.get("timestamp").is_none());
    }

    #[test]
    fn test_envelope_data_carries_timestamp() {
        let env = Envelope::data("exception", json!({}), 1_700_000_000_000);
        let wire = serde_json::to_value(&env).unwrap();
        assert_eq!(wire["timestamp"], 1_700_000_000_000i64);
    }

    #[test]
    fn test_breakpoint_spec_field_precedence() {
        // Canonical camelCase names win over fallbacks
        let spec = BreakpointSpec::from_value(&json!({
            "id": "bp-1",
            "filePath": "src/main.rs",
            "file": "ignored.rs",
            "lineNumber": 42,
            "line": 9
        }))
        .unwrap();
        assert_eq!(spec.file_path, "src/main.rs");
        assert_eq!(spec.line_number, 42);

        // Bare fallback names are accepted alone
        let spec = BreakpointSpec::from_value(&json!({
            "id": "bp-2",
            "file": "lib.rs",
            "line": 7,
            "max_hits": 5
        }))
        .unwrap();
        assert_eq!(spec.file_path, "lib.rs");
        assert_eq!(spec.line_number, 7);
        assert_eq!(spec.max_hits, Some(5));
    }

    #[test]
    fn test_breakpoint_spec_missing_fields() {
        assert!(BreakpointSpec::from_value(&json!({"id": "x"})).is_err());
        assert!(BreakpointSpec::from_value(&json!({"file": "a.rs", "line": 1})).is_err());
    }

    #[test]
    fn test_server_message_unknown_type_ignored() {
        let env = Envelope::control("totally_new_feature", json!({}));
        assert!(ServerMessage::decode(&env).unwrap().is_none());
    }

    #[test]
    fn test_server_message_malformed_payload() {
        let env = Envelope::control("registered", json!({"wrong": true}));
        assert!(ServerMessage::decode(&env).is_err());
    }

    #[test]
    fn test_captured_event_round_trip_field_names() {
        let event = CapturedEvent {
            event_type: "std::io::Error".into(),
            message: "file not found".into(),
            severity: Severity::Error,
            origin: Some(EventOrigin {
                file: Some("src/main.rs".into()),
                line: Some(10),
                method: Some("run".into()),
                class: Some("app".into()),
            }),
            runtime: "rust".into(),
            runtime_version: "1.80".into(),
            stack_frames: vec![StackFrame {
                method_name: Some("run".into()),
                line: 10,
                ..Default::default()
            }],
            variables: vec![VariableNode::leaf("Message", "string", "file not found")],
            request_context: None,
            timestamp_ms: 1,
        };

        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["type"], "std::io::Error");
        assert_eq!(wire["stackFrames"][0]["methodName"], "run");
        assert_eq!(wire["severity"], "error");
        assert!(wire.get("requestContext").is_none());
    }
}
