//! Capture orchestration.
//!
//! Pulls a stack walk, fingerprint dedup, and the fault-variable tree
//! together into a `CapturedEvent`, then hands it to the connection queue.
//! Nothing on this path is allowed to fail outward: a telemetry failure must
//! never crash or alter the observed program.

pub mod fingerprint;
pub mod stack;

use std::sync::Arc;

use chrono::Utc;
use sentinel_types::{
    CapturedEvent, EventOrigin, RequestContext, Severity, SnapshotPayload, StackFrame,
    VariableNode,
};

use crate::config::AgentConfig;
use crate::connection::ConnectionManager;
use crate::fault::{Fault, FieldValue};
use crate::snapshot::Snapshotter;
use self::fingerprint::FingerprintSet;

/// Frames hidden from capture snapshots.
const OWN_FRAME_PREFIXES: &[&str] = &["sentinel_agent::capture"];

/// Benign fault categories that bypass passive capture entirely. Matched
/// against the normalized type name; these are routinely caught-and-handled
/// noise on first-chance paths.
const SKIP_LIST: &[&str] = &["cancel", "timeout", "socket", "notfound", "missing"];

/// Orchestrates extraction and filtering ahead of the connection.
pub struct CaptureEngine {
    config: Arc<AgentConfig>,
    connection: Arc<ConnectionManager>,
    snapshotter: Snapshotter,
    dedup: FingerprintSet,
}

impl CaptureEngine {
    pub fn new(config: Arc<AgentConfig>, connection: Arc<ConnectionManager>) -> Self {
        let snapshotter = Snapshotter::new(&config);
        Self {
            config,
            connection,
            snapshotter,
            dedup: FingerprintSet::new(),
        }
    }

    /// Capture an explicitly reported fault. Fire-and-forget: enqueues to the
    /// connection and returns immediately; all failures are swallowed.
    pub fn capture(&self, fault: &dyn Fault, severity: Severity, context: Option<RequestContext>) {
        self.capture_inner(fault, severity, context, false);
    }

    /// Capture a passively observed (first-chance) fault. The skip-list and
    /// sampling rate apply on this path only.
    pub fn capture_passive(
        &self,
        fault: &dyn Fault,
        severity: Severity,
        context: Option<RequestContext>,
    ) {
        self.capture_inner(fault, severity, context, true);
    }

    /// Capture a stack + variables snapshot with no fault attached.
    pub fn capture_snapshot(
        &self,
        label: &str,
        fields: Vec<(String, FieldValue)>,
        context: Option<RequestContext>,
    ) {
        let payload = SnapshotPayload {
            label: label.to_string(),
            stack_frames: stack::capture_frames(OWN_FRAME_PREFIXES),
            variables: fields
                .iter()
                .map(|(name, value)| self.snapshotter.snapshot(name.clone(), value, 0))
                .collect(),
            request_context: context,
            timestamp_ms: Utc::now().timestamp_millis(),
        };
        match serde_json::to_value(&payload) {
            Ok(value) => self.connection.enqueue("snapshot", value),
            Err(e) => self.report_local_failure(&e.to_string()),
        }
    }

    fn capture_inner(
        &self,
        fault: &dyn Fault,
        severity: Severity,
        context: Option<RequestContext>,
        passive: bool,
    ) {
        if let Err(e) = self.try_capture(fault, severity, context, passive) {
            self.report_local_failure(&e);
        }
    }

    fn try_capture(
        &self,
        fault: &dyn Fault,
        severity: Severity,
        context: Option<RequestContext>,
        passive: bool,
    ) -> Result<(), String> {
        let type_name = fault.type_name();

        if passive {
            if is_skip_listed(&type_name) {
                log::debug!("[CAPTURE] Skip-listed fault type {}", type_name);
                return Ok(());
            }
            if !self.sample() {
                return Ok(());
            }
        }

        let frames = stack::capture_frames(OWN_FRAME_PREFIXES);

        let identity = fingerprint::fingerprint(&type_name, &frames);
        if !self.dedup.insert(&identity) {
            log::debug!("[CAPTURE] Suppressed duplicate of {}", type_name);
            return Ok(());
        }

        let event = CapturedEvent {
            event_type: type_name,
            message: fault.message(),
            severity,
            origin: origin_from(&frames),
            runtime: "rust".to_string(),
            runtime_version: option_env!("RUSTC_VERSION").unwrap_or("unknown").to_string(),
            stack_frames: frames,
            variables: self.fault_variables(fault, 0),
            request_context: context,
            timestamp_ms: Utc::now().timestamp_millis(),
        };

        let payload = serde_json::to_value(&event).map_err(|e| e.to_string())?;
        self.connection.enqueue("exception", payload);
        Ok(())
    }

    /// One uniform draw against the configured rate. Zero means never.
    fn sample(&self) -> bool {
        let rate = self.config.sampling_rate;
        rate > 0.0 && (rate >= 1.0 || rand::random::<f64>() <= rate)
    }

    /// Synthesize the "local variables" tree from the fault's capability
    /// surface: message, code, link, exported fields, the data bag, and the
    /// cause chain. This substitutes for true stack-local inspection, which
    /// the runtime does not expose outside of a debugger.
    fn fault_variables(&self, fault: &dyn Fault, depth: usize) -> Vec<VariableNode> {
        let mut nodes = Vec::new();

        nodes.push(
            self.snapshotter
                .snapshot("Message", &FieldValue::str(fault.message()), depth),
        );
        if let Some(code) = fault.error_code() {
            nodes.push(
                self.snapshotter
                    .snapshot("ErrorCode", &FieldValue::Int(code), depth),
            );
        }
        if let Some(link) = fault.help_link() {
            nodes.push(
                self.snapshotter
                    .snapshot("HelpLink", &FieldValue::str(link), depth),
            );
        }

        for (name, value) in fault.exported_fields() {
            nodes.push(self.snapshotter.snapshot(name, &value, depth));
        }

        let data = fault.data();
        if !data.is_empty() {
            nodes.push(self.snapshotter.snapshot("Data", &FieldValue::Map(data), depth));
        }

        if let Some(cause) = fault.cause() {
            nodes.push(self.fault_node("InnerException", cause, depth + 1));
        }

        let contained = fault.contained_faults();
        if !contained.is_empty() {
            let children: Vec<VariableNode> = contained
                .iter()
                .take(self.config.max_collection_size)
                .enumerate()
                .map(|(i, inner)| self.fault_node(&format!("[{}]", i), *inner, depth + 1))
                .collect();
            nodes.push(VariableNode {
                name: "InnerExceptions".to_string(),
                var_type: "collection".to_string(),
                value: format!("[{} items]", contained.len()),
                is_null: false,
                is_truncated: contained.len() > self.config.max_collection_size,
                children: Some(children),
            });
        }

        nodes
    }

    /// A nested fault rendered as a variable node, depth-limited.
    fn fault_node(&self, name: &str, fault: &dyn Fault, depth: usize) -> VariableNode {
        if depth > self.config.max_variable_depth {
            // The snapshotter produces the sentinel for us past the cap.
            return self.snapshotter.snapshot(name, &FieldValue::Null, depth);
        }

        let mut children = vec![self.snapshotter.snapshot(
            "Type",
            &FieldValue::str(fault.type_name()),
            depth,
        )];
        children.extend(self.fault_variables(fault, depth));

        VariableNode {
            name: name.to_string(),
            var_type: fault.type_name(),
            value: self
                .snapshotter
                .snapshot("", &FieldValue::str(fault.message()), depth)
                .value,
            is_null: false,
            is_truncated: false,
            children: Some(children),
        }
    }

    /// Capture-local failures are reported in debug mode and silent otherwise.
    fn report_local_failure(&self, detail: &str) {
        if self.config.debug_logging {
            log::debug!("[CAPTURE] Capture failed: {}", detail);
        }
    }
}

/// Innermost non-native frame, falling back to the innermost frame.
fn origin_from(frames: &[StackFrame]) -> Option<EventOrigin> {
    let frame = frames.iter().find(|f| !f.is_native).or_else(|| frames.first())?;
    Some(EventOrigin {
        file: frame.file_path.clone(),
        line: (frame.line > 0).then_some(frame.line),
        method: frame.method_name.clone(),
        class: frame.class_name.clone(),
    })
}

fn is_skip_listed(type_name: &str) -> bool {
    let normalized: String = type_name
        .chars()
        .filter(|c| *c != '_')
        .collect::<String>()
        .to_lowercase();
    SKIP_LIST.iter().any(|entry| normalized.contains(entry))
}
