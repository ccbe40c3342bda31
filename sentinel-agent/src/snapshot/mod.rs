//! Bounded value snapshots.
//!
//! Converts a [`FieldValue`] into a [`VariableNode`] tree capped by depth,
//! string length, and collection size so every payload that reaches the
//! transport is already bounded.

use sentinel_types::VariableNode;

use crate::config::AgentConfig;
use crate::fault::FieldValue;

/// Value shown for nodes cut off by the depth cap.
pub const MAX_DEPTH_SENTINEL: &str = "<max depth>";

/// Applies the configured shape caps to runtime values.
#[derive(Debug, Clone)]
pub struct Snapshotter {
    max_depth: usize,
    max_string_length: usize,
    max_collection_size: usize,
}

impl Snapshotter {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            max_depth: config.max_variable_depth,
            max_string_length: config.max_string_length,
            max_collection_size: config.max_collection_size,
        }
    }

    /// Snapshot a value at the given depth (0 for top-level variables).
    ///
    /// Exceeding the depth cap returns a sentinel node without descending, so
    /// traversal terminates no matter what shape the host hands over.
    pub fn snapshot(&self, name: impl Into<String>, value: &FieldValue, depth: usize) -> VariableNode {
        let name = name.into();

        if depth > self.max_depth {
            return VariableNode {
                name,
                var_type: "unknown".to_string(),
                value: MAX_DEPTH_SENTINEL.to_string(),
                is_null: false,
                is_truncated: true,
                children: None,
            };
        }

        match value {
            FieldValue::Null => VariableNode {
                name,
                var_type: "null".to_string(),
                value: "null".to_string(),
                is_null: true,
                is_truncated: false,
                children: None,
            },
            FieldValue::Bool(v) => VariableNode::leaf(name, "bool", v.to_string()),
            FieldValue::Int(v) => VariableNode::leaf(name, "int", v.to_string()),
            FieldValue::UInt(v) => VariableNode::leaf(name, "uint", v.to_string()),
            FieldValue::Float(v) => VariableNode::leaf(name, "float", v.to_string()),
            FieldValue::Timestamp(ms) => VariableNode::leaf(name, "timestamp", ms.to_string()),
            FieldValue::Str(s) => self.snapshot_string(name, s),
            FieldValue::Seq(items) => self.snapshot_seq(name, items),
            FieldValue::Map(entries) => self.snapshot_map(name, entries, depth),
            FieldValue::Opaque { type_name } => VariableNode::leaf(
                name,
                type_name.clone(),
                format!("<{}>", type_name),
            ),
        }
    }

    fn snapshot_string(&self, name: String, s: &str) -> VariableNode {
        let char_count = s.chars().count();
        let truncated = char_count > self.max_string_length;
        let value = if truncated {
            s.chars().take(self.max_string_length).collect()
        } else {
            s.to_string()
        };

        VariableNode {
            name,
            var_type: "string".to_string(),
            value,
            is_null: false,
            is_truncated: truncated,
            children: None,
        }
    }

    /// Indexed collections are never expanded element-by-element; the count
    /// itself is only taken as far as the cap plus one.
    fn snapshot_seq(&self, name: String, items: &[FieldValue]) -> VariableNode {
        let counted = items.len().min(self.max_collection_size + 1);
        VariableNode::leaf(name, "collection", format!("[{} items]", counted))
    }

    fn snapshot_map(
        &self,
        name: String,
        entries: &[(String, FieldValue)],
        depth: usize,
    ) -> VariableNode {
        let truncated = entries.len() > self.max_collection_size;
        let children: Vec<VariableNode> = entries
            .iter()
            .take(self.max_collection_size)
            .map(|(key, value)| self.snapshot(key.clone(), value, depth + 1))
            .collect();

        VariableNode {
            name,
            var_type: "map".to_string(),
            value: format!("{{{} entries}}", entries.len()),
            is_null: false,
            is_truncated: truncated,
            children: Some(children),
        }
    }
}
