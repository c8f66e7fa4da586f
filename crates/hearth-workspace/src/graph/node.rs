//! One saved workspace block: immutable wiring plus shared runtime cells.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};

use crate::graph::{BlockGraph, ParseError};
use crate::graph::primitive::{self, InputSlot};
use crate::value::Value;

/// Lifecycle of one node as reported to diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Idle,
    Waiting,
    Running,
    Finished,
}

impl ExecutionState {
    fn from_u8(raw: u8) -> ExecutionState {
        match raw {
            1 => ExecutionState::Waiting,
            2 => ExecutionState::Running,
            3 => ExecutionState::Finished,
            _ => ExecutionState::Idle,
        }
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExecutionState::Idle => "idle",
            ExecutionState::Waiting => "waiting",
            ExecutionState::Running => "running",
            ExecutionState::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// A saved field: the displayed value plus an optional entity reference id.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub value: serde_json::Value,
    pub ref_id: Option<String>,
}

impl Field {
    /// String form of the displayed value, without JSON quoting.
    pub fn text(&self) -> String {
        match &self.value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        Value::from(self.value.clone()).as_bool()
    }
}

/// One block of a parsed workspace tree.
///
/// Identity, wiring and decoded inputs never change after parse. The runtime
/// cells are written by the owning task and by signal listeners on other
/// tasks, so they sit behind atomics and `ArcSwap`.
#[derive(Debug)]
pub struct BlockNode {
    pub id: String,
    pub extension_id: String,
    pub opcode: String,
    pub shadow: bool,
    pub top_level: bool,
    pub parent: Option<String>,
    pub next: Option<String>,
    pub fields: HashMap<String, Field>,
    pub inputs: HashMap<String, InputSlot>,
    last_value: ArcSwapOption<Value>,
    last_child_value: ArcSwapOption<Value>,
    execution_state: AtomicU8,
    state_text: ArcSwapOption<String>,
}

impl BlockNode {
    /// Build a node from one entry of the saved `target.blocks` map.
    ///
    /// Inputs that fail to decode are kept as [`InputSlot::Invalid`] and
    /// surface when the node first reads them; only structural problems
    /// reject the whole tree here.
    pub(crate) fn from_saved(id: &str, raw: &serde_json::Value) -> Result<BlockNode, ParseError> {
        let body = raw.as_object().ok_or_else(|| ParseError::NodeNotObject { id: id.to_string() })?;
        let combined = body.get("opcode").and_then(|v| v.as_str()).unwrap_or_default();
        let (extension_id, opcode) = split_opcode(combined).ok_or_else(|| ParseError::BadOpcode {
            id: id.to_string(),
            opcode: combined.to_string(),
        })?;

        let mut fields = HashMap::new();
        if let Some(saved) = body.get("fields").and_then(|v| v.as_object()) {
            for (name, entry) in saved {
                let parts = entry.as_array().ok_or_else(|| ParseError::BadField {
                    id: id.to_string(),
                    name: name.clone(),
                })?;
                fields.insert(
                    name.clone(),
                    Field {
                        value: parts.first().cloned().unwrap_or(serde_json::Value::Null),
                        ref_id: parts.get(1).and_then(|v| v.as_str()).map(str::to_owned),
                    },
                );
            }
        }

        let mut inputs = HashMap::new();
        if let Some(saved) = body.get("inputs").and_then(|v| v.as_object()) {
            for (key, entry) in saved {
                let slot = match primitive::decode_input(id, key, entry) {
                    Ok(slot) => slot,
                    Err(err) => InputSlot::Invalid(err),
                };
                inputs.insert(key.clone(), slot);
            }
        }

        Ok(BlockNode {
            id: id.to_string(),
            extension_id,
            opcode,
            shadow: body.get("shadow").and_then(|v| v.as_bool()).unwrap_or(false),
            top_level: body.get("topLevel").and_then(|v| v.as_bool()).unwrap_or(false),
            parent: body.get("parent").and_then(|v| v.as_str()).map(str::to_owned),
            next: body.get("next").and_then(|v| v.as_str()).map(str::to_owned),
            fields,
            inputs,
            last_value: ArcSwapOption::new(None),
            last_child_value: ArcSwapOption::new(None),
            execution_state: AtomicU8::new(0),
            state_text: ArcSwapOption::new(None),
        })
    }

    pub fn last_value(&self) -> Option<Value> {
        self.last_value.load_full().map(|v| (*v).clone())
    }

    pub fn set_last_value(&self, value: Value) {
        self.last_value.store(Some(Arc::new(value)));
    }

    pub fn last_child_value(&self) -> Option<Value> {
        self.last_child_value.load_full().map(|v| (*v).clone())
    }

    pub fn set_last_child_value(&self, value: Value) {
        self.last_child_value.store(Some(Arc::new(value)));
    }

    /// The value visible to this node: its own result, then the result cached
    /// off its children, then the nearest ancestor carrying either.
    pub fn last_value_in(&self, graph: &BlockGraph) -> Option<Value> {
        if let Some(value) = self.last_value() {
            return Some(value);
        }
        if let Some(value) = self.last_child_value() {
            return Some(value);
        }
        let mut seen = HashSet::new();
        let mut cursor = self.parent.clone();
        while let Some(id) = cursor {
            if !seen.insert(id.clone()) {
                return None;
            }
            let node = graph.get(&id)?;
            if let Some(value) = node.last_value() {
                return Some(value);
            }
            if let Some(value) = node.last_child_value() {
                return Some(value);
            }
            cursor = node.parent.clone();
        }
        None
    }

    pub fn execution_state(&self) -> ExecutionState {
        ExecutionState::from_u8(self.execution_state.load(Ordering::SeqCst))
    }

    pub fn set_execution_state(&self, state: ExecutionState) {
        self.execution_state.store(state as u8, Ordering::SeqCst);
    }

    /// Human readable progress line shown next to the block.
    pub fn state_text(&self) -> Option<String> {
        self.state_text.load_full().map(|v| (*v).clone())
    }

    pub fn set_state_text(&self, text: impl Into<String>) {
        self.state_text.store(Some(Arc::new(text.into())));
    }

    pub fn clear_state_text(&self) {
        self.state_text.store(None);
    }

    /// Structural equality, ignoring the runtime cells. Used to detect
    /// reloads that saved an unchanged tree.
    pub(crate) fn same_shape(&self, other: &BlockNode) -> bool {
        self.extension_id == other.extension_id
            && self.opcode == other.opcode
            && self.shadow == other.shadow
            && self.top_level == other.top_level
            && self.parent == other.parent
            && self.next == other.next
            && self.fields == other.fields
            && self.inputs == other.inputs
    }
}

/// Split a saved combined opcode (`control_if`) into extension id and opcode.
/// The extension id runs to the first underscore, the opcode keeps the rest.
pub(crate) fn split_opcode(combined: &str) -> Option<(String, String)> {
    let (extension, opcode) = combined.split_once('_')?;
    if extension.is_empty() || opcode.is_empty() {
        return None;
    }
    Some((extension.to_string(), opcode.to_string()))
}
