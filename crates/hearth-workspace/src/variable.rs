//! Workspace variables, shared across every loaded tab.
//!
//! Writes are published through the signal hub under [`variable_key`], so a
//! hat block watching a variable is woken no matter which tab changed it.

use std::sync::Arc;

use dashmap::DashMap;

use crate::lock::SignalHub;
use crate::value::Value;

/// Lock key under which changes to the variable `id` are signaled.
pub fn variable_key(id: &str) -> String {
    format!("var:{id}")
}

#[derive(Debug)]
pub struct VariableStore {
    values: DashMap<String, Value>,
    hub: Arc<SignalHub>,
}

impl VariableStore {
    pub fn new(hub: Arc<SignalHub>) -> VariableStore {
        VariableStore {
            values: DashMap::new(),
            hub,
        }
    }

    /// An unset variable reads as [`Value::Empty`].
    pub fn get(&self, id: &str) -> Value {
        self.values
            .get(id)
            .map(|entry| entry.value().clone())
            .unwrap_or(Value::Empty)
    }

    pub fn set(&self, id: &str, value: Value) {
        self.values.insert(id.to_string(), value.clone());
        self.hub.signal_all(&variable_key(id), value);
    }

    /// Add `delta` to the variable, treating non-numeric values as zero.
    /// Returns the stored result.
    pub fn adjust(&self, id: &str, delta: f64) -> Value {
        let current = self.get(id).as_f64().unwrap_or(0.0);
        let next = Value::Number(current + delta);
        self.set(id, next.clone());
        next
    }

    /// Flip the variable's boolean reading, treating anything else as false.
    /// Returns the stored result.
    pub fn toggle(&self, id: &str) -> Value {
        let current = self.get(id).as_bool().unwrap_or(false);
        let next = Value::Bool(!current);
        self.set(id, next.clone());
        next
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
