//! The replicated key/value state machine.
//!
//! Updated only from `Raft`'s `on_commit` callback, in strict
//! `last_applied` order. This is the "ground truth"
//! the cache falls back to on a cluster-wide miss, and the store the
//! lock manager's and queue's Raft commands apply side effects to for
//! introspection.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A command applied to the state machine once its enclosing Raft
/// entry commits. `op` is deliberately an open string rather than an
/// enum: the lock manager and queue ride the same log with their own
/// op vocabularies (`acquire_lock`, `enqueue`, ...) that this state
/// machine does not need to understand — only `set`/`delete` touch
/// the key/value store itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Command {
    pub op: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Command {
    pub fn set(key: impl Into<String>, value: Value) -> Self {
        Self {
            op: "set".to_string(),
            key: Some(key.into()),
            value: Some(value),
            extra: Default::default(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            op: "delete".to_string(),
            key: Some(key.into()),
            value: None,
            extra: Default::default(),
        }
    }
}

#[derive(Default)]
pub struct StateMachine {
    inner: RwLock<HashMap<String, Value>>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a committed command. Unknown ops are ignored rather
    /// than rejected: other subsystems (lock manager, queue) submit
    /// their own ops through the same log and apply side effects
    /// elsewhere.
    pub fn apply(&self, command: &Command) {
        match command.op.as_str() {
            "set" => {
                if let (Some(key), Some(value)) = (&command.key, &command.value) {
                    self.inner.write().unwrap().insert(key.clone(), value.clone());
                }
            }
            "delete" => {
                if let Some(key) = &command.key {
                    self.inner.write().unwrap().remove(key);
                }
            }
            _ => {}
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.inner.read().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_then_get() {
        let sm = StateMachine::new();
        sm.apply(&Command::set("x", json!("1")));
        assert_eq!(sm.get("x"), Some(json!("1")));
        sm.apply(&Command::set("x", json!("2")));
        assert_eq!(sm.get("x"), Some(json!("2")));
    }

    #[test]
    fn delete_removes_key() {
        let sm = StateMachine::new();
        sm.apply(&Command::set("x", json!(1)));
        sm.apply(&Command::delete("x"));
        assert_eq!(sm.get("x"), None);
    }

    #[test]
    fn unknown_op_is_ignored() {
        let sm = StateMachine::new();
        sm.apply(&Command {
            op: "acquire_lock".to_string(),
            key: None,
            value: None,
            extra: Default::default(),
        });
        assert!(sm.is_empty());
    }
}
