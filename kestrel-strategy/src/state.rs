//! The strategy-visible state container.
//!
//! A mutable mapping from string keys to JSON-serializable leaves. Every
//! mutation flips the dirty flag; the framework snapshots dirty containers at
//! callback exit and CAS-writes them against the store's monotonic version.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Default)]
pub struct StateContainer {
    values: Map<String, Value>,
    dirty: bool,
    version: u64,
}

impl StateContainer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw value lookup.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Typed lookup; `None` when missing or of the wrong shape.
    #[must_use]
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
    }

    /// Insert or replace a leaf, marking the container dirty.
    pub fn set(&mut self, key: impl Into<String>, value: impl Serialize) {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.values.insert(key.into(), value);
        self.dirty = true;
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.values.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Force the dirty flag, e.g. when an action was emitted.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Version the last committed snapshot carries (0 before any commit).
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Serialize the whole mapping for persistence.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        Value::Object(self.values.clone())
    }

    /// The snapshot was durably written; record its new version.
    pub fn committed(&mut self, new_version: u64) {
        self.version = new_version;
        self.dirty = false;
    }

    /// Replace the contents from a persisted snapshot (crash recovery).
    /// Leaves the container clean at the supplied version.
    pub fn rehydrate(&mut self, snapshot: Value, version: u64) {
        self.values = match snapshot {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                tracing::warn!(kind = %value_kind(&other), "non-object state snapshot ignored");
                Map::new()
            }
        };
        self.version = version;
        self.dirty = false;
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
