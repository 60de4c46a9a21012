//! Opaque per-call session context.
//!
//! The dispatch core passes the session through unchanged; the only key it
//! ever reads itself is the correlation id, used for logging and tracing.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

/// Session key under which the correlation id is stored.
pub const CORRELATION_ID_KEY: &str = "cid";

/// Per-call mapping of string keys to opaque values.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionContext {
    values: HashMap<String, Value>,
}

impl SessionContext {
    /// Creates an empty session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a session carrying the given correlation id.
    pub fn with_correlation_id(correlation_id: impl Into<String>) -> Self {
        let mut session = Self::new();
        session.put(CORRELATION_ID_KEY, correlation_id.into());
        session
    }

    /// Stores a value under `key`, replacing any previous value.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Returns the value stored under `key`, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Returns the value under `key` as a string slice, if present and textual.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// Returns the correlation id, generating and storing one if absent.
    pub fn correlation_id(&mut self) -> String {
        if let Some(cid) = self.get_str(CORRELATION_ID_KEY) {
            return cid.to_string();
        }
        let cid = uuid::Uuid::new_v4().to_string();
        self.put(CORRELATION_ID_KEY, cid.clone());
        cid
    }

    /// Number of entries in the session.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the session carries no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
