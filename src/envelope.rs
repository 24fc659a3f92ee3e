//! The `{event, payload}` wire unit and the size-checked copy every message
//! goes through when it crosses a context boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;

/// Largest message the browser accepts in either direction (64 MiB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1_048_576;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    /// Envelope whose event is `"<namespace>/<event>"`.
    pub fn namespaced(namespace: &str, event: &str, payload: Value) -> Self {
        Self::new(format!("{namespace}/{event}"), payload)
    }

    /// Logical event name, or `None` if the envelope belongs to someone else.
    pub fn strip_namespace(&self, namespace: &str) -> Option<&str> {
        self.event
            .strip_prefix(namespace)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|name| !name.is_empty())
    }

    pub fn from_value(value: Value) -> Option<Self> {
        serde_json::from_value(value).ok()
    }

    pub fn into_value(self) -> Value {
        serde_json::json!({ "event": self.event, "payload": self.payload })
    }
}

/// Fail with `InvalidInput` when `bytes` is over `max_size`.
fn check_size(bytes: usize, max_size: usize) -> io::Result<()> {
    if bytes > max_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("message of {bytes} bytes exceeds {max_size}"),
        ));
    }
    Ok(())
}

/// Copy a value across a context boundary by serializing it, refusing
/// anything whose JSON is larger than `max_size`.
pub fn transfer(value: &Value, max_size: usize) -> io::Result<Value> {
    let json = serde_json::to_vec(value)?;
    check_size(json.len(), max_size)?;
    Ok(serde_json::from_slice(&json)?)
}

/// Fail unless `value` serializes to at most `max_size` bytes.
pub fn ensure_fits(value: &Value, max_size: usize) -> io::Result<()> {
    let json = serde_json::to_vec(value)?;
    check_size(json.len(), max_size)
}
