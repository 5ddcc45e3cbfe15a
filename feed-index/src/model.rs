//! Core data types for feed indexing.
//!
//! This module defines the records read from logs, the per-log cursors the
//! pipeline persists, and the key components and locators stored in index
//! partitions.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;

use crate::error::{Error, Result};

/// Opaque identifier naming a log.
///
/// Log ids are arbitrary bytes (typically a public key or a name). When a log
/// id has to serve as a stable persisted name it is rendered as lowercase hex.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogId(Bytes);

impl LogId {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lowercase hex rendering used in persisted cursor keys.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Parses a lowercase or uppercase hex rendering.
    pub fn from_hex(s: &str) -> Result<Self> {
        hex::decode(s)
            .map(|bytes| Self(Bytes::from(bytes)))
            .map_err(|e| Error::Encoding(format!("invalid hex log id '{}': {}", s, e)))
    }
}

impl fmt::Debug for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogId({})", self.to_hex())
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<&'static str> for LogId {
    fn from(s: &'static str) -> Self {
        Self(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for LogId {
    fn from(s: String) -> Self {
        Self(Bytes::from(s))
    }
}

impl From<Vec<u8>> for LogId {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl From<Bytes> for LogId {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

/// Resume state for one log.
///
/// `numeric_id` is assigned once, the first time the pipeline sees the log,
/// and never changes. `next_sequence` is the first sequence that has not yet
/// been fully indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogCursor {
    pub log_id: LogId,
    pub numeric_id: u32,
    pub next_sequence: u64,
}

/// A record read from a log.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// The log this record was read from.
    pub log_id: LogId,

    /// Position of the record within its log, starting at zero.
    pub sequence: u64,

    /// The record body. Field paths are resolved here first.
    pub payload: Value,

    /// Auxiliary data attached by the log source. Field paths fall back to
    /// this when the payload does not contain them.
    pub metadata: Value,
}

impl Record {
    pub fn new(log_id: impl Into<LogId>, sequence: u64, payload: impl Into<Value>) -> Self {
        Self {
            log_id: log_id.into(),
            sequence,
            payload: payload.into(),
            metadata: Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<Value>) -> Self {
        self.metadata = metadata.into();
        self
    }
}

/// Generic structured value carried by record payloads and metadata.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    /// Also holds JSON integers outside the `i64` range, which therefore
    /// cannot be used as key components.
    Float(f64),
    String(String),
    Bytes(Bytes),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Looks up a nested field, descending through maps only.
    pub fn get_path<S: AsRef<str>>(&self, path: &[S]) -> Option<&Value> {
        path.iter().try_fold(self, |value, segment| match value {
            Value::Map(map) => map.get(segment.as_ref()),
            _ => None,
        })
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
        }
    }
}

/// Integers that fit `i64` become [`Value::Int`]; every other number,
/// including unsigned integers above `i64::MAX`, becomes [`Value::Float`].
impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(fields) => Value::Map(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

/// One scalar component of a composite index key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyComponent {
    String(String),
    Int(i64),
    Bool(bool),
    Bytes(Bytes),
}

impl TryFrom<&Value> for KeyComponent {
    type Error = Error;

    /// Converts a scalar value. `Null` and non-scalar values are rejected;
    /// callers that treat `Null` as a missing field check for it first.
    fn try_from(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(KeyComponent::String(s.clone())),
            Value::Int(i) => Ok(KeyComponent::Int(*i)),
            Value::Bool(b) => Ok(KeyComponent::Bool(*b)),
            Value::Bytes(b) => Ok(KeyComponent::Bytes(b.clone())),
            other => Err(Error::InvalidInput(format!(
                "{} value cannot be used as a key component",
                other.kind()
            ))),
        }
    }
}

impl From<&str> for KeyComponent {
    fn from(s: &str) -> Self {
        KeyComponent::String(s.to_string())
    }
}

impl From<String> for KeyComponent {
    fn from(s: String) -> Self {
        KeyComponent::String(s)
    }
}

impl From<i64> for KeyComponent {
    fn from(i: i64) -> Self {
        KeyComponent::Int(i)
    }
}

impl From<u32> for KeyComponent {
    fn from(i: u32) -> Self {
        KeyComponent::Int(i64::from(i))
    }
}

impl From<bool> for KeyComponent {
    fn from(b: bool) -> Self {
        KeyComponent::Bool(b)
    }
}

impl From<Bytes> for KeyComponent {
    fn from(b: Bytes) -> Self {
        KeyComponent::Bytes(b)
    }
}

/// Points from an index entry back to the record it was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Locator {
    pub log_numeric_id: u32,
    pub sequence: u64,
}

impl Locator {
    pub fn new(log_numeric_id: u32, sequence: u64) -> Self {
        Self {
            log_numeric_id,
            sequence,
        }
    }
}
