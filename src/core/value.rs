//! Value types for polled tag data.
//!
//! `Value` is the protocol-agnostic decoded representation; `TagValue` pairs
//! it with the raw wire encoding, an optional per-read error, and the time of
//! observation. A failed read is represented as a `TagValue` carrying an
//! error instead of being dropped, so downstream consumers can distinguish
//! "device went away" from "value unchanged".

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A decoded tag value.
///
/// Structured (UDT) tags decode to `Struct` with one entry per member;
/// member maps are ordered so serialized payloads are stable.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Boolean value (BOOL, coil, flag bit).
    Bool(bool),

    /// Integer value (SINT/INT/DINT/LINT and unsigned kin).
    Integer(i64),

    /// Floating-point value (REAL/LREAL).
    Float(f64),

    /// String value.
    Text(String),

    /// Array of homogeneous elements.
    ///
    /// Declared before `Bytes` so untagged deserialization prefers it for
    /// integer arrays.
    Array(Vec<Value>),

    /// Raw bytes for types without a decoded representation.
    Bytes(Vec<u8>),

    /// Structured (UDT) value: member name -> member value.
    Struct(BTreeMap<String, Value>),

    /// Null/missing value.
    #[default]
    Null,
}

impl Value {
    /// Try to get the value as f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Integer(v) => Some(*v as f64),
            Self::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Try to get the value as i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            Self::Float(v) => Some(*v as i64),
            Self::Bool(v) => Some(if *v { 1 } else { 0 }),
            _ => None,
        }
    }

    /// Try to get the value as bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            Self::Integer(v) => Some(*v != 0),
            Self::Float(v) => Some(*v != 0.0),
            _ => None,
        }
    }

    /// Try to get the value as a string slice.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get a structured value's members, if this is a `Struct`.
    pub fn members(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Struct(m) => Some(m),
            _ => None,
        }
    }

    /// Check if this is a null value.
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Check if this is a structured value.
    #[inline]
    pub fn is_struct(&self) -> bool {
        matches!(self, Self::Struct(_))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float(v as f64)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(m: BTreeMap<String, Value>) -> Self {
        Self::Struct(m)
    }
}

/// One observation of a tag: decoded value, raw encoding, and read outcome.
///
/// The current-value table maps `(device, tag)` to the most recent
/// `TagValue`. Values are replaced whole, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagValue {
    /// Decoded value. `Null` when the read failed.
    pub value: Value,

    /// Raw wire encoding, when the driver surfaces it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Vec<u8>>,

    /// Per-read error. A value with an error compares unequal to every
    /// successful value, so error transitions produce change events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Time of observation (gateway clock).
    pub timestamp: DateTime<Utc>,
}

impl TagValue {
    /// Create a successful observation with the current timestamp.
    pub fn ok(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            raw: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a failed observation.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            value: Value::Null,
            raw: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }

    /// Attach the raw wire encoding.
    #[must_use]
    pub fn with_raw(mut self, raw: Vec<u8>) -> Self {
        self.raw = Some(raw);
        self
    }

    /// Check if this observation is a read error.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
