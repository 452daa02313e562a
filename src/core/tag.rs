//! Tag identity and publishing configuration.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A discovered tag: name, type, shape, owning device.
///
/// Descriptors are immutable once discovered and re-discovered on reconnect.
/// Structured-member paths use dotted names (`Motor1.Cmd.Speed`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagDescriptor {
    /// Owning device name.
    pub device: String,

    /// Tag name, possibly dotted for structured-member paths.
    pub name: String,

    /// Family-specific type code (see [`crate::driver::family`]).
    pub type_code: u16,

    /// Array dimensions; empty for scalars.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dims: Vec<u32>,
}

impl TagDescriptor {
    /// Create a scalar descriptor.
    pub fn scalar(device: impl Into<String>, name: impl Into<String>, type_code: u16) -> Self {
        Self {
            device: device.into(),
            name: name.into(),
            type_code,
            dims: Vec::new(),
        }
    }

    /// Set array dimensions.
    #[must_use]
    pub fn with_dims(mut self, dims: Vec<u32>) -> Self {
        self.dims = dims;
        self
    }

    /// Check if this tag is an array.
    #[inline]
    pub fn is_array(&self) -> bool {
        !self.dims.is_empty()
    }
}

/// Per-tag publishing configuration.
///
/// Owned by configuration; snapshotted into every change event so the
/// publisher and rule engine see a consistent view even while the user edits
/// the live selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSelection {
    /// Whether the tag participates in polling and publishing at all.
    /// Disabled tags never produce change events and are excluded from
    /// full-table publish sweeps.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Whether downstream writes to this tag are accepted.
    #[serde(default)]
    pub writable: bool,

    /// Optional publish alias; sinks see the alias where set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    /// Suppress delivery to broker-kind sinks.
    #[serde(default)]
    pub suppress_broker: bool,

    /// Suppress delivery to key-value-kind sinks.
    #[serde(default)]
    pub suppress_kv: bool,

    /// Structured-member names excluded from change detection.
    ///
    /// Ignored members never trigger a republish but their values are still
    /// carried in every published payload.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub ignored_members: BTreeSet<String>,

    /// Latch: volatile members have been auto-added to `ignored_members`.
    /// Applied once at enable time so later user edits are never overwritten.
    #[serde(default)]
    pub auto_ignore_applied: bool,
}

fn default_true() -> bool {
    true
}

impl Default for TagSelection {
    fn default() -> Self {
        Self {
            enabled: true,
            writable: false,
            alias: None,
            suppress_broker: false,
            suppress_kv: false,
            ignored_members: BTreeSet::new(),
            auto_ignore_applied: false,
        }
    }
}

impl TagSelection {
    /// Create a disabled selection.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Publish name for this tag: alias where set, else the tag name.
    pub fn publish_name<'a>(&'a self, tag: &'a str) -> &'a str {
        self.alias.as_deref().unwrap_or(tag)
    }
}

/// A named group of tags published together.
///
/// A pack is a configuration-level view over the normal publish path: its
/// enable transition triggers an immediate group publish, identical in
/// spirit to the single-tag force publish but scoped to the group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagPack {
    /// Pack name, unique within the gateway.
    pub name: String,

    /// Member tags as `(device, tag)` pairs.
    pub members: Vec<(String, String)>,

    /// Whether the pack is active.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Suppress delivery to broker-kind sinks.
    #[serde(default)]
    pub suppress_broker: bool,

    /// Suppress delivery to key-value-kind sinks.
    #[serde(default)]
    pub suppress_kv: bool,
}
