//! The current-value table.
//!
//! One shared table maps `(device, tag)` to the most recently observed
//! [`TagValue`]. Each device's poll task is the only writer for that
//! device's keys; the publisher, rule engine, and presentation layers are
//! readers. Mutation is always whole-value replace, so a reader observes
//! either the old or the new value, never a torn one.

use dashmap::DashMap;

use crate::core::value::TagValue;

/// Key type: `(device, tag)`.
pub type TagKey = (String, String);

/// Concurrent table of last-known tag values.
pub struct CurrentValueTable {
    values: DashMap<TagKey, TagValue>,
}

impl CurrentValueTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
        }
    }

    /// Replace the stored value for a tag, returning the previous one.
    pub fn replace(&self, device: &str, tag: &str, value: TagValue) -> Option<TagValue> {
        self.values
            .insert((device.to_string(), tag.to_string()), value)
    }

    /// Read the current value for a tag.
    pub fn get(&self, device: &str, tag: &str) -> Option<TagValue> {
        self.values
            .get(&(device.to_string(), tag.to_string()))
            .map(|v| v.clone())
    }

    /// Snapshot every `(device, tag, value)` triple.
    pub fn snapshot(&self) -> Vec<(TagKey, TagValue)> {
        self.values
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Snapshot one device's values.
    pub fn snapshot_device(&self, device: &str) -> Vec<(String, TagValue)> {
        self.values
            .iter()
            .filter(|e| e.key().0 == device)
            .map(|e| (e.key().1.clone(), e.value().clone()))
            .collect()
    }

    /// Drop all values belonging to a device (device removal).
    pub fn clear_device(&self, device: &str) {
        self.values.retain(|key, _| key.0 != device);
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Default for CurrentValueTable {
    fn default() -> Self {
        Self::new()
    }
}
