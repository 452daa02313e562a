//! Per-device runtime state.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::tag::{TagDescriptor, TagSelection};
use crate::driver::family::ProtocolFamily;
use crate::driver::traits::DeviceInfo;

/// Connection status of one device.
///
/// Transitions happen only inside the connection manager:
/// `Disconnected -> Connecting -> Connected`, `Connecting/Connected -> Error`
/// on failure, `Error -> Connecting` while auto-connect is enabled, and any
/// state `-> Disconnected` on an explicit disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// Not connected; no poll task running.
    #[default]
    Disconnected,

    /// Handshake in progress.
    Connecting,

    /// Connected and polling.
    Connected,

    /// Last connect or I/O attempt failed.
    Error,
}

impl DeviceStatus {
    /// Check if the device is usable for reads and writes.
    #[inline]
    pub const fn is_online(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Aggregate poll statistics for one device.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollStats {
    /// Tags read across all poll cycles.
    pub tags_polled: u64,

    /// Change events produced.
    pub changes_found: u64,

    /// Completion time of the last poll cycle.
    pub last_poll: Option<DateTime<Utc>>,

    /// Last poll-cycle error.
    pub last_error: Option<String>,
}

impl PollStats {
    /// Fold another device's stats into a gateway-wide aggregate.
    pub fn merge(&mut self, other: &PollStats) {
        self.tags_polled += other.tags_polled;
        self.changes_found += other.changes_found;
        if other.last_poll > self.last_poll {
            self.last_poll = other.last_poll;
        }
        if other.last_error.is_some() {
            self.last_error = other.last_error.clone();
        }
    }
}

/// Mutable runtime state of one device, guarded by the handle's lock.
#[derive(Debug, Default)]
pub struct DeviceRuntime {
    /// Connection status.
    pub status: DeviceStatus,

    /// Last connectivity error.
    pub last_error: Option<String>,

    /// Identity captured at connect.
    pub identity: Option<DeviceInfo>,

    /// Discovered tag index, refreshed on every connect.
    pub tag_index: Vec<TagDescriptor>,

    /// Discovered program names.
    pub programs: Vec<String>,

    /// Poll statistics.
    pub stats: PollStats,

    /// Consecutive connect failures, drives the reconnect backoff.
    pub consecutive_failures: u32,
}

impl DeviceRuntime {
    /// Look up a discovered descriptor by tag name.
    pub fn descriptor(&self, tag: &str) -> Option<&TagDescriptor> {
        self.tag_index.iter().find(|d| d.name == tag)
    }
}

/// Point-in-time view of one device, for presentation layers.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub name: String,
    pub family: ProtocolFamily,
    pub address: String,
    pub status: DeviceStatus,
    pub auto_connect: bool,
    pub last_error: Option<String>,
    pub identity: Option<DeviceInfo>,
    pub tag_count: usize,
    pub stats: PollStats,
}

/// Live tag selections for one device, editable at runtime.
pub type SelectionMap = BTreeMap<String, TagSelection>;

/// Reconnect backoff: bounded exponential, 500 ms doubling to a 30 s cap.
pub fn reconnect_backoff(consecutive_failures: u32) -> Duration {
    const BASE_MS: u64 = 500;
    const CAP_MS: u64 = 30_000;
    let shift = consecutive_failures.min(16);
    Duration::from_millis((BASE_MS << shift).min(CAP_MS))
}
