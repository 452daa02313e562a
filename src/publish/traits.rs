//! The downstream publish contract.
//!
//! A sink is one configured instance of a downstream system (a message
//! broker connection, a key-value store connection). The wire client for
//! each sink kind lives outside the crate and plugs in through
//! [`PublishSink`]; the fan-out engine treats every sink identically.

use async_trait::async_trait;
use serde::Serialize;

use crate::core::error::Result;
use crate::core::event::{ChangeEvent, HealthStatus};
use crate::core::value::TagValue;

/// Kind of downstream sink. Per-tag suppression flags are keyed by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// Message broker instance.
    Broker,

    /// Key-value / pub-sub store instance.
    KeyValue,

    /// Console (JSON lines); debugging surface, never suppressed.
    Console,
}

impl std::fmt::Display for SinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Broker => "broker",
            Self::KeyValue => "key_value",
            Self::Console => "console",
        };
        f.write_str(s)
    }
}

/// One tag value on its way to the sinks.
#[derive(Debug, Clone, Serialize)]
pub struct TagUpdate {
    /// Owning device name.
    pub device: String,

    /// Tag name.
    pub tag: String,

    /// Publish alias, where configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    /// Device network address.
    pub address: String,

    /// Human-readable type name.
    pub type_name: String,

    /// The observation, including any per-read error and all structured
    /// members (ignored members included).
    pub value: TagValue,

    /// Whether downstream writes to this tag are accepted.
    pub writable: bool,

    /// True when change detection was bypassed (enable/connect sync).
    pub force: bool,

    /// Suppression flags snapshotted from the tag selection.
    #[serde(skip)]
    pub suppress_broker: bool,
    #[serde(skip)]
    pub suppress_kv: bool,
}

impl TagUpdate {
    /// Build an update from a change event plus device metadata.
    pub fn from_change(event: &ChangeEvent, address: &str, type_name: &str) -> Self {
        Self {
            device: event.device.clone(),
            tag: event.tag.clone(),
            alias: event.selection.alias.clone(),
            address: address.to_string(),
            type_name: type_name.to_string(),
            value: event.new.clone(),
            writable: event.selection.writable,
            force: false,
            suppress_broker: event.selection.suppress_broker,
            suppress_kv: event.selection.suppress_kv,
        }
    }

    /// Mark the update as a forced publish.
    #[must_use]
    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    /// Check if delivery to a sink kind is suppressed for this tag.
    pub fn suppressed_for(&self, kind: SinkKind) -> bool {
        match kind {
            SinkKind::Broker => self.suppress_broker,
            SinkKind::KeyValue => self.suppress_kv,
            SinkKind::Console => false,
        }
    }

    /// Publish name: alias where set, else the tag name.
    pub fn publish_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.tag)
    }
}

/// Device health on its way to the sinks.
pub type HealthUpdate = HealthStatus;

/// Contract implemented by every downstream sink.
#[async_trait]
pub trait PublishSink: Send + Sync {
    /// Sink instance name, unique within the gateway.
    fn name(&self) -> &str;

    /// Sink kind, for suppression-flag matching.
    fn kind(&self) -> SinkKind;

    /// Downstream address (broker URL, store address).
    fn address(&self) -> &str;

    /// Establish the downstream connection.
    async fn start(&self) -> Result<()>;

    /// Tear down the downstream connection. Idempotent.
    async fn stop(&self);

    /// Check if the sink has been started.
    fn is_running(&self) -> bool;

    /// Deliver one tag update.
    async fn publish(&self, update: &TagUpdate) -> Result<()>;

    /// Deliver one device health message.
    async fn publish_health(&self, health: &HealthUpdate) -> Result<()>;
}

/// Provider of whole-table snapshots for sink initial sync.
///
/// Implemented by the connection manager, which owns the tag selections
/// needed to filter disabled tags and attach metadata.
pub trait SnapshotSource: Send + Sync {
    /// Current values of every enabled tag, ready to publish.
    fn snapshot_updates(&self) -> Vec<TagUpdate>;
}
