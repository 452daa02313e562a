//! Gateway configuration.
//!
//! Consumed as TOML. All validation happens synchronously at load or
//! mutation time, before any runtime state is touched; a configuration
//! error is the only error kind that propagates to the caller as a hard
//! failure.

use serde::{Deserialize, Serialize};

use crate::core::error::{GatewayError, Result};
use crate::core::tag::TagSelection;
use crate::driver::family::ProtocolFamily;
use crate::publish::traits::SinkKind;
use crate::rules::engine::RuleConfig;

/// Lower bound on poll intervals.
pub const MIN_POLL_INTERVAL_MS: u64 = 250;

/// Upper bound on poll intervals.
pub const MAX_POLL_INTERVAL_MS: u64 = 10_000;

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_health_interval_ms() -> u64 {
    10_000
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

/// Gateway-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Gateway name, used in logs and health messages.
    pub name: String,

    /// Poll interval for devices that do not set their own.
    #[serde(default = "default_poll_interval_ms")]
    pub default_poll_interval_ms: u64,

    /// Health publish cadence, independent of poll cadence.
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,

    /// Bound on graceful shutdown; outstanding disconnects continue in the
    /// background once it elapses.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

/// One tag selection inside a device block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagConfig {
    /// Tag name on the controller.
    pub name: String,

    /// Publishing configuration.
    #[serde(flatten)]
    pub selection: TagSelection,
}

/// One configured device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name, unique within the gateway.
    pub name: String,

    /// Protocol family.
    pub family: ProtocolFamily,

    /// Network address (`host[:port]` or a family-specific URI).
    pub address: String,

    /// Backplane slot, for families that route through a chassis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<u8>,

    /// Explicit routing path, for families that need one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,

    /// Per-device poll interval; the gateway default applies when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,

    /// Re-enter `Connecting` from `Error` automatically.
    #[serde(default = "default_true")]
    pub auto_connect: bool,

    /// Include this device in health publishing.
    #[serde(default = "default_true")]
    pub health_check: bool,

    /// Tag selections.
    #[serde(default)]
    pub tags: Vec<TagConfig>,
}

impl DeviceConfig {
    /// Create a device config with defaults.
    pub fn new(name: impl Into<String>, family: ProtocolFamily, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            family,
            address: address.into(),
            slot: None,
            route: None,
            poll_interval_ms: None,
            auto_connect: true,
            health_check: true,
            tags: Vec::new(),
        }
    }

    /// Add a tag selection.
    #[must_use]
    pub fn with_tag(mut self, name: impl Into<String>, selection: TagSelection) -> Self {
        self.tags.push(TagConfig {
            name: name.into(),
            selection,
        });
        self
    }

    /// Effective poll interval given the gateway default.
    pub fn effective_poll_interval(&self, default_ms: u64) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms.unwrap_or(default_ms))
    }

    /// Validate this device block.
    pub fn validate(&self) -> Result<()> {
        validate_device(self)
    }
}

/// One configured downstream sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Sink instance name, unique within the gateway.
    pub name: String,

    /// Sink kind.
    pub kind: SinkKind,

    /// Downstream address (broker URL, store address; empty for console).
    #[serde(default)]
    pub address: String,

    /// Whether the sink participates in fan-out.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Credentials, where the downstream requires them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Enable TLS on the downstream connection.
    #[serde(default)]
    pub tls: bool,

    /// Topic/key namespace prefix applied by the sink.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// One configured tag pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackConfig {
    /// Pack name, unique within the gateway.
    pub name: String,

    /// Member tags as `[device, tag]` pairs.
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

/// Whole-gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway-wide settings.
    #[serde(default)]
    pub gateway: GatewaySettings,

    /// Device list.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,

    /// Sink list.
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,

    /// Rule/push definitions.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    /// Tag packs.
    #[serde(default)]
    pub packs: Vec<PackConfig>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            name: "tagway".to_string(),
            default_poll_interval_ms: default_poll_interval_ms(),
            health_interval_ms: default_health_interval_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl GatewayConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(input).map_err(|e| GatewayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn from_path(path: &std::path::Path) -> Result<Self> {
        let input = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&input)
    }

    /// Validate the whole configuration.
    pub fn validate(&self) -> Result<()> {
        if self.gateway.name.is_empty() {
            return Err(GatewayError::Config("gateway name is empty".to_string()));
        }
        validate_poll_interval(self.gateway.default_poll_interval_ms)?;
        if self.gateway.health_interval_ms == 0 {
            return Err(GatewayError::invalid("health_interval_ms", "must be > 0"));
        }

        let mut device_names = std::collections::HashSet::new();
        for device in &self.devices {
            validate_device(device)?;
            if !device_names.insert(device.name.as_str()) {
                return Err(GatewayError::Config(format!(
                    "duplicate device: {}",
                    device.name
                )));
            }
        }

        let mut sink_names = std::collections::HashSet::new();
        for sink in &self.sinks {
            if sink.name.is_empty() {
                return Err(GatewayError::Config("sink name is empty".to_string()));
            }
            if !sink_names.insert(sink.name.as_str()) {
                return Err(GatewayError::Config(format!("duplicate sink: {}", sink.name)));
            }
            if sink.kind != SinkKind::Console && sink.address.is_empty() {
                return Err(GatewayError::Config(format!(
                    "sink {} has no address",
                    sink.name
                )));
            }
        }

        let mut rule_names = std::collections::HashSet::new();
        for rule in &self.rules {
            rule.validate()?;
            if !rule_names.insert(rule.name.as_str()) {
                return Err(GatewayError::Config(format!("duplicate rule: {}", rule.name)));
            }
        }

        let mut pack_names = std::collections::HashSet::new();
        for pack in &self.packs {
            if pack.name.is_empty() {
                return Err(GatewayError::Config("pack name is empty".to_string()));
            }
            if !pack_names.insert(pack.name.as_str()) {
                return Err(GatewayError::Config(format!("duplicate pack: {}", pack.name)));
            }
            for (device, tag) in &pack.members {
                if !device_names.contains(device.as_str()) {
                    return Err(GatewayError::Config(format!(
                        "pack {} references unknown device {} (tag {})",
                        pack.name, device, tag
                    )));
                }
            }
        }

        Ok(())
    }
}

fn validate_poll_interval(ms: u64) -> Result<()> {
    if !(MIN_POLL_INTERVAL_MS..=MAX_POLL_INTERVAL_MS).contains(&ms) {
        return Err(GatewayError::invalid(
            "poll interval",
            format!(
                "{} ms out of range {}..={} ms",
                ms, MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS
            ),
        ));
    }
    Ok(())
}

fn validate_device(device: &DeviceConfig) -> Result<()> {
    if device.name.is_empty() {
        return Err(GatewayError::Config("device name is empty".to_string()));
    }
    if device.address.is_empty() {
        return Err(GatewayError::Config(format!(
            "device {} has no address",
            device.name
        )));
    }
    if let Some(ms) = device.poll_interval_ms {
        validate_poll_interval(ms)?;
    }
    let mut tag_names = std::collections::HashSet::new();
    for tag in &device.tags {
        if tag.name.is_empty() {
            return Err(GatewayError::Config(format!(
                "device {} has an unnamed tag",
                device.name
            )));
        }
        if !tag_names.insert(tag.name.as_str()) {
            return Err(GatewayError::Config(format!(
                "duplicate tag {} on device {}",
                tag.name, device.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[gateway]
name = "plant-gw"
default_poll_interval_ms = 500

[[devices]]
name = "plc1"
family = "sim"
address = "sim://plant1"
poll_interval_ms = 250

[[devices.tags]]
name = "Speed"
alias = "line1/speed"

[[devices.tags]]
name = "Motor"
enabled = false
suppress_kv = true

[[sinks]]
name = "console"
kind = "console"

[[sinks]]
name = "broker1"
kind = "broker"
address = "mqtt://10.0.0.9:1883"
username = "gw"
password = "secret"

[[rules]]
name = "overspeed"

[[rules.conditions]]
device = "plc1"
tag = "Speed"
op = "gt"
value = 100

[[rules.actions]]
type = "write_back"
device = "plc1"
tag = "Motor"
value = false

[[packs]]
name = "line1"
members = [["plc1", "Speed"], ["plc1", "Motor"]]
"#;

    #[test]
    fn test_sample_parses_and_validates() {
        let config = GatewayConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.gateway.name, "plant-gw");
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].tags.len(), 2);
        assert!(!config.devices[0].tags[1].selection.enabled);
        assert!(config.devices[0].tags[1].selection.suppress_kv);
        assert_eq!(config.sinks.len(), 2);
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.packs[0].members.len(), 2);
    }

    #[test]
    fn test_duplicate_device_rejected() {
        let bad = format!(
            "{}\n[[devices]]\nname = \"plc1\"\nfamily = \"sim\"\naddress = \"sim://x\"\n",
            SAMPLE
        );
        let err = GatewayConfig::from_toml_str(&bad).unwrap_err();
        assert!(err.to_string().contains("duplicate device"));
    }

    #[test]
    fn test_poll_interval_bounds() {
        let bad = SAMPLE.replace("poll_interval_ms = 250", "poll_interval_ms = 50");
        assert!(GatewayConfig::from_toml_str(&bad).is_err());

        let bad = SAMPLE.replace("poll_interval_ms = 250", "poll_interval_ms = 60000");
        assert!(GatewayConfig::from_toml_str(&bad).is_err());
    }

    #[test]
    fn test_duplicate_tag_rejected() {
        let bad = SAMPLE.replace("name = \"Motor\"", "name = \"Speed\"");
        let err = GatewayConfig::from_toml_str(&bad).unwrap_err();
        assert!(err.to_string().contains("duplicate tag"));
    }

    #[test]
    fn test_pack_unknown_device_rejected() {
        let bad = SAMPLE.replace(
            "members = [[\"plc1\", \"Speed\"], [\"plc1\", \"Motor\"]]",
            "members = [[\"nope\", \"Speed\"]]",
        );
        let err = GatewayConfig::from_toml_str(&bad).unwrap_err();
        assert!(err.to_string().contains("unknown device"));
    }

    #[test]
    fn test_broker_sink_needs_address() {
        let bad = SAMPLE.replace("address = \"mqtt://10.0.0.9:1883\"", "address = \"\"");
        assert!(GatewayConfig::from_toml_str(&bad).is_err());
    }
}
