//! # Tagway
//!
//! An industrial tag gateway: polls PLC tags across heterogeneous protocol
//! families, detects value changes, republishes them to independent
//! downstream sinks, and evaluates user-defined conditional rules.
//!
//! ## Architecture
//!
//! ```text
//! TagDriver (per family)          PublishSink (per downstream)
//!        │                                ▲
//!        ▼                                │
//! DeviceManager ──► CurrentValueTable ──► FanoutPublisher
//!        │                 │
//!        └── ChangeEvents ─┼────────────► RuleEngine ──► actions
//!                          └────────────► presentation listeners
//! ```
//!
//! - One poll task per connected device; one delivery task per sink; the
//!   rule engine reacts to change events without a polling loop of its own.
//! - Wire codecs for controller families and broker/store clients live in
//!   separate crates behind the [`driver::TagDriver`] and
//!   [`publish::PublishSink`] traits.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use tagway::prelude::*;
//!
//! let manager = DeviceManager::new(GatewaySettings::default());
//! let (driver, _handle) = SimDriver::new("sim://demo", vec![
//!     SimTagDef::new("Speed", tagway::driver::family::CIP_REAL, 0.0),
//! ]);
//! manager.add_device(
//!     DeviceConfig::new("plc1", ProtocolFamily::Sim, "sim://demo")
//!         .with_tag("Speed", TagSelection::default()),
//!     Box::new(driver),
//! )?;
//! manager.start();
//! manager.connect("plc1")?;
//! ```

pub mod core;
pub mod detect;
pub mod driver;
pub mod manager;
pub mod publish;
pub mod rules;
pub mod store;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::{
        ChangeEvent, GatewayError, HealthStatus, Result, TagDescriptor, TagPack, TagSelection,
        TagValue, Value,
    };
    pub use crate::driver::{ProtocolFamily, SimDriver, SimHandle, SimTagDef, TagDriver};
    pub use crate::manager::{DeviceConfig, DeviceManager, GatewayConfig, GatewaySettings};
    pub use crate::publish::{FanoutPublisher, PublishSink, SinkKind};
    pub use crate::rules::{RuleConfig, RuleEngine, RuleState};
    pub use crate::store::CurrentValueTable;
}

// Re-export core types at crate root for convenience.
pub use crate::core::error::{GatewayError, Result};
pub use crate::core::event::{ChangeEvent, HealthStatus};
pub use crate::core::tag::{TagDescriptor, TagSelection};
pub use crate::core::value::{TagValue, Value};
pub use crate::manager::{DeviceManager, GatewayConfig};
pub use crate::publish::{FanoutPublisher, PublishSink, SinkKind};
pub use crate::rules::RuleEngine;
pub use crate::store::CurrentValueTable;
