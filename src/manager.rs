//! Connection & poll management.

pub mod config;
pub mod device;
pub mod service;

pub use config::{DeviceConfig, GatewayConfig, GatewaySettings, PackConfig, SinkConfig, TagConfig};
pub use device::{DeviceSnapshot, DeviceStatus, PollStats};
pub use service::{DeviceManager, PollReport};
