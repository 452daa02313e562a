//! Tag-access driver layer.
//!
//! Wire-level codecs for each controller family live in separate crates and
//! plug in through the [`TagDriver`] trait. The in-crate [`sim`] driver is
//! the reference implementation used by tests and the demo configuration.

pub mod family;
pub mod sim;
pub mod traits;

pub use family::ProtocolFamily;
pub use sim::{SimDriver, SimHandle, SimTagDef};
pub use traits::{DeviceInfo, DiscoveredDevice, TagDriver, TemplateMember, TypeTemplate};
