//! The tag-access driver contract.
//!
//! One implementation exists per protocol family (Logix, S7, Omron,
//! Beckhoff). The connection manager and change detector depend only on this
//! trait and the uniform value types, never on family-specific wire codecs.
//!
//! A driver instance owns the connection to exactly one controller. All
//! methods take `&mut self`; the manager serializes access per device, which
//! also gives the strict no-overlapping-polls guarantee.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::core::error::Result;
use crate::core::tag::TagDescriptor;
use crate::core::value::{TagValue, Value};

use super::family::ProtocolFamily;

/// Identity reported by a controller during the connection handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// Vendor name.
    pub vendor: String,

    /// Product/model name.
    pub model: String,

    /// Serial number, where the family exposes one.
    pub serial: String,

    /// Firmware revision string.
    pub revision: String,
}

/// A device found by a network discovery sweep.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredDevice {
    /// Network address the device answered from.
    pub address: String,

    /// Identity reported in the discovery response.
    pub info: DeviceInfo,
}

/// One member of a structured type template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateMember {
    /// Member name.
    pub name: String,

    /// Family-specific type code of the member.
    pub type_code: u16,

    /// Array dimensions; empty for scalar members.
    pub dims: Vec<u32>,

    /// Hidden/host members (padding, reserved bits) are not published.
    pub hidden: bool,
}

/// A structured (UDT) type template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeTemplate {
    /// Type name as reported by the controller.
    pub name: String,

    /// Ordered member list.
    pub members: Vec<TemplateMember>,
}

impl TypeTemplate {
    /// Visible (non-hidden) members.
    pub fn visible_members(&self) -> impl Iterator<Item = &TemplateMember> {
        self.members.iter().filter(|m| !m.hidden)
    }
}

/// Capability interface for one protocol family.
///
/// Read errors come in two flavors: a connection-level failure is returned
/// as `Err` (and moves the device toward the `Error` state), while a per-tag
/// decode failure is returned as `Ok(TagValue)` carrying an error, which
/// participates in change detection like any other value.
#[async_trait]
pub trait TagDriver: Send + Sync {
    /// Protocol family implemented by this driver.
    fn family(&self) -> ProtocolFamily;

    /// Perform the connection handshake and return the device identity.
    async fn connect(&mut self) -> Result<DeviceInfo>;

    /// Close the connection. Idempotent.
    async fn disconnect(&mut self) -> Result<()>;

    /// Sweep a broadcast address for devices of this family.
    async fn discover(
        &mut self,
        broadcast: &str,
        timeout: Duration,
    ) -> Result<Vec<DiscoveredDevice>>;

    /// List controller-scope tags.
    async fn list_tags(&mut self) -> Result<Vec<TagDescriptor>>;

    /// List program names (families with program-scoped tags).
    async fn list_programs(&mut self) -> Result<Vec<String>>;

    /// Look up the structured-type template for a type code.
    ///
    /// Returns `None` for non-structured type codes.
    async fn get_template(&mut self, type_code: u16) -> Result<Option<TypeTemplate>>;

    /// Read a single tag.
    async fn read(&mut self, tag: &str) -> Result<TagValue>;

    /// Read `count` elements starting at an array tag.
    async fn read_with_count(&mut self, tag: &str, count: u32) -> Result<TagValue>;

    /// Read several tags in one poll pass.
    ///
    /// The default implementation loops over [`read`](Self::read); families
    /// with multi-request framing override this with a batched
    /// implementation. A connection-level failure aborts the pass; per-tag
    /// decode failures are carried as error observations and the pass
    /// continues.
    async fn read_batch(&mut self, tags: &[String]) -> Result<Vec<(String, TagValue)>> {
        let mut out = Vec::with_capacity(tags.len());
        for tag in tags {
            match self.read(tag).await {
                Ok(value) => out.push((tag.clone(), value)),
                Err(e) if e.is_connectivity() => return Err(e),
                Err(e) => out.push((tag.clone(), TagValue::failed(e.to_string()))),
            }
        }
        Ok(out)
    }

    /// Write a value to a tag.
    async fn write(&mut self, tag: &str, value: &Value) -> Result<()>;

    /// Size in bytes of one element of the given type code.
    fn element_size(&self, type_code: u16) -> u32;
}
