//! Simulated controller driver.
//!
//! `SimDriver` implements the full [`TagDriver`] contract against an
//! in-memory register map instead of a physical device. It backs the demo
//! configuration and every pipeline test: the paired [`SimHandle`] lets a
//! test mutate device-side values, take the device offline, or make the next
//! handshake fail while the manager polls concurrently.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::core::error::{GatewayError, Result};
use crate::core::tag::TagDescriptor;
use crate::core::value::{TagValue, Value};

use super::family::{self, ProtocolFamily};
use super::traits::{DeviceInfo, DiscoveredDevice, TagDriver, TemplateMember, TypeTemplate};

/// Definition of one simulated tag.
#[derive(Debug, Clone)]
pub struct SimTagDef {
    /// Tag name.
    pub name: String,

    /// Type code (Logix encoding; see [`family`]).
    pub type_code: u16,

    /// Initial value.
    pub initial: Value,
}

impl SimTagDef {
    /// Create a tag definition.
    pub fn new(name: impl Into<String>, type_code: u16, initial: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            type_code,
            initial: initial.into(),
        }
    }
}

/// Shared device-side state, visible to both driver and handle.
struct SimState {
    address: String,
    tags: Vec<(String, u16)>,
    values: DashMap<String, Value>,
    read_errors: DashMap<String, String>,
    templates: DashMap<u16, TypeTemplate>,
    programs: Vec<String>,
    offline: AtomicBool,
    fail_connects: AtomicU32,
}

/// Test/demo handle to a simulated controller.
///
/// Cloneable; all clones observe the same device.
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<SimState>,
}

impl SimHandle {
    /// Set a tag's device-side value. The next poll observes it.
    pub fn set_value(&self, tag: &str, value: impl Into<Value>) {
        self.state.values.insert(tag.to_string(), value.into());
    }

    /// Set one member of a structured tag's device-side value.
    pub fn set_member(&self, tag: &str, member: &str, value: impl Into<Value>) {
        if let Some(mut entry) = self.state.values.get_mut(tag) {
            if let Value::Struct(members) = entry.value_mut() {
                members.insert(member.to_string(), value.into());
            }
        }
    }

    /// Read a tag's device-side value (what a poll would observe).
    pub fn value(&self, tag: &str) -> Option<Value> {
        self.state.values.get(tag).map(|v| v.clone())
    }

    /// Take the device offline (reads and connects fail) or back online.
    pub fn set_offline(&self, offline: bool) {
        self.state.offline.store(offline, Ordering::Release);
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.state.fail_connects.store(n, Ordering::Release);
    }

    /// Inject a per-tag decode error; cleared by [`clear_read_error`](Self::clear_read_error).
    pub fn set_read_error(&self, tag: &str, message: &str) {
        self.state
            .read_errors
            .insert(tag.to_string(), message.to_string());
    }

    /// Clear an injected decode error.
    pub fn clear_read_error(&self, tag: &str) {
        self.state.read_errors.remove(tag);
    }
}

/// In-memory simulated controller.
pub struct SimDriver {
    state: Arc<SimState>,
    connected: bool,
}

impl SimDriver {
    /// Create a driver plus its device handle.
    pub fn new(address: impl Into<String>, tags: Vec<SimTagDef>) -> (Self, SimHandle) {
        let values = DashMap::new();
        let mut index = Vec::with_capacity(tags.len());
        for def in &tags {
            values.insert(def.name.clone(), def.initial.clone());
            index.push((def.name.clone(), def.type_code));
        }

        let state = Arc::new(SimState {
            address: address.into(),
            tags: index,
            values,
            read_errors: DashMap::new(),
            templates: DashMap::new(),
            programs: vec!["MainProgram".to_string()],
            offline: AtomicBool::new(false),
            fail_connects: AtomicU32::new(0),
        });

        let handle = SimHandle {
            state: Arc::clone(&state),
        };
        (
            Self {
                state,
                connected: false,
            },
            handle,
        )
    }

    /// Register a structured-type template for a type code.
    pub fn with_template(self, type_code: u16, template: TypeTemplate) -> Self {
        self.state.templates.insert(type_code, template);
        self
    }

    /// A ready-made TIMER template (PRE/ACC/EN/TT/DN).
    pub fn timer_template() -> TypeTemplate {
        TypeTemplate {
            name: "TIMER".to_string(),
            members: vec![
                TemplateMember {
                    name: "PRE".to_string(),
                    type_code: family::CIP_DINT,
                    dims: vec![],
                    hidden: false,
                },
                TemplateMember {
                    name: "ACC".to_string(),
                    type_code: family::CIP_TIMER,
                    dims: vec![],
                    hidden: false,
                },
                TemplateMember {
                    name: "EN".to_string(),
                    type_code: family::CIP_BOOL,
                    dims: vec![],
                    hidden: false,
                },
            ],
        }
    }

    fn ensure_online(&self) -> Result<()> {
        if self.state.offline.load(Ordering::Acquire) {
            return Err(GatewayError::Connection("device offline".to_string()));
        }
        Ok(())
    }

    fn identity(&self) -> DeviceInfo {
        DeviceInfo {
            vendor: "Tagway".to_string(),
            model: "SimPLC-5000".to_string(),
            serial: "SIM-0001".to_string(),
            revision: "1.0".to_string(),
        }
    }
}

#[async_trait]
impl TagDriver for SimDriver {
    fn family(&self) -> ProtocolFamily {
        ProtocolFamily::Sim
    }

    async fn connect(&mut self) -> Result<DeviceInfo> {
        let pending = self.state.fail_connects.load(Ordering::Acquire);
        if pending > 0 {
            self.state.fail_connects.store(pending - 1, Ordering::Release);
            return Err(GatewayError::Connection("handshake refused".to_string()));
        }
        self.ensure_online()?;
        self.connected = true;
        Ok(self.identity())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    async fn discover(
        &mut self,
        _broadcast: &str,
        _timeout: Duration,
    ) -> Result<Vec<DiscoveredDevice>> {
        Ok(vec![DiscoveredDevice {
            address: self.state.address.clone(),
            info: self.identity(),
        }])
    }

    async fn list_tags(&mut self) -> Result<Vec<TagDescriptor>> {
        if !self.connected {
            return Err(GatewayError::NotConnected);
        }
        Ok(self
            .state
            .tags
            .iter()
            .map(|(name, code)| TagDescriptor::scalar("", name.clone(), *code))
            .collect())
    }

    async fn list_programs(&mut self) -> Result<Vec<String>> {
        if !self.connected {
            return Err(GatewayError::NotConnected);
        }
        Ok(self.state.programs.clone())
    }

    async fn get_template(&mut self, type_code: u16) -> Result<Option<TypeTemplate>> {
        Ok(self.state.templates.get(&type_code).map(|t| t.clone()))
    }

    async fn read(&mut self, tag: &str) -> Result<TagValue> {
        if !self.connected {
            return Err(GatewayError::NotConnected);
        }
        self.ensure_online()?;

        if let Some(err) = self.state.read_errors.get(tag) {
            return Ok(TagValue::failed(err.clone()));
        }
        match self.state.values.get(tag) {
            Some(value) => Ok(TagValue::ok(value.clone())),
            None => Ok(TagValue::failed(format!("no such tag: {}", tag))),
        }
    }

    async fn read_with_count(&mut self, tag: &str, count: u32) -> Result<TagValue> {
        let single = self.read(tag).await?;
        if single.is_error() {
            return Ok(single);
        }
        // The simulator stores arrays whole; slice to the requested length.
        let value = match single.value {
            Value::Array(items) => {
                Value::Array(items.into_iter().take(count as usize).collect())
            }
            other => Value::Array(vec![other; count as usize]),
        };
        Ok(TagValue::ok(value))
    }

    async fn write(&mut self, tag: &str, value: &Value) -> Result<()> {
        if !self.connected {
            return Err(GatewayError::NotConnected);
        }
        self.ensure_online()?;

        if !self.state.values.contains_key(tag) {
            return Err(GatewayError::Protocol(format!("no such tag: {}", tag)));
        }
        self.state.values.insert(tag.to_string(), value.clone());
        Ok(())
    }

    fn element_size(&self, type_code: u16) -> u32 {
        family::element_size(ProtocolFamily::Sim, type_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn driver() -> (SimDriver, SimHandle) {
        SimDriver::new(
            "sim://plant1",
            vec![
                SimTagDef::new("Speed", family::CIP_REAL, 0.0),
                SimTagDef::new("Counter", family::CIP_DINT, 0_i64),
            ],
        )
    }

    #[tokio::test]
    async fn test_connect_read_write() {
        let (mut drv, handle) = driver();
        let info = drv.connect().await.unwrap();
        assert_eq!(info.model, "SimPLC-5000");

        handle.set_value("Speed", 42.5);
        let v = drv.read("Speed").await.unwrap();
        assert_eq!(v.value, Value::Float(42.5));

        drv.write("Counter", &Value::Integer(7)).await.unwrap();
        let v = drv.read("Counter").await.unwrap();
        assert_eq!(v.value, Value::Integer(7));
    }

    #[tokio::test]
    async fn test_handshake_failure_injection() {
        let (mut drv, handle) = driver();
        handle.fail_next_connects(2);

        assert!(drv.connect().await.is_err());
        assert!(drv.connect().await.is_err());
        assert!(drv.connect().await.is_ok());
    }

    #[tokio::test]
    async fn test_offline_read_is_connectivity_error() {
        let (mut drv, handle) = driver();
        drv.connect().await.unwrap();

        handle.set_offline(true);
        let err = drv.read("Speed").await.unwrap_err();
        assert!(err.is_connectivity());

        handle.set_offline(false);
        assert!(drv.read("Speed").await.is_ok());
    }

    #[tokio::test]
    async fn test_decode_error_is_value() {
        let (mut drv, handle) = driver();
        drv.connect().await.unwrap();

        handle.set_read_error("Speed", "CRC mismatch");
        let v = drv.read("Speed").await.unwrap();
        assert!(v.is_error());

        handle.clear_read_error("Speed");
        assert!(!drv.read("Speed").await.unwrap().is_error());
    }

    #[tokio::test]
    async fn test_unknown_tag_read_and_write() {
        let (mut drv, _handle) = driver();
        drv.connect().await.unwrap();

        let v = drv.read("Bogus").await.unwrap();
        assert!(v.is_error());

        assert!(drv.write("Bogus", &Value::Bool(true)).await.is_err());
    }

    #[tokio::test]
    async fn test_struct_member_mutation() {
        let mut members = BTreeMap::new();
        members.insert("PRE".to_string(), Value::Integer(5000));
        members.insert("ACC".to_string(), Value::Integer(0));

        let (mut drv, handle) = SimDriver::new(
            "sim://udt",
            vec![SimTagDef::new(
                "Tmr",
                family::TYPE_STRUCT_BIT | 0x01,
                Value::Struct(members),
            )],
        );
        drv.connect().await.unwrap();

        handle.set_member("Tmr", "ACC", 123_i64);
        let v = drv.read("Tmr").await.unwrap();
        assert_eq!(v.value.members().unwrap()["ACC"], Value::Integer(123));
    }

    #[tokio::test]
    async fn test_batch_read_continues_past_decode_errors() {
        let (mut drv, handle) = driver();
        drv.connect().await.unwrap();
        handle.set_read_error("Speed", "stale");

        let tags = vec!["Speed".to_string(), "Counter".to_string()];
        let out = drv.read_batch(&tags).await.unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[0].1.is_error());
        assert!(!out[1].1.is_error());
    }
}
