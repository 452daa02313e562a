//! The connection & poll manager.
//!
//! Owns one driver per configured device, runs one poll task per connected
//! device, maintains the current-value table, and feeds the change-event
//! listeners. One device's I/O never blocks another device's poll loop;
//! all cross-component communication goes through the value table and the
//! listener registry.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::core::error::{GatewayError, Result};
use crate::core::event::{ChangeEvent, ChangeListeners, HealthStatus, ListenerId};
use crate::core::tag::{TagPack, TagSelection};
use crate::core::value::{TagValue, Value};
use crate::detect;
use crate::driver::family;
use crate::driver::traits::TagDriver;
use crate::publish::fanout::FanoutPublisher;
use crate::publish::traits::{SinkKind, SnapshotSource, TagUpdate};
use crate::rules::engine::RuleHost;
use crate::store::CurrentValueTable;

use super::config::{DeviceConfig, GatewaySettings};
use super::device::{
    reconnect_backoff, DeviceRuntime, DeviceSnapshot, DeviceStatus, PollStats, SelectionMap,
};

/// One registered device.
struct DeviceHandle {
    config: DeviceConfig,
    driver: Mutex<Box<dyn TagDriver>>,
    runtime: std::sync::RwLock<DeviceRuntime>,
    selections: std::sync::RwLock<SelectionMap>,
    shutdown: std::sync::Mutex<Option<watch::Sender<bool>>>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DeviceHandle {
    fn status(&self) -> DeviceStatus {
        self.runtime.read().expect("lock poisoned").status
    }

    fn set_error(&self, message: String) {
        let mut runtime = self.runtime.write().expect("lock poisoned");
        runtime.status = DeviceStatus::Error;
        runtime.last_error = Some(message);
    }

    fn health(&self) -> HealthStatus {
        let runtime = self.runtime.read().expect("lock poisoned");
        HealthStatus {
            device: self.config.name.clone(),
            driver: self.config.family.driver_name().to_string(),
            online: runtime.status.is_online(),
            status: runtime.status.to_string(),
            error: runtime.last_error.clone(),
        }
    }

    /// Type name of a discovered tag, `UNKNOWN` before discovery.
    fn type_name_of(&self, tag: &str) -> String {
        let runtime = self.runtime.read().expect("lock poisoned");
        runtime
            .descriptor(tag)
            .map(|d| family::type_name(self.config.family, d.type_code).to_string())
            .unwrap_or_else(|| "UNKNOWN".to_string())
    }
}

/// Gateway-wide poll statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PollReport {
    /// Aggregate across all devices.
    pub total: PollStats,

    /// Per-device breakdown.
    pub devices: std::collections::BTreeMap<String, PollStats>,
}

struct ManagerInner {
    settings: GatewaySettings,
    devices: DashMap<String, Arc<DeviceHandle>>,
    values: Arc<CurrentValueTable>,
    listeners: Arc<ChangeListeners>,
    publisher: Arc<FanoutPublisher>,
    packs: std::sync::RwLock<Vec<TagPack>>,
    aux_tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ManagerInner {
    fn handle(&self, device: &str) -> Result<Arc<DeviceHandle>> {
        self.devices
            .get(device)
            .map(|h| Arc::clone(&h))
            .ok_or_else(|| GatewayError::Config(format!("unknown device: {}", device)))
    }

    /// Build a publishable update for a tag from its stored value.
    fn build_update(
        &self,
        handle: &DeviceHandle,
        tag: &str,
        selection: &TagSelection,
        value: TagValue,
    ) -> TagUpdate {
        TagUpdate {
            device: handle.config.name.clone(),
            tag: tag.to_string(),
            alias: selection.alias.clone(),
            address: handle.config.address.clone(),
            type_name: handle.type_name_of(tag),
            value,
            writable: selection.writable,
            force: false,
            suppress_broker: selection.suppress_broker,
            suppress_kv: selection.suppress_kv,
        }
    }

    /// Store a sample, run change detection, and emit an event when the
    /// value constitutes a publishable change. Returns true on change.
    fn process_sample(&self, handle: &DeviceHandle, tag: &str, new: TagValue) -> bool {
        let selection = handle
            .selections
            .read()
            .expect("lock poisoned")
            .get(tag)
            .cloned();
        let prev = self.values.replace(&handle.config.name, tag, new.clone());

        // Ad-hoc reads of unconfigured tags are stored but never published.
        let Some(selection) = selection else {
            return false;
        };
        if !selection.enabled {
            return false;
        }

        if detect::is_change(prev.as_ref(), &new, &selection.ignored_members) {
            let event = ChangeEvent {
                device: handle.config.name.clone(),
                tag: tag.to_string(),
                selection,
                old: prev,
                new,
            };
            self.listeners.emit(&event);
            true
        } else {
            false
        }
    }
}

/// Snapshot provider handed to the fan-out publisher.
///
/// Holds a weak reference: the publisher lives inside the manager, and a
/// strong reference here would leak both.
struct ManagerSnapshot(Weak<ManagerInner>);

impl SnapshotSource for ManagerSnapshot {
    fn snapshot_updates(&self) -> Vec<TagUpdate> {
        let Some(inner) = self.0.upgrade() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for entry in inner.devices.iter() {
            let handle = entry.value();
            let selections = handle.selections.read().expect("lock poisoned").clone();
            for (tag, value) in inner.values.snapshot_device(&handle.config.name) {
                let Some(selection) = selections.get(&tag) else {
                    continue;
                };
                // Disabled tags are excluded from full-table sweeps.
                if !selection.enabled {
                    continue;
                }
                out.push(inner.build_update(handle, &tag, selection, value));
            }
        }
        out
    }
}

/// The public manager surface. Cheap to clone.
#[derive(Clone)]
pub struct DeviceManager {
    inner: Arc<ManagerInner>,
}

impl DeviceManager {
    /// Create a manager with its own value table, listener registry, and
    /// fan-out publisher.
    pub fn new(settings: GatewaySettings) -> Self {
        let inner = Arc::new(ManagerInner {
            settings,
            devices: DashMap::new(),
            values: Arc::new(CurrentValueTable::new()),
            listeners: Arc::new(ChangeListeners::new()),
            publisher: Arc::new(FanoutPublisher::new()),
            packs: std::sync::RwLock::new(Vec::new()),
            aux_tasks: std::sync::Mutex::new(Vec::new()),
        });
        inner
            .publisher
            .set_snapshot_source(Arc::new(ManagerSnapshot(Arc::downgrade(&inner))));
        Self { inner }
    }

    /// Shared current-value table (read-only use by consumers).
    pub fn values(&self) -> Arc<CurrentValueTable> {
        Arc::clone(&self.inner.values)
    }

    /// The fan-out publisher.
    pub fn publisher(&self) -> Arc<FanoutPublisher> {
        Arc::clone(&self.inner.publisher)
    }

    /// Register a change-event listener.
    pub fn add_listener(&self) -> (ListenerId, mpsc::Receiver<ChangeEvent>) {
        self.inner.listeners.add()
    }

    /// Remove a change-event listener.
    pub fn remove_listener(&self, id: ListenerId) {
        self.inner.listeners.remove(id);
    }

    /// Start the publish pump and the health cadence task.
    pub fn start(&self) {
        let (_, rx) = self.inner.listeners.add();
        let pump = tokio::spawn(run_publish_pump(Arc::clone(&self.inner), rx));
        let health = tokio::spawn(run_health_cadence(Arc::clone(&self.inner)));
        let mut tasks = self.inner.aux_tasks.lock().expect("lock poisoned");
        tasks.push(pump);
        tasks.push(health);
    }

    // ------------------------------------------------------------------
    // Device lifecycle
    // ------------------------------------------------------------------

    /// Register a device with its driver. Does not connect.
    pub fn add_device(&self, config: DeviceConfig, driver: Box<dyn TagDriver>) -> Result<()> {
        config.validate()?;
        if self.inner.devices.contains_key(&config.name) {
            return Err(GatewayError::Config(format!(
                "duplicate device: {}",
                config.name
            )));
        }

        let mut selections = SelectionMap::new();
        for tag in &config.tags {
            selections.insert(tag.name.clone(), tag.selection.clone());
        }

        let name = config.name.clone();
        let handle = Arc::new(DeviceHandle {
            config,
            driver: Mutex::new(driver),
            runtime: std::sync::RwLock::new(DeviceRuntime::default()),
            selections: std::sync::RwLock::new(selections),
            shutdown: std::sync::Mutex::new(None),
            task: std::sync::Mutex::new(None),
        });
        self.inner.devices.insert(name, handle);
        Ok(())
    }

    /// Remove a device: cancels its poll task and drops its values.
    pub async fn remove_device(&self, device: &str) -> Result<()> {
        self.disconnect(device).await?;
        self.inner.devices.remove(device);
        self.inner.values.clear_device(device);
        Ok(())
    }

    /// Start (or restart) a device's connect/poll task.
    pub fn connect(&self, device: &str) -> Result<()> {
        let handle = self.inner.handle(device)?;

        let mut task = handle.task.lock().expect("lock poisoned");
        if task.as_ref().map_or(false, |t| !t.is_finished()) {
            return Ok(());
        }

        let (tx, rx) = watch::channel(false);
        *handle.shutdown.lock().expect("lock poisoned") = Some(tx);
        *task = Some(tokio::spawn(run_device(
            Arc::clone(&self.inner),
            Arc::clone(&handle),
            rx,
        )));
        Ok(())
    }

    /// Cancel a device's poll task and close its connection.
    pub async fn disconnect(&self, device: &str) -> Result<()> {
        let handle = self.inner.handle(device)?;

        if let Some(tx) = handle.shutdown.lock().expect("lock poisoned").take() {
            let _ = tx.send(true);
        }
        let task = handle.task.lock().expect("lock poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let _ = handle.driver.lock().await.disconnect().await;
        let mut runtime = handle.runtime.write().expect("lock poisoned");
        runtime.status = DeviceStatus::Disconnected;
        runtime.consecutive_failures = 0;
        Ok(())
    }

    /// Snapshot of every registered device.
    pub fn list_devices(&self) -> Vec<DeviceSnapshot> {
        let mut out: Vec<DeviceSnapshot> = self
            .inner
            .devices
            .iter()
            .map(|entry| {
                let handle = entry.value();
                let runtime = handle.runtime.read().expect("lock poisoned");
                DeviceSnapshot {
                    name: handle.config.name.clone(),
                    family: handle.config.family,
                    address: handle.config.address.clone(),
                    status: runtime.status,
                    auto_connect: handle.config.auto_connect,
                    last_error: runtime.last_error.clone(),
                    identity: runtime.identity.clone(),
                    tag_count: runtime.tag_index.len(),
                    stats: runtime.stats.clone(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Health snapshot of one device.
    pub fn health_status(&self, device: &str) -> Result<HealthStatus> {
        Ok(self.inner.handle(device)?.health())
    }

    /// Poll statistics, aggregate and per device.
    pub fn poll_stats(&self) -> PollReport {
        let mut report = PollReport::default();
        for entry in self.inner.devices.iter() {
            let stats = entry
                .value()
                .runtime
                .read()
                .expect("lock poisoned")
                .stats
                .clone();
            report.total.merge(&stats);
            report.devices.insert(entry.key().clone(), stats);
        }
        report
    }

    // ------------------------------------------------------------------
    // Tag access
    // ------------------------------------------------------------------

    /// Read one tag immediately. The result flows through the same
    /// store/detect path as polled values.
    pub async fn read_tag(&self, device: &str, tag: &str) -> Result<TagValue> {
        let handle = self.inner.handle(device)?;
        if !handle.status().is_online() {
            return Err(GatewayError::NotConnected);
        }

        let result = handle.driver.lock().await.read(tag).await;
        match result {
            Ok(value) => {
                self.inner.process_sample(&handle, tag, value.clone());
                Ok(value)
            }
            Err(e) => {
                if e.is_connectivity() {
                    handle.set_error(e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Read `count` elements of an array tag.
    pub async fn read_tag_with_count(
        &self,
        device: &str,
        tag: &str,
        count: u32,
    ) -> Result<TagValue> {
        let handle = self.inner.handle(device)?;
        if !handle.status().is_online() {
            return Err(GatewayError::NotConnected);
        }

        let result = handle.driver.lock().await.read_with_count(tag, count).await;
        match result {
            Ok(value) => {
                self.inner.process_sample(&handle, tag, value.clone());
                Ok(value)
            }
            Err(e) => {
                if e.is_connectivity() {
                    handle.set_error(e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Write a value to a tag.
    ///
    /// Fails immediately with a connectivity error when the device is not
    /// `Connected`; writes are never queued or retried.
    pub async fn write_tag(&self, device: &str, tag: &str, value: &Value) -> Result<()> {
        let handle = self.inner.handle(device)?;
        if !handle.status().is_online() {
            return Err(GatewayError::NotConnected);
        }

        let result = handle.driver.lock().await.write(tag, value).await;
        if let Err(e) = &result {
            if e.is_connectivity() {
                handle.set_error(e.to_string());
            }
        }
        result
    }

    /// Names of all enabled tags on a device.
    pub fn enabled_tags(&self, device: &str) -> Result<Vec<String>> {
        let handle = self.inner.handle(device)?;
        let selections = handle.selections.read().expect("lock poisoned");
        Ok(selections
            .iter()
            .filter(|(_, s)| s.enabled)
            .map(|(name, _)| name.clone())
            .collect())
    }

    /// Current selection of a tag, if configured.
    pub fn tag_selection(&self, device: &str, tag: &str) -> Result<Option<TagSelection>> {
        let handle = self.inner.handle(device)?;
        let selection = handle
            .selections
            .read()
            .expect("lock poisoned")
            .get(tag)
            .cloned();
        Ok(selection)
    }

    /// Enable or disable a tag for publishing.
    ///
    /// On the disabled->enabled transition the tag's volatile structured
    /// members are auto-ignored (once), and its current value is force
    /// published to every sink so late subscribers see state immediately.
    pub async fn set_tag_enabled(&self, device: &str, tag: &str, enabled: bool) -> Result<()> {
        let handle = self.inner.handle(device)?;

        let was_enabled = {
            let mut selections = handle.selections.write().expect("lock poisoned");
            let selection = selections
                .entry(tag.to_string())
                .or_insert_with(TagSelection::disabled);
            let was = selection.enabled;
            selection.enabled = enabled;
            was
        };

        if !enabled || was_enabled {
            return Ok(());
        }

        self.apply_auto_ignore(&handle, tag).await;

        // Force publish the last known value, bypassing change detection.
        let selection = handle
            .selections
            .read()
            .expect("lock poisoned")
            .get(tag)
            .cloned()
            .unwrap_or_default();
        if let Some(value) = self.inner.values.get(&handle.config.name, tag) {
            let update = self
                .inner
                .build_update(&handle, tag, &selection, value)
                .forced();
            self.inner.publisher.publish(&update);
        }
        Ok(())
    }

    /// One-shot volatile-member auto-ignore at enable time.
    async fn apply_auto_ignore(&self, handle: &Arc<DeviceHandle>, tag: &str) {
        let already_applied = {
            let selections = handle.selections.read().expect("lock poisoned");
            selections
                .get(tag)
                .map_or(true, |s| s.auto_ignore_applied)
        };
        if already_applied || !handle.status().is_online() {
            return;
        }

        let type_code = {
            let runtime = handle.runtime.read().expect("lock poisoned");
            runtime.descriptor(tag).map(|d| d.type_code)
        };
        let Some(type_code) = type_code else {
            return;
        };

        let family = handle.config.family;
        let mut volatile = std::collections::BTreeSet::new();
        if family::is_structured(family, type_code) {
            let template = handle
                .driver
                .lock()
                .await
                .get_template(type_code)
                .await
                .ok()
                .flatten();
            if let Some(template) = template {
                volatile = detect::volatile_members(family, &template);
            }
        }

        let mut selections = handle.selections.write().expect("lock poisoned");
        if let Some(selection) = selections.get_mut(tag) {
            if !volatile.is_empty() {
                debug!(
                    device = handle.config.name.as_str(),
                    tag,
                    members = ?volatile,
                    "auto-ignoring volatile members"
                );
            }
            selection.ignored_members.extend(volatile);
            selection.auto_ignore_applied = true;
        }
    }

    // ------------------------------------------------------------------
    // Publishing helpers
    // ------------------------------------------------------------------

    /// Replay every enabled tag's current value to the matching sinks.
    pub fn force_publish_all(&self, kind: Option<SinkKind>) {
        self.inner.publisher.force_publish_all(kind);
    }

    /// Register a tag pack.
    pub fn add_pack(&self, pack: TagPack) -> Result<()> {
        let mut packs = self.inner.packs.write().expect("lock poisoned");
        if packs.iter().any(|p| p.name == pack.name) {
            return Err(GatewayError::Config(format!("duplicate pack: {}", pack.name)));
        }
        packs.push(pack);
        Ok(())
    }

    /// Enable or disable a pack. The disabled->enabled transition publishes
    /// every member's current value immediately, scoped by the pack's
    /// suppression flags.
    pub fn set_pack_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let (was_enabled, members, suppress_broker, suppress_kv) = {
            let mut packs = self.inner.packs.write().expect("lock poisoned");
            let pack = packs
                .iter_mut()
                .find(|p| p.name == name)
                .ok_or_else(|| GatewayError::Config(format!("unknown pack: {}", name)))?;
            let was = pack.enabled;
            pack.enabled = enabled;
            (
                was,
                pack.members.clone(),
                pack.suppress_broker,
                pack.suppress_kv,
            )
        };

        if !enabled || was_enabled {
            return Ok(());
        }

        for (device, tag) in members {
            let Ok(handle) = self.inner.handle(&device) else {
                continue;
            };
            let selection = handle
                .selections
                .read()
                .expect("lock poisoned")
                .get(&tag)
                .cloned();
            let Some(selection) = selection else {
                continue;
            };
            if !selection.enabled {
                continue;
            }
            if let Some(value) = self.inner.values.get(&device, &tag) {
                let mut update = self
                    .inner
                    .build_update(&handle, &tag, &selection, value)
                    .forced();
                update.suppress_broker |= suppress_broker;
                update.suppress_kv |= suppress_kv;
                self.inner.publisher.publish(&update);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stop everything: poll tasks, pump, health cadence, sinks.
    ///
    /// Bounded by the configured shutdown timeout; device disconnects still
    /// outstanding when it elapses continue in the background.
    pub async fn shutdown(&self) {
        for task in self
            .inner
            .aux_tasks
            .lock()
            .expect("lock poisoned")
            .drain(..)
        {
            task.abort();
        }

        let mut set = JoinSet::new();
        let names: Vec<String> = self.inner.devices.iter().map(|e| e.key().clone()).collect();
        for name in names {
            let manager = self.clone();
            set.spawn(async move {
                let _ = manager.disconnect(&name).await;
            });
        }

        let deadline = Duration::from_millis(self.inner.settings.shutdown_timeout_ms);
        if tokio::time::timeout(deadline, async {
            while set.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!("shutdown timeout reached, detaching outstanding disconnects");
            set.detach_all();
        }

        self.inner.publisher.shutdown().await;
    }
}

#[async_trait]
impl RuleHost for DeviceManager {
    async fn write_tag(&self, device: &str, tag: &str, value: &Value) -> Result<()> {
        DeviceManager::write_tag(self, device, tag, value).await
    }

    async fn force_publish(&self, device: &str, tag: &str) -> Result<()> {
        let handle = self.inner.handle(device)?;
        let value = self
            .inner
            .values
            .get(device, tag)
            .ok_or_else(|| GatewayError::Config(format!("no current value for {}/{}", device, tag)))?;
        let selection = handle
            .selections
            .read()
            .expect("lock poisoned")
            .get(tag)
            .cloned()
            .unwrap_or_default();
        let update = self
            .inner
            .build_update(&handle, tag, &selection, value)
            .forced();
        self.inner.publisher.publish(&update);
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Background tasks
// ----------------------------------------------------------------------

/// Connect/poll loop for one device.
async fn run_device(
    inner: Arc<ManagerInner>,
    handle: Arc<DeviceHandle>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let device = handle.config.name.clone();
    let interval = handle
        .config
        .effective_poll_interval(inner.settings.default_poll_interval_ms);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        if !handle.status().is_online() {
            match establish(&handle).await {
                Ok(()) => {
                    info!(device = device.as_str(), "device connected");
                }
                Err(e) => {
                    let backoff = {
                        let mut runtime = handle.runtime.write().expect("lock poisoned");
                        runtime.status = DeviceStatus::Error;
                        runtime.last_error = Some(e.to_string());
                        let failures = runtime.consecutive_failures;
                        runtime.consecutive_failures += 1;
                        reconnect_backoff(failures)
                    };
                    warn!(device = device.as_str(), error = %e, "connect failed");
                    if !handle.config.auto_connect {
                        // Stays in Error until manually reconnected.
                        break;
                    }
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = tokio::time::sleep(backoff) => continue,
                    }
                }
            }
        }

        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = poll_cycle(&inner, &handle).await {
                    warn!(device = device.as_str(), error = %e, "poll cycle lost device");
                    if !handle.config.auto_connect {
                        break;
                    }
                }
            }
        }
    }
}

/// Handshake plus tag/program discovery.
async fn establish(handle: &Arc<DeviceHandle>) -> crate::core::error::Result<()> {
    {
        let mut runtime = handle.runtime.write().expect("lock poisoned");
        runtime.status = DeviceStatus::Connecting;
    }

    let mut driver = handle.driver.lock().await;
    let info = driver.connect().await?;

    // Re-discover the tag index on every connect.
    let mut tags = driver.list_tags().await.unwrap_or_default();
    for descriptor in &mut tags {
        descriptor.device = handle.config.name.clone();
    }
    let programs = driver.list_programs().await.unwrap_or_default();
    drop(driver);

    let mut runtime = handle.runtime.write().expect("lock poisoned");
    runtime.status = DeviceStatus::Connected;
    runtime.identity = Some(info);
    runtime.tag_index = tags;
    runtime.programs = programs;
    runtime.consecutive_failures = 0;
    runtime.last_error = None;
    Ok(())
}

/// One poll pass: bulk read of every enabled tag.
async fn poll_cycle(
    inner: &Arc<ManagerInner>,
    handle: &Arc<DeviceHandle>,
) -> crate::core::error::Result<()> {
    let tags: Vec<String> = {
        let selections = handle.selections.read().expect("lock poisoned");
        selections
            .iter()
            .filter(|(_, s)| s.enabled)
            .map(|(name, _)| name.clone())
            .collect()
    };

    if tags.is_empty() {
        let mut runtime = handle.runtime.write().expect("lock poisoned");
        runtime.stats.last_poll = Some(Utc::now());
        return Ok(());
    }

    let result = handle.driver.lock().await.read_batch(&tags).await;
    match result {
        Ok(samples) => {
            let mut changes = 0u64;
            let polled = samples.len() as u64;
            for (tag, value) in samples {
                if inner.process_sample(handle, &tag, value) {
                    changes += 1;
                }
            }
            let mut runtime = handle.runtime.write().expect("lock poisoned");
            runtime.stats.tags_polled += polled;
            runtime.stats.changes_found += changes;
            runtime.stats.last_poll = Some(Utc::now());
            runtime.stats.last_error = None;
            Ok(())
        }
        Err(e) => {
            // Device lost mid-poll: every enabled tag becomes an error
            // observation, which is itself a publishable change.
            let message = e.to_string();
            let mut changes = 0u64;
            for tag in &tags {
                if inner.process_sample(handle, tag, TagValue::failed(message.clone())) {
                    changes += 1;
                }
            }
            let mut runtime = handle.runtime.write().expect("lock poisoned");
            runtime.stats.changes_found += changes;
            runtime.stats.last_poll = Some(Utc::now());
            runtime.stats.last_error = Some(message.clone());
            runtime.status = DeviceStatus::Error;
            runtime.last_error = Some(message);
            runtime.consecutive_failures += 1;
            Err(e)
        }
    }
}

/// Change events -> fan-out publisher.
async fn run_publish_pump(inner: Arc<ManagerInner>, mut rx: mpsc::Receiver<ChangeEvent>) {
    while let Some(event) = rx.recv().await {
        let Ok(handle) = inner.handle(&event.device) else {
            continue;
        };
        let update = TagUpdate::from_change(
            &event,
            &handle.config.address,
            &handle.type_name_of(&event.tag),
        );
        inner.publisher.publish(&update);
    }
}

/// Health publishing on a fixed cadence, independent of poll cadence.
async fn run_health_cadence(inner: Arc<ManagerInner>) {
    let interval = Duration::from_millis(inner.settings.health_interval_ms);
    loop {
        tokio::time::sleep(interval).await;
        for entry in inner.devices.iter() {
            let handle = entry.value();
            if !handle.config.health_check {
                continue;
            }
            inner.publisher.publish_health(&handle.health());
        }
    }
}
