//! Independent fan-out delivery.
//!
//! Every enabled sink gets its own bounded queue and delivery task, so one
//! sink's failure or backpressure never blocks another ("independent
//! fan-out", not a pipeline). Delivery is best-effort with bounded
//! exponential retry; persistent failure marks the sink disconnected and is
//! surfaced through [`SinkStatus`], never raised to the publisher's caller.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::error::{GatewayError, Result};

use super::traits::{HealthUpdate, PublishSink, SinkKind, SnapshotSource, TagUpdate};

/// Delivery attempts per payload before it is dropped.
const MAX_ATTEMPTS: u32 = 4;

/// Base retry delay; doubles per attempt.
const RETRY_BASE: Duration = Duration::from_millis(200);

/// Per-sink queue depth.
const SINK_QUEUE: usize = 256;

/// Observable state of one sink.
#[derive(Debug, Clone, Serialize)]
pub struct SinkStatus {
    /// Sink instance name.
    pub name: String,

    /// Sink kind.
    pub kind: SinkKind,

    /// Whether the sink participates in fan-out.
    pub enabled: bool,

    /// Whether the last delivery succeeded.
    pub connected: bool,

    /// Last delivery error, if any.
    pub last_error: Option<String>,

    /// Payloads delivered.
    pub delivered: u64,

    /// Payloads dropped after exhausted retries or backpressure.
    pub dropped: u64,
}

/// Work item for a sink's delivery task.
enum SinkJob {
    Tag(TagUpdate),
    Health(HealthUpdate),
    /// Replay the whole current-value table to this sink (initial sync).
    Replay,
}

/// Shared counters between the publisher surface and the delivery task.
struct SinkShared {
    connected: AtomicBool,
    last_error: Mutex<Option<String>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl SinkShared {
    fn record_error(&self, message: String) {
        *self.last_error.lock().expect("lock poisoned") = Some(message);
    }
}

struct SinkRuntime {
    sink: Arc<dyn PublishSink>,
    enabled: AtomicBool,
    shared: Arc<SinkShared>,
    tx: mpsc::Sender<SinkJob>,
    task: JoinHandle<()>,
}

type SharedSnapshot = Arc<RwLock<Option<Arc<dyn SnapshotSource>>>>;

/// Fan-out publisher: routes tag and health updates to every eligible sink.
pub struct FanoutPublisher {
    sinks: DashMap<String, Arc<SinkRuntime>>,
    snapshot: SharedSnapshot,
}

impl FanoutPublisher {
    /// Create a publisher with no sinks.
    pub fn new() -> Self {
        Self {
            sinks: DashMap::new(),
            snapshot: Arc::new(RwLock::new(None)),
        }
    }

    /// Install the snapshot provider used for sink initial sync.
    pub fn set_snapshot_source(&self, source: Arc<dyn SnapshotSource>) {
        *self.snapshot.write().expect("lock poisoned") = Some(source);
    }

    /// Register a sink and spawn its delivery task. The sink is not started.
    pub fn add_sink(&self, sink: Arc<dyn PublishSink>) -> Result<()> {
        let name = sink.name().to_string();
        if self.sinks.contains_key(&name) {
            return Err(GatewayError::Config(format!("duplicate sink: {}", name)));
        }

        let shared = Arc::new(SinkShared {
            connected: AtomicBool::new(false),
            last_error: Mutex::new(None),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });
        let (tx, rx) = mpsc::channel(SINK_QUEUE);
        let task = tokio::spawn(run_delivery(
            Arc::clone(&sink),
            Arc::clone(&shared),
            Arc::clone(&self.snapshot),
            rx,
        ));

        self.sinks.insert(
            name,
            Arc::new(SinkRuntime {
                sink,
                enabled: AtomicBool::new(true),
                shared,
                tx,
                task,
            }),
        );
        Ok(())
    }

    /// Start a sink's downstream connection and trigger its initial sync.
    pub async fn start_sink(&self, name: &str) -> Result<()> {
        let runtime = self
            .sinks
            .get(name)
            .map(|r| Arc::clone(&r))
            .ok_or_else(|| GatewayError::Config(format!("unknown sink: {}", name)))?;

        match runtime.sink.start().await {
            Ok(()) => {
                runtime.shared.connected.store(true, Ordering::Release);
                info!(sink = name, "sink connected");
                // Connect transition: replay the entire table to this sink
                // alone, bypassing change detection.
                let _ = runtime.tx.try_send(SinkJob::Replay);
                Ok(())
            }
            Err(e) => {
                runtime.shared.connected.store(false, Ordering::Release);
                runtime.shared.record_error(e.to_string());
                warn!(sink = name, error = %e, "sink connect failed");
                Ok(())
            }
        }
    }

    /// Remove a sink: no further delivery attempts are made to it.
    ///
    /// In-flight deliveries to other sinks are unaffected.
    pub async fn remove_sink(&self, name: &str) {
        if let Some((_, runtime)) = self.sinks.remove(name) {
            runtime.task.abort();
            runtime.sink.stop().await;
        }
    }

    /// Enable or disable a sink without removing it.
    pub async fn set_sink_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let runtime = self
            .sinks
            .get(name)
            .map(|r| Arc::clone(&r))
            .ok_or_else(|| GatewayError::Config(format!("unknown sink: {}", name)))?;

        let was = runtime.enabled.swap(enabled, Ordering::AcqRel);
        if enabled && !was {
            // Enable transition behaves like a fresh connect.
            self.start_sink(name).await?;
        }
        Ok(())
    }

    /// Route one tag update to every eligible sink.
    ///
    /// Eligibility: sink enabled, and the tag's per-kind suppression flag
    /// not set. Backpressure on one sink drops the payload for that sink
    /// only.
    pub fn publish(&self, update: &TagUpdate) {
        for entry in self.sinks.iter() {
            let runtime = entry.value();
            if !runtime.enabled.load(Ordering::Acquire) {
                continue;
            }
            if update.suppressed_for(runtime.sink.kind()) {
                continue;
            }
            if runtime
                .tx
                .try_send(SinkJob::Tag(update.clone()))
                .is_err()
            {
                runtime.shared.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(sink = entry.key().as_str(), "sink queue full, update dropped");
            }
        }
    }

    /// Route one health message to every enabled sink.
    pub fn publish_health(&self, health: &HealthUpdate) {
        for entry in self.sinks.iter() {
            let runtime = entry.value();
            if !runtime.enabled.load(Ordering::Acquire) {
                continue;
            }
            if runtime
                .tx
                .try_send(SinkJob::Health(health.clone()))
                .is_err()
            {
                runtime.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Replay the current-value table to every enabled sink, optionally
    /// restricted to one sink kind.
    pub fn force_publish_all(&self, kind: Option<SinkKind>) {
        for entry in self.sinks.iter() {
            let runtime = entry.value();
            if !runtime.enabled.load(Ordering::Acquire) {
                continue;
            }
            if let Some(kind) = kind {
                if runtime.sink.kind() != kind {
                    continue;
                }
            }
            let _ = runtime.tx.try_send(SinkJob::Replay);
        }
    }

    /// Status of every registered sink.
    pub fn sink_status(&self) -> Vec<SinkStatus> {
        let mut out: Vec<SinkStatus> = self
            .sinks
            .iter()
            .map(|entry| {
                let r = entry.value();
                SinkStatus {
                    name: r.sink.name().to_string(),
                    kind: r.sink.kind(),
                    enabled: r.enabled.load(Ordering::Acquire),
                    connected: r.shared.connected.load(Ordering::Acquire),
                    last_error: r.shared.last_error.lock().expect("lock poisoned").clone(),
                    delivered: r.shared.delivered.load(Ordering::Relaxed),
                    dropped: r.shared.dropped.load(Ordering::Relaxed),
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Stop every sink and its delivery task.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.sinks.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.remove_sink(&name).await;
        }
    }
}

impl Default for FanoutPublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-sink delivery loop.
async fn run_delivery(
    sink: Arc<dyn PublishSink>,
    shared: Arc<SinkShared>,
    snapshot: SharedSnapshot,
    mut rx: mpsc::Receiver<SinkJob>,
) {
    while let Some(job) = rx.recv().await {
        if let SinkJob::Replay = job {
            replay(&*sink, &shared, &snapshot).await;
            continue;
        }
        if deliver(&*sink, &shared, &job).await {
            maybe_replay_on_reconnect(&*sink, &shared, &snapshot).await;
        }
    }
}

/// Attempt one payload with bounded exponential retry.
///
/// Returns true when the delivery eventually succeeded.
async fn deliver(sink: &dyn PublishSink, shared: &SinkShared, job: &SinkJob) -> bool {
    for attempt in 0..MAX_ATTEMPTS {
        let result = match job {
            SinkJob::Tag(update) => sink.publish(update).await,
            SinkJob::Health(health) => sink.publish_health(health).await,
            SinkJob::Replay => return false,
        };
        match result {
            Ok(()) => {
                shared.delivered.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            Err(e) => {
                shared.record_error(e.to_string());
                if attempt + 1 < MAX_ATTEMPTS {
                    tokio::time::sleep(RETRY_BASE * 2u32.pow(attempt)).await;
                }
            }
        }
    }

    shared.dropped.fetch_add(1, Ordering::Relaxed);
    if shared.connected.swap(false, Ordering::AcqRel) {
        warn!(sink = sink.name(), "sink marked disconnected after exhausted retries");
    }
    false
}

/// A successful delivery after a disconnected period triggers an initial
/// sync, exactly like a fresh connect.
async fn maybe_replay_on_reconnect(
    sink: &dyn PublishSink,
    shared: &SinkShared,
    snapshot: &SharedSnapshot,
) {
    if !shared.connected.swap(true, Ordering::AcqRel) {
        info!(sink = sink.name(), "sink reconnected, replaying current values");
        replay(sink, shared, snapshot).await;
    }
}

/// Push the whole current-value table to one sink, single attempt per tag.
async fn replay(sink: &dyn PublishSink, shared: &SinkShared, snapshot: &SharedSnapshot) {
    let source = snapshot.read().expect("lock poisoned").clone();
    let Some(source) = source else {
        return;
    };

    for update in source.snapshot_updates() {
        if update.suppressed_for(sink.kind()) {
            continue;
        }
        let update = update.forced();
        match sink.publish(&update).await {
            Ok(()) => {
                shared.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                shared.record_error(e.to_string());
                shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::TagValue;
    use crate::publish::memory::MemorySink;

    fn update(tag: &str) -> TagUpdate {
        TagUpdate {
            device: "plc1".to_string(),
            tag: tag.to_string(),
            alias: None,
            address: "sim://plc1".to_string(),
            type_name: "DINT".to_string(),
            value: TagValue::ok(1_i64),
            writable: false,
            force: false,
            suppress_broker: false,
            suppress_kv: false,
        }
    }

    struct FixedSnapshot(Vec<TagUpdate>);

    impl SnapshotSource for FixedSnapshot {
        fn snapshot_updates(&self) -> Vec<TagUpdate> {
            self.0.clone()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_independence() {
        let publisher = FanoutPublisher::new();
        let healthy = Arc::new(MemorySink::new("healthy", SinkKind::Broker));
        let broken = Arc::new(MemorySink::new("broken", SinkKind::KeyValue));
        broken.set_failing(true);

        publisher.add_sink(healthy.clone()).unwrap();
        publisher.add_sink(broken.clone()).unwrap();
        publisher.start_sink("healthy").await.unwrap();
        publisher.start_sink("broken").await.unwrap();

        publisher.publish(&update("Speed"));
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(healthy.update_count(), 1);
        assert_eq!(broken.update_count(), 0);

        let status = publisher.sink_status();
        let healthy_status = status.iter().find(|s| s.name == "healthy").unwrap();
        let broken_status = status.iter().find(|s| s.name == "broken").unwrap();

        assert!(healthy_status.connected);
        assert_eq!(healthy_status.delivered, 1);
        assert!(!broken_status.connected);
        assert!(broken_status.last_error.is_some());
        assert!(broken_status.dropped >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suppression_per_kind() {
        let publisher = FanoutPublisher::new();
        let broker = Arc::new(MemorySink::new("broker", SinkKind::Broker));
        let kv = Arc::new(MemorySink::new("kv", SinkKind::KeyValue));
        publisher.add_sink(broker.clone()).unwrap();
        publisher.add_sink(kv.clone()).unwrap();
        publisher.start_sink("broker").await.unwrap();
        publisher.start_sink("kv").await.unwrap();

        let mut u = update("Speed");
        u.suppress_broker = true;
        publisher.publish(&u);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(broker.update_count(), 0);
        assert_eq!(kv.update_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_transition_replays_table() {
        let publisher = FanoutPublisher::new();
        publisher.set_snapshot_source(Arc::new(FixedSnapshot(vec![
            update("A"),
            update("B"),
        ])));

        let sink = Arc::new(MemorySink::new("late", SinkKind::Broker));
        publisher.add_sink(sink.clone()).unwrap();
        publisher.start_sink("late").await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let got = sink.updates();
        assert_eq!(got.len(), 2);
        assert!(got.iter().all(|u| u.force));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_triggers_replay() {
        let publisher = FanoutPublisher::new();
        publisher.set_snapshot_source(Arc::new(FixedSnapshot(vec![update("A")])));

        let sink = Arc::new(MemorySink::new("flaky", SinkKind::Broker));
        publisher.add_sink(sink.clone()).unwrap();
        publisher.start_sink("flaky").await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        sink.clear();

        // Outage: delivery exhausts retries, sink goes disconnected.
        sink.set_failing(true);
        publisher.publish(&update("Speed"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!publisher.sink_status()[0].connected);

        // Recovery: next delivery succeeds and replays the table.
        sink.set_failing(false);
        publisher.publish(&update("Speed"));
        tokio::time::sleep(Duration::from_secs(10)).await;

        let status = publisher.sink_status();
        assert!(status[0].connected);
        let tags: Vec<String> = sink.updates().iter().map(|u| u.tag.clone()).collect();
        assert!(tags.contains(&"Speed".to_string()));
        assert!(tags.contains(&"A".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_sink_rejected() {
        let publisher = FanoutPublisher::new();
        publisher
            .add_sink(Arc::new(MemorySink::new("s1", SinkKind::Broker)))
            .unwrap();
        let err = publisher
            .add_sink(Arc::new(MemorySink::new("s1", SinkKind::KeyValue)))
            .unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_sink_gets_nothing() {
        let publisher = FanoutPublisher::new();
        let sink = Arc::new(MemorySink::new("gone", SinkKind::Broker));
        publisher.add_sink(sink.clone()).unwrap();
        publisher.start_sink("gone").await.unwrap();
        publisher.remove_sink("gone").await;

        publisher.publish(&update("Speed"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sink.update_count(), 0);
        assert!(!sink.is_running());
    }
}
