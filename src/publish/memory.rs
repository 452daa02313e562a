//! In-memory sink that records everything it is handed.
//!
//! Stands in for a broker or key-value client in tests and demos; supports
//! failure injection so sink-independence scenarios can be exercised
//! without a real downstream outage.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::error::{GatewayError, Result};

use super::traits::{HealthUpdate, PublishSink, SinkKind, TagUpdate};

/// Recording sink.
pub struct MemorySink {
    name: String,
    kind: SinkKind,
    running: AtomicBool,
    failing: AtomicBool,
    updates: Mutex<Vec<TagUpdate>>,
    health: Mutex<Vec<HealthUpdate>>,
}

impl MemorySink {
    /// Create a recording sink of the given kind.
    pub fn new(name: impl Into<String>, kind: SinkKind) -> Self {
        Self {
            name: name.into(),
            kind,
            running: AtomicBool::new(false),
            failing: AtomicBool::new(false),
            updates: Mutex::new(Vec::new()),
            health: Mutex::new(Vec::new()),
        }
    }

    /// Make every delivery fail (simulated unreachable downstream).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// All tag updates received so far.
    pub fn updates(&self) -> Vec<TagUpdate> {
        self.updates.lock().expect("lock poisoned").clone()
    }

    /// All health messages received so far.
    pub fn health_messages(&self) -> Vec<HealthUpdate> {
        self.health.lock().expect("lock poisoned").clone()
    }

    /// Number of tag updates received.
    pub fn update_count(&self) -> usize {
        self.updates.lock().expect("lock poisoned").len()
    }

    /// Drop all recorded messages.
    pub fn clear(&self) {
        self.updates.lock().expect("lock poisoned").clear();
        self.health.lock().expect("lock poisoned").clear();
    }
}

#[async_trait]
impl PublishSink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SinkKind {
        self.kind
    }

    fn address(&self) -> &str {
        "memory"
    }

    async fn start(&self) -> Result<()> {
        if self.failing.load(Ordering::Acquire) {
            return Err(GatewayError::Publish("sink unreachable".to_string()));
        }
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    async fn publish(&self, update: &TagUpdate) -> Result<()> {
        if self.failing.load(Ordering::Acquire) {
            return Err(GatewayError::Publish("sink unreachable".to_string()));
        }
        self.updates.lock().expect("lock poisoned").push(update.clone());
        Ok(())
    }

    async fn publish_health(&self, health: &HealthUpdate) -> Result<()> {
        if self.failing.load(Ordering::Acquire) {
            return Err(GatewayError::Publish("sink unreachable".to_string()));
        }
        self.health.lock().expect("lock poisoned").push(health.clone());
        Ok(())
    }
}
