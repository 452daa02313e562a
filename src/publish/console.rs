//! Console sink: JSON lines on stdout.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::json;

use crate::core::error::Result;

use super::traits::{HealthUpdate, PublishSink, SinkKind, TagUpdate};

/// Sink that prints every update as one JSON line.
pub struct ConsoleSink {
    name: String,
    running: AtomicBool,
}

impl ConsoleSink {
    /// Create a console sink.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            running: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PublishSink for ConsoleSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SinkKind {
        SinkKind::Console
    }

    fn address(&self) -> &str {
        "stdout"
    }

    async fn start(&self) -> Result<()> {
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
        let line = json!({
            "type": "tag",
            "device": update.device,
            "tag": update.publish_name(),
            "type_name": update.type_name,
            "value": update.value.value,
            "error": update.value.error,
            "timestamp": update.value.timestamp,
            "writable": update.writable,
            "force": update.force,
        });
        println!("{}", line);
        Ok(())
    }

    async fn publish_health(&self, health: &HealthUpdate) -> Result<()> {
        let line = json!({
            "type": "health",
            "device": health.device,
            "driver": health.driver,
            "online": health.online,
            "status": health.status,
            "error": health.error,
        });
        println!("{}", line);
        Ok(())
    }
}
