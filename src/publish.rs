//! Fan-out publishing to downstream sinks.

pub mod console;
pub mod fanout;
pub mod memory;
pub mod traits;

pub use console::ConsoleSink;
pub use fanout::{FanoutPublisher, SinkStatus};
pub use memory::MemorySink;
pub use traits::{HealthUpdate, PublishSink, SinkKind, SnapshotSource, TagUpdate};
