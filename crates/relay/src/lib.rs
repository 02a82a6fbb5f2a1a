//! Source-to-sink relay engine
//!
//! Defines the `EventSource` and `EventSink` capabilities, the built-in
//! Microsoft 365 sources and the plain webhook sink, and the runtime that
//! drives them: one `PollWorker` per (source, sink) pair under a
//! `Supervisor` that restarts dead workers and coordinates shutdown.
//!
//! Event items are opaque JSON values; nothing between the source and the
//! sink inspects them.

pub mod error;
pub mod registry;
pub mod sink;
pub mod sources;
pub mod supervisor;
pub mod worker;

pub use error::{Error, Result};
pub use registry::{SinkRegistry, SourceRegistry};
pub use sink::{AuthScheme, PlainWebhook, SinkConfig};
pub use sources::SourceContext;
pub use supervisor::Supervisor;
pub use worker::{Phase, PollWorker, WorkerSettings, WorkerStatus};

use serde_json::Value;
use std::future::Future;
use std::pin::Pin;

/// A list operation on a remote API.
///
/// Each call returns the items newer than the source's own high-water mark
/// and advances the mark. Sources are owned by exactly one worker, hence
/// `&mut self`.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Box<dyn EventSource>`).
pub trait EventSource: Send {
    /// `Source.Operation`, for logs and metrics labels
    fn id(&self) -> &str;

    fn list<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = Result<Vec<Value>>> + Send + 'a>>;
}

/// A send operation delivering one item to a webhook.
pub trait EventSink: Send + Sync {
    /// Sink kind, e.g. "Plain"
    fn id(&self) -> &str;

    /// Deliver `item`. Returns whether the sink accepted it.
    fn send<'a>(&'a self, item: &'a Value) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;
}
