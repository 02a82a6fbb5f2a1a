//! Poll worker
//!
//! Binds one source to one sink and loops
//! `Polling → Delivering → Sleeping → Polling …` until cancelled. Items of a
//! batch are delivered in order with a growing pause between deliveries so
//! a large backlog does not flood the sink.
//!
//! The worker is shared (`Arc`) between its running task and the
//! supervisor; a restarted task picks up the same source, sink and
//! high-water mark.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dispatch::cancellable_sleep;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{EventSink, EventSource};

/// Loop timing for one worker.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    /// Pause added per item already delivered in the batch
    pub flood_step: Duration,
    /// Longest pause between two deliveries
    pub flood_cap: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(300),
            flood_step: Duration::from_millis(50),
            flood_cap: Duration::from_millis(1000),
        }
    }
}

/// Where a worker is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Phase {
    Idle = 0,
    Polling = 1,
    Delivering = 2,
    Sleeping = 3,
    Cancelled = 4,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Phase::Polling,
            2 => Phase::Delivering,
            3 => Phase::Sleeping,
            4 => Phase::Cancelled,
            _ => Phase::Idle,
        }
    }
}

/// Snapshot for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub name: String,
    pub sink: String,
    pub phase: Phase,
    pub last_alive: Option<DateTime<Utc>>,
    pub restarts: u32,
}

/// Pause after the `sent`-th delivery of a batch.
pub fn flood_delay(sent: u32, step: Duration, cap: Duration) -> Duration {
    step.saturating_mul(sent).min(cap)
}

/// One (source, sink) pair and its loop state.
pub struct PollWorker {
    name: String,
    source: Mutex<Box<dyn EventSource>>,
    sink: Arc<dyn EventSink>,
    settings: WorkerSettings,
    cancel: CancellationToken,
    phase: AtomicU8,
    /// Unix milliseconds, 0 until the first loop iteration
    last_alive: AtomicI64,
    restarts: AtomicU32,
}

impl PollWorker {
    pub fn new(
        source: Box<dyn EventSource>,
        sink: Arc<dyn EventSink>,
        settings: WorkerSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name: source.id().to_string(),
            source: Mutex::new(source),
            sink,
            settings,
            cancel,
            phase: AtomicU8::new(Phase::Idle as u8),
            last_alive: AtomicI64::new(0),
            restarts: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn last_alive(&self) -> Option<DateTime<Utc>> {
        match self.last_alive.load(Ordering::SeqCst) {
            0 => None,
            millis => DateTime::from_timestamp_millis(millis),
        }
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub(crate) fn record_restart(&self) -> u32 {
        self.phase.store(Phase::Idle as u8, Ordering::SeqCst);
        self.restarts.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            name: self.name.clone(),
            sink: self.sink.id().to_string(),
            phase: self.phase(),
            last_alive: self.last_alive(),
            restarts: self.restarts(),
        }
    }

    fn enter(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
        self.last_alive
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    /// Run until cancelled.
    pub async fn run(self: Arc<Self>) {
        info!(worker = %self.name, sink = self.sink.id(), "worker started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.enter(Phase::Polling);
            let listed = {
                let mut source = self.source.lock().await;
                source.list().await
            };
            match listed {
                Ok(items) if items.is_empty() => {
                    debug!(worker = %self.name, "nothing new");
                }
                Ok(items) => {
                    if !self.deliver(items).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!(worker = %self.name, error = %e, "listing failed");
                }
            }

            self.enter(Phase::Sleeping);
            if !cancellable_sleep(&self.cancel, self.settings.poll_interval).await {
                break;
            }
        }

        self.enter(Phase::Cancelled);
        info!(worker = %self.name, "worker stopped");
    }

    /// Deliver a batch in order. Returns `false` if cancelled mid-batch.
    async fn deliver(&self, items: Vec<Value>) -> bool {
        self.enter(Phase::Delivering);
        let total = items.len();
        let mut sent: u32 = 0;

        for item in &items {
            if self.cancel.is_cancelled() {
                info!(worker = %self.name, sent, total, "cancelled mid-batch, dropping the rest");
                return false;
            }

            self.enter(Phase::Delivering);
            if self.sink.send(item).await {
                sent += 1;
                metrics::counter!("relay_events_delivered_total", "source" => self.name.clone())
                    .increment(1);
                let pause = flood_delay(sent, self.settings.flood_step, self.settings.flood_cap);
                if !cancellable_sleep(&self.cancel, pause).await {
                    return false;
                }
            } else {
                metrics::counter!("relay_events_failed_total", "source" => self.name.clone())
                    .increment(1);
                warn!(worker = %self.name, sink = self.sink.id(), "delivery failed");
            }
        }

        info!(worker = %self.name, sent, total, "batch delivered");
        true
    }
}
