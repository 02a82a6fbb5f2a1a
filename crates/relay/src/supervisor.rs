//! Worker supervision
//!
//! Runs one tokio task per `PollWorker`. A watchdog tick checks every task;
//! one that finished while the relay is not shutting down (a panic, most
//! likely) is logged and replaced with a new task bound to the same worker.
//! Shutdown cancels the shared token and waits until every task is gone.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::worker::PollWorker;

/// How often shutdown re-checks for remaining tasks.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

pub struct Supervisor {
    workers: Vec<Arc<PollWorker>>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    watchdog_interval: Duration,
}

impl Supervisor {
    pub fn new(
        workers: Vec<Arc<PollWorker>>,
        cancel: CancellationToken,
        watchdog_interval: Duration,
    ) -> Self {
        Self {
            workers,
            tasks: Vec::new(),
            cancel,
            watchdog_interval,
        }
    }

    pub fn workers(&self) -> &[Arc<PollWorker>] {
        &self.workers
    }

    fn spawn(worker: &Arc<PollWorker>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(worker).run())
    }

    /// Start every worker, then watch them until the cancel token fires and
    /// all of them have stopped.
    pub async fn run(mut self) {
        self.tasks = self.workers.iter().map(Self::spawn).collect();
        info!(
            workers = self.workers.len(),
            watchdog_secs = self.watchdog_interval.as_secs_f64(),
            "supervisor started"
        );

        let cancel = self.cancel.clone();
        let mut ticker = tokio::time::interval(self.watchdog_interval);
        // Skip the immediate first tick, the tasks were just spawned
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check().await;
                }
            }
        }

        self.shutdown().await;
    }

    /// Restart every task that ended while not cancelled. Returns how many
    /// were restarted.
    async fn check(&mut self) -> usize {
        let mut restarted = 0;
        for (worker, task) in self.workers.iter().zip(self.tasks.iter_mut()) {
            if !task.is_finished() || worker.is_cancelled() {
                continue;
            }

            let restarts = worker.record_restart();
            let ended = std::mem::replace(task, Self::spawn(worker));
            metrics::counter!("relay_worker_restarts_total", "source" => worker.name().to_string())
                .increment(1);
            match ended.await {
                Err(e) if e.is_panic() => {
                    error!(worker = worker.name(), restarts, error = %e, "worker panicked, restarted");
                }
                _ => {
                    warn!(worker = worker.name(), restarts, "worker exited unexpectedly, restarted");
                }
            }
            restarted += 1;
        }
        restarted
    }

    async fn shutdown(&mut self) {
        self.cancel.cancel();
        info!(workers = self.tasks.len(), "stopping workers");

        while self.tasks.iter().any(|task| !task.is_finished()) {
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await
                && e.is_panic()
            {
                warn!(error = %e, "worker panicked during shutdown");
            }
        }
        info!("all workers stopped");
    }
}
