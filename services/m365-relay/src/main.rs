//! M365 event relay
//!
//! Single-binary service that:
//! 1. Finds the tenant/application credentials allowed to read each source
//! 2. Polls Microsoft 365 security APIs for new events
//! 3. Forwards every event as JSON to the paired webhook
//! 4. Restarts crashed workers and stops cleanly on SIGINT/SIGTERM

mod config;
mod error;
mod metrics;
mod status;

use anyhow::{Context, Result};
use relay::{PollWorker, SinkRegistry, SourceContext, SourceRegistry, Supervisor};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::status::StatusState;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting m365-relay");
    let started_at = Instant::now();

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        tenants = config.azure.tenant_ids.len(),
        apps = config.azure.app_ids.len(),
        certificates = config.azure.certificate_paths.len(),
        secrets = config.azure.app_secrets.len(),
        pairs = config.pairs.len(),
        show_secrets = config.show_secrets,
        "configuration loaded"
    );

    // One token for the whole process; the signal task is its only canceller
    // until the supervisor takes over.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            cancel.cancel();
        });
    }

    let workers = match build_workers(&config, &cancel).await {
        Ok(workers) => workers,
        Err(e) => {
            if e.is_clock_skew() {
                error!(error = %e, "local clock disagrees with Azure AD, fix time sync and restart");
            }
            return Err(e.into());
        }
    };
    info!(workers = workers.len(), "all pairs built");

    let status_task = match &config.status {
        Some(status_config) => {
            let listener = TcpListener::bind(status_config.listen_addr)
                .await
                .map_err(|source| error::Error::StatusBind {
                    addr: status_config.listen_addr,
                    source,
                })?;
            let router = status::build_router(
                StatusState {
                    workers: workers.clone(),
                    prometheus: prometheus_handle,
                    cancel: cancel.clone(),
                    started_at,
                },
                status_config.max_connections,
            );
            Some(status::spawn(listener, router, cancel.clone()))
        }
        None => None,
    };

    Supervisor::new(workers, cancel.clone(), config.watchdog_interval())
        .run()
        .await;

    if let Some(task) = status_task
        && let Err(e) = task.await
    {
        error!(error = %e, "status listener task panicked");
    }

    info!("shutdown complete");
    Ok(())
}

/// Build one `PollWorker` per configured pair.
///
/// Every source and sink id is checked against the registries before any
/// source is built, so a typo fails fast without touching the network.
async fn build_workers(
    config: &Config,
    cancel: &CancellationToken,
) -> error::Result<Vec<Arc<PollWorker>>> {
    let sources = SourceRegistry::with_builtin();
    let sinks = SinkRegistry::with_builtin();

    for (index, pair) in config.pairs.iter().enumerate() {
        let unknown = if !sources.contains(&pair.source, &pair.operation) {
            Some(relay::Error::UnknownSource(format!(
                "{}.{}",
                pair.source, pair.operation
            )))
        } else if !sinks.contains(&pair.sink_kind) {
            Some(relay::Error::UnknownSink(pair.sink_kind.clone()))
        } else {
            None
        };
        if let Some(source) = unknown {
            return Err(error::Error::Pair {
                index,
                source_id: pair.source.clone(),
                operation: pair.operation.clone(),
                source,
            });
        }
    }

    let context = SourceContext {
        auth: Arc::new(config.auth_settings()),
        dispatch: config.dispatch_policy(),
        cancel: cancel.clone(),
        lookback: config.lookback(),
        api_base: None,
    };

    let mut workers = Vec::with_capacity(config.pairs.len());
    for (index, pair) in config.pairs.iter().enumerate() {
        let pair_error = |source: relay::Error| error::Error::Pair {
            index,
            source_id: pair.source.clone(),
            operation: pair.operation.clone(),
            source,
        };

        let sink = sinks
            .build(config.sink_config(pair), cancel.clone())
            .map_err(pair_error)?;
        let source = sources
            .build(&pair.source, &pair.operation, context.clone())
            .await
            .map_err(pair_error)?;

        info!(
            source = source.id(),
            sink = sink.id(),
            address = %pair.sink_address,
            "pair ready"
        );
        workers.push(Arc::new(PollWorker::new(
            source,
            sink,
            config.worker_settings(),
            cancel.clone(),
        )));
    }
    Ok(workers)
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_pair(source: &str, operation: &str, sink_kind: &str) -> Config {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m365-relay.toml");
        let toml = format!(
            r#"
[azure]
tenant_ids = ["t1"]
app_ids = ["a1"]

[[pairs]]
source = "{source}"
operation = "{operation}"
sink_address = "http://127.0.0.1:9/hook"
sink_kind = "{sink_kind}"
"#
        );
        std::fs::write(&path, toml).unwrap();
        Config::load(&path).unwrap()
    }

    #[tokio::test]
    async fn unknown_source_is_rejected_before_building() {
        let config = config_with_pair("MicrosoftDefender", "Alerts", "Plain");
        let err = build_workers(&config, &CancellationToken::new())
            .await
            .err()
            .expect("unknown source must fail");

        let msg = err.to_string();
        assert!(msg.contains("pair 0 (MicrosoftDefender.Alerts)"), "got: {msg}");
        assert!(msg.contains("MicrosoftDefender.Alerts"), "got: {msg}");
        assert!(!err.is_clock_skew());
    }

    #[tokio::test]
    async fn unknown_sink_kind_is_rejected_before_building() {
        let config = config_with_pair("MicrosoftThreatProtection", "Incidents", "Splunk");
        let err = build_workers(&config, &CancellationToken::new())
            .await
            .err()
            .expect("unknown sink must fail");

        assert!(
            matches!(
                err,
                error::Error::Pair {
                    source: relay::Error::UnknownSink(ref kind),
                    ..
                } if kind == "Splunk"
            ),
            "got: {err}"
        );
    }
}
