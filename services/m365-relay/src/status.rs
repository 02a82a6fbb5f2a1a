//! Status listener
//!
//! Optional HTTP listener with two routes:
//! - `/health`: JSON snapshot of every worker (phase, last alive, restarts)
//! - `/metrics`: Prometheus text exposition

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use relay::{PollWorker, WorkerStatus};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Shared state for the status handlers
#[derive(Clone)]
pub struct StatusState {
    pub workers: Vec<Arc<PollWorker>>,
    pub prometheus: PrometheusHandle,
    pub cancel: CancellationToken,
    pub started_at: Instant,
}

/// Build the status router with a concurrency limit.
pub fn build_router(state: StatusState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Serve `router` on `listener` until `cancel` fires.
pub fn spawn(listener: TcpListener, router: Router, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let addr = listener.local_addr().ok();
        info!(addr = ?addr, "status listener ready");
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
        {
            error!(error = %e, "status listener failed");
        }
    })
}

/// 200 while running, 503 once shutdown has begun.
async fn health_handler(State(state): State<StatusState>) -> impl IntoResponse {
    let workers: Vec<WorkerStatus> = state.workers.iter().map(|w| w.status()).collect();
    let (status_code, status) = if state.cancel.is_cancelled() {
        (StatusCode::SERVICE_UNAVAILABLE, "stopping")
    } else {
        (StatusCode::OK, "healthy")
    };

    let body = serde_json::json!({
        "status": status,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "workers": workers,
    });

    (
        status_code,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

async fn metrics_handler(State(state): State<StatusState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}
