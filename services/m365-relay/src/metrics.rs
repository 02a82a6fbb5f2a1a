//! Prometheus metrics exposition
//!
//! The library crates emit through the `metrics` facade; this module installs
//! the recorder and describes what they emit:
//!
//! - `relay_api_requests_total` (counter): label `status`
//! - `relay_api_request_duration_seconds` (histogram): label `status`
//! - `relay_api_rate_limited_total` (counter)
//! - `relay_api_transport_errors_total` (counter)
//! - `relay_events_delivered_total` (counter): label `source`
//! - `relay_events_failed_total` (counter): label `source`
//! - `relay_worker_restarts_total` (counter): label `source`

use metrics::{Unit, describe_counter, describe_histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Bucket boundaries from 50ms up to the 120s request timeout.
const API_DURATION_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("relay_api_request_duration_seconds".to_string()),
        API_DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `relay_api_request_duration_seconds` gets explicit buckets so it renders
/// as a histogram (`_bucket` lines) rather than a summary.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = builder()?.install_recorder()?;
    describe();
    Ok(handle)
}

/// Attach help text to every relay metric.
pub fn describe() {
    describe_counter!(
        "relay_api_requests_total",
        "Management API responses by HTTP status"
    );
    describe_histogram!(
        "relay_api_request_duration_seconds",
        Unit::Seconds,
        "Management API request latency"
    );
    describe_counter!(
        "relay_api_rate_limited_total",
        "403 answers that triggered the rate-limit backoff"
    );
    describe_counter!(
        "relay_api_transport_errors_total",
        "Requests that failed before a response arrived"
    );
    describe_counter!(
        "relay_events_delivered_total",
        "Items accepted by the sink"
    );
    describe_counter!(
        "relay_events_failed_total",
        "Items the sink rejected after its resend"
    );
    describe_counter!(
        "relay_worker_restarts_total",
        "Worker tasks restarted by the watchdog"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    /// Isolated recorder/handle pair; only one global recorder may exist per
    /// process.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = builder().unwrap().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn api_duration_renders_as_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        metrics::histogram!("relay_api_request_duration_seconds", "status" => "200")
            .record(0.03);

        let output = handle.render();
        assert!(output.contains("relay_api_request_duration_seconds_bucket"));
        assert!(output.contains("le=\"0.05\""), "50ms bucket must exist");
        assert!(output.contains("le=\"120\""), "timeout bucket must exist");
        assert!(output.contains("le=\"+Inf\""));
    }

    #[test]
    fn described_metrics_carry_help_text() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        describe();
        metrics::counter!("relay_worker_restarts_total", "source" => "Office365Management.Activities")
            .increment(1);

        let output = handle.render();
        assert!(
            output.contains("# HELP relay_worker_restarts_total Worker tasks restarted by the watchdog"),
            "got: {output}"
        );
        assert!(output.contains("source=\"Office365Management.Activities\""));
    }
}
