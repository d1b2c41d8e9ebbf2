//! Prometheus metrics exposition
//!
//! - `zyte_api_requests_total` (counter): label `outcome`
//! - `zyte_api_request_duration_seconds` (histogram): label `outcome`
//! - `zyte_api_session_events_total` (counter): labels `pool`, `phase`,
//!   `outcome`, recorded by the session manager

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use zyte_api::ApiResponse;

const DURATION_METRIC: &str = "zyte_api_request_duration_seconds";

/// API calls are slow, browser rendering included; the default client
/// timeout is 200s.
const DURATION_BUCKETS: &[f64] = &[
    0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 200.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed API call, session initialization requests included.
pub fn record_api_request(result: &zyte_api::Result<ApiResponse>, duration_secs: f64) {
    let outcome = match result {
        Ok(_) => "success",
        Err(_) => "error",
    };
    metrics::counter!("zyte_api_requests_total", "outcome" => outcome).increment(1);
    metrics::histogram!(DURATION_METRIC, "outcome" => outcome).record(duration_secs);
}

#[cfg(test)]
pub(crate) fn isolated_recorder() -> (
    metrics_exporter_prometheus::PrometheusRecorder,
    PrometheusHandle,
) {
    let recorder = builder().build_recorder();
    let handle = recorder.handle();
    (recorder, handle)
}
