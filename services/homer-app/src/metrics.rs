//! Prometheus metrics exposition
//!
//! - `homer_login_attempts_total` (counter): label `outcome`
//! - `homer_oauth_redirects_total` (counter): label `provider`
//! - `homer_oauth_callbacks_total` (counter): label `outcome`
//! - `homer_oauth_exchange_duration_seconds` (histogram)

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const EXCHANGE_DURATION: &str = "homer_oauth_exchange_duration_seconds";

/// Exchange latency buckets, 10ms up to just past the 10s default timeout.
const EXCHANGE_BUCKETS: &[f64] = &[0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(EXCHANGE_DURATION.to_string()), EXCHANGE_BUCKETS)
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// The exchange histogram gets explicit buckets so it renders `_bucket` lines
/// instead of a summary.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a password login attempt (`success`, `rejected`, `invalid_request`).
pub fn record_login(outcome: &'static str) {
    metrics::counter!("homer_login_attempts_total", "outcome" => outcome).increment(1);
}

/// Record a redirect to the external provider.
pub fn record_redirect(provider: &str) {
    metrics::counter!("homer_oauth_redirects_total", "provider" => provider.to_string())
        .increment(1);
}

/// Record a provider callback outcome.
pub fn record_callback(outcome: &'static str) {
    metrics::counter!("homer_oauth_callbacks_total", "outcome" => outcome).increment(1);
}

/// Record the time spent completing a callback that reached the token endpoint.
pub fn record_exchange_duration(duration_secs: f64) {
    metrics::histogram!(EXCHANGE_DURATION).record(duration_secs);
}

#[cfg(test)]
pub(crate) fn isolated_recorder() -> (metrics_exporter_prometheus::PrometheusRecorder, PrometheusHandle)
{
    let recorder = builder()
        .expect("failed to set histogram buckets")
        .build_recorder();
    let handle = recorder.handle();
    (recorder, handle)
}
