//! Prometheus Metrics Module
//!
//! Exposes proxy metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Publishes**: accepted publishes by queue and outcome
//! - **Consumes**: single-get pulls by queue and outcome
//! - **Pushes**: subscriber deliveries by queue and terminal outcome
//! - **HTTP**: requests answered by route and status class
//!
//! Metrics are rendered at `GET /metrics` on the main listener.

use std::sync::OnceLock;

use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

fn register_metrics() {
    describe_counter!(
        "bunny_proxy_publishes_total",
        "Publishes accepted per queue by outcome"
    );
    describe_counter!(
        "bunny_proxy_consumes_total",
        "Single-get pulls per queue by outcome"
    );
    describe_counter!(
        "bunny_proxy_pushes_total",
        "Subscriber deliveries per queue by terminal outcome"
    );
    describe_counter!(
        "bunny_proxy_http_errors_total",
        "HTTP error responses by error kind"
    );
}

/// Record a publish outcome (`confirmed`, `unconfirmed`, `rejected`).
pub fn record_publish(queue: &str, outcome: &'static str) {
    counter!(
        "bunny_proxy_publishes_total",
        "queue" => queue.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a consume outcome (`delivered`, `empty`).
pub fn record_consume(queue: &str, outcome: &'static str) {
    counter!(
        "bunny_proxy_consumes_total",
        "queue" => queue.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a push terminal outcome (`delivered`, `requeued`, `cancelled`).
pub fn record_push(queue: &str, outcome: &'static str) {
    counter!(
        "bunny_proxy_pushes_total",
        "queue" => queue.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record an HTTP error response by error kind.
pub fn record_http_error(kind: &'static str) {
    counter!(
        "bunny_proxy_http_errors_total",
        "kind" => kind
    )
    .increment(1);
}
