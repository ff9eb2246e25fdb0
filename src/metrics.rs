use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the global Prometheus recorder.
/// Fails if a recorder is already installed (e.g., in tests)
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    init_metric_descriptions();

    Ok(handle)
}

/// Initialize metric descriptions (can be called multiple times safely)
fn init_metric_descriptions() {
    describe_counter!(
        "lake_http_requests_total",
        "Total number of HTTP requests served"
    );
    describe_histogram!(
        "lake_http_request_duration_seconds",
        "HTTP request duration in seconds"
    );
    describe_counter!(
        "lake_cache_operations_total",
        "Cache operations by operation and outcome"
    );
    describe_counter!(
        "lake_cache_reconnects_total",
        "Number of cache connection replacements"
    );
    describe_counter!(
        "lake_auth_requests_total",
        "Calls to the authentication service"
    );
    describe_gauge!("lake_gateway_info", "Gateway version information");

    gauge!("lake_gateway_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
}

/// Record a served request
pub fn record_request(method: &str, path: &str, status: u16, duration: Duration) {
    counter!(
        "lake_http_requests_total",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status.to_string(),
    )
    .increment(1);

    histogram!(
        "lake_http_request_duration_seconds",
        "method" => method.to_string(),
        "path" => path.to_string(),
    )
    .record(duration.as_secs_f64());
}

/// Record a cache operation; `outcome` is hit, miss, ok or error
pub fn record_cache_operation(operation: &'static str, outcome: &'static str) {
    counter!(
        "lake_cache_operations_total",
        "operation" => operation,
        "outcome" => outcome,
    )
    .increment(1);
}

pub fn record_cache_reconnect() {
    counter!("lake_cache_reconnects_total").increment(1);
}

/// Record an authentication service call
pub fn record_auth_request(operation: &'static str, outcome: &'static str) {
    counter!(
        "lake_auth_requests_total",
        "operation" => operation,
        "outcome" => outcome,
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_metrics() {
        init_metric_descriptions();

        record_request("GET", "/v1/healthcheck", 200, Duration::from_millis(3));
        record_cache_operation("get", "hit");
        record_cache_reconnect();
        record_auth_request("validate", "ok");

        // Without an installed recorder the calls are no-ops; they must not panic
    }

    #[test]
    fn test_rendered_output() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            record_cache_operation("set", "ok");
        });

        let rendered = handle.render();
        assert!(rendered.contains("lake_cache_operations_total"));
        assert!(rendered.contains("operation=\"set\""));
    }
}
