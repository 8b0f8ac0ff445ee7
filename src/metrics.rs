//! Prometheus metrics for the gateway.
//!
//! Served by a dedicated listener on `metrics.prometheus_port`, separate
//! from the API port. Health gauges are rebuilt from the registry's pull
//! accessor on every scrape: the per-backend vector is Reset() first so
//! series for deleted backends disappear instead of going stale.

use once_cell::sync::Lazy;
use prometheus::{
    opts, register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};

use crate::models::backend::HealthStatus;
use crate::store::postgres::PgStore;

pub struct Recorder {
    requests_total: CounterVec,
    request_duration_seconds: HistogramVec,
    audit_written_total: CounterVec,
    server_health: GaugeVec,
    servers_total: GaugeVec,
}

static RECORDER: Lazy<Recorder> = Lazy::new(Recorder::new);

impl Recorder {
    fn new() -> Self {
        let requests_total = register_counter_vec!(
            opts!("gateway_requests_total", "Proxied MCP calls by outcome"),
            &["transport", "method", "status_code"]
        )
        .expect("failed to register gateway_requests_total");

        let request_duration_seconds = register_histogram_vec!(
            prometheus::histogram_opts!(
                "gateway_request_duration_seconds",
                "Proxied call latency in seconds",
                vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
            ),
            &["transport", "method"]
        )
        .expect("failed to register gateway_request_duration_seconds");

        let audit_written_total = register_counter_vec!(
            opts!("audit_logs_written_total", "Audit rows written by status"),
            &["status"]
        )
        .expect("failed to register audit_logs_written_total");

        let server_health = register_gauge_vec!(
            opts!(
                "gateway_server_health_status",
                "1 when the backend's last probe was healthy, else 0"
            ),
            &["server_id", "server_name"]
        )
        .expect("failed to register gateway_server_health_status");

        let servers_total = register_gauge_vec!(
            opts!("registry_servers_total", "Registered backends by state"),
            &["status"]
        )
        .expect("failed to register registry_servers_total");

        Self {
            requests_total,
            request_duration_seconds,
            audit_written_total,
            server_health,
            servers_total,
        }
    }
}

/// Count one proxied call.
pub fn observe_proxy_call(transport: &str, method: &str, status: u16, duration_secs: f64) {
    RECORDER
        .requests_total
        .with_label_values(&[transport, method, &status.to_string()])
        .inc();
    RECORDER
        .request_duration_seconds
        .with_label_values(&[transport, method])
        .observe(duration_secs);
}

pub fn audit_written(status: &str) {
    RECORDER
        .audit_written_total
        .with_label_values(&[status])
        .inc();
}

/// Rebuild the registry gauges from current store state. Called on each
/// scrape before encoding.
pub async fn collect_registry(store: &PgStore) {
    // Reset, then re-emit: series for backends that no longer exist drop
    // cleanly after one cycle.
    RECORDER.server_health.reset();

    match store.all_health().await {
        Ok(records) => {
            for (record, name) in records {
                let value = if record.status == HealthStatus::Healthy {
                    1.0
                } else {
                    0.0
                };
                RECORDER
                    .server_health
                    .with_label_values(&[&record.backend_id.to_string(), &name])
                    .set(value);
            }
        }
        Err(e) => tracing::warn!("failed to collect health records: {}", e),
    }

    match store.count_backends().await {
        Ok((active, inactive)) => {
            RECORDER
                .servers_total
                .with_label_values(&["active"])
                .set(active as f64);
            RECORDER
                .servers_total
                .with_label_values(&["inactive"])
                .set(inactive as f64);
        }
        Err(e) => tracing::warn!("failed to count backends: {}", e),
    }
}

/// Encode all registered metrics as Prometheus text format.
pub fn encode() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .unwrap_or_default();
    String::from_utf8(buffer).unwrap_or_default()
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_returns_text() {
        observe_proxy_call("http", "tools/call", 200, 0.05);
        audit_written("ok");
        let output = encode();
        assert!(output.contains("gateway_requests_total"));
        assert!(output.contains("audit_logs_written_total"));
    }

    #[test]
    fn test_health_gauge_reset_drops_series() {
        RECORDER
            .server_health
            .with_label_values(&["gone-backend", "gone"])
            .set(1.0);
        assert!(encode().contains("gone-backend"));
        RECORDER.server_health.reset();
        assert!(!encode().contains("gone-backend"));
    }
}
