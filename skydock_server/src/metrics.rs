//! Prometheus counters and histograms emitted by the pipeline.

use metrics::{counter, gauge, histogram};

/// Initialize metrics exporter (Prometheus).
pub fn init_metrics() {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

pub fn record_webhook_received(event: &str) {
    counter!("skydock_webhooks_received_total", "event" => event.to_string()).increment(1);
}

pub fn record_run_started(trigger: &str) {
    counter!("skydock_runs_started_total", "trigger" => trigger.to_string()).increment(1);
}

pub fn record_run_finished(status: &str) {
    counter!("skydock_runs_finished_total", "status" => status.to_string()).increment(1);
}

pub fn record_stage_duration(stage: &'static str, seconds: f64) {
    histogram!("skydock_stage_duration_seconds", "stage" => stage).record(seconds);
}

pub fn record_provider_call(service: &'static str, ok: bool) {
    counter!(
        "skydock_provider_calls_total",
        "service" => service,
        "outcome" => if ok { "ok" } else { "error" }
    )
    .increment(1);
}

pub fn record_rollback(kind: &'static str) {
    counter!("skydock_rollbacks_total", "kind" => kind).increment(1);
}

/// Current number of live websocket connections.
pub fn set_hub_connections(count: usize) {
    gauge!("skydock_hub_connections").set(count as f64);
}
