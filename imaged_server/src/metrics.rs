//! Prometheus metrics for build worker observability.

use metrics::{counter, histogram};

/// Initialize metrics exporter (Prometheus).
pub fn init_metrics() {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

/// Record a build state transition.
pub fn build_status_changed(status: &str) {
    counter!("imaged_builds_total", "status" => status.to_string()).increment(1);
}

/// Record build duration.
pub fn build_duration(duration_ms: u64) {
    histogram!("imaged_build_duration_ms").record(duration_ms as f64);
}

/// Record the outcome of attaching one record file.
pub fn record_attached(ok: bool) {
    let result = if ok { "uploaded" } else { "failed" };
    counter!("imaged_records_total", "result" => result).increment(1);
}

/// Record a submission turned away because the worker was busy.
pub fn submission_rejected() {
    counter!("imaged_submissions_rejected_total").increment(1);
}

/// Record a failed build store write.
pub fn persistence_error(op: &'static str) {
    counter!("imaged_persistence_errors_total", "op" => op).increment(1);
}

/// Record a job aborted by an infrastructure error.
pub fn job_error(kind: &'static str) {
    counter!("imaged_job_errors_total", "kind" => kind).increment(1);
}
