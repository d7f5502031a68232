use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    // Business Metrics
    pub static ref ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "attempts_total",
        "Total number of assessment attempts",
        &["status"]
    )
    .unwrap();

    pub static ref ATTEMPTS_ACTIVE: IntGauge = register_int_gauge!(
        "attempts_active",
        "Number of attempts currently held in memory and not completed"
    )
    .unwrap();

    pub static ref ANSWERS_RECORDED_TOTAL: IntCounter = register_int_counter!(
        "answers_recorded_total",
        "Total number of answers recorded across all attempts"
    )
    .unwrap();

    // Recorder Metrics
    pub static ref SUBMISSIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "submissions_total",
        "Total number of submission deliveries to the recorder",
        &["reason", "outcome"]
    )
    .unwrap();

    pub static ref SUBMISSION_DELIVERY_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "submission_delivery_duration_seconds",
        "Recorder delivery duration in seconds",
        &["reason"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    pub static ref SSE_CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        "sse_connections_active",
        "Number of active SSE connections"
    )
    .unwrap();
}

/// Renders all metrics in Prometheus text format
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e)))
}

/// Helper: track one recorder delivery with metrics
pub async fn track_submission_delivery<F, T>(reason: &str, future: F) -> Result<T, anyhow::Error>
where
    F: std::future::Future<Output = Result<T, anyhow::Error>>,
{
    let start = std::time::Instant::now();
    let result = future.await;
    let duration = start.elapsed().as_secs_f64();

    let outcome = if result.is_ok() { "delivered" } else { "failed" };

    SUBMISSIONS_TOTAL
        .with_label_values(&[reason, outcome])
        .inc();

    SUBMISSION_DELIVERY_DURATION_SECONDS
        .with_label_values(&[reason])
        .observe(duration);

    result
}
