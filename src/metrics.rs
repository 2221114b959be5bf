use lazy_static::lazy_static;
use prometheus::{
    Counter, Encoder, Gauge, Histogram, TextEncoder, register_counter, register_gauge,
    register_histogram,
};

lazy_static! {
    pub static ref SUBMISSIONS_TOTAL: Counter = register_counter!(
        "verification_submissions_total",
        "Total number of submit calls"
    )
    .unwrap();
    pub static ref RATE_LIMITED_TOTAL: Counter = register_counter!(
        "verification_rate_limited_total",
        "Submissions rejected by the rate limiter"
    )
    .unwrap();
    pub static ref SUBMISSION_FAILURES: Counter = register_counter!(
        "verification_failures_total",
        "Submissions that reached the endpoint and failed"
    )
    .unwrap();
    pub static ref SUBMIT_LATENCY: Histogram = register_histogram!(
        "verification_submit_latency_seconds",
        "End-to-end submit latency in seconds"
    )
    .unwrap();
    pub static ref TRACKED_KEYS: Gauge = register_gauge!(
        "verification_rate_limit_keys",
        "Current number of user+address keys tracked"
    )
    .unwrap();
}

// Text exposition of everything registered in the default registry
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
