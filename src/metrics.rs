//! Observability counters.
//!
//! Recording goes to the `prometheus` default registry and never blocks a
//! core path. Exposition is left to the operator's scrape wiring.

use prometheus::{
    HistogramVec, IntCounterVec, exponential_buckets, register_histogram_vec,
    register_int_counter_vec,
};
use std::sync::LazyLock;

static HIT_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "cachefront_hit_total",
        "Retrieval hits per backend node.",
        &["cluster", "node"]
    )
    .expect("register cachefront_hit_total")
});

static MISS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "cachefront_miss_total",
        "Retrieval misses per backend node.",
        &["cluster", "node"]
    )
    .expect("register cachefront_miss_total")
});

static HANDLE_TIME_US: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "cachefront_handle_time_us",
        "Microseconds from request parse to backend reply.",
        &["cluster", "node", "command"],
        exponential_buckets(64.0, 4.0, 10).unwrap()
    )
    .expect("register cachefront_handle_time_us")
});

static ERR_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "cachefront_error_total",
        "Failed messages per backend node, command and cause.",
        &["cluster", "node", "command", "cause"]
    )
    .expect("register cachefront_error_total")
});

pub fn hit(cluster: &str, node: &str) {
    HIT_TOTAL.with_label_values(&[cluster, node]).inc();
}

pub fn miss(cluster: &str, node: &str) {
    MISS_TOTAL.with_label_values(&[cluster, node]).inc();
}

pub fn handle_time(cluster: &str, node: &str, command: &str, micros: u64) {
    HANDLE_TIME_US
        .with_label_values(&[cluster, node, command])
        .observe(micros as f64);
}

pub fn err_incr(cluster: &str, node: &str, command: &str, cause: &str) {
    ERR_TOTAL
        .with_label_values(&[cluster, node, command, cause])
        .inc();
}
