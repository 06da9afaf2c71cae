use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, Counter, CounterVec, Encoder,
    Histogram, TextEncoder,
};

pub static ROUNDS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "filament_profiling_rounds_total",
        "Profiling rounds by outcome",
        &["outcome"]
    )
    .unwrap()
});

pub static ROUND_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "filament_profiling_round_duration_seconds",
        "Wall clock time spent draining and emitting one round",
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .unwrap()
});

pub static SAMPLES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "filament_samples_total",
        "Aggregated stack samples drained from the kernel"
    )
    .unwrap()
});

pub static PROFILES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "filament_profiles_total",
        "Per-process profiles assembled"
    )
    .unwrap()
});

pub static WRITES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "filament_profile_writes_total",
        "Profile write attempts by writer and outcome",
        &["writer", "outcome"]
    )
    .unwrap()
});

pub static BATCH_FLUSHES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "filament_store_batch_flushes_total",
        "Remote store batch flushes by outcome",
        &["outcome"]
    )
    .unwrap()
});

pub static DEBUGINFO_DROPS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "filament_debuginfo_upload_drops_total",
        "Debug info upload batches dropped because the queue was full"
    )
    .unwrap()
});

/// Renders every registered metric in the Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_includes_registered_metrics() {
        ROUNDS_TOTAL.with_label_values(&["ok"]).inc();
        let text = encode_metrics();
        assert!(text.contains("filament_profiling_rounds_total"));
    }
}
