use once_cell::sync::Lazy;
use prometheus::{Counter, Gauge, Histogram, HistogramOpts};

#[cfg(feature = "bench-no-metrics")]
mod shim {
    use super::*;
    pub struct NoopCounter;
    impl NoopCounter { pub fn inc(&self) {} pub fn inc_by(&self, _v: f64) {} }
    pub struct NoopGauge;
    impl NoopGauge { pub fn set(&self, _v: f64) {} pub fn inc(&self) {} pub fn dec(&self) {} }
    pub struct NoopHistogram;
    impl NoopHistogram { pub fn observe(&self, _v: f64) {} pub fn start_timer(&self) -> NoopTimer { NoopTimer } }
    pub struct NoopTimer; impl NoopTimer { pub fn observe_duration(&self) {} }
    pub static CACHE_HITS_TOTAL: Lazy<NoopCounter> = Lazy::new(|| NoopCounter);
    pub static CACHE_MISSES_TOTAL: Lazy<NoopCounter> = Lazy::new(|| NoopCounter);
    pub static CACHE_INVALIDATIONS_TOTAL: Lazy<NoopCounter> = Lazy::new(|| NoopCounter);
    pub static CACHE_COLD_STARTS_TOTAL: Lazy<NoopCounter> = Lazy::new(|| NoopCounter);
    pub static BACKEND_FALLBACKS_TOTAL: Lazy<NoopCounter> = Lazy::new(|| NoopCounter);
    pub static EVENTS_INGESTED_TOTAL: Lazy<NoopCounter> = Lazy::new(|| NoopCounter);
    pub static EVENTS_REJECTED_TOTAL: Lazy<NoopCounter> = Lazy::new(|| NoopCounter);
    pub static DRIFT_CHECKS_TOTAL: Lazy<NoopCounter> = Lazy::new(|| NoopCounter);
    pub static DRIFT_REBASELINES_TOTAL: Lazy<NoopCounter> = Lazy::new(|| NoopCounter);
    pub static DRIFT_WARNINGS_TOTAL: Lazy<NoopCounter> = Lazy::new(|| NoopCounter);
    pub static DRIFT_CRITICAL_TOTAL: Lazy<NoopCounter> = Lazy::new(|| NoopCounter);
    pub static DRIFT_MAX_PSI: Lazy<NoopGauge> = Lazy::new(|| NoopGauge);
    pub static LEARNING_UPDATES_TOTAL: Lazy<NoopCounter> = Lazy::new(|| NoopCounter);
    pub static LEARNING_UPDATES_REJECTED_TOTAL: Lazy<NoopCounter> = Lazy::new(|| NoopCounter);
    pub static LEARNING_UPDATE_FAILURES_TOTAL: Lazy<NoopCounter> = Lazy::new(|| NoopCounter);
    pub static LEARNING_UPDATE_LATENCY_SECONDS: Lazy<NoopHistogram> = Lazy::new(|| NoopHistogram);
    pub static LEARNING_BUFFER_UTILIZATION: Lazy<NoopGauge> = Lazy::new(|| NoopGauge);
    pub static ACTIVE_EXPERIMENTS: Lazy<NoopGauge> = Lazy::new(|| NoopGauge);
    pub static VARIANT_SELECTIONS_TOTAL: Lazy<NoopCounter> = Lazy::new(|| NoopCounter);
    pub static EXPERIMENT_IMPRESSIONS_TOTAL: Lazy<NoopCounter> = Lazy::new(|| NoopCounter);
    pub static EXPERIMENT_CONVERSIONS_TOTAL: Lazy<NoopCounter> = Lazy::new(|| NoopCounter);
    pub static RETRAIN_TRIGGERS_TOTAL: Lazy<NoopCounter> = Lazy::new(|| NoopCounter);
    pub static RETRAIN_FAILURES_TOTAL: Lazy<NoopCounter> = Lazy::new(|| NoopCounter);
    pub static RETRAIN_DURATION_SECONDS: Lazy<NoopHistogram> = Lazy::new(|| NoopHistogram);
    pub static RECOMMENDATIONS_TOTAL: Lazy<NoopCounter> = Lazy::new(|| NoopCounter);
    pub static COLD_START_RECOMMENDATIONS_TOTAL: Lazy<NoopCounter> = Lazy::new(|| NoopCounter);
    pub static RECOMMENDATION_LATENCY_SECONDS: Lazy<NoopHistogram> = Lazy::new(|| NoopHistogram);
    pub fn render() -> String { String::new() }
}

#[cfg(feature = "bench-no-metrics")]
pub use shim::{
    render, ACTIVE_EXPERIMENTS, BACKEND_FALLBACKS_TOTAL, CACHE_COLD_STARTS_TOTAL,
    CACHE_HITS_TOTAL, CACHE_INVALIDATIONS_TOTAL, CACHE_MISSES_TOTAL,
    COLD_START_RECOMMENDATIONS_TOTAL, DRIFT_CHECKS_TOTAL, DRIFT_CRITICAL_TOTAL, DRIFT_MAX_PSI,
    DRIFT_REBASELINES_TOTAL, DRIFT_WARNINGS_TOTAL, EVENTS_INGESTED_TOTAL, EVENTS_REJECTED_TOTAL,
    EXPERIMENT_CONVERSIONS_TOTAL, EXPERIMENT_IMPRESSIONS_TOTAL, LEARNING_BUFFER_UTILIZATION,
    LEARNING_UPDATES_REJECTED_TOTAL, LEARNING_UPDATES_TOTAL, LEARNING_UPDATE_FAILURES_TOTAL,
    LEARNING_UPDATE_LATENCY_SECONDS, RECOMMENDATIONS_TOTAL, RECOMMENDATION_LATENCY_SECONDS,
    RETRAIN_DURATION_SECONDS, RETRAIN_FAILURES_TOTAL, RETRAIN_TRIGGERS_TOTAL,
    VARIANT_SELECTIONS_TOTAL,
};

#[cfg(not(feature = "bench-no-metrics"))]
pub static CACHE_HITS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    prometheus::register_counter!("recflux_cache_hits_total", "Total feature cache hits")
        .expect("register recflux_cache_hits_total")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static CACHE_MISSES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    prometheus::register_counter!("recflux_cache_misses_total", "Total feature cache misses")
        .expect("register recflux_cache_misses_total")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static CACHE_INVALIDATIONS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    prometheus::register_counter!(
        "recflux_cache_invalidations_total",
        "Total cache entries invalidated by writes"
    )
    .expect("register recflux_cache_invalidations_total")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static CACHE_COLD_STARTS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    prometheus::register_counter!(
        "recflux_cache_cold_starts_total",
        "Total default vectors served for unknown entities"
    )
    .expect("register recflux_cache_cold_starts_total")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static BACKEND_FALLBACKS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    prometheus::register_counter!(
        "recflux_backend_fallbacks_total",
        "Total fallbacks to the in-memory feature backend"
    )
    .expect("register recflux_backend_fallbacks_total")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static EVENTS_INGESTED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    prometheus::register_counter!(
        "recflux_events_ingested_total",
        "Total interaction events accepted"
    )
    .expect("register recflux_events_ingested_total")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static EVENTS_REJECTED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    prometheus::register_counter!(
        "recflux_events_rejected_total",
        "Total interaction events rejected by validation"
    )
    .expect("register recflux_events_rejected_total")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static DRIFT_CHECKS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    prometheus::register_counter!("recflux_drift_checks_total", "Total drift checks run")
        .expect("register recflux_drift_checks_total")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static DRIFT_REBASELINES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    prometheus::register_counter!(
        "recflux_drift_rebaselines_total",
        "Total reference window promotions"
    )
    .expect("register recflux_drift_rebaselines_total")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static DRIFT_WARNINGS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    prometheus::register_counter!(
        "recflux_drift_warnings_total",
        "Total drift checks that landed in the warning band"
    )
    .expect("register recflux_drift_warnings_total")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static DRIFT_CRITICAL_TOTAL: Lazy<Counter> = Lazy::new(|| {
    prometheus::register_counter!(
        "recflux_drift_critical_total",
        "Total drift checks that crossed the critical threshold"
    )
    .expect("register recflux_drift_critical_total")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static DRIFT_MAX_PSI: Lazy<Gauge> = Lazy::new(|| {
    prometheus::register_gauge!(
        "recflux_drift_max_psi",
        "Maximum PSI across monitored dimensions at the last check"
    )
    .expect("register recflux_drift_max_psi")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static LEARNING_UPDATES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    prometheus::register_counter!(
        "recflux_learning_updates_total",
        "Total committed incremental model updates"
    )
    .expect("register recflux_learning_updates_total")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static LEARNING_UPDATES_REJECTED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    prometheus::register_counter!(
        "recflux_learning_updates_rejected_total",
        "Total update triggers rejected while another update was in flight"
    )
    .expect("register recflux_learning_updates_rejected_total")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static LEARNING_UPDATE_FAILURES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    prometheus::register_counter!(
        "recflux_learning_update_failures_total",
        "Total incremental updates rolled back after a failure"
    )
    .expect("register recflux_learning_update_failures_total")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static LEARNING_UPDATE_LATENCY_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "recflux_learning_update_latency_seconds",
        "Incremental update latency in seconds",
    )
    .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]);
    prometheus::register_histogram!(opts).expect("register recflux_learning_update_latency_seconds")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static LEARNING_BUFFER_UTILIZATION: Lazy<Gauge> = Lazy::new(|| {
    prometheus::register_gauge!(
        "recflux_learning_buffer_utilization",
        "Interaction buffer fill fraction"
    )
    .expect("register recflux_learning_buffer_utilization")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static ACTIVE_EXPERIMENTS: Lazy<Gauge> = Lazy::new(|| {
    prometheus::register_gauge!(
        "recflux_active_experiments",
        "Experiments currently in running status"
    )
    .expect("register recflux_active_experiments")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static VARIANT_SELECTIONS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    prometheus::register_counter!(
        "recflux_variant_selections_total",
        "Total variant allocations across experiments"
    )
    .expect("register recflux_variant_selections_total")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static EXPERIMENT_IMPRESSIONS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    prometheus::register_counter!(
        "recflux_experiment_impressions_total",
        "Total recorded experiment impressions"
    )
    .expect("register recflux_experiment_impressions_total")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static EXPERIMENT_CONVERSIONS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    prometheus::register_counter!(
        "recflux_experiment_conversions_total",
        "Total recorded experiment conversions"
    )
    .expect("register recflux_experiment_conversions_total")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static RETRAIN_TRIGGERS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    prometheus::register_counter!(
        "recflux_retrain_triggers_total",
        "Total retraining runs that completed"
    )
    .expect("register recflux_retrain_triggers_total")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static RETRAIN_FAILURES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    prometheus::register_counter!(
        "recflux_retrain_failures_total",
        "Total retraining runs that failed or timed out"
    )
    .expect("register recflux_retrain_failures_total")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static RETRAIN_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "recflux_retrain_duration_seconds",
        "Training run duration in seconds",
    )
    .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0]);
    prometheus::register_histogram!(opts).expect("register recflux_retrain_duration_seconds")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static RECOMMENDATIONS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    prometheus::register_counter!(
        "recflux_recommendations_total",
        "Total recommendation requests served"
    )
    .expect("register recflux_recommendations_total")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static COLD_START_RECOMMENDATIONS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    prometheus::register_counter!(
        "recflux_cold_start_recommendations_total",
        "Total requests served from the popularity fallback"
    )
    .expect("register recflux_cold_start_recommendations_total")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub static RECOMMENDATION_LATENCY_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "recflux_recommendation_latency_seconds",
        "Recommendation latency in seconds",
    )
    .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]);
    prometheus::register_histogram!(opts).expect("register recflux_recommendation_latency_seconds")
});

#[cfg(not(feature = "bench-no-metrics"))]
pub fn render() -> String {
    use prometheus::{Encoder, TextEncoder};
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    let mf = prometheus::gather();
    encoder.encode(&mf, &mut buf).unwrap();
    String::from_utf8_lossy(&buf).into_owned()
}
