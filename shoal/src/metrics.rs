//! Prometheus metrics instrumentation for shoal.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `shoal_work_units_admitted_total` - Work units created by admission
//! - `shoal_work_units_completed_total` - Work units that reached a terminal phase
//! - `shoal_reconcile_errors_total` - Failed reconcile passes by error kind
//!
//! ## Gauges
//! - `shoal_active_work_units` - Pending or running work units per campaign
//!
//! ## Histograms
//! - `shoal_work_unit_duration_seconds` - Start-to-completion time of work units
#![cfg(feature = "metrics")]

use prometheus::{CounterVec, GaugeVec, HistogramVec, Opts, Registry, exponential_buckets};
use std::sync::LazyLock;

/// Global Prometheus registry for shoal metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `campaign`.
pub static WORK_UNITS_ADMITTED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "shoal_work_units_admitted_total",
        "Total number of work units admitted",
    );
    CounterVec::new(opts, &["campaign"])
        .expect("shoal_work_units_admitted_total metric creation failed")
});

/// Labels: `campaign`, `phase` (Succeeded or Failed).
pub static WORK_UNITS_COMPLETED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "shoal_work_units_completed_total",
        "Total number of work units that reached a terminal phase",
    );
    CounterVec::new(opts, &["campaign", "phase"])
        .expect("shoal_work_units_completed_total metric creation failed")
});

/// Labels: `target` (Campaign or WorkUnit), `kind` (fatal or retryable).
pub static RECONCILE_ERRORS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "shoal_reconcile_errors_total",
        "Total number of failed reconcile passes",
    );
    CounterVec::new(opts, &["target", "kind"])
        .expect("shoal_reconcile_errors_total metric creation failed")
});

/// Labels: `campaign`.
pub static ACTIVE_WORK_UNITS: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "shoal_active_work_units",
        "Current number of pending or running work units",
    );
    GaugeVec::new(opts, &["campaign"]).expect("shoal_active_work_units metric creation failed")
});

/// Labels: `phase`.
pub static WORK_UNIT_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    // 1s .. ~9h
    let buckets = exponential_buckets(1.0, 2.0, 16).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "shoal_work_unit_duration_seconds",
        "Work unit start-to-completion duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["phase"])
        .expect("shoal_work_unit_duration_seconds metric creation failed")
});

/// Register all metrics with the global registry. Safe to call repeatedly.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(WORK_UNITS_ADMITTED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(WORK_UNITS_COMPLETED_TOTAL.clone()),
        Box::new(RECONCILE_ERRORS_TOTAL.clone()),
        Box::new(ACTIVE_WORK_UNITS.clone()),
        Box::new(WORK_UNIT_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_work_unit_admitted(campaign: &str) {
    WORK_UNITS_ADMITTED_TOTAL.with_label_values(&[campaign]).inc();
}

pub fn record_work_unit_completed(campaign: &str, phase: &str) {
    WORK_UNITS_COMPLETED_TOTAL
        .with_label_values(&[campaign, phase])
        .inc();
}

pub fn record_reconcile_error(target: &str, kind: &str) {
    RECONCILE_ERRORS_TOTAL.with_label_values(&[target, kind]).inc();
}

pub fn set_active_work_units(campaign: &str, active: f64) {
    ACTIVE_WORK_UNITS.with_label_values(&[campaign]).set(active);
}

pub fn observe_work_unit_duration(phase: &str, duration_secs: f64) {
    WORK_UNIT_DURATION_SECONDS
        .with_label_values(&[phase])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization_is_idempotent() {
        init_metrics().expect("metrics initialization should succeed");
        init_metrics().expect("second initialization should succeed");
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().expect("metrics initialization should succeed");

        record_work_unit_admitted("maint/nightly");
        record_work_unit_completed("maint/nightly", "Succeeded");
        record_reconcile_error("WorkUnit", "retryable");
        set_active_work_units("maint/nightly", 2.0);
        observe_work_unit_duration("Succeeded", 42.0);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("shoal_work_units_admitted_total"));
        assert!(output.contains("shoal_work_units_completed_total"));
        assert!(output.contains("shoal_reconcile_errors_total"));
        assert!(output.contains("shoal_active_work_units"));
        assert!(output.contains("shoal_work_unit_duration_seconds"));
    }
}
