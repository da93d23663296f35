//! Tracing and telemetry instrumentation for shoal.
//!
//! Span helpers for the four reconcile paths plus `record_*` functions that
//! log an event and, with the `metrics` feature, update the Prometheus
//! collectors in [`crate::metrics`].
//!
//! Every span declares an empty `error_kind` field. [`record_reconcile_error`]
//! fills it with `fatal` or `retryable` on the current span.

use tracing::{Span, field, info_span};

use crate::error::Error;
use crate::resource::WorkUnitPhase;

/// Span for one admission pass over a campaign.
#[must_use]
pub fn admission_span(campaign: impl AsRef<str>) -> Span {
    info_span!(
        "shoal.admission",
        campaign = %campaign.as_ref(),
        error_kind = field::Empty,
    )
}

/// Span for one lifecycle pass over a work unit.
#[must_use]
pub fn reconcile_span(work_unit: impl AsRef<str>) -> Span {
    info_span!(
        "shoal.reconcile",
        work_unit = %work_unit.as_ref(),
        error_kind = field::Empty,
    )
}

/// Span for a worker-side dispatch merge.
#[must_use]
pub fn dispatch_span(worker_index: usize) -> Span {
    info_span!(
        "shoal.dispatch",
        worker_index = worker_index,
        error_kind = field::Empty,
    )
}

/// Span for finalizer cleanup of a work unit.
#[must_use]
pub fn finalize_span(work_unit: impl AsRef<str>) -> Span {
    info_span!(
        "shoal.finalize",
        work_unit = %work_unit.as_ref(),
        error_kind = field::Empty,
    )
}

/// Record a newly admitted work unit.
pub fn record_work_unit_admitted(campaign: impl AsRef<str>, batch_index: usize) {
    tracing::info!(
        campaign = %campaign.as_ref(),
        batch_index,
        "work unit admitted"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_work_unit_admitted(campaign.as_ref());
}

/// Record a work unit reaching a terminal phase.
///
/// `duration_secs` is the time from start to completion when both are known.
pub fn record_work_unit_completed(
    campaign: impl AsRef<str>,
    phase: WorkUnitPhase,
    duration_secs: Option<f64>,
) {
    tracing::info!(
        campaign = %campaign.as_ref(),
        phase = %phase,
        duration_secs,
        "work unit completed"
    );

    #[cfg(feature = "metrics")]
    {
        crate::metrics::record_work_unit_completed(campaign.as_ref(), phase.as_str());
        if let Some(secs) = duration_secs {
            crate::metrics::observe_work_unit_duration(phase.as_str(), secs);
        }
    }
}

/// Record a failed reconcile pass and tag the current span with its kind.
pub fn record_reconcile_error(target: impl AsRef<str>, err: &Error) {
    let kind = err.kind_label();
    Span::current().record("error_kind", kind);

    if err.is_fatal() {
        tracing::error!(target_kind = %target.as_ref(), error_kind = kind, error = %err, "reconcile failed");
    } else {
        tracing::warn!(target_kind = %target.as_ref(), error_kind = kind, error = %err, "reconcile failed");
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_reconcile_error(target.as_ref(), kind);
}

/// Update the live work-unit gauge for a campaign.
pub fn set_active_work_units(campaign: impl AsRef<str>, active: usize) {
    tracing::debug!(
        campaign = %campaign.as_ref(),
        active,
        "active work units updated"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::set_active_work_units(campaign.as_ref(), active as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_subscriber(f: impl FnOnce()) {
        tracing::subscriber::with_default(tracing_subscriber::registry(), f);
    }

    #[test]
    fn test_span_names() {
        with_subscriber(|| {
            assert_eq!(
                admission_span("maint/nightly").metadata().unwrap().name(),
                "shoal.admission"
            );
            assert_eq!(
                reconcile_span("maint/nightly-batch-0").metadata().unwrap().name(),
                "shoal.reconcile"
            );
            assert_eq!(dispatch_span(3).metadata().unwrap().name(), "shoal.dispatch");
            assert_eq!(
                finalize_span("maint/nightly-batch-0").metadata().unwrap().name(),
                "shoal.finalize"
            );
        });
    }

    #[test]
    fn test_spans_declare_error_kind() {
        with_subscriber(|| {
            let span = reconcile_span("maint/nightly-batch-0");
            assert!(!span.is_disabled());
            assert!(span.metadata().unwrap().fields().field("error_kind").is_some());
        });
    }

    #[test]
    fn test_record_helpers_do_not_panic() {
        record_work_unit_admitted("maint/nightly", 0);
        record_work_unit_completed("maint/nightly", WorkUnitPhase::Succeeded, Some(1.5));
        record_work_unit_completed("maint/nightly", WorkUnitPhase::Failed, None);
        record_reconcile_error("WorkUnit", &Error::discovery("timeout"));
        set_active_work_units("maint/nightly", 2);
    }
}
