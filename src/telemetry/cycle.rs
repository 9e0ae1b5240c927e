//! Worker cycle span helpers.
//!
//! Provides span creation and status-transition recording for workers
//! moving through their processing loop.

use tracing::Span;

/// Start a span for one processing cycle of a worker.
///
/// The `worker.outcome` field is declared empty and filled via
/// [`record_outcome`].
pub fn start_cycle_span(worker: &str, cycle: u64) -> Span {
    tracing::info_span!(
        "worker.cycle",
        "worker.name" = worker,
        "worker.cycle" = cycle,
        "worker.outcome" = tracing::field::Empty,
    )
}

/// Record how a cycle ended on its span.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("worker.outcome", outcome);
}

/// Record a status transition event on the given span.
///
/// Emits a tracing `info` event scoped to the span.
pub fn record_status_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "status_transition");
    });
}
