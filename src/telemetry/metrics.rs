//! Metric instrument factories for jobhost.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"jobhost"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for jobhost instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("jobhost")
}

/// Counter: completed worker processing cycles.
/// Labels: `worker`.
pub fn worker_cycles() -> Counter<u64> {
    meter()
        .u64_counter("jobhost.worker.cycles")
        .with_description("Completed worker processing cycles")
        .build()
}

/// Counter: failed worker processing cycles.
/// Labels: `worker`, `kind` ("error" | "panic").
pub fn worker_errors() -> Counter<u64> {
    meter()
        .u64_counter("jobhost.worker.errors")
        .with_description("Failed worker processing cycles")
        .build()
}

/// Counter: worker status transitions.
/// Labels: `from`, `to`.
pub fn worker_status_transitions() -> Counter<u64> {
    meter()
        .u64_counter("jobhost.worker.status_transitions")
        .with_description("Number of worker status transitions")
        .build()
}

/// Counter: queue-level operations (publish, get, ack, nack, archive).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("jobhost.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: deliveries settled by a consumer.
/// Labels: `worker`, `disposition` ("ack" | "nack").
pub fn deliveries_settled() -> Counter<u64> {
    meter()
        .u64_counter("jobhost.consumer.deliveries")
        .with_description("Deliveries acknowledged or rejected by consumers")
        .build()
}

/// Counter: attempts made against external endpoints.
/// Labels: `endpoint`, `class`.
pub fn endpoint_attempts() -> Counter<u64> {
    meter()
        .u64_counter("jobhost.retry.attempts")
        .with_description("Attempts made against external endpoints")
        .build()
}

/// Counter: payloads escalated to operators after exhausting retries.
/// Labels: `endpoint`, `disposition`.
pub fn escalations() -> Counter<u64> {
    meter()
        .u64_counter("jobhost.retry.escalations")
        .with_description("Payloads escalated after exhausting retries")
        .build()
}

/// Histogram: processing cycle duration in milliseconds.
/// Labels: `worker`.
pub fn cycle_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("jobhost.worker.cycle_duration_ms")
        .with_description("Worker processing cycle duration in milliseconds")
        .with_unit("ms")
        .build()
}
