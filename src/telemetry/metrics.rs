//! Metric instruments for the lease queue.
//!
//! Instruments come from the `"leaseq"` meter on the globally registered
//! `MeterProvider`; before `init_telemetry` installs one they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("leaseq")
}

/// Counter: items published. Labels: `topic`.
pub fn items_published() -> Counter<u64> {
    meter()
        .u64_counter("leaseq.items.published")
        .with_description("Number of work items published")
        .build()
}

/// Counter: successful claims. Labels: `topic`.
pub fn leases_claimed() -> Counter<u64> {
    meter()
        .u64_counter("leaseq.leases.claimed")
        .with_description("Number of leases claimed")
        .build()
}

/// Counter: finish_processing calls.
/// Labels: `topic`, `outcome` ("completed" | "requeued" | "lease_lost").
pub fn leases_finished() -> Counter<u64> {
    meter()
        .u64_counter("leaseq.leases.finished")
        .with_description("Number of leases finalized")
        .build()
}

/// Counter: stale leases returned to the pool by the reaper. Labels: `topic`.
pub fn leases_reclaimed() -> Counter<u64> {
    meter()
        .u64_counter("leaseq.leases.reclaimed")
        .with_description("Number of stale leases reclaimed")
        .build()
}

/// Counter: heartbeat attempts. Labels: `topic`, `result` ("ok" | "lost" | "error").
pub fn heartbeats() -> Counter<u64> {
    meter()
        .u64_counter("leaseq.heartbeats")
        .with_description("Number of heartbeat refresh attempts")
        .build()
}

/// Counter: payload queries. Labels: `topic`, `operation`.
pub fn queries() -> Counter<u64> {
    meter()
        .u64_counter("leaseq.queries")
        .with_description("Number of payload query operations")
        .build()
}

/// Histogram: work seconds recorded when a lease ends.
/// Labels: `topic`, `outcome`.
pub fn lease_work_seconds() -> Histogram<f64> {
    meter()
        .f64_histogram("leaseq.lease.work_seconds")
        .with_description("Leased work time recorded per lease")
        .with_unit("s")
        .build()
}
