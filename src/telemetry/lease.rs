//! Lease span helpers.

use tracing::Span;

use crate::model::ItemId;

/// Start a span covering one lease: claim, handler, finish.
///
/// `lease.state` is declared empty and filled by [`record_lease_transition`].
pub fn start_lease_span(topic: &str, item_id: ItemId) -> Span {
    tracing::info_span!(
        "lease.process",
        "lease.topic" = topic,
        "lease.item_id" = %item_id,
        "lease.state" = tracing::field::Empty,
    )
}

/// Record a lease state change on the span and emit it as an event.
pub fn record_lease_transition(span: &Span, from: &str, to: &str) {
    span.record("lease.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "lease_transition");
    });
}
