//! Metric instrument factories for certdesk.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"certdesk"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for certdesk instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("certdesk")
}

/// Counter: tickets created.
/// Labels: `priority`.
pub fn tickets_created() -> Counter<u64> {
    meter()
        .u64_counter("certdesk.tickets.created")
        .with_description("Number of tickets created")
        .build()
}

/// Counter: ticket state transitions.
/// Labels: `from`, `to`.
pub fn ticket_transitions() -> Counter<u64> {
    meter()
        .u64_counter("certdesk.tickets.transitions")
        .with_description("Number of ticket state transitions")
        .build()
}

/// Counter: notification outcomes per channel.
/// Labels: `channel` ("email" | "messaging"), `result` ("sent" | "skipped" | "failed").
pub fn notify_deliveries() -> Counter<u64> {
    meter()
        .u64_counter("certdesk.notify.deliveries")
        .with_description("Completion notification outcomes per channel")
        .build()
}

/// Counter: messaging wire-format attempts.
/// Labels: `variant`, `result` ("accepted" | "rejected").
pub fn messaging_attempts() -> Counter<u64> {
    meter()
        .u64_counter("certdesk.notify.messaging_attempts")
        .with_description("Messaging wire-format attempts")
        .build()
}

/// Counter: sync client reconciliation cycles that reached the store.
/// Labels: `result` ("live" | "stale" | "cached" | "unavailable").
pub fn sync_reconciliations() -> Counter<u64> {
    meter()
        .u64_counter("certdesk.sync.reconciliations")
        .with_description("Sync client reconciliation cycles")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("certdesk.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
