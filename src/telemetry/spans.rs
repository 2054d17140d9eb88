//! Span helpers for ticket transitions and notification channels.

use tracing::Span;

use crate::model::TicketId;

/// Start a span for a ticket transition.
///
/// `ticket.from` is declared empty and filled by [`record_transition`].
pub fn start_transition_span(ticket_id: &TicketId, to: &str) -> Span {
    tracing::info_span!(
        "ticket.transition",
        "ticket.id" = %ticket_id,
        "ticket.to" = to,
        "ticket.from" = tracing::field::Empty,
    )
}

/// Record a committed transition on the span.
pub fn record_transition(span: &Span, from: &str, to: &str) {
    span.record("ticket.from", from);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}

/// Start a span for one notification channel.
pub fn start_channel_span(channel: &str, ticket_id: &TicketId) -> Span {
    tracing::info_span!(
        "notify.channel",
        "notify.channel" = channel,
        "ticket.id" = %ticket_id,
    )
}
