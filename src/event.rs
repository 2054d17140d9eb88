//! Structured events emitted by the store on every committed change.
//!
//! Sync clients subscribe to wake reconciliation early; the events carry
//! just enough to decide whether a refresh is worth it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Status, TicketCode, TicketId};

/// A structured event emitted by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketEvent {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    TicketCreated {
        id: TicketId,
        code: TicketCode,
    },
    StateTransition {
        id: TicketId,
        from: Status,
        to: Status,
        author: String,
    },
    EntryAppended {
        id: TicketId,
        status: Status,
        author: String,
    },
    Override {
        id: TicketId,
        from: Status,
        to: Status,
        author: String,
    },
    CompletionNotified {
        id: TicketId,
        email_sent: bool,
        messaging_sent: bool,
    },
}

impl EventKind {
    pub fn ticket_id(&self) -> TicketId {
        match self {
            EventKind::TicketCreated { id, .. }
            | EventKind::StateTransition { id, .. }
            | EventKind::EntryAppended { id, .. }
            | EventKind::Override { id, .. }
            | EventKind::CompletionNotified { id, .. } => *id,
        }
    }
}
