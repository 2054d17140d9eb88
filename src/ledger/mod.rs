//! History ledger: append-only per-ticket transition records.
//!
//! The store is the only writer. Entries are appended through [`append`],
//! which also keeps `status` and `completed_at` in step with the ledger head.

pub mod consolidate;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{AttachmentRef, HistoryEntry, NotificationFlags, RecordId, Status, Ticket};

pub use consolidate::{ConsolidatedView, DisplayEntry, consolidate};

/// Build a record id from creation time, ledger position and a random suffix.
pub fn record_id(at: DateTime<Utc>, position: usize) -> RecordId {
    let suffix = Uuid::new_v4().simple().to_string();
    RecordId(format!(
        "{}-{position:04}-{}",
        at.timestamp_millis(),
        &suffix[..12]
    ))
}

/// Everything an entry needs except what the ledger derives itself.
#[derive(Debug, Clone)]
pub struct EntryDraft {
    pub author: String,
    pub status_to: Status,
    pub message: String,
    pub flags: NotificationFlags,
    pub attachment: Option<AttachmentRef>,
}

impl EntryDraft {
    pub fn new(author: impl Into<String>, status_to: Status) -> Self {
        Self {
            author: author.into(),
            status_to,
            message: String::new(),
            flags: NotificationFlags::NONE,
            attachment: None,
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn flags(mut self, flags: NotificationFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn attachment(mut self, attachment: Option<AttachmentRef>) -> Self {
        self.attachment = attachment;
        self
    }
}

/// Append an entry to the ticket's ledger and move the ticket to its status.
///
/// Does not validate the edge; callers decide which edges are legal.
pub fn append(ticket: &mut Ticket, draft: EntryDraft) -> &HistoryEntry {
    let now = Utc::now();
    let position = ticket.history.len();
    let entry = HistoryEntry {
        record_id: record_id(now, position),
        at: now,
        author: draft.author,
        status_from: ticket.status,
        status_to: draft.status_to,
        message: draft.message,
        flags: draft.flags,
        attachment: draft.attachment,
    };

    ticket.status = draft.status_to;
    ticket.updated_at = now;
    if draft.status_to == Status::Concluido {
        ticket.completed_at.get_or_insert(now);
    } else {
        ticket.completed_at = None;
    }

    ticket.history.push(entry);
    &ticket.history[position]
}
