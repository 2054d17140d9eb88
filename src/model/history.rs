//! History ledger entry types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Status;

/// Author name used for entries the service writes on its own behalf.
pub const SYSTEM_AUTHOR: &str = "system";

/// One immutable record in a ticket's ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub record_id: RecordId,
    pub at: DateTime<Utc>,
    /// Operator name or [`SYSTEM_AUTHOR`].
    pub author: String,
    #[serde(rename = "statusAnterior")]
    pub status_from: Status,
    #[serde(rename = "statusNovo")]
    pub status_to: Status,
    #[serde(default)]
    pub message: String,
    #[serde(flatten)]
    pub flags: NotificationFlags,
    #[serde(default)]
    pub attachment: Option<AttachmentRef>,
}

impl HistoryEntry {
    pub fn is_state_change(&self) -> bool {
        self.status_from != self.status_to
    }

    pub fn is_system(&self) -> bool {
        self.author == SYSTEM_AUTHOR
    }

    pub fn has_attachment(&self) -> bool {
        self.attachment.is_some()
    }
}

/// Which channels a notification was delivered on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationFlags {
    #[serde(default)]
    pub email_sent: bool,
    #[serde(default)]
    pub messaging_sent: bool,
}

impl NotificationFlags {
    pub const NONE: NotificationFlags = NotificationFlags {
        email_sent: false,
        messaging_sent: false,
    };

    pub fn email() -> Self {
        Self {
            email_sent: true,
            messaging_sent: false,
        }
    }

    pub fn messaging() -> Self {
        Self {
            email_sent: false,
            messaging_sent: true,
        }
    }

    pub fn any(self) -> bool {
        self.email_sent || self.messaging_sent
    }

    /// Exactly one channel set.
    pub fn single_channel(self) -> bool {
        self.email_sent != self.messaging_sent
    }

    pub fn union(self, other: NotificationFlags) -> NotificationFlags {
        NotificationFlags {
            email_sent: self.email_sent || other.email_sent,
            messaging_sent: self.messaging_sent || other.messaging_sent,
        }
    }
}

/// Reference to a stored attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub name: String,
    pub content_type: String,
    /// Where the encoded payload lives in the repository.
    pub locator: String,
}

/// Ledger record identifier: `<millis>-<position>-<suffix>`.
///
/// Position in the ledger is the true ordering key; the random suffix keeps
/// ids unique across tickets appending in the same millisecond.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Ledger position encoded in the id.
    pub fn position(&self) -> Option<usize> {
        self.0.split('-').nth(1)?.parse().ok()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
