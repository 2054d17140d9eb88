//! Consolidation view: a compacted, display-only projection of a ledger.
//!
//! Never persisted and never written back. Repetitive system notification
//! entries are merged or dropped; anything unrecognized is kept.

use serde::{Deserialize, Serialize};

use crate::model::{HistoryEntry, RecordId, SYSTEM_AUTHOR, Status};

/// Default number of consolidated entries rendered.
pub const DEFAULT_CAP: usize = 50;

/// Phrase for merged notification pairs on an open ticket.
pub const CONFIRMATION_PHRASE: &str = "confirmation sent by email and messaging";
/// Phrase for merged notification pairs on a completed ticket.
pub const RESULT_PHRASE: &str = "result sent by email and messaging";

/// Per-channel messages written by the dispatcher that are noise once the
/// flags are visible.
const VERBOSE_TEMPLATES: &[&str] = &[
    "email sent to",
    "e-mail sent to",
    "message sent to",
    "messaging sent to",
    "whatsapp sent to",
    "sms sent to",
];

/// One rendered row, with the raw records it stands for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayEntry {
    #[serde(flatten)]
    pub entry: HistoryEntry,
    pub sources: Vec<RecordId>,
}

impl DisplayEntry {
    fn kept(entry: &HistoryEntry) -> Self {
        Self {
            entry: entry.clone(),
            sources: vec![entry.record_id.clone()],
        }
    }

    pub fn is_merged(&self) -> bool {
        self.sources.len() > 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidatedView {
    /// Most recent consolidated entries, oldest first.
    pub entries: Vec<DisplayEntry>,
    pub raw_len: usize,
    pub consolidated_len: usize,
    /// Consolidated entries left out by the cap.
    pub elided: usize,
}

impl ConsolidatedView {
    pub fn elided_notice(&self) -> Option<String> {
        (self.elided > 0).then(|| {
            format!(
                "{} earlier entries hidden ({} raw records in ledger)",
                self.elided, self.raw_len
            )
        })
    }
}

/// Derive the display view of `history`, keeping at most `cap` entries.
pub fn consolidate(history: &[HistoryEntry], cap: usize) -> ConsolidatedView {
    let mut out: Vec<DisplayEntry> = Vec::with_capacity(history.len());
    let mut i = 0;

    while i < history.len() {
        let entry = &history[i];

        // Real changes, attachments and anything a human wrote are kept as is.
        if entry.is_state_change() || entry.has_attachment() || !entry.is_system() {
            out.push(DisplayEntry::kept(entry));
            i += 1;
            continue;
        }

        // Same-status system entry from here on.
        if let Some(next) = history.get(i + 1)
            && complementary(entry, next)
        {
            out.push(merge(entry, next));
            i += 2;
            continue;
        }

        if is_consolidated_phrase(&entry.message) || !is_verbose_template(&entry.message) {
            out.push(DisplayEntry::kept(entry));
        }
        i += 1;
    }

    let consolidated_len = out.len();
    let elided = consolidated_len.saturating_sub(cap);
    out.drain(..elided);

    ConsolidatedView {
        entries: out,
        raw_len: history.len(),
        consolidated_len,
        elided,
    }
}

fn complementary(a: &HistoryEntry, b: &HistoryEntry) -> bool {
    b.is_system()
        && !b.is_state_change()
        && !b.has_attachment()
        && b.status_to == a.status_to
        && a.flags.single_channel()
        && b.flags.single_channel()
        && a.flags != b.flags
}

fn merge(a: &HistoryEntry, b: &HistoryEntry) -> DisplayEntry {
    let phrase = if a.status_to == Status::Concluido {
        RESULT_PHRASE
    } else {
        CONFIRMATION_PHRASE
    };
    let mut entry = a.clone();
    entry.author = SYSTEM_AUTHOR.to_string();
    entry.message = phrase.to_string();
    entry.flags = a.flags.union(b.flags);
    entry.at = b.at.max(a.at);
    DisplayEntry {
        entry,
        sources: vec![a.record_id.clone(), b.record_id.clone()],
    }
}

fn normalized(message: &str) -> String {
    message.trim().to_lowercase()
}

fn is_consolidated_phrase(message: &str) -> bool {
    let m = normalized(message);
    m.starts_with(CONFIRMATION_PHRASE) || m.starts_with(RESULT_PHRASE)
}

fn is_verbose_template(message: &str) -> bool {
    let m = normalized(message);
    VERBOSE_TEMPLATES.iter().any(|t| m.starts_with(t))
}
