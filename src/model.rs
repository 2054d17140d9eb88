//! Core data model.
//!
//! A ticket is one certificate request tracked from intake to completion. It has
//! identity (opaque id + human-facing code), classification, contact data owned
//! by the intake surface, workflow state, and an append-only history ledger.

pub mod history;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

pub use history::{AttachmentRef, HistoryEntry, NotificationFlags, RecordId, SYSTEM_AUTHOR};

// ---------------------------------------------------------------------------
// Ticket
// ---------------------------------------------------------------------------

/// A certificate request tracked by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub id: TicketId,

    /// Sequential human-facing code (`TK-001`). Immutable once assigned.
    pub code: TicketCode,

    pub person_type: PersonType,
    pub certificate_type: String,
    pub priority: PriorityTier,

    #[serde(flatten)]
    pub contact: Contact,

    pub status: Status,
    pub assigned_operator: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    /// Set if and only if `status == Concluido`.
    pub completed_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Append-only. Never reordered or truncated.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl Ticket {
    /// Build a fresh ticket from an intake draft.
    pub fn from_draft(id: TicketId, code: TicketCode, draft: NewTicket) -> Self {
        let now = Utc::now();
        Self {
            id,
            code,
            person_type: draft.person_type,
            certificate_type: draft.certificate_type,
            priority: draft.priority,
            contact: draft.contact,
            status: Status::Geral,
            assigned_operator: None,
            assigned_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        }
    }

    /// Most recent ledger entry, if any.
    pub fn last_entry(&self) -> Option<&HistoryEntry> {
        self.history.last()
    }

    /// Status obtained by replaying the ledger from the initial state.
    pub fn replayed_status(&self) -> Status {
        self.history
            .iter()
            .fold(Status::Geral, |_, entry| entry.status_to)
    }

    /// Check the structural invariants that tie status, ledger and completion time.
    pub fn check_invariants(&self) -> Result<()> {
        if let Some(last) = self.last_entry()
            && last.status_to != self.status
        {
            return Err(Error::Other(format!(
                "ticket {} status {} disagrees with ledger head {}",
                self.code, self.status, last.status_to
            )));
        }
        if self.completed_at.is_some() != (self.status == Status::Concluido) {
            return Err(Error::Other(format!(
                "ticket {} completed_at inconsistent with status {}",
                self.code, self.status
            )));
        }
        Ok(())
    }
}

/// Newtype for ticket IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(pub Uuid);

impl TicketId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TicketId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TicketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TicketId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(TicketId)
            .map_err(|e| Error::Validation(format!("invalid ticket id '{s}': {e}")))
    }
}

/// Sequential human-facing code, `TK-###`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TicketCode(String);

impl TicketCode {
    pub const PREFIX: &'static str = "TK-";

    pub fn from_seq(seq: u64) -> Self {
        Self(format!("{}{seq:03}", Self::PREFIX))
    }

    /// Numeric part of the code.
    pub fn seq(&self) -> Option<u64> {
        self.0.strip_prefix(Self::PREFIX)?.parse().ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TicketCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

impl std::str::FromStr for TicketCode {
    type Err = Error;

    /// `TK-` and at least three digits, case-insensitive.
    fn from_str(s: &str) -> Result<Self> {
        let code = Self(s.trim().to_uppercase());
        let well_formed = code
            .0
            .strip_prefix(Self::PREFIX)
            .is_some_and(|digits| digits.len() >= 3 && digits.bytes().all(|b| b.is_ascii_digit()));
        if !well_formed || code.seq().is_none() {
            return Err(Error::Validation(format!("invalid ticket code '{s}'")));
        }
        Ok(code)
    }
}

impl TryFrom<String> for TicketCode {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<TicketCode> for String {
    fn from(code: TicketCode) -> Self {
        code.0
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Workflow status of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Intake, unassigned.
    Geral,
    /// Queued for an operator.
    EmOperacao,
    /// Actively worked by an operator.
    EmAtendimento,
    /// Waiting for information from the customer.
    AguardandoInfo,
    /// Waiting on payment.
    Financeiro,
    /// Done. Terminal for the operator workflow.
    Concluido,
}

impl Status {
    pub const ALL: [Status; 6] = [
        Status::Geral,
        Status::EmOperacao,
        Status::EmAtendimento,
        Status::AguardandoInfo,
        Status::Financeiro,
        Status::Concluido,
    ];

    /// Can transition from self to `to` in the normal operator workflow?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        match (self, to) {
            (Concluido, _) => false,
            (_, Concluido) => true,
            _ => matches!(
                (self, to),
                (Geral, EmOperacao)
                    | (Geral, EmAtendimento)    // direct assignment
                    | (EmOperacao, EmAtendimento)
                    | (EmAtendimento, AguardandoInfo)
                    | (AguardandoInfo, EmAtendimento)
                    | (EmAtendimento, Financeiro)
                    | (Financeiro, EmAtendimento)
            ),
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Status::Concluido
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Geral => "GERAL",
            Status::EmOperacao => "EM_OPERACAO",
            Status::EmAtendimento => "EM_ATENDIMENTO",
            Status::AguardandoInfo => "AGUARDANDO_INFO",
            Status::Financeiro => "FINANCEIRO",
            Status::Concluido => "CONCLUIDO",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_uppercase();
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == upper)
            .ok_or_else(|| Error::Validation(format!("unknown status: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonType {
    Individual,
    Organization,
}

impl std::fmt::Display for PersonType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            PersonType::Individual => "individual",
            PersonType::Organization => "organization",
        })
    }
}

impl std::str::FromStr for PersonType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "individual" => Ok(PersonType::Individual),
            "organization" => Ok(PersonType::Organization),
            _ => Err(Error::Validation(format!("unknown person type: {s}"))),
        }
    }
}

/// Priority tier. Affects ordering and billing, never processing logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityTier {
    #[default]
    Standard,
    Priority,
    Premium,
}

impl PriorityTier {
    /// Higher = served first.
    pub fn rank(self) -> u8 {
        match self {
            PriorityTier::Standard => 0,
            PriorityTier::Priority => 1,
            PriorityTier::Premium => 2,
        }
    }
}

impl std::fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            PriorityTier::Standard => "standard",
            PriorityTier::Priority => "priority",
            PriorityTier::Premium => "premium",
        })
    }
}

impl std::str::FromStr for PriorityTier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "standard" => Ok(PriorityTier::Standard),
            "priority" => Ok(PriorityTier::Priority),
            "premium" => Ok(PriorityTier::Premium),
            _ => Err(Error::Validation(format!("unknown priority tier: {s}"))),
        }
    }
}

/// Contact data captured at intake. Free-form; only presence is checked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub full_name: String,
    pub tax_id: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub birth_date: Option<String>,
    pub jurisdiction: Option<String>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Intake draft. The store's public API for creating tickets.
///
/// `id` and `code` may be pre-allocated by offline-first intake flows; the
/// store assigns both when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTicket {
    #[serde(default)]
    pub id: Option<TicketId>,
    #[serde(default)]
    pub code: Option<TicketCode>,
    pub person_type: PersonType,
    pub certificate_type: String,
    #[serde(default)]
    pub priority: PriorityTier,
    #[serde(flatten)]
    pub contact: Contact,
}

impl NewTicket {
    pub fn new(
        person_type: PersonType,
        certificate_type: impl Into<String>,
        full_name: impl Into<String>,
        tax_id: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            code: None,
            person_type,
            certificate_type: certificate_type.into(),
            priority: PriorityTier::Standard,
            contact: Contact {
                full_name: full_name.into(),
                tax_id: tax_id.into(),
                ..Contact::default()
            },
        }
    }

    pub fn priority(mut self, priority: PriorityTier) -> Self {
        self.priority = priority;
        self
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.contact.email = Some(email.into());
        self
    }

    pub fn phone(mut self, phone: impl Into<String>) -> Self {
        self.contact.phone = Some(phone.into());
        self
    }

    pub fn birth_date(mut self, birth_date: impl Into<String>) -> Self {
        self.contact.birth_date = Some(birth_date.into());
        self
    }

    pub fn jurisdiction(mut self, jurisdiction: impl Into<String>) -> Self {
        self.contact.jurisdiction = Some(jurisdiction.into());
        self
    }

    pub fn with_id(mut self, id: TicketId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_code(mut self, code: TicketCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Presence check of required fields.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("fullName", self.contact.full_name.as_str()),
            ("taxId", self.contact.tax_id.as_str()),
            ("certificateType", self.certificate_type.as_str()),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(Error::Validation(format!("{field} is required")));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// List filter. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketFilter {
    pub status: Option<Status>,
    pub operator: Option<String>,
}

impl TicketFilter {
    pub fn status(status: Status) -> Self {
        Self {
            status: Some(status),
            operator: None,
        }
    }

    pub fn matches(&self, ticket: &Ticket) -> bool {
        self.status.is_none_or(|s| s == ticket.status)
            && self
                .operator
                .as_deref()
                .is_none_or(|op| ticket.assigned_operator.as_deref() == Some(op))
    }

    /// Stable key for caching filtered views.
    pub fn cache_key(&self) -> String {
        format!(
            "tickets:{}:{}",
            self.status.map(Status::as_str).unwrap_or("*"),
            self.operator.as_deref().unwrap_or("*")
        )
    }
}

/// Queue ordering: premium first, then oldest first.
pub fn queue_order(a: &Ticket, b: &Ticket) -> std::cmp::Ordering {
    b.priority
        .rank()
        .cmp(&a.priority.rank())
        .then(a.created_at.cmp(&b.created_at))
        .then(a.code.seq().cmp(&b.code.seq()))
}
