//! Ticket store: the single authority for ticket state.
//!
//! All mutations are expressed as "apply this transition" (or an annotation /
//! administrative override) and go through here. Writes to one ticket are
//! serialized by a per-ticket lock; the repository additionally rejects a
//! commit whose expected prior state no longer matches, so a second process
//! racing the same ticket loses with `InvalidTransition` instead of
//! overwriting.

pub mod memory;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use opentelemetry::KeyValue;
use tokio::sync::{OwnedMutexGuard, broadcast};
use tracing::{Instrument, info, warn};

use crate::attachment::EncodedAttachment;
use crate::error::{Error, Result};
use crate::event::{EventKind, TicketEvent};
use crate::ledger::{self, EntryDraft};
use crate::model::*;
use crate::notify::{ChannelSelection, CompletionNotifier, DispatchReport, NotificationRequest};
use crate::telemetry::{metrics, spans};

pub use memory::MemoryRepository;

/// Persistence seam. Implementations: [`MemoryRepository`] and the Postgres
/// repository in [`crate::db`].
#[async_trait]
pub trait TicketRepository: Send + Sync {
    /// Allocate the next sequential code. Never hands out the same code twice.
    async fn next_code(&self) -> Result<TicketCode>;

    /// Insert a new ticket. `Conflict` if the id or code already exists.
    async fn insert(&self, ticket: &Ticket) -> Result<()>;

    async fn load(&self, id: TicketId) -> Result<Ticket>;

    async fn find_by_code(&self, code: &TicketCode) -> Result<Option<Ticket>>;

    async fn list(&self, filter: &TicketFilter) -> Result<Vec<Ticket>>;

    /// Persist the ticket's workflow fields and its newest ledger entry.
    ///
    /// Must fail with `InvalidTransition` when the stored status is not
    /// `expected` or the stored ledger is not exactly one entry shorter.
    async fn commit(
        &self,
        ticket: &Ticket,
        expected: Status,
        attachment: Option<&EncodedAttachment>,
    ) -> Result<()>;

    async fn load_attachment(&self, locator: &str) -> Result<EncodedAttachment>;

    async fn health_check(&self) -> Result<()>;
}

/// A requested status change.
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub status: Status,
    pub author: String,
    pub message: String,
    pub attachment: Option<EncodedAttachment>,
    /// Status the caller believes the ticket is in. A mismatch is rejected.
    pub expected_status: Option<Status>,
    /// Operator to assign when entering `EM_ATENDIMENTO`. Defaults to the author.
    pub assign_to: Option<String>,
}

impl TransitionRequest {
    pub fn new(status: Status, author: impl Into<String>) -> Self {
        Self {
            status,
            author: author.into(),
            message: String::new(),
            attachment: None,
            expected_status: None,
            assign_to: None,
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn attachment(mut self, attachment: EncodedAttachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    pub fn expect(mut self, status: Status) -> Self {
        self.expected_status = Some(status);
        self
    }

    pub fn assign_to(mut self, operator: impl Into<String>) -> Self {
        self.assign_to = Some(operator.into());
        self
    }
}

/// What an applied transition produced.
#[derive(Debug, Clone)]
pub struct Applied {
    pub ticket: Ticket,
    /// Present when the transition completed the ticket.
    pub dispatch: Option<DispatchReport>,
}

/// The ticket store. Owns the repository handle and the change stream.
pub struct TicketStore {
    repo: Arc<dyn TicketRepository>,
    notifier: Option<Arc<dyn CompletionNotifier>>,
    locks: Mutex<HashMap<TicketId, Arc<tokio::sync::Mutex<()>>>>,
    events: broadcast::Sender<TicketEvent>,
    seq: AtomicU64,
    timeout: Duration,
}

impl TicketStore {
    pub fn new(repo: Arc<dyn TicketRepository>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            repo,
            notifier: None,
            locks: Mutex::new(HashMap::new()),
            events,
            seq: AtomicU64::new(0),
            timeout: Duration::from_secs(5),
        }
    }

    /// Store backed by a fresh in-process repository (for tests and dev).
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryRepository::new()))
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn CompletionNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Deadline for each repository call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Subscribe to committed changes.
    pub fn subscribe(&self) -> broadcast::Receiver<TicketEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> broadcast::Sender<TicketEvent> {
        self.events.clone()
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get(&self, id: TicketId) -> Result<Ticket> {
        self.guarded(self.repo.load(id)).await
    }

    pub async fn find_by_code(&self, code: &TicketCode) -> Result<Option<Ticket>> {
        self.guarded(self.repo.find_by_code(code)).await
    }

    /// Tickets matching `filter`, premium first then oldest first.
    pub async fn list(&self, filter: &TicketFilter) -> Result<Vec<Ticket>> {
        let mut tickets = self.guarded(self.repo.list(filter)).await?;
        tickets.sort_by(queue_order);
        Ok(tickets)
    }

    pub async fn attachment(&self, locator: &str) -> Result<EncodedAttachment> {
        self.guarded(self.repo.load_attachment(locator)).await
    }

    pub async fn health_check(&self) -> Result<()> {
        self.guarded(self.repo.health_check()).await
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Pre-allocate a sequential code for offline-first intake.
    pub async fn generate_code(&self) -> Result<TicketCode> {
        self.guarded(self.repo.next_code()).await
    }

    /// Create a ticket in `GERAL` with an empty ledger.
    pub async fn create(&self, mut draft: NewTicket) -> Result<Ticket> {
        draft.validate()?;
        let id = draft.id.take().unwrap_or_default();
        let code = match draft.code.take() {
            Some(code) => code,
            None => self.guarded(self.repo.next_code()).await?,
        };

        let ticket = Ticket::from_draft(id, code, draft);
        self.guarded(self.repo.insert(&ticket)).await?;

        metrics::tickets_created().add(
            1,
            &[KeyValue::new("priority", ticket.priority.to_string())],
        );
        info!(ticket_id = %ticket.id, code = %ticket.code, "ticket created");
        self.emit(EventKind::TicketCreated {
            id: ticket.id,
            code: ticket.code.clone(),
        });
        Ok(ticket)
    }

    /// Apply a state-machine transition and append it to the ledger.
    ///
    /// Completing a ticket invokes the notifier before the commit: a failure
    /// after notifying leaves the caller unconfirmed and the retry may notify
    /// twice, but a confirmed completion has always been notified.
    pub async fn apply_transition(&self, id: TicketId, req: TransitionRequest) -> Result<Applied> {
        require_author(&req.author)?;
        let span = spans::start_transition_span(&id, req.status.as_str());
        let start = Instant::now();

        async {
            let _guard = self.lock(id).await;
            let mut ticket = self.guarded(self.repo.load(id)).await?;
            let from = ticket.status;

            if let Some(expected) = req.expected_status
                && expected != from
            {
                warn!(ticket_id = %id, %expected, actual = %from, "stale transition rejected");
                return Err(Error::InvalidTransition { from, to: req.status });
            }
            if !from.can_transition_to(req.status) {
                return Err(Error::InvalidTransition { from, to: req.status });
            }

            let attachment_ref = req
                .attachment
                .as_ref()
                .map(|a| attachment_ref(&ticket, a));

            let mut flags = NotificationFlags::NONE;
            let mut dispatch = None;
            if req.status == Status::Concluido
                && let Some(notifier) = &self.notifier
            {
                let report = notifier
                    .notify(NotificationRequest {
                        ticket: &ticket,
                        message: &req.message,
                        attachment: req.attachment.as_ref(),
                        channels: ChannelSelection::ALL,
                    })
                    .await;
                flags = report.flags();
                dispatch = Some(report);
            }

            if req.status == Status::EmAtendimento {
                ticket.assigned_operator =
                    Some(req.assign_to.clone().unwrap_or_else(|| req.author.clone()));
                ticket.assigned_at = Some(Utc::now());
            }

            ledger::append(
                &mut ticket,
                EntryDraft::new(&req.author, req.status)
                    .message(&req.message)
                    .flags(flags)
                    .attachment(attachment_ref),
            );
            self.guarded(self.repo.commit(&ticket, from, req.attachment.as_ref()))
                .await?;

            spans::record_transition(&tracing::Span::current(), from.as_str(), req.status.as_str());
            metrics::ticket_transitions().add(
                1,
                &[
                    KeyValue::new("from", from.as_str()),
                    KeyValue::new("to", req.status.as_str()),
                ],
            );
            metrics::operation_duration_ms().record(
                start.elapsed().as_secs_f64() * 1000.0,
                &[KeyValue::new("operation", "ticket.transition")],
            );
            info!(ticket_id = %id, code = %ticket.code, %from, to = %req.status, author = %req.author, "transition applied");

            self.emit(EventKind::StateTransition {
                id,
                from,
                to: req.status,
                author: req.author.clone(),
            });
            if let Some(report) = &dispatch {
                self.emit(EventKind::CompletionNotified {
                    id,
                    email_sent: report.email.is_sent(),
                    messaging_sent: report.messaging.is_sent(),
                });
            }

            Ok(Applied { ticket, dispatch })
        }
        .instrument(span)
        .await
    }

    /// Append a same-status entry (operator note, manual record).
    pub async fn annotate(
        &self,
        id: TicketId,
        author: &str,
        message: &str,
        attachment: Option<EncodedAttachment>,
    ) -> Result<Ticket> {
        require_author(author)?;
        if message.trim().is_empty() && attachment.is_none() {
            return Err(Error::Validation(
                "annotation needs a message or an attachment".into(),
            ));
        }

        let _guard = self.lock(id).await;
        let mut ticket = self.guarded(self.repo.load(id)).await?;
        let status = ticket.status;
        let attachment_ref = attachment.as_ref().map(|a| attachment_ref(&ticket, a));

        ledger::append(
            &mut ticket,
            EntryDraft::new(author, status)
                .message(message)
                .attachment(attachment_ref),
        );
        self.guarded(self.repo.commit(&ticket, status, attachment.as_ref()))
            .await?;

        self.emit(EventKind::EntryAppended {
            id,
            status,
            author: author.to_string(),
        });
        Ok(ticket)
    }

    /// Administrative edit: set any status, bypassing the edge table.
    ///
    /// Still appends to the ledger. Never notifies; re-notification after a
    /// re-opened ticket is completed again goes through the normal path.
    pub async fn admin_override(
        &self,
        id: TicketId,
        status: Status,
        author: &str,
        reason: &str,
    ) -> Result<Ticket> {
        require_author(author)?;
        if reason.trim().is_empty() {
            return Err(Error::Validation("override requires a reason".into()));
        }

        let _guard = self.lock(id).await;
        let mut ticket = self.guarded(self.repo.load(id)).await?;
        let from = ticket.status;

        ledger::append(
            &mut ticket,
            EntryDraft::new(author, status).message(format!("override: {reason}")),
        );
        self.guarded(self.repo.commit(&ticket, from, None)).await?;

        warn!(ticket_id = %id, code = %ticket.code, %from, to = %status, author, "administrative override");
        self.emit(EventKind::Override {
            id,
            from,
            to: status,
            author: author.to_string(),
        });
        Ok(ticket)
    }

    /// Re-send the completion notification of a `CONCLUIDO` ticket.
    ///
    /// Unless `force` is set, channels already delivered since the ticket
    /// entered `CONCLUIDO` are skipped. The attempt is recorded as a system
    /// entry carrying the resulting flags.
    pub async fn resend_completion(
        &self,
        id: TicketId,
        message: &str,
        attachment: Option<EncodedAttachment>,
        force: bool,
    ) -> Result<(Ticket, DispatchReport)> {
        let notifier = self
            .notifier
            .clone()
            .ok_or_else(|| Error::Config("no notification channels configured".into()))?;

        let _guard = self.lock(id).await;
        let mut ticket = self.guarded(self.repo.load(id)).await?;
        if ticket.status != Status::Concluido {
            return Err(Error::InvalidTransition {
                from: ticket.status,
                to: Status::Concluido,
            });
        }

        let delivered = delivered_since_completion(&ticket);
        let channels = if force {
            ChannelSelection::ALL
        } else {
            ChannelSelection {
                email: !delivered.email_sent,
                messaging: !delivered.messaging_sent,
            }
        };

        if !channels.any() {
            info!(ticket_id = %id, "all channels already delivered, nothing to resend");
            return Ok((ticket, DispatchReport::skipped("already delivered")));
        }

        let report = notifier
            .notify(NotificationRequest {
                ticket: &ticket,
                message,
                attachment: attachment.as_ref(),
                channels,
            })
            .await;

        let attachment_ref = attachment.as_ref().map(|a| attachment_ref(&ticket, a));
        let summary = report.summary(&ticket);
        ledger::append(
            &mut ticket,
            EntryDraft::new(SYSTEM_AUTHOR, Status::Concluido)
                .message(summary)
                .flags(report.flags())
                .attachment(attachment_ref),
        );
        self.guarded(self.repo.commit(&ticket, Status::Concluido, attachment.as_ref()))
            .await?;

        self.emit(EventKind::CompletionNotified {
            id,
            email_sent: report.email.is_sent(),
            messaging_sent: report.messaging.is_sent(),
        });
        Ok((ticket, report))
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn lock(&self, id: TicketId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            if locks.len() > 1024 {
                locks.retain(|_, l| Arc::strong_count(l) > 1);
            }
            Arc::clone(locks.entry(id).or_default())
        };
        lock.lock_owned().await
    }

    async fn guarded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::StorageUnavailable(format!(
                "repository call timed out after {:?}",
                self.timeout
            ))),
        }
    }

    fn emit(&self, kind: EventKind) {
        let event = TicketEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            timestamp: Utc::now(),
            kind,
        };
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn require_author(author: &str) -> Result<()> {
    if author.trim().is_empty() {
        return Err(Error::Validation("author is required".into()));
    }
    Ok(())
}

fn attachment_ref(ticket: &Ticket, attachment: &EncodedAttachment) -> AttachmentRef {
    AttachmentRef {
        name: attachment.name.clone(),
        content_type: attachment.content_type.clone(),
        locator: format!("{}/{:04}/{}", ticket.id, ticket.history.len(), attachment.name),
    }
}

/// Union of channel flags recorded since the ticket last entered `CONCLUIDO`.
fn delivered_since_completion(ticket: &Ticket) -> NotificationFlags {
    let mut flags = NotificationFlags::NONE;
    for entry in ticket.history.iter().rev() {
        flags = flags.union(entry.flags);
        if entry.status_to == Status::Concluido && entry.is_state_change() {
            break;
        }
    }
    flags
}
