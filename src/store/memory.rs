//! In-process repository. Used by tests and by `serve` when no database is
//! configured.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::TicketRepository;
use crate::attachment::EncodedAttachment;
use crate::error::{Error, Result};
use crate::model::*;

#[derive(Default)]
struct Tables {
    tickets: HashMap<TicketId, Ticket>,
    codes: HashMap<TicketCode, TicketId>,
    attachments: HashMap<String, EncodedAttachment>,
}

pub struct MemoryRepository {
    tables: RwLock<Tables>,
    /// Last code handed out. Guarded so concurrent allocations never collide.
    code_seq: Mutex<u64>,
    available: AtomicBool,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            code_seq: Mutex::new(0),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every call fails with `StorageUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::StorageUnavailable("repository offline".into()))
        }
    }

    fn bump_code_seq(&self, seen: u64) {
        let mut seq = self.code_seq.lock().unwrap_or_else(|p| p.into_inner());
        *seq = (*seq).max(seen);
    }
}

#[async_trait]
impl TicketRepository for MemoryRepository {
    async fn next_code(&self) -> Result<TicketCode> {
        self.check_available()?;
        let mut seq = self.code_seq.lock().unwrap_or_else(|p| p.into_inner());
        *seq += 1;
        Ok(TicketCode::from_seq(*seq))
    }

    async fn insert(&self, ticket: &Ticket) -> Result<()> {
        self.check_available()?;
        let mut tables = self.tables.write().await;
        if tables.tickets.contains_key(&ticket.id) {
            return Err(Error::Conflict(format!("ticket {} already exists", ticket.id)));
        }
        if tables.codes.contains_key(&ticket.code) {
            return Err(Error::Conflict(format!("code {} already assigned", ticket.code)));
        }
        if let Some(seq) = ticket.code.seq() {
            self.bump_code_seq(seq);
        }
        tables.codes.insert(ticket.code.clone(), ticket.id);
        tables.tickets.insert(ticket.id, ticket.clone());
        Ok(())
    }

    async fn load(&self, id: TicketId) -> Result<Ticket> {
        self.check_available()?;
        self.tables
            .read()
            .await
            .tickets
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("ticket {id}")))
    }

    async fn find_by_code(&self, code: &TicketCode) -> Result<Option<Ticket>> {
        self.check_available()?;
        let tables = self.tables.read().await;
        Ok(tables
            .codes
            .get(code)
            .and_then(|id| tables.tickets.get(id))
            .cloned())
    }

    async fn list(&self, filter: &TicketFilter) -> Result<Vec<Ticket>> {
        self.check_available()?;
        Ok(self
            .tables
            .read()
            .await
            .tickets
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect())
    }

    async fn commit(
        &self,
        ticket: &Ticket,
        expected: Status,
        attachment: Option<&EncodedAttachment>,
    ) -> Result<()> {
        self.check_available()?;
        let mut tables = self.tables.write().await;
        let stored = tables
            .tickets
            .get(&ticket.id)
            .ok_or_else(|| Error::NotFound(format!("ticket {}", ticket.id)))?;

        if stored.status != expected || stored.history.len() + 1 != ticket.history.len() {
            return Err(Error::InvalidTransition {
                from: stored.status,
                to: ticket.status,
            });
        }

        if let (Some(att), Some(entry)) = (attachment, ticket.last_entry())
            && let Some(reference) = &entry.attachment
        {
            tables
                .attachments
                .insert(reference.locator.clone(), att.clone());
        }
        tables.tickets.insert(ticket.id, ticket.clone());
        Ok(())
    }

    async fn load_attachment(&self, locator: &str) -> Result<EncodedAttachment> {
        self.check_available()?;
        self.tables
            .read()
            .await
            .attachments
            .get(locator)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("attachment {locator}")))
    }

    async fn health_check(&self) -> Result<()> {
        self.check_available()
    }
}
