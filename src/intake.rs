//! Intake Bridge: creates tickets from the public intake surface.
//!
//! Ids are assigned on this side so a draft keeps its identity across
//! retries. While the store is unreachable drafts wait in an outbox
//! (optionally mirrored to a JSON file); a flush first checks whether an
//! earlier attempt already landed, by id and then by code, before creating.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::client::TicketSource;
use crate::error::{Error, Result};
use crate::model::{NewTicket, Ticket, TicketCode, TicketId};

/// A draft waiting for the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingDraft {
    pub draft: NewTicket,
    pub queued_at: DateTime<Utc>,
    pub attempts: u32,
}

impl PendingDraft {
    /// Always set: ids are assigned before queueing.
    pub fn id(&self) -> Option<TicketId> {
        self.draft.id
    }

    pub fn code(&self) -> Option<&TicketCode> {
        self.draft.code.as_ref()
    }
}

/// Result of [`IntakeBridge::submit`].
#[derive(Debug, Clone)]
pub enum Submitted {
    Created(Ticket),
    /// Store unreachable; the draft is in the outbox.
    Queued {
        id: TicketId,
        code: Option<TicketCode>,
    },
}

#[derive(Debug, Default)]
pub struct FlushReport {
    pub created: Vec<Ticket>,
    /// Drafts an earlier attempt had already created.
    pub reconciled: Vec<Ticket>,
    /// Drafts the store refused. Dropped from the outbox.
    pub rejected: Vec<(TicketId, String)>,
    pub remaining: usize,
}

pub struct IntakeBridge {
    source: Arc<dyn TicketSource>,
    outbox: Mutex<VecDeque<PendingDraft>>,
    outbox_file: Option<PathBuf>,
}

impl IntakeBridge {
    pub fn new(source: Arc<dyn TicketSource>) -> Self {
        Self {
            source,
            outbox: Mutex::new(VecDeque::new()),
            outbox_file: None,
        }
    }

    /// Mirror the outbox to `path`, loading whatever a previous run left.
    pub async fn with_outbox_file(mut self, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let pending: VecDeque<PendingDraft> = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Config(format!("corrupt outbox {}: {e}", path.display())))?;
                info!(pending = pending.len(), path = %path.display(), "outbox restored");
                *self.outbox.get_mut() = pending;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.outbox_file = Some(path);
        Ok(self)
    }

    pub async fn pending(&self) -> Vec<PendingDraft> {
        self.outbox.lock().await.iter().cloned().collect()
    }

    /// Create a ticket, or queue the draft if the store is unreachable.
    pub async fn submit(&self, mut draft: NewTicket) -> Result<Submitted> {
        draft.validate()?;
        let id = *draft.id.get_or_insert_with(TicketId::new);

        if draft.code.is_none() {
            match self.source.generate_code().await {
                Ok(code) => draft.code = Some(code),
                Err(e) if e.is_transient() => {
                    debug!(error = %e, "code pre-allocation unavailable, store will assign");
                }
                Err(e) => return Err(e),
            }
        }

        match self.source.create(draft.clone()).await {
            Ok(ticket) => Ok(Submitted::Created(ticket)),
            Err(e) if e.is_transient() => {
                warn!(ticket_id = %id, error = %e, "store unreachable, draft queued");
                let code = draft.code.clone();
                self.enqueue(PendingDraft {
                    draft,
                    queued_at: Utc::now(),
                    attempts: 1,
                })
                .await?;
                Ok(Submitted::Queued { id, code })
            }
            Err(e) => Err(e),
        }
    }

    /// Retry every queued draft. Stops early if the store is still down.
    pub async fn flush(&self) -> Result<FlushReport> {
        let mut outbox = self.outbox.lock().await;
        let mut report = FlushReport::default();

        while let Some(mut pending) = outbox.pop_front() {
            pending.attempts += 1;
            match self.deliver(&mut pending).await {
                Ok(Delivered::Created(ticket)) => {
                    info!(ticket_id = %ticket.id, code = %ticket.code, "queued draft created");
                    report.created.push(ticket);
                }
                Ok(Delivered::AlreadyPresent(ticket)) => {
                    info!(ticket_id = %ticket.id, code = %ticket.code, "queued draft already in store");
                    report.reconciled.push(ticket);
                }
                Err(e) if e.is_transient() => {
                    debug!(error = %e, "store still unreachable");
                    outbox.push_front(pending);
                    break;
                }
                Err(e) => {
                    let id = pending.id().unwrap_or_default();
                    warn!(ticket_id = %id, error = %e, "queued draft rejected");
                    report.rejected.push((id, e.to_string()));
                }
            }
        }

        report.remaining = outbox.len();
        self.persist(&outbox).await?;
        Ok(report)
    }

    /// Flush on an interval until `shutdown` is notified.
    pub async fn run(&self, interval: Duration, shutdown: Arc<Notify>) {
        loop {
            tokio::select! {
                _ = shutdown.notified() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            if self.outbox.lock().await.is_empty() {
                continue;
            }
            match self.flush().await {
                Ok(report) if report.remaining > 0 => {
                    debug!(remaining = report.remaining, "outbox not drained");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "outbox flush failed"),
            }
        }
    }

    async fn deliver(&self, pending: &mut PendingDraft) -> Result<Delivered> {
        let id = pending
            .id()
            .ok_or_else(|| Error::Validation("queued draft without id".into()))?;

        match self.source.get(id).await {
            Ok(ticket) => return Ok(Delivered::AlreadyPresent(ticket)),
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        if let Some(code) = pending.code().cloned() {
            match self.source.find_by_code(&code).await? {
                Some(ticket) if ticket.id == id => return Ok(Delivered::AlreadyPresent(ticket)),
                Some(other) => {
                    warn!(%code, holder = %other.id, ticket_id = %id, "pre-allocated code taken, store will assign");
                    pending.draft.code = None;
                }
                None => {}
            }
        }

        self.source
            .create(pending.draft.clone())
            .await
            .map(Delivered::Created)
    }

    async fn enqueue(&self, pending: PendingDraft) -> Result<()> {
        let mut outbox = self.outbox.lock().await;
        outbox.push_back(pending);
        self.persist(&outbox).await
    }

    async fn persist(&self, outbox: &VecDeque<PendingDraft>) -> Result<()> {
        let Some(path) = &self.outbox_file else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(outbox)
            .map_err(|e| Error::Other(format!("cannot serialize outbox: {e}")))?;

        // Write aside and rename so a crash never leaves a truncated outbox.
        let temp = temp_path(path);
        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temp, path).await?;
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

enum Delivered {
    Created(Ticket),
    AlreadyPresent(Ticket),
}
