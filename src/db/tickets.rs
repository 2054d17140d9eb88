//! Postgres ticket repository.
//!
//! Tickets live in `tickets`, their ledger in `ticket_history` keyed by
//! `(ticket_id, position)`. Commits are conditional on the stored status, and
//! the ledger primary key rejects a second writer appending the same
//! position, so a racing commit fails instead of overwriting.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use super::Db;
use crate::attachment::EncodedAttachment;
use crate::error::{Error, Result};
use crate::model::*;
use crate::store::TicketRepository;

const TICKET_COLUMNS: &str = "id, code, person_type, certificate_type, priority, full_name, tax_id, \
     phone, email, birth_date, jurisdiction, status, assigned_operator, assigned_at, \
     completed_at, created_at, updated_at";

const HISTORY_COLUMNS: &str = "ticket_id, position, record_id, at, author, status_from, status_to, \
     message, email_sent, messaging_sent, attachment_name, attachment_type, attachment_locator";

/// [`TicketRepository`] over a shared [`Db`] pool.
#[derive(Clone)]
pub struct PgRepository {
    db: Db,
}

impl PgRepository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Read-only snapshot: ticket rows and their ledger are read as of one
    /// point, so a concurrent commit cannot split status from history.
    async fn snapshot(&self) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self.db.pool().begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    async fn history_for(
        tx: &mut Transaction<'_, Postgres>,
        ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Vec<HistoryEntry>>> {
        let rows: Vec<HistoryRow> = sqlx::query_as(&format!(
            "SELECT {HISTORY_COLUMNS} FROM ticket_history
             WHERE ticket_id = ANY($1) ORDER BY ticket_id, position"
        ))
        .bind(ids)
        .fetch_all(&mut **tx)
        .await?;

        let mut grouped: HashMap<Uuid, Vec<HistoryEntry>> = HashMap::new();
        for row in rows {
            let ticket_id = row.ticket_id;
            grouped
                .entry(ticket_id)
                .or_default()
                .push(row.try_into_entry()?);
        }
        Ok(grouped)
    }

    /// Attach ledgers to `rows` within the snapshot they were read in.
    async fn hydrate(
        mut tx: Transaction<'static, Postgres>,
        rows: Vec<TicketRow>,
    ) -> Result<Vec<Ticket>> {
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let mut histories = Self::history_for(&mut tx, &ids).await?;
        tx.commit().await?;
        rows.into_iter()
            .map(|row| {
                let history = histories.remove(&row.id).unwrap_or_default();
                row.try_into_ticket(history)
            })
            .collect()
    }
}

fn unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl TicketRepository for PgRepository {
    async fn next_code(&self) -> Result<TicketCode> {
        let (seq,): (i64,) = sqlx::query_as("SELECT nextval('ticket_code_seq')")
            .fetch_one(self.db.pool())
            .await?;
        Ok(TicketCode::from_seq(seq as u64))
    }

    async fn insert(&self, ticket: &Ticket) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;
        let c = &ticket.contact;
        let inserted = sqlx::query(&format!(
            "INSERT INTO tickets ({TICKET_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"
        ))
        .bind(ticket.id.0)
        .bind(ticket.code.as_str())
        .bind(ticket.person_type.to_string())
        .bind(&ticket.certificate_type)
        .bind(ticket.priority.to_string())
        .bind(&c.full_name)
        .bind(&c.tax_id)
        .bind(&c.phone)
        .bind(&c.email)
        .bind(&c.birth_date)
        .bind(&c.jurisdiction)
        .bind(ticket.status.as_str())
        .bind(&ticket.assigned_operator)
        .bind(ticket.assigned_at)
        .bind(ticket.completed_at)
        .bind(ticket.created_at)
        .bind(ticket.updated_at)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            return Err(if unique_violation(&e) {
                Error::Conflict(format!(
                    "ticket {} or code {} already exists",
                    ticket.id, ticket.code
                ))
            } else {
                e.into()
            });
        }

        // Pre-allocated codes must never be handed out again.
        if let Some(seq) = ticket.code.seq() {
            sqlx::query(
                "SELECT setval('ticket_code_seq', GREATEST($1, (SELECT last_value FROM ticket_code_seq)))",
            )
            .bind(seq as i64)
            .execute(&mut *tx)
            .await?;
        }

        for (position, entry) in ticket.history.iter().enumerate() {
            insert_entry(&mut tx, ticket.id, position, entry).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load(&self, id: TicketId) -> Result<Ticket> {
        let mut tx = self.snapshot().await?;
        let row: Option<TicketRow> =
            sqlx::query_as(&format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&mut *tx)
                .await?;
        let row = row.ok_or_else(|| Error::NotFound(format!("ticket {id}")))?;
        Self::hydrate(tx, vec![row])
            .await?
            .pop()
            .ok_or_else(|| Error::NotFound(format!("ticket {id}")))
    }

    async fn find_by_code(&self, code: &TicketCode) -> Result<Option<Ticket>> {
        let mut tx = self.snapshot().await?;
        let row: Option<TicketRow> =
            sqlx::query_as(&format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE code = $1"))
                .bind(code.as_str())
                .fetch_optional(&mut *tx)
                .await?;
        match row {
            Some(row) => Ok(Self::hydrate(tx, vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn list(&self, filter: &TicketFilter) -> Result<Vec<Ticket>> {
        let mut tx = self.snapshot().await?;
        let rows: Vec<TicketRow> = sqlx::query_as(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets
             WHERE ($1::text IS NULL OR status = $1)
               AND ($2::text IS NULL OR assigned_operator = $2)
             ORDER BY created_at"
        ))
        .bind(filter.status.map(Status::as_str))
        .bind(filter.operator.as_deref())
        .fetch_all(&mut *tx)
        .await?;
        Self::hydrate(tx, rows).await
    }

    async fn commit(
        &self,
        ticket: &Ticket,
        expected: Status,
        attachment: Option<&EncodedAttachment>,
    ) -> Result<()> {
        let Some(entry) = ticket.last_entry() else {
            return Err(Error::Validation("commit without a ledger entry".into()));
        };
        let position = ticket.history.len() - 1;
        let mut tx = self.db.pool().begin().await?;

        let rows_affected = sqlx::query(
            "UPDATE tickets
             SET status = $1, assigned_operator = $2, assigned_at = $3, completed_at = $4, updated_at = $5
             WHERE id = $6 AND status = $7",
        )
        .bind(ticket.status.as_str())
        .bind(&ticket.assigned_operator)
        .bind(ticket.assigned_at)
        .bind(ticket.completed_at)
        .bind(ticket.updated_at)
        .bind(ticket.id.0)
        .bind(expected.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            let stored: Option<(String,)> =
                sqlx::query_as("SELECT status FROM tickets WHERE id = $1")
                    .bind(ticket.id.0)
                    .fetch_optional(&mut *tx)
                    .await?;
            return match stored {
                Some((status,)) => Err(Error::InvalidTransition {
                    from: status.parse()?,
                    to: ticket.status,
                }),
                None => Err(Error::NotFound(format!("ticket {}", ticket.id))),
            };
        }

        if let Err(e) = insert_entry(&mut tx, ticket.id, position, entry).await {
            return Err(match e {
                Error::Database(ref db) if unique_violation(db) => Error::InvalidTransition {
                    from: expected,
                    to: ticket.status,
                },
                other => other,
            });
        }

        if let (Some(att), Some(reference)) = (attachment, &entry.attachment) {
            sqlx::query(
                "INSERT INTO ticket_attachments (locator, ticket_id, name, content_type, content, size)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(&reference.locator)
            .bind(ticket.id.0)
            .bind(&att.name)
            .bind(&att.content_type)
            .bind(&att.base64)
            .bind(att.size as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_attachment(&self, locator: &str) -> Result<EncodedAttachment> {
        let row: Option<(String, String, String, i64)> = sqlx::query_as(
            "SELECT name, content_type, content, size FROM ticket_attachments WHERE locator = $1",
        )
        .bind(locator)
        .fetch_optional(self.db.pool())
        .await?;
        let (name, content_type, base64, size) =
            row.ok_or_else(|| Error::NotFound(format!("attachment {locator}")))?;
        Ok(EncodedAttachment {
            name,
            content_type,
            base64,
            size: size as u64,
        })
    }

    async fn health_check(&self) -> Result<()> {
        self.db.health_check().await
    }
}

async fn insert_entry(
    tx: &mut Transaction<'_, Postgres>,
    ticket_id: TicketId,
    position: usize,
    entry: &HistoryEntry,
) -> Result<()> {
    let attachment = entry.attachment.as_ref();
    sqlx::query(&format!(
        "INSERT INTO ticket_history ({HISTORY_COLUMNS})
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
    ))
    .bind(ticket_id.0)
    .bind(position as i32)
    .bind(entry.record_id.as_str())
    .bind(entry.at)
    .bind(&entry.author)
    .bind(entry.status_from.as_str())
    .bind(entry.status_to.as_str())
    .bind(&entry.message)
    .bind(entry.flags.email_sent)
    .bind(entry.flags.messaging_sent)
    .bind(attachment.map(|a| a.name.as_str()))
    .bind(attachment.map(|a| a.content_type.as_str()))
    .bind(attachment.map(|a| a.locator.as_str()))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TicketRow {
    id: Uuid,
    code: String,
    person_type: String,
    certificate_type: String,
    priority: String,
    full_name: String,
    tax_id: String,
    phone: Option<String>,
    email: Option<String>,
    birth_date: Option<String>,
    jurisdiction: Option<String>,
    status: String,
    assigned_operator: Option<String>,
    assigned_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TicketRow {
    fn try_into_ticket(self, history: Vec<HistoryEntry>) -> Result<Ticket> {
        Ok(Ticket {
            id: TicketId(self.id),
            code: self.code.parse()?,
            person_type: self.person_type.parse()?,
            certificate_type: self.certificate_type,
            priority: self.priority.parse()?,
            contact: Contact {
                full_name: self.full_name,
                tax_id: self.tax_id,
                phone: self.phone,
                email: self.email,
                birth_date: self.birth_date,
                jurisdiction: self.jurisdiction,
            },
            status: self.status.parse()?,
            assigned_operator: self.assigned_operator,
            assigned_at: self.assigned_at,
            completed_at: self.completed_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            history,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    ticket_id: Uuid,
    #[allow(dead_code)] // ordering only
    position: i32,
    record_id: String,
    at: DateTime<Utc>,
    author: String,
    status_from: String,
    status_to: String,
    message: String,
    email_sent: bool,
    messaging_sent: bool,
    attachment_name: Option<String>,
    attachment_type: Option<String>,
    attachment_locator: Option<String>,
}

impl HistoryRow {
    fn try_into_entry(self) -> Result<HistoryEntry> {
        let attachment = match (
            self.attachment_name,
            self.attachment_type,
            self.attachment_locator,
        ) {
            (Some(name), Some(content_type), Some(locator)) => Some(AttachmentRef {
                name,
                content_type,
                locator,
            }),
            _ => None,
        };
        Ok(HistoryEntry {
            record_id: RecordId(self.record_id),
            at: self.at,
            author: self.author,
            status_from: self.status_from.parse()?,
            status_to: self.status_to.parse()?,
            message: self.message,
            flags: NotificationFlags {
                email_sent: self.email_sent,
                messaging_sent: self.messaging_sent,
            },
            attachment,
        })
    }
}
