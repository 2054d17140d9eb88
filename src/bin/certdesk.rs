//! certdesk CLI: run the ticket store, or operate on it over HTTP.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use certdesk::api::{self, AppState};
use certdesk::attachment::AttachmentEncoder;
use certdesk::client::{ApiClient, TicketSource};
use certdesk::config::Config;
use certdesk::db::{Db, PgRepository};
use certdesk::intake::{IntakeBridge, Submitted};
use certdesk::model::*;
use certdesk::notify::{
    DispatchReport, Dispatcher, EmailChannel, MessagingChannel, NotificationPolicy,
};
use certdesk::store::{MemoryRepository, TicketRepository, TicketStore, TransitionRequest};
use certdesk::sync::{MemoryCache, SyncClient, SyncConfig, ViewSource};
use certdesk::telemetry::{TelemetryConfig, init_telemetry};
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use tracing::info;

#[derive(Parser)]
#[command(name = "certdesk", about = "Certificate request desk")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the ticket store HTTP service
    Serve,
    /// Ticket operations against a running store
    Ticket {
        #[command(subcommand)]
        action: TicketAction,
    },
    /// Show the consolidated history of a ticket
    History {
        /// Ticket id or code (TK-001)
        ticket: String,
        /// Most recent entries to show
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Run a sync client and log view changes until ctrl-c
    Sync {
        #[arg(long)]
        status: Option<Status>,
        #[arg(long)]
        operator: Option<String>,
    },
}

#[derive(Subcommand)]
enum TicketAction {
    /// List tickets, premium first
    List {
        #[arg(long)]
        status: Option<Status>,
        #[arg(long)]
        operator: Option<String>,
    },
    /// Show one ticket
    Show { ticket: String },
    /// Create a ticket
    Create {
        #[arg(long, default_value = "individual")]
        person_type: PersonType,
        #[arg(long)]
        certificate: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        tax_id: String,
        #[arg(long, default_value = "standard")]
        priority: PriorityTier,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        /// Queue the draft in this file if the store is unreachable
        #[arg(long)]
        outbox: Option<PathBuf>,
    },
    /// Retry drafts queued in an outbox file
    Flush { outbox: PathBuf },
    /// Apply a status transition
    Transition {
        ticket: String,
        status: Status,
        #[arg(long)]
        author: String,
        #[arg(long, default_value = "")]
        message: String,
        /// Reject if the ticket is no longer in this status
        #[arg(long)]
        expect: Option<Status>,
        #[arg(long)]
        assign_to: Option<String>,
        /// File to attach
        #[arg(long)]
        attach: Option<PathBuf>,
        #[arg(long, default_value = "application/pdf")]
        content_type: String,
    },
    /// Complete a ticket and notify the customer
    Complete {
        ticket: String,
        #[arg(long)]
        author: String,
        #[arg(long, default_value = "")]
        message: String,
        #[arg(long)]
        attach: Option<PathBuf>,
        #[arg(long, default_value = "application/pdf")]
        content_type: String,
    },
    /// Re-send the completion notice of a completed ticket
    Resend {
        ticket: String,
        #[arg(long, default_value = "")]
        message: String,
        /// Also re-send channels that already succeeded
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(
        TelemetryConfig::new("certdesk")
            .with_endpoint(config.otel_endpoint.clone())
            .with_default_level(&config.log_level),
    )?;

    match cli.command {
        Command::Serve => cmd_serve(&config).await,
        Command::Ticket { action } => {
            let client = ApiClient::new(&config.api_url, config.api_key.clone())?;
            let encoder = AttachmentEncoder::with_max_bytes(config.attachment_max_bytes);
            cmd_ticket(&client, &encoder, action).await
        }
        Command::History { ticket, limit } => {
            let client = ApiClient::new(&config.api_url, config.api_key.clone())?;
            cmd_history(&client, &ticket, limit).await
        }
        Command::Sync { status, operator } => cmd_sync(&config, status, operator).await,
    }
}

async fn cmd_serve(config: &Config) -> anyhow::Result<()> {
    let repo: Arc<dyn TicketRepository> = match &config.database_url {
        Some(url) => {
            let db = Db::connect(url.expose_secret()).await?;
            db.migrate().await?;
            Arc::new(PgRepository::new(db))
        }
        None => {
            info!("DATABASE_URL not set, using in-process repository");
            Arc::new(MemoryRepository::new())
        }
    };

    let policy = match &config.notify_policy {
        Some(path) => NotificationPolicy::load(path)?,
        None => NotificationPolicy::default(),
    };
    let http = reqwest::Client::new();
    let mut dispatcher = Dispatcher::new(policy);
    if let Some(email) = &config.email {
        dispatcher = dispatcher.with_email(EmailChannel::new(
            http.clone(),
            &email.url,
            email.api_key.clone(),
            &config.email_from,
        ));
    }
    if let Some(messaging) = &config.messaging {
        dispatcher = dispatcher.with_messaging(MessagingChannel::standard(
            http.clone(),
            &messaging.url,
            &messaging.api_key,
        ));
    }

    let store = TicketStore::new(repo)
        .with_notifier(Arc::new(dispatcher))
        .with_timeout(config.store_timeout);
    let state = AppState::new(Arc::new(store), config.api_key.clone())
        .with_encoder(AttachmentEncoder::with_max_bytes(config.attachment_max_bytes));

    api::serve(&config.bind_addr, Arc::new(state)).await?;
    Ok(())
}

/// Accept a UUID or a `TK-` code.
async fn resolve(client: &ApiClient, ticket: &str) -> anyhow::Result<TicketId> {
    if let Ok(id) = ticket.parse::<TicketId>() {
        return Ok(id);
    }
    let code: TicketCode = ticket.parse()?;
    let found = client
        .find_by_code(&code)
        .await?
        .with_context(|| format!("no ticket with code {code}"))?;
    Ok(found.id)
}

async fn attachment(
    encoder: &AttachmentEncoder,
    path: Option<&Path>,
    content_type: &str,
) -> anyhow::Result<Option<certdesk::attachment::EncodedAttachment>> {
    match path {
        Some(path) => Ok(Some(encoder.encode_file(path, content_type).await?)),
        None => Ok(None),
    }
}

async fn cmd_ticket(
    client: &ApiClient,
    encoder: &AttachmentEncoder,
    action: TicketAction,
) -> anyhow::Result<()> {
    match action {
        TicketAction::List { status, operator } => {
            let tickets = client.list(&TicketFilter { status, operator }).await?;
            print_list(&tickets);
        }
        TicketAction::Show { ticket } => {
            let id = resolve(client, &ticket).await?;
            print_ticket(&client.get(id).await?);
        }
        TicketAction::Create {
            person_type,
            certificate,
            name,
            tax_id,
            priority,
            email,
            phone,
            outbox,
        } => {
            let mut draft =
                NewTicket::new(person_type, certificate, name, tax_id).priority(priority);
            if let Some(email) = email {
                draft = draft.email(email);
            }
            if let Some(phone) = phone {
                draft = draft.phone(phone);
            }
            let Some(outbox) = outbox else {
                let ticket = client.create(draft).await?;
                println!("Created: {} ({})", ticket.code, ticket.id);
                return Ok(());
            };
            let bridge = IntakeBridge::new(Arc::new(client.clone()))
                .with_outbox_file(outbox)
                .await?;
            match bridge.submit(draft).await? {
                Submitted::Created(ticket) => println!("Created: {} ({})", ticket.code, ticket.id),
                Submitted::Queued { id, code } => println!(
                    "Store unreachable, queued: {} ({id})",
                    code.map(|c| c.to_string()).unwrap_or_else(|| "no code yet".into())
                ),
            }
        }
        TicketAction::Flush { outbox } => {
            let bridge = IntakeBridge::new(Arc::new(client.clone()))
                .with_outbox_file(outbox)
                .await?;
            let report = bridge.flush().await?;
            for ticket in &report.created {
                println!("Created: {} ({})", ticket.code, ticket.id);
            }
            for ticket in &report.reconciled {
                println!("Already present: {} ({})", ticket.code, ticket.id);
            }
            for (id, reason) in &report.rejected {
                println!("Rejected: {id}: {reason}");
            }
            println!("{} still queued", report.remaining);
        }
        TicketAction::Transition {
            ticket,
            status,
            author,
            message,
            expect,
            assign_to,
            attach,
            content_type,
        } => {
            let id = resolve(client, &ticket).await?;
            let mut req = TransitionRequest::new(status, author).message(message);
            if let Some(expected) = expect {
                req = req.expect(expected);
            }
            if let Some(operator) = assign_to {
                req = req.assign_to(operator);
            }
            if let Some(att) = attachment(encoder, attach.as_deref(), &content_type).await? {
                req = req.attachment(att);
            }
            let ticket = client.apply_transition(id, req).await?;
            println!("{}: {}", ticket.code, ticket.status);
        }
        TicketAction::Complete {
            ticket,
            author,
            message,
            attach,
            content_type,
        } => {
            let id = resolve(client, &ticket).await?;
            let mut req = TransitionRequest::new(Status::Concluido, author).message(message);
            if let Some(att) = attachment(encoder, attach.as_deref(), &content_type).await? {
                req = req.attachment(att);
            }
            let resp = client.transition(id, req).await?;
            println!("{}: {}", resp.ticket.code, resp.ticket.status);
            match &resp.notification {
                Some(report) => print_report(report),
                None => println!("  no notification dispatched"),
            }
        }
        TicketAction::Resend {
            ticket,
            message,
            force,
        } => {
            let id = resolve(client, &ticket).await?;
            let report = client.send_completion(id, &message, None, force).await?;
            print_report(&report);
        }
    }
    Ok(())
}

fn print_report(report: &DispatchReport) {
    println!("  email:     {}", report.email);
    println!("  messaging: {}", report.messaging);
}

async fn cmd_history(client: &ApiClient, ticket: &str, limit: Option<usize>) -> anyhow::Result<()> {
    let id = resolve(client, ticket).await?;
    let view = client.history(id, limit).await?;
    if let Some(notice) = view.elided_notice() {
        println!("({notice})");
    }
    for entry in &view.entries {
        let e = &entry.entry;
        let flags = match (e.flags.email_sent, e.flags.messaging_sent) {
            (true, true) => " [email+messaging]",
            (true, false) => " [email]",
            (false, true) => " [messaging]",
            (false, false) => "",
        };
        println!(
            "{}  {:<16} {} -> {}{}  {}",
            e.at.format("%Y-%m-%d %H:%M"),
            e.author,
            e.status_from,
            e.status_to,
            flags,
            e.message
        );
    }
    Ok(())
}

async fn cmd_sync(
    config: &Config,
    status: Option<Status>,
    operator: Option<String>,
) -> anyhow::Result<()> {
    let client = ApiClient::new(&config.api_url, config.api_key.clone())?;
    let sync = SyncClient::new(
        Arc::new(client),
        SyncConfig {
            interval: config.sync_interval,
            filter: TicketFilter { status, operator },
            ..SyncConfig::default()
        },
    )
    .with_cache(Arc::new(MemoryCache::default()));

    let first = sync.start().await;
    info!(outcome = ?first, "sync client started");

    let mut last: Vec<(TicketId, Status, usize)> = Vec::new();
    let mut ticks = tokio::time::interval(config.sync_interval);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticks.tick() => {}
        }
        let view = sync.snapshot().await;
        let current: Vec<_> = view
            .tickets
            .iter()
            .map(|t| (t.id, t.status, t.history.len()))
            .collect();
        if current != last {
            info!(
                tickets = current.len(),
                source = ?view.source,
                stale = view.source != ViewSource::Live,
                "view changed"
            );
            print_list(&view.tickets);
            last = current;
        }
    }
    sync.stop();
    Ok(())
}

fn print_list(tickets: &[Ticket]) {
    if tickets.is_empty() {
        println!("No tickets found.");
        return;
    }
    println!(
        "{:<8}  {:<15}  {:<9}  {:<24}  {:<16}  CREATED",
        "CODE", "STATUS", "PRIORITY", "NAME", "OPERATOR"
    );
    println!("{}", "-".repeat(96));
    for t in tickets {
        println!(
            "{:<8}  {:<15}  {:<9}  {:<24}  {:<16}  {}",
            t.code,
            t.status,
            t.priority,
            t.contact.full_name.chars().take(24).collect::<String>(),
            t.assigned_operator.as_deref().unwrap_or("-"),
            t.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!("\n{} ticket(s)", tickets.len());
}

fn print_ticket(t: &Ticket) {
    println!("ID:          {}", t.id);
    println!("Code:        {}", t.code);
    println!("Status:      {}", t.status);
    println!("Priority:    {}", t.priority);
    println!("Certificate: {} ({})", t.certificate_type, t.person_type);
    println!("Name:        {}", t.contact.full_name);
    println!("Tax ID:      {}", t.contact.tax_id);
    println!("Email:       {}", t.contact.email.as_deref().unwrap_or("-"));
    println!("Phone:       {}", t.contact.phone.as_deref().unwrap_or("-"));
    println!(
        "Operator:    {}",
        t.assigned_operator.as_deref().unwrap_or("-")
    );
    println!("Created:     {}", t.created_at);
    if let Some(completed) = t.completed_at {
        println!("Completed:   {completed}");
    }
    println!("History:     {} entries", t.history.len());
}
