//! Completion notification dispatch over email and messaging.
//!
//! The dispatcher is stateless apart from the messaging adapter cache and
//! safe to re-invoke. Each channel runs under its own deadline, concurrently,
//! and reports independently; a failed channel never affects the other or
//! the already-decided ticket transition.

pub mod email;
pub mod messaging;
pub mod policy;

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{Instrument, info, warn};

use crate::attachment::EncodedAttachment;
use crate::ledger::consolidate::RESULT_PHRASE;
use crate::model::{NotificationFlags, Ticket};
use crate::telemetry::{metrics, spans};

pub use email::EmailChannel;
pub use messaging::{
    AuthStyle, Delivery, MessagingChannel, MessagingProvider, OutboundMessage, PayloadStyle,
    WireShape,
};
pub use policy::NotificationPolicy;

/// Per-channel delivery failure. Folded into the report, never raised.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider rejected request with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("all {attempts} wire formats failed; last ({last_variant}): {last_error}")]
    AllVariantsFailed {
        attempts: usize,
        last_variant: String,
        last_error: Box<ChannelError>,
    },
}

impl ChannelError {
    /// Short tag operators can act on.
    pub fn cause(&self) -> &'static str {
        match self {
            ChannelError::Transport(_) => "transport",
            ChannelError::Rejected { .. } => "rejected",
            ChannelError::Timeout(_) => "timeout",
            ChannelError::AllVariantsFailed { .. } => "all_variants_failed",
        }
    }
}

impl From<reqwest::Error> for ChannelError {
    fn from(e: reqwest::Error) -> Self {
        ChannelError::Transport(e.to_string())
    }
}

/// Provider acknowledgement of a delivered message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Receipt {
    pub provider_id: Option<String>,
}

/// Which channels a dispatch should attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSelection {
    pub email: bool,
    pub messaging: bool,
}

impl ChannelSelection {
    pub const ALL: ChannelSelection = ChannelSelection {
        email: true,
        messaging: true,
    };

    pub fn any(self) -> bool {
        self.email || self.messaging
    }
}

/// Input to a completion notification.
#[derive(Debug, Clone, Copy)]
pub struct NotificationRequest<'a> {
    pub ticket: &'a Ticket,
    /// Free-text interaction message from the operator.
    pub message: &'a str,
    pub attachment: Option<&'a EncodedAttachment>,
    pub channels: ChannelSelection,
}

/// Outcome of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ChannelOutcome {
    Sent {
        #[serde(skip_serializing_if = "Option::is_none")]
        provider_id: Option<String>,
        /// Wire format that was accepted (messaging only).
        #[serde(skip_serializing_if = "Option::is_none")]
        variant: Option<String>,
        attempts: usize,
    },
    Skipped {
        reason: String,
    },
    Failed {
        cause: String,
        error: String,
    },
}

impl ChannelOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        ChannelOutcome::Skipped {
            reason: reason.into(),
        }
    }

    fn failed(err: &ChannelError) -> Self {
        ChannelOutcome::Failed {
            cause: err.cause().to_string(),
            error: err.to_string(),
        }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, ChannelOutcome::Sent { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ChannelOutcome::Failed { .. })
    }

    fn label(&self) -> &'static str {
        match self {
            ChannelOutcome::Sent { .. } => "sent",
            ChannelOutcome::Skipped { .. } => "skipped",
            ChannelOutcome::Failed { .. } => "failed",
        }
    }
}

/// Operator-facing line: what happened and, on failure, why.
impl fmt::Display for ChannelOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelOutcome::Sent {
                provider_id,
                variant,
                attempts,
            } => {
                write!(f, "sent")?;
                if let Some(variant) = variant {
                    write!(f, " via {variant} after {attempts} attempt(s)")?;
                }
                if let Some(id) = provider_id {
                    write!(f, " (id {id})")?;
                }
                Ok(())
            }
            ChannelOutcome::Skipped { reason } => write!(f, "skipped: {reason}"),
            ChannelOutcome::Failed { cause, error } => write!(f, "FAILED [{cause}]: {error}"),
        }
    }
}

/// Independent per-channel results of one dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub email: ChannelOutcome,
    pub messaging: ChannelOutcome,
}

impl DispatchReport {
    pub fn skipped(reason: &str) -> Self {
        Self {
            email: ChannelOutcome::skipped(reason),
            messaging: ChannelOutcome::skipped(reason),
        }
    }

    /// Flags recorded in the ledger for this dispatch.
    pub fn flags(&self) -> NotificationFlags {
        NotificationFlags {
            email_sent: self.email.is_sent(),
            messaging_sent: self.messaging.is_sent(),
        }
    }

    /// Ledger message describing the dispatch. Failures lead so they are
    /// never mistaken for routine per-channel noise.
    pub fn summary(&self, ticket: &Ticket) -> String {
        let mut parts = Vec::new();
        for (channel, outcome) in [("email", &self.email), ("messaging", &self.messaging)] {
            if let ChannelOutcome::Failed { cause, error } = outcome {
                parts.push(format!("{channel} failed ({cause}): {error}"));
            }
        }
        match (self.email.is_sent(), self.messaging.is_sent()) {
            (true, true) => parts.push(RESULT_PHRASE.to_string()),
            (true, false) => parts.push(format!(
                "email sent to {}",
                ticket.contact.email.as_deref().unwrap_or("-")
            )),
            (false, true) => parts.push(format!(
                "message sent to {}",
                ticket.contact.phone.as_deref().unwrap_or("-")
            )),
            (false, false) if parts.is_empty() => {
                parts.push("completion notification not sent".to_string())
            }
            (false, false) => {}
        }
        parts.join("; ")
    }
}

/// Capability the store invokes when a ticket completes.
#[async_trait]
pub trait CompletionNotifier: Send + Sync {
    async fn notify(&self, request: NotificationRequest<'_>) -> DispatchReport;
}

/// Sends completion notices on the configured channels.
pub struct Dispatcher {
    email: Option<EmailChannel>,
    messaging: Option<MessagingChannel>,
    policy: NotificationPolicy,
}

impl Dispatcher {
    pub fn new(policy: NotificationPolicy) -> Self {
        Self {
            email: None,
            messaging: None,
            policy,
        }
    }

    pub fn with_email(mut self, channel: EmailChannel) -> Self {
        self.email = Some(channel);
        self
    }

    /// The channel's per-attempt deadline is capped so every wire format
    /// gets a share of the channel timeout.
    pub fn with_messaging(mut self, channel: MessagingChannel) -> Self {
        self.messaging = Some(channel.fit_within(self.policy.channel_timeout()));
        self
    }

    pub fn policy(&self) -> &NotificationPolicy {
        &self.policy
    }

    async fn send_email(&self, req: &NotificationRequest<'_>) -> ChannelOutcome {
        let Some(channel) = &self.email else {
            return ChannelOutcome::skipped("email channel not configured");
        };
        if !req.channels.email {
            return ChannelOutcome::skipped("not selected");
        }
        if !self.policy.email_tiers.contains(&req.ticket.priority) {
            return ChannelOutcome::skipped(format!(
                "email not sent for {} tier",
                req.ticket.priority
            ));
        }
        let Some(to) = req.ticket.contact.email.as_deref().filter(|e| !e.trim().is_empty())
        else {
            return ChannelOutcome::skipped("no email address");
        };

        let subject = self.policy.render_subject(req.ticket);
        let body = self.policy.render_body(req.ticket, req.message);
        let deadline = self.policy.channel_timeout();
        let span = spans::start_channel_span("email", &req.ticket.id);

        let result = tokio::time::timeout(
            deadline,
            channel.send(to, &subject, &body, req.attachment),
        )
        .instrument(span)
        .await
        .unwrap_or(Err(ChannelError::Timeout(deadline)));

        match result {
            Ok(receipt) => ChannelOutcome::Sent {
                provider_id: receipt.provider_id,
                variant: None,
                attempts: 1,
            },
            Err(e) => {
                warn!(ticket_id = %req.ticket.id, channel = "email", cause = e.cause(), error = %e, "email delivery failed");
                ChannelOutcome::failed(&e)
            }
        }
    }

    async fn send_messaging(&self, req: &NotificationRequest<'_>) -> ChannelOutcome {
        let Some(channel) = &self.messaging else {
            return ChannelOutcome::skipped("messaging channel not configured");
        };
        if !req.channels.messaging {
            return ChannelOutcome::skipped("not selected");
        }
        if !self.policy.messaging_tiers.contains(&req.ticket.priority) {
            return ChannelOutcome::skipped(format!(
                "messaging not sent for {} tier",
                req.ticket.priority
            ));
        }
        let Some(phone) = req.ticket.contact.phone.as_deref().filter(|p| !p.trim().is_empty())
        else {
            return ChannelOutcome::skipped("no phone number");
        };

        let text = self.policy.render_body(req.ticket, req.message);
        let msg = OutboundMessage {
            phone,
            text: &text,
            attachment: req.attachment,
        };
        let deadline = self.policy.channel_timeout();
        let span = spans::start_channel_span("messaging", &req.ticket.id);

        let result = tokio::time::timeout(deadline, channel.send(&msg))
            .instrument(span)
            .await
            .unwrap_or(Err(ChannelError::Timeout(deadline)));

        match result {
            Ok(delivery) => ChannelOutcome::Sent {
                provider_id: delivery.receipt.provider_id,
                variant: Some(delivery.variant),
                attempts: delivery.attempts,
            },
            Err(e) => {
                warn!(ticket_id = %req.ticket.id, channel = "messaging", cause = e.cause(), error = %e, "messaging delivery failed");
                ChannelOutcome::failed(&e)
            }
        }
    }
}

#[async_trait]
impl CompletionNotifier for Dispatcher {
    async fn notify(&self, request: NotificationRequest<'_>) -> DispatchReport {
        let start = Instant::now();
        let (email, messaging) =
            tokio::join!(self.send_email(&request), self.send_messaging(&request));

        for (channel, outcome) in [("email", &email), ("messaging", &messaging)] {
            metrics::notify_deliveries().add(
                1,
                &[
                    KeyValue::new("channel", channel),
                    KeyValue::new("result", outcome.label()),
                ],
            );
        }
        metrics::operation_duration_ms().record(
            start.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "notify.dispatch")],
        );
        info!(
            ticket_id = %request.ticket.id,
            code = %request.ticket.code,
            email = email.label(),
            messaging = messaging.label(),
            "completion dispatched"
        );

        DispatchReport { email, messaging }
    }
}
