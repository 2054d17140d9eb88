//! Channel policy: who gets which channel, how long a channel may take, and
//! the wording of the customer message. Loadable from TOML.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::{PriorityTier, Ticket};

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct PolicyFile {
    notifications: NotificationPolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationPolicy {
    /// Tiers that receive the email notice.
    pub email_tiers: Vec<PriorityTier>,
    /// Tiers that receive the messaging notice.
    pub messaging_tiers: Vec<PriorityTier>,
    /// Deadline for one channel, including every messaging wire-format attempt.
    pub channel_timeout_secs: u64,
    /// `{code}`, `{certificate}` and `{name}` are substituted.
    pub subject: String,
    pub greeting: String,
}

impl Default for NotificationPolicy {
    fn default() -> Self {
        Self {
            email_tiers: vec![
                PriorityTier::Standard,
                PriorityTier::Priority,
                PriorityTier::Premium,
            ],
            messaging_tiers: vec![PriorityTier::Premium],
            channel_timeout_secs: 15,
            subject: "Your certificate request {code} is complete".to_string(),
            greeting: "Hello {name}, your {certificate} request {code} has been completed."
                .to_string(),
        }
    }
}

impl NotificationPolicy {
    /// Load `[notifications]` from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read policy file {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("bad policy file {}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let file: PolicyFile =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        if file.notifications.channel_timeout_secs == 0 {
            return Err(Error::Config("channel_timeout_secs must be positive".into()));
        }
        Ok(file.notifications)
    }

    pub fn channel_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_timeout_secs)
    }

    pub fn render_subject(&self, ticket: &Ticket) -> String {
        render(&self.subject, ticket)
    }

    /// Greeting followed by the operator's message, if any.
    pub fn render_body(&self, ticket: &Ticket, message: &str) -> String {
        let greeting = render(&self.greeting, ticket);
        let message = message.trim();
        if message.is_empty() {
            greeting
        } else {
            format!("{greeting}\n\n{message}")
        }
    }
}

fn render(template: &str, ticket: &Ticket) -> String {
    template
        .replace("{code}", ticket.code.as_str())
        .replace("{certificate}", &ticket.certificate_type)
        .replace("{name}", &ticket.contact.full_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_send_messaging_to_premium_only() {
        let policy = NotificationPolicy::default();
        assert_eq!(policy.messaging_tiers, vec![PriorityTier::Premium]);
        assert_eq!(policy.email_tiers.len(), 3);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let policy = NotificationPolicy::from_toml(
            r#"
            [notifications]
            messaging_tiers = ["priority", "premium"]
            channel_timeout_secs = 3
            "#,
        )
        .unwrap();
        assert_eq!(policy.messaging_tiers.len(), 2);
        assert_eq!(policy.channel_timeout(), Duration::from_secs(3));
        assert!(policy.subject.contains("{code}"));
    }

    #[test]
    fn zero_timeout_rejected() {
        let err = NotificationPolicy::from_toml("[notifications]\nchannel_timeout_secs = 0\n");
        assert!(matches!(err, Err(Error::Config(_))));
    }
}
