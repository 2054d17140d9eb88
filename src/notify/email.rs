//! Email channel: one well-defined provider API (JSON over HTTPS, bearer key).

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::debug;

use super::{ChannelError, Receipt};
use crate::attachment::EncodedAttachment;

#[derive(Serialize)]
struct EmailPayload<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<EmailAttachment<'a>>,
}

#[derive(Serialize)]
struct EmailAttachment<'a> {
    filename: &'a str,
    content: &'a str,
    content_type: &'a str,
}

pub struct EmailChannel {
    client: reqwest::Client,
    endpoint: String,
    api_key: SecretString,
    from: String,
}

impl EmailChannel {
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        api_key: SecretString,
        from: impl Into<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            api_key,
            from: from.into(),
        }
    }

    pub async fn send(
        &self,
        to: &str,
        subject: &str,
        text: &str,
        attachment: Option<&EncodedAttachment>,
    ) -> Result<Receipt, ChannelError> {
        let payload = EmailPayload {
            from: &self.from,
            to: [to],
            subject,
            text,
            attachments: attachment
                .map(|a| EmailAttachment {
                    filename: &a.name,
                    content: &a.base64,
                    content_type: &a.content_type,
                })
                .into_iter()
                .collect(),
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .json(&payload)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ChannelError::Rejected {
                status: status.as_u16(),
                body: truncate(&body, 300),
            });
        }

        let provider_id = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("id").and_then(|id| id.as_str()).map(str::to_string));
        debug!(to, provider_id = ?provider_id, "email accepted by provider");
        Ok(Receipt { provider_id })
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}
