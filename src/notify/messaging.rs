//! Messaging channel: protocol-sniffing fallback chain.
//!
//! Several compatible backends can sit behind the one configured endpoint and
//! they disagree on authentication header and payload field names. Each
//! candidate wire format is a [`MessagingProvider`]; the channel tries them
//! once each, in priority order, and remembers which one worked for the
//! endpoint so later sends go straight to it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::email::truncate;
use super::{ChannelError, Receipt};
use crate::attachment::EncodedAttachment;
use crate::telemetry::metrics;

/// A message to deliver to one phone number.
#[derive(Debug, Clone, Copy)]
pub struct OutboundMessage<'a> {
    pub phone: &'a str,
    pub text: &'a str,
    pub attachment: Option<&'a EncodedAttachment>,
}

/// One hypothesis about the provider's wire contract.
#[async_trait]
pub trait MessagingProvider: Send + Sync {
    /// Stable name reported when this format is accepted.
    fn variant(&self) -> &str;

    /// Endpoint this provider talks to. Used as the cache key.
    fn endpoint(&self) -> &str;

    async fn send(&self, msg: &OutboundMessage<'_>) -> Result<Receipt, ChannelError>;
}

/// How the key is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    /// `apikey: <key>`
    ApiKeyHeader,
    /// `Authorization: Bearer <key>`
    Bearer,
    /// `Client-Token: <key>`
    ClientToken,
}

/// Payload field naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadStyle {
    /// `{ "number", "text" }`, media as `{ "number", "mediatype", "media", ... }`
    NumberText,
    /// `{ "phone", "message" }`, media as `{ "phone", "document", ... }`
    PhoneMessage,
}

/// A wire format realized over HTTP POST.
pub struct WireShape {
    variant: String,
    auth: AuthStyle,
    payload: PayloadStyle,
    client: reqwest::Client,
    endpoint: String,
    api_key: SecretString,
}

impl WireShape {
    pub fn new(
        variant: impl Into<String>,
        auth: AuthStyle,
        payload: PayloadStyle,
        client: reqwest::Client,
        endpoint: impl Into<String>,
        api_key: SecretString,
    ) -> Self {
        Self {
            variant: variant.into(),
            auth,
            payload,
            client,
            endpoint: endpoint.into(),
            api_key,
        }
    }

    /// The four known shapes, in priority order.
    pub fn standard_chain(
        client: reqwest::Client,
        endpoint: &str,
        api_key: &SecretString,
    ) -> Vec<Arc<dyn MessagingProvider>> {
        [
            ("apikey-number-text", AuthStyle::ApiKeyHeader, PayloadStyle::NumberText),
            ("bearer-number-text", AuthStyle::Bearer, PayloadStyle::NumberText),
            ("bearer-phone-message", AuthStyle::Bearer, PayloadStyle::PhoneMessage),
            ("client-token-phone-message", AuthStyle::ClientToken, PayloadStyle::PhoneMessage),
        ]
        .into_iter()
        .map(|(variant, auth, payload)| {
            Arc::new(WireShape::new(
                variant,
                auth,
                payload,
                client.clone(),
                endpoint,
                api_key.clone(),
            )) as Arc<dyn MessagingProvider>
        })
        .collect()
    }

    fn body(&self, msg: &OutboundMessage<'_>) -> Value {
        let phone = normalize_phone(msg.phone);
        match (self.payload, msg.attachment) {
            (PayloadStyle::NumberText, None) => json!({
                "number": phone,
                "text": msg.text,
            }),
            (PayloadStyle::NumberText, Some(att)) => json!({
                "number": phone,
                "mediatype": "document",
                "mimetype": att.content_type,
                "media": att.base64,
                "fileName": att.name,
                "caption": msg.text,
            }),
            (PayloadStyle::PhoneMessage, None) => json!({
                "phone": phone,
                "message": msg.text,
            }),
            (PayloadStyle::PhoneMessage, Some(att)) => json!({
                "phone": phone,
                "message": msg.text,
                "document": att.base64,
                "fileName": att.name,
                "mimetype": att.content_type,
            }),
        }
    }
}

#[async_trait]
impl MessagingProvider for WireShape {
    fn variant(&self) -> &str {
        &self.variant
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&self, msg: &OutboundMessage<'_>) -> Result<Receipt, ChannelError> {
        let key = self.api_key.expose_secret();
        let request = self.client.post(&self.endpoint).json(&self.body(msg));
        let request = match self.auth {
            AuthStyle::ApiKeyHeader => request.header("apikey", key),
            AuthStyle::Bearer => request.bearer_auth(key),
            AuthStyle::ClientToken => request.header("Client-Token", key),
        };

        let resp = request.send().await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ChannelError::Rejected {
                status: status.as_u16(),
                body: truncate(&body, 300),
            });
        }

        let parsed: Option<Value> = serde_json::from_str(&body).ok();
        if let Some(error) = parsed.as_ref().and_then(embedded_error) {
            return Err(ChannelError::Rejected {
                status: status.as_u16(),
                body: error,
            });
        }
        Ok(Receipt {
            provider_id: parsed.as_ref().and_then(provider_id),
        })
    }
}

/// Some backends answer 200 with an error object.
fn embedded_error(body: &Value) -> Option<String> {
    match body.get("error")? {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn provider_id(body: &Value) -> Option<String> {
    let candidates = [
        body.pointer("/key/id"),
        body.get("messageId"),
        body.get("id"),
        body.get("zaapId"),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

fn normalize_phone(phone: &str) -> String {
    phone.chars().filter(char::is_ascii_digit).collect()
}

/// Successful messaging delivery.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub receipt: Receipt,
    pub variant: String,
    /// Attempts made, including the successful one.
    pub attempts: usize,
}

/// Ordered adapter chain with a per-endpoint memory of the last format that
/// worked.
pub struct MessagingChannel {
    providers: Vec<Arc<dyn MessagingProvider>>,
    known_good: Mutex<HashMap<String, usize>>,
    attempt_timeout: Duration,
}

impl MessagingChannel {
    pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(providers: Vec<Arc<dyn MessagingProvider>>) -> Self {
        Self {
            providers,
            known_good: Mutex::new(HashMap::new()),
            attempt_timeout: Self::DEFAULT_ATTEMPT_TIMEOUT,
        }
    }

    /// Deadline for a single wire format. An attempt that runs past it
    /// counts as a failure and the next format is tried.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Shrink the per-attempt deadline so the whole chain fits in `budget`.
    pub fn fit_within(mut self, budget: Duration) -> Self {
        let share = budget / self.providers.len().max(1) as u32;
        self.attempt_timeout = self.attempt_timeout.min(share);
        self
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    /// Channel over the four standard wire shapes.
    pub fn standard(client: reqwest::Client, endpoint: &str, api_key: &SecretString) -> Self {
        Self::new(WireShape::standard_chain(client, endpoint, api_key))
    }

    /// Variant currently remembered for `endpoint`.
    pub fn known_variant(&self, endpoint: &str) -> Option<String> {
        let cache = self.known_good.lock().unwrap_or_else(|p| p.into_inner());
        cache
            .get(endpoint)
            .and_then(|&i| self.providers.get(i))
            .map(|p| p.variant().to_string())
    }

    fn attempt_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.providers.len()).collect();
        let Some(endpoint) = self.providers.first().map(|p| p.endpoint()) else {
            return order;
        };
        let cached = self
            .known_good
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(endpoint)
            .copied();
        if let Some(idx) = cached.filter(|&i| i < order.len()) {
            order.remove(idx);
            order.insert(0, idx);
        }
        order
    }

    /// Try each wire format once until one is accepted.
    pub async fn send(&self, msg: &OutboundMessage<'_>) -> Result<Delivery, ChannelError> {
        let mut last: Option<(String, ChannelError)> = None;
        let mut attempts = 0;

        for idx in self.attempt_order() {
            let provider = &self.providers[idx];
            attempts += 1;
            let result = tokio::time::timeout(self.attempt_timeout, provider.send(msg))
                .await
                .unwrap_or(Err(ChannelError::Timeout(self.attempt_timeout)));
            match result {
                Ok(receipt) => {
                    metrics::messaging_attempts().add(
                        1,
                        &[
                            KeyValue::new("variant", provider.variant().to_string()),
                            KeyValue::new("result", "accepted"),
                        ],
                    );
                    self.known_good
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .insert(provider.endpoint().to_string(), idx);
                    info!(variant = provider.variant(), attempts, "messaging accepted");
                    return Ok(Delivery {
                        receipt,
                        variant: provider.variant().to_string(),
                        attempts,
                    });
                }
                Err(e) => {
                    metrics::messaging_attempts().add(
                        1,
                        &[
                            KeyValue::new("variant", provider.variant().to_string()),
                            KeyValue::new("result", "rejected"),
                        ],
                    );
                    debug!(variant = provider.variant(), error = %e, "wire format rejected");
                    last = Some((provider.variant().to_string(), e));
                }
            }
        }

        if let Some(endpoint) = self.providers.first().map(|p| p.endpoint()) {
            self.known_good
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(endpoint);
        }

        let (last_variant, last_error) = last.ok_or_else(|| {
            ChannelError::Transport("no messaging wire formats configured".to_string())
        })?;
        warn!(attempts, last_variant = %last_variant, "every messaging wire format failed");
        Err(ChannelError::AllVariantsFailed {
            attempts,
            last_variant,
            last_error: Box::new(last_error),
        })
    }
}
