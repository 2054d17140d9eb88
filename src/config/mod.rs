//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. Sensitive values wrapped in secrecy::SecretString to prevent
//! log leaks.

pub mod secrets;

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    /// Pre-shared key expected in the `x-api-key` header.
    pub api_key: SecretString,
    /// Postgres URL. `None` runs the server on the in-process repository.
    pub database_url: Option<SecretString>,
    pub bind_addr: String,
    /// Base URL clients (CLI, sync, intake) use to reach the server.
    pub api_url: String,
    pub email: Option<ProviderConfig>,
    pub email_from: String,
    pub messaging: Option<ProviderConfig>,
    pub sync_interval: Duration,
    pub attachment_max_bytes: u64,
    pub store_timeout: Duration,
    pub notify_policy: Option<PathBuf>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

/// Endpoint and credential of one notification provider.
#[derive(Debug)]
pub struct ProviderConfig {
    pub url: String,
    pub api_key: SecretString,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            api_key: SecretString::from(required_var("CERTDESK_API_KEY")?),
            database_url: optional_var("DATABASE_URL").map(SecretString::from),
            bind_addr: optional_var("CERTDESK_BIND").unwrap_or_else(|| "0.0.0.0:8080".into()),
            api_url: optional_var("CERTDESK_API_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8080".into()),
            email: provider("EMAIL_API_URL", "EMAIL_API_KEY")?,
            email_from: optional_var("EMAIL_FROM")
                .unwrap_or_else(|| "no-reply@certdesk.local".into()),
            messaging: provider("MESSAGING_API_URL", "MESSAGING_API_KEY")?,
            sync_interval: Duration::from_secs(parsed_var("SYNC_INTERVAL_SECS", 10)?),
            attachment_max_bytes: parsed_var("ATTACHMENT_MAX_BYTES", 10 * 1024 * 1024)?,
            store_timeout: Duration::from_millis(parsed_var("STORE_TIMEOUT_MS", 5000)?),
            notify_policy: optional_var("NOTIFY_POLICY").map(PathBuf::from),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    optional_var(name)
        .ok_or_else(|| Error::Config(format!("required environment variable {name} is not set")))
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match optional_var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}"))),
        None => Ok(default),
    }
}

/// Both halves or neither: a URL without a key is a misconfiguration.
fn provider(url_var: &str, key_var: &str) -> Result<Option<ProviderConfig>> {
    match (optional_var(url_var), optional_var(key_var)) {
        (Some(url), Some(key)) => Ok(Some(ProviderConfig {
            url,
            api_key: SecretString::from(key),
        })),
        (None, None) => Ok(None),
        (Some(_), None) => Err(Error::Config(format!("{url_var} is set but {key_var} is not"))),
        (None, Some(_)) => Err(Error::Config(format!("{key_var} is set but {url_var} is not"))),
    }
}
