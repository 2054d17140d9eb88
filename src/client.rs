//! Access to the Ticket Store from outside the store process.
//!
//! [`TicketSource`] is the read/write capability Sync Clients and the Intake
//! Bridge depend on. [`TicketStore`] implements it directly (same process);
//! [`ApiClient`] implements it over the HTTP surface.

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::api::dto::{
    Anexo, CodeResponse, CompletionRequest, ErrorBody, TicketUpdate, UpdateResponse,
};
use crate::attachment::EncodedAttachment;
use crate::error::{Error, Result};
use crate::ledger::ConsolidatedView;
use crate::model::{NewTicket, Ticket, TicketCode, TicketFilter, TicketId};
use crate::notify::DispatchReport;
use crate::store::{TicketStore, TransitionRequest};

/// Header carrying the pre-shared key.
pub const API_KEY_HEADER: &str = "x-api-key";

#[async_trait]
pub trait TicketSource: Send + Sync {
    async fn list(&self, filter: &TicketFilter) -> Result<Vec<Ticket>>;

    async fn get(&self, id: TicketId) -> Result<Ticket>;

    async fn find_by_code(&self, code: &TicketCode) -> Result<Option<Ticket>>;

    async fn create(&self, draft: NewTicket) -> Result<Ticket>;

    async fn generate_code(&self) -> Result<TicketCode>;

    async fn apply_transition(&self, id: TicketId, req: TransitionRequest) -> Result<Ticket>;

    async fn annotate(&self, id: TicketId, author: &str, message: &str) -> Result<Ticket>;
}

#[async_trait]
impl TicketSource for TicketStore {
    async fn list(&self, filter: &TicketFilter) -> Result<Vec<Ticket>> {
        TicketStore::list(self, filter).await
    }

    async fn get(&self, id: TicketId) -> Result<Ticket> {
        TicketStore::get(self, id).await
    }

    async fn find_by_code(&self, code: &TicketCode) -> Result<Option<Ticket>> {
        TicketStore::find_by_code(self, code).await
    }

    async fn create(&self, draft: NewTicket) -> Result<Ticket> {
        TicketStore::create(self, draft).await
    }

    async fn generate_code(&self) -> Result<TicketCode> {
        TicketStore::generate_code(self).await
    }

    async fn apply_transition(&self, id: TicketId, req: TransitionRequest) -> Result<Ticket> {
        Ok(TicketStore::apply_transition(self, id, req).await?.ticket)
    }

    async fn annotate(&self, id: TicketId, author: &str, message: &str) -> Result<Ticket> {
        TicketStore::annotate(self, id, author, message, None).await
    }
}

/// HTTP client for a remote Ticket Store.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, api_key: SecretString) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self::with_client(http, base_url, api_key))
    }

    pub fn with_client(
        http: reqwest::Client,
        base_url: impl Into<String>,
        api_key: SecretString,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `PUT /tickets/{id}` as a transition. Unlike the [`TicketSource`]
    /// method this keeps the per-channel notification outcome, present when
    /// the transition completed the ticket.
    pub async fn transition(&self, id: TicketId, req: TransitionRequest) -> Result<UpdateResponse> {
        let update = TicketUpdate {
            status: Some(req.status),
            author: req.author,
            message: req.message,
            anexo: req.attachment.as_ref().map(Anexo::from),
            expected_status: req.expected_status,
            assigned_operator: req.assign_to,
            override_reason: None,
        };
        self.send(
            self.request(reqwest::Method::PUT, &format!("/tickets/{id}"))
                .json(&update),
        )
        .await
    }

    /// `POST /tickets/{id}/send-completion`.
    pub async fn send_completion(
        &self,
        id: TicketId,
        message: &str,
        attachment: Option<&EncodedAttachment>,
        force: bool,
    ) -> Result<DispatchReport> {
        let body = CompletionRequest {
            mensagem_interacao: message.to_string(),
            anexo: attachment.map(Anexo::from),
            force,
        };
        self.send(
            self.request(reqwest::Method::POST, &format!("/tickets/{id}/send-completion"))
                .json(&body),
        )
        .await
    }

    /// Consolidated history of one ticket.
    pub async fn history(&self, id: TicketId, limit: Option<usize>) -> Result<ConsolidatedView> {
        let mut request = self.request(reqwest::Method::GET, &format!("/tickets/{id}/history"));
        if let Some(limit) = limit {
            request = request.query(&[("limit", limit)]);
        }
        self.send(request).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, self.url(path))
            .header(API_KEY_HEADER, self.api_key.expose_secret())
    }

    async fn send<T: DeserializeOwned>(&self, builder: reqwest::RequestBuilder) -> Result<T> {
        let resp = builder.send().await.map_err(transport_error)?;
        let status = resp.status();
        if status.is_success() {
            return resp.json().await.map_err(transport_error);
        }
        let body = resp.text().await.unwrap_or_default();
        debug!(%status, body = %body, "ticket store returned an error");
        Err(status_error(status, &body))
    }
}

/// Unreachable store is transient, not an application error.
fn transport_error(e: reqwest::Error) -> Error {
    if e.is_connect() || e.is_timeout() || e.is_request() {
        Error::StorageUnavailable(e.to_string())
    } else {
        Error::Http(e)
    }
}

fn status_error(status: StatusCode, body: &str) -> Error {
    let detail = serde_json::from_str::<ErrorBody>(body).ok().map(|b| b.error);
    let message = detail
        .as_ref()
        .map(|d| d.message.clone())
        .unwrap_or_else(|| body.to_string());

    match status {
        StatusCode::BAD_REQUEST => Error::Validation(message),
        StatusCode::UNAUTHORIZED => Error::Config(format!("api key rejected: {message}")),
        StatusCode::NOT_FOUND => Error::NotFound(message),
        StatusCode::CONFLICT => match detail.and_then(|d| Some((d.from?, d.to?))) {
            Some((from, to)) => Error::InvalidTransition { from, to },
            None => Error::Conflict(message),
        },
        s if s.is_server_error() => Error::StorageUnavailable(format!("{s}: {message}")),
        s => Error::Other(format!("unexpected {s}: {message}")),
    }
}

#[async_trait]
impl TicketSource for ApiClient {
    async fn list(&self, filter: &TicketFilter) -> Result<Vec<Ticket>> {
        let mut query = Vec::new();
        if let Some(status) = filter.status {
            query.push(("status", status.as_str().to_string()));
        }
        if let Some(op) = &filter.operator {
            query.push(("operator", op.clone()));
        }
        self.send(self.request(reqwest::Method::GET, "/tickets").query(&query))
            .await
    }

    async fn get(&self, id: TicketId) -> Result<Ticket> {
        self.send(self.request(reqwest::Method::GET, &format!("/tickets/{id}")))
            .await
    }

    async fn find_by_code(&self, code: &TicketCode) -> Result<Option<Ticket>> {
        match self
            .send(self.request(reqwest::Method::GET, &format!("/tickets/by-code/{code}")))
            .await
        {
            Ok(ticket) => Ok(Some(ticket)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create(&self, draft: NewTicket) -> Result<Ticket> {
        self.send(self.request(reqwest::Method::POST, "/tickets").json(&draft))
            .await
    }

    async fn generate_code(&self) -> Result<TicketCode> {
        let resp: CodeResponse = self
            .send(self.request(reqwest::Method::GET, "/tickets/generate-code"))
            .await?;
        Ok(resp.code)
    }

    async fn apply_transition(&self, id: TicketId, req: TransitionRequest) -> Result<Ticket> {
        Ok(self.transition(id, req).await?.ticket)
    }

    async fn annotate(&self, id: TicketId, author: &str, message: &str) -> Result<Ticket> {
        let update = TicketUpdate {
            author: author.to_string(),
            message: message.to_string(),
            ..Default::default()
        };
        let resp: UpdateResponse = self
            .send(
                self.request(reqwest::Method::PUT, &format!("/tickets/{id}"))
                    .json(&update),
            )
            .await?;
        Ok(resp.ticket)
    }
}
