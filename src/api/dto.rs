//! JSON bodies of the HTTP surface, shared by the server and [`ApiClient`].
//!
//! [`ApiClient`]: crate::client::ApiClient

use serde::{Deserialize, Serialize};

use crate::attachment::EncodedAttachment;
use crate::model::{Status, Ticket, TicketCode};
use crate::notify::DispatchReport;

/// Inbound attachment: `{ nome, tipo, base64 }`. `base64` may be a data URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anexo {
    pub nome: String,
    #[serde(default)]
    pub tipo: String,
    pub base64: String,
}

impl From<&EncodedAttachment> for Anexo {
    fn from(a: &EncodedAttachment) -> Self {
        Self {
            nome: a.name.clone(),
            tipo: a.content_type.clone(),
            base64: a.base64.clone(),
        }
    }
}

/// `PUT /tickets/{id}`.
///
/// With `status` it is a transition; without, a same-status annotation.
/// `overrideReason` turns a transition into an administrative override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketUpdate {
    #[serde(default, rename = "statusNovo", skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    pub author: String,
    #[serde(default, rename = "mensagem")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anexo: Option<Anexo>,
    /// Status the caller last saw. A mismatch is rejected with 409.
    #[serde(default, rename = "statusAnterior", skip_serializing_if = "Option::is_none")]
    pub expected_status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_operator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_reason: Option<String>,
}

/// Result of `PUT /tickets/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateResponse {
    #[serde(flatten)]
    pub ticket: Ticket,
    /// Present when the update completed the ticket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification: Option<DispatchReport>,
}

/// `POST /tickets/{id}/send-completion`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    #[serde(default)]
    pub mensagem_interacao: String,
    #[serde(default)]
    pub anexo: Option<Anexo>,
    /// Re-send channels that already succeeded.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeResponse {
    pub code: TicketCode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListQuery {
    pub status: Option<Status>,
    pub operator: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// `{ "error": { "code", "message", ... } }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Status>,
}
