//! Request handlers.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use serde_json::{Value, json};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

use super::AppState;
use super::dto::*;
use super::error::ApiError;
use crate::attachment::{AttachmentEncoder, EncodedAttachment};
use crate::error::Error;
use crate::ledger::{ConsolidatedView, consolidate, consolidate::DEFAULT_CAP};
use crate::model::{NewTicket, Ticket, TicketCode, TicketFilter, TicketId};
use crate::notify::DispatchReport;
use crate::store::TransitionRequest;

type ApiResult<T> = Result<T, ApiError>;

fn decode(
    encoder: &AttachmentEncoder,
    anexo: Option<Anexo>,
) -> ApiResult<Option<EncodedAttachment>> {
    let Some(anexo) = anexo else {
        return Ok(None);
    };
    if anexo.nome.trim().is_empty() {
        return Err(Error::Validation("anexo.nome is required".into()).into());
    }
    let encoded = encoder
        .accept_base64(anexo.nome, anexo.tipo, &anexo.base64)
        .map_err(Error::from)?;
    Ok(Some(encoded))
}

/// `GET /events`: committed changes as server-sent events. A `lagged`
/// event means some were dropped and the subscriber should refetch.
pub async fn events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.store.subscribe()).filter_map(|msg| match msg {
        Ok(event) => match Event::default().event("ticket").json_data(&event) {
            Ok(sse) => Some(Ok::<_, Infallible>(sse)),
            Err(e) => {
                debug!(error = %e, "unserializable ticket event skipped");
                None
            }
        },
        Err(BroadcastStreamRecvError::Lagged(missed)) => Some(Ok(Event::default()
            .event("lagged")
            .data(missed.to_string()))),
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    match state.store.health_check().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "error": e.to_string() })),
        ),
    }
}

pub async fn list_tickets(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<Ticket>>> {
    let Query(query) = query?;
    let filter = TicketFilter {
        status: query.status,
        operator: query.operator,
    };
    Ok(Json(state.store.list(&filter).await?))
}

pub async fn create_ticket(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<NewTicket>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Ticket>)> {
    let Json(draft) = payload?;
    let ticket = state.store.create(draft).await?;
    Ok((StatusCode::CREATED, Json(ticket)))
}

pub async fn generate_code(State(state): State<Arc<AppState>>) -> ApiResult<Json<CodeResponse>> {
    let code = state.store.generate_code().await?;
    Ok(Json(CodeResponse { code }))
}

pub async fn get_ticket(
    State(state): State<Arc<AppState>>,
    path: Result<Path<TicketId>, PathRejection>,
) -> ApiResult<Json<Ticket>> {
    let Path(id) = path?;
    Ok(Json(state.store.get(id).await?))
}

pub async fn get_by_code(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> ApiResult<Json<Ticket>> {
    let code: TicketCode = code.parse()?;
    state
        .store
        .find_by_code(&code)
        .await?
        .map(Json)
        .ok_or_else(|| Error::NotFound(format!("ticket {code}")).into())
}

/// Transition, annotation or administrative override, depending on the body.
pub async fn update_ticket(
    State(state): State<Arc<AppState>>,
    path: Result<Path<TicketId>, PathRejection>,
    payload: Result<Json<TicketUpdate>, JsonRejection>,
) -> ApiResult<Json<UpdateResponse>> {
    let Path(id) = path?;
    let Json(update) = payload?;

    if let Some(reason) = &update.override_reason {
        if update.anexo.is_some() {
            return Err(
                Error::Validation("anexo is not accepted on an administrative override".into())
                    .into(),
            );
        }
        let status = update
            .status
            .ok_or_else(|| Error::Validation("override requires statusNovo".into()))?;
        let ticket = state
            .store
            .admin_override(id, status, &update.author, reason)
            .await?;
        return Ok(Json(UpdateResponse {
            ticket,
            notification: None,
        }));
    }

    let attachment = decode(&state.encoder, update.anexo)?;
    let Some(status) = update.status else {
        let ticket = state
            .store
            .annotate(id, &update.author, &update.message, attachment)
            .await?;
        return Ok(Json(UpdateResponse {
            ticket,
            notification: None,
        }));
    };

    let mut req = TransitionRequest::new(status, update.author).message(update.message);
    if let Some(attachment) = attachment {
        req = req.attachment(attachment);
    }
    if let Some(expected) = update.expected_status {
        req = req.expect(expected);
    }
    if let Some(operator) = update.assigned_operator {
        req = req.assign_to(operator);
    }
    let applied = state.store.apply_transition(id, req).await?;
    Ok(Json(UpdateResponse {
        ticket: applied.ticket,
        notification: applied.dispatch,
    }))
}

pub async fn history(
    State(state): State<Arc<AppState>>,
    path: Result<Path<TicketId>, PathRejection>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> ApiResult<Json<ConsolidatedView>> {
    let Path(id) = path?;
    let Query(query) = query?;
    let ticket = state.store.get(id).await?;
    let cap = query.limit.unwrap_or(DEFAULT_CAP);
    Ok(Json(consolidate(&ticket.history, cap)))
}

/// Manual (re-)send of the completion notice.
pub async fn send_completion(
    State(state): State<Arc<AppState>>,
    path: Result<Path<TicketId>, PathRejection>,
    payload: Result<Json<CompletionRequest>, JsonRejection>,
) -> ApiResult<Json<DispatchReport>> {
    let Path(id) = path?;
    let Json(body) = payload?;
    let attachment = decode(&state.encoder, body.anexo)?;
    let (_, report) = state
        .store
        .resend_completion(id, &body.mensagem_interacao, attachment, body.force)
        .await?;
    Ok(Json(report))
}

pub async fn get_attachment(
    State(state): State<Arc<AppState>>,
    Path(locator): Path<String>,
) -> ApiResult<Json<EncodedAttachment>> {
    Ok(Json(state.store.attachment(&locator).await?))
}
