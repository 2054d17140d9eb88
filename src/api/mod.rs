//! HTTP surface of the Ticket Store.
//!
//! Everything except `/health` requires the pre-shared key in `x-api-key`;
//! `/events` also accepts it as `?key=`.

pub mod auth;
pub mod dto;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use secrecy::SecretString;
use tower_http::trace::TraceLayer;

use crate::attachment::AttachmentEncoder;
use crate::store::TicketStore;

pub use error::ApiError;

/// Shared handler state.
pub struct AppState {
    pub store: Arc<TicketStore>,
    pub encoder: AttachmentEncoder,
    pub api_key: SecretString,
}

impl AppState {
    pub fn new(store: Arc<TicketStore>, api_key: SecretString) -> Self {
        Self {
            store,
            encoder: AttachmentEncoder::default(),
            api_key,
        }
    }

    pub fn with_encoder(mut self, encoder: AttachmentEncoder) -> Self {
        self.encoder = encoder;
        self
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route(
            "/tickets",
            get(routes::list_tickets).post(routes::create_ticket),
        )
        .route("/tickets/generate-code", get(routes::generate_code))
        .route("/tickets/by-code/:code", get(routes::get_by_code))
        .route(
            "/tickets/:id",
            get(routes::get_ticket).put(routes::update_ticket),
        )
        .route("/tickets/:id/history", get(routes::history))
        .route("/tickets/:id/send-completion", post(routes::send_completion))
        .route("/attachments/*locator", get(routes::get_attachment))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_api_key,
        ));

    let stream = Router::new()
        .route("/events", get(routes::events))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_api_key_or_query,
        ));

    Router::new()
        .route("/health", get(routes::health))
        .merge(protected)
        .merge(stream)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `router` on `addr` until ctrl-c.
pub async fn serve(addr: &str, state: Arc<AppState>) -> crate::error::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr, "ticket store listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}
