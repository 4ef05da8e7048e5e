//! Development Stream Server
//!
//! A small axum server that speaks the same push protocol as the production
//! backend. Used by the `serve` command and by integration tests.
//!
//! # Endpoints
//!
//! - `GET {prefix}/events` - server push stream (`text/event-stream`)
//! - `GET /health` - liveness check with the client count
//!
//! Every stream starts with a `connected` event carrying the client id,
//! followed by every frame broadcast through the [`StreamHub`].

mod hub;
mod publisher;

pub use hub::{ClientGuard, ClientId, HubConfig, HubError, StreamHub};
pub use publisher::spawn_rate_publisher;

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures_util::stream::{self, Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::realtime::{ConnectedPayload, EventKind, Frame};

/// Build the stream server router
pub fn router(hub: Arc<StreamHub>, prefix: &str) -> Router {
    let events_path = format!("{}/events", prefix.trim_end_matches('/'));

    Router::new()
        .route(&events_path, get(events_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}

/// Bind and run the server until Ctrl+C
pub async fn serve(hub: Arc<StreamHub>, config: &ServerConfig) -> Result<(), ServerError> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;

    tracing::info!("Stream server listening on {}{}/events", addr, config.prefix);

    axum::serve(listener, router(hub, &config.prefix))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(ServerError::Serve)?;

    tracing::info!("Stream server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}

async fn health(State(hub): State<Arc<StreamHub>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "clients": hub.connection_count(),
    }))
}

async fn events_handler(
    State(hub): State<Arc<StreamHub>>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, HubError> {
    let (guard, receiver) = hub.register()?;

    let connected = serde_json::to_string(&ConnectedPayload {
        client_id: guard.id().to_string(),
    })?;
    let hello = Frame::new(EventKind::Connected.as_str(), connected);

    let frames = stream::unfold((receiver, guard), |(mut receiver, guard)| async move {
        loop {
            match receiver.recv().await {
                Ok(frame) => return Some((frame, (receiver, guard))),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(client_id = %guard.id(), skipped, "Stream client lagging");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    let events = stream::once(async move { hello })
        .chain(frames)
        .map(|frame| Ok(SseEvent::default().event(frame.event).data(frame.data)));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = match self {
            HubError::TooManyConnections => StatusCode::SERVICE_UNAVAILABLE,
            HubError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::warn!(error = %self, "Rejected stream client");
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[source] std::io::Error),
}
