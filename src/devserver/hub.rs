//! Stream Hub
//!
//! Tracks connected stream clients and fans frames out to all of them
//! through a tokio broadcast channel.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::realtime::{EventKind, Frame};

/// Server-assigned identifier of a stream client
pub type ClientId = String;

/// Configuration for the stream hub
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum number of concurrent stream clients
    pub max_connections: usize,
    /// Frames buffered per slow client before it starts skipping
    pub broadcast_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            broadcast_capacity: 256,
        }
    }
}

/// Fan-out point for server push frames
pub struct StreamHub {
    clients: RwLock<HashMap<ClientId, Instant>>,
    broadcast_tx: broadcast::Sender<Frame>,
    config: HubConfig,
}

/// A registered client; unregisters itself when dropped
pub struct ClientGuard {
    hub: Arc<StreamHub>,
    id: ClientId,
}

impl ClientGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.hub.unregister(&self.id);
    }
}

impl StreamHub {
    pub fn new(config: HubConfig) -> Self {
        let (broadcast_tx, _) = broadcast::channel(config.broadcast_capacity);
        Self {
            clients: RwLock::new(HashMap::new()),
            broadcast_tx,
            config,
        }
    }

    /// Register a client and subscribe it to future broadcasts
    pub fn register(
        self: &Arc<Self>,
    ) -> Result<(ClientGuard, broadcast::Receiver<Frame>), HubError> {
        let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
        if clients.len() >= self.config.max_connections {
            return Err(HubError::TooManyConnections);
        }

        let id = Uuid::new_v4().to_string();
        clients.insert(id.clone(), Instant::now());
        let receiver = self.broadcast_tx.subscribe();
        let total = clients.len();
        drop(clients);

        tracing::info!(client_id = %id, total, "Stream client connected");
        Ok((
            ClientGuard {
                hub: Arc::clone(self),
                id,
            },
            receiver,
        ))
    }

    pub fn unregister(&self, id: &str) {
        let removed = self
            .clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);

        if let Some(connected_at) = removed {
            tracing::info!(
                client_id = %id,
                connected_secs = connected_at.elapsed().as_secs(),
                "Stream client disconnected"
            );
        }
    }

    /// Send an event to every connected client
    ///
    /// Returns how many clients the frame was queued for.
    pub fn broadcast<T: Serialize>(&self, kind: &EventKind, data: &T) -> Result<usize, HubError> {
        let data = serde_json::to_string(data)?;
        let frame = Frame::new(kind.as_str(), data);

        // No receivers is not an error; nobody is listening yet
        let sent = self.broadcast_tx.send(frame).unwrap_or(0);
        tracing::debug!(kind = %kind, clients = sent, "Broadcast event");
        Ok(sent)
    }

    pub fn connection_count(&self) -> usize {
        self.clients.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("Too many stream clients")]
    TooManyConnections,

    #[error("Failed to encode event data: {0}")]
    Encode(#[from] serde_json::Error),
}
