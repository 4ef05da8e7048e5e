//! Real-time client
//!
//! The owning controller for the stream session. `enable()` creates the
//! connection and `disable()` destroys it; handler registration lives in
//! the registry and survives both.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, watch, Mutex};

use super::backoff::BackoffPolicy;
use super::connection::{ConnectionEvent, ConnectionManager, ConnectionSignals, ConnectionState};
use super::messages::{EventKind, EventPayload};
use super::registry::{EventRegistry, Handler};
use super::transport::{HttpTransport, Transport, TransportError};
use crate::config::Config;

pub struct RealtimeClient {
    transport: Arc<dyn Transport>,
    policy: BackoffPolicy,
    registry: Arc<EventRegistry>,
    connection: Mutex<Option<ConnectionManager>>,
    signals: ConnectionSignals,
    was_enabled: AtomicBool,
    client_id: Arc<RwLock<Option<String>>>,
}

impl RealtimeClient {
    pub fn new(transport: Arc<dyn Transport>, policy: BackoffPolicy) -> Self {
        let registry = Arc::new(EventRegistry::new());
        let client_id: Arc<RwLock<Option<String>>> = Arc::new(RwLock::new(None));

        let session = Arc::clone(&client_id);
        let track_session = Handler::new("session", move |payload: &EventPayload| {
            if let EventPayload::Connected(connected) = payload {
                tracing::info!(client_id = %connected.client_id, "Stream session established");
                *session.write().unwrap_or_else(|e| e.into_inner()) =
                    Some(connected.client_id.clone());
            }
            Ok(())
        });
        registry.subscribe(EventKind::Connected, &track_session);

        Self {
            transport,
            policy,
            registry,
            connection: Mutex::new(None),
            signals: ConnectionSignals::default(),
            was_enabled: AtomicBool::new(false),
            client_id,
        }
    }

    /// Client for the configured HTTP endpoint
    pub fn from_config(config: &Config) -> Result<Self, TransportError> {
        let transport = HttpTransport::new(&config.stream)?;
        tracing::debug!(url = %transport.url(), "Configured event stream");
        Ok(Self::new(Arc::new(transport), config.backoff.policy()))
    }

    /// Create the connection and start connecting; no-op when already enabled
    pub async fn enable(&self) {
        let mut slot = self.connection.lock().await;
        if slot.is_some() {
            return;
        }

        let manager = ConnectionManager::spawn(
            Arc::clone(&self.transport),
            Arc::clone(&self.registry),
            self.policy,
            self.signals.clone(),
        );
        manager.connect().await;
        *slot = Some(manager);
        self.was_enabled.store(true, Ordering::SeqCst);
        tracing::info!("Real-time updates enabled");
    }

    /// Close the transport, cancel any retry and destroy the connection
    ///
    /// Async handler work already in flight keeps running.
    pub async fn disable(&self) {
        let Some(manager) = self.connection.lock().await.take() else {
            return;
        };
        manager.disconnect().await;
        drop(manager);

        *self.client_id.write().unwrap_or_else(|e| e.into_inner()) = None;
        tracing::info!("Real-time updates disabled");
    }

    pub async fn is_enabled(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    /// Current connection state
    pub async fn state(&self) -> ConnectionState {
        match self.connection.lock().await.as_ref() {
            Some(manager) => manager.state(),
            None if self.was_enabled.load(Ordering::SeqCst) => ConnectionState::Closed,
            None => ConnectionState::Idle,
        }
    }

    /// Whether the stream is currently open
    pub fn is_connected(&self) -> bool {
        *self.signals.connected.borrow()
    }

    /// Observe `is_connected` changes
    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.signals.connected.subscribe()
    }

    /// Subscribe to connection lifecycle events
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.signals.events.subscribe()
    }

    /// Register a handler for an event kind
    pub fn on(&self, kind: EventKind, handler: &Handler) -> bool {
        self.registry.subscribe(kind, handler)
    }

    /// Remove a handler registered with [`RealtimeClient::on`]
    pub fn off(&self, kind: EventKind, handler: &Handler) -> bool {
        self.registry.unsubscribe(&kind, handler)
    }

    /// Retry immediately, skipping any backoff wait
    ///
    /// Returns false when the client is not enabled.
    pub async fn reconnect(&self) -> bool {
        match self.connection.lock().await.as_ref() {
            Some(manager) => {
                manager.reconnect().await;
                true
            }
            None => {
                tracing::debug!("Reconnect requested while disabled");
                false
            }
        }
    }

    /// Identifier the server assigned to the current session
    pub fn client_id(&self) -> Option<String> {
        self.client_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.registry
    }
}
