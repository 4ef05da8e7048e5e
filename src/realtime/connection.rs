//! Connection Manager
//!
//! Owns the single stream transport and runs the connect / error / backoff /
//! reconnect state machine on one background task. Public methods send
//! commands to that task and return once it has applied them.
//!
//! ## States
//!
//! ```text
//!            connect()                 open ok
//!   Idle ───────────────► Connecting ───────────► Open
//!                             │  ▲                  │
//!                  open error │  │ retry open ok    │ transport error
//!                             ▼  │                  ▼
//!                          Reconnecting ◄───────────┘
//!                    (backoff wait + retry in flight)
//!
//!   any state ── disconnect() ──► Closed
//! ```
//!
//! A retry fired by the backoff timer stays in `Reconnecting` while its
//! request is in flight; only once the server accepts it does the state move
//! to `Connecting` and then `Open`. An explicit `connect()` or `reconnect()`
//! enters `Connecting` immediately.
//!
//! Frames are decoded and dispatched on the same task, one at a time, in
//! arrival order. Neither decode nor handler failures touch connection
//! state.

use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;

use super::backoff::BackoffPolicy;
use super::decoder::{decode_frame, frames, FrameStream};
use super::registry::EventRegistry;
use super::messages::Frame;
use super::transport::{ByteStream, Transport, TransportError};

/// Capacity of the connection event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle state of the stream session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Notifications published by the manager
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Emitted on every state assignment, including repeats
    StateChanged(ConnectionState),
    /// The stream was accepted and is now open
    Connected,
    /// The transport failed; a retry is scheduled
    Disconnected {
        error: TransportError,
        attempt: u32,
        retry_in: Duration,
    },
}

/// Point-in-time view of the session
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Consecutive failures since the last successful open
    pub attempt: u32,
    pub last_error: Option<TransportError>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            attempt: 0,
            last_error: None,
        }
    }
}

/// Observers that outlive a single manager instance
#[derive(Clone)]
pub struct ConnectionSignals {
    pub connected: Arc<watch::Sender<bool>>,
    pub events: broadcast::Sender<ConnectionEvent>,
}

impl Default for ConnectionSignals {
    fn default() -> Self {
        let (connected, _) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            connected: Arc::new(connected),
            events,
        }
    }
}

enum Command {
    Connect(oneshot::Sender<()>),
    Reconnect(oneshot::Sender<()>),
    Disconnect(oneshot::Sender<()>),
}

/// Handle to the connection task
///
/// Dropping the handle stops the task, which closes the transport and
/// cancels any pending retry timer.
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    signals: ConnectionSignals,
    task: JoinHandle<()>,
}

impl ConnectionManager {
    /// Spawn the connection task in the `Idle` state
    pub fn spawn(
        transport: Arc<dyn Transport>,
        registry: Arc<EventRegistry>,
        policy: BackoffPolicy,
        signals: ConnectionSignals,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());

        let worker = Worker {
            transport,
            registry,
            policy,
            commands: commands_rx,
            phase: Phase::Idle,
            status: ConnectionStatus::default(),
            status_tx,
            signals: signals.clone(),
        };
        let task = tokio::spawn(worker.run());

        Self {
            commands: commands_tx,
            status: status_rx,
            signals,
            task,
        }
    }

    /// Open a fresh transport, closing any existing one first
    pub async fn connect(&self) {
        self.send(Command::Connect).await;
    }

    /// Cancel any pending retry, reset the attempt count and connect now
    pub async fn reconnect(&self) {
        self.send(Command::Reconnect).await;
    }

    /// Cancel any pending retry, close the transport and enter `Closed`
    pub async fn disconnect(&self) {
        self.send(Command::Disconnect).await;
    }

    /// Current session status
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    /// Whether the stream is open
    pub fn is_connected(&self) -> bool {
        *self.signals.connected.borrow()
    }

    /// Watch the session status
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Subscribe to connection events
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.signals.events.subscribe()
    }

    async fn send(&self, make: impl FnOnce(oneshot::Sender<()>) -> Command) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(make(ack_tx)).is_err() {
            tracing::debug!("Connection task already stopped");
            return;
        }
        let _ = ack_rx.await;
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.task.abort();
        self.signals.connected.send_if_modified(|connected| {
            std::mem::replace(connected, false)
        });
    }
}

enum Phase {
    Idle,
    Opening(BoxFuture<'static, Result<ByteStream, TransportError>>),
    Streaming(FrameStream),
    Waiting(Pin<Box<Sleep>>),
    Closed,
}

enum Wake {
    Command(Option<Command>),
    Opened(Result<ByteStream, TransportError>),
    Received(Option<Result<Frame, TransportError>>),
    RetryDue,
}

struct Worker {
    transport: Arc<dyn Transport>,
    registry: Arc<EventRegistry>,
    policy: BackoffPolicy,
    commands: mpsc::UnboundedReceiver<Command>,
    phase: Phase,
    status: ConnectionStatus,
    status_tx: watch::Sender<ConnectionStatus>,
    signals: ConnectionSignals,
}

impl Worker {
    async fn run(mut self) {
        loop {
            // Commands win ties so a reconnect or disconnect always beats a
            // retry timer that became due in the same poll.
            let wake = match &mut self.phase {
                Phase::Opening(open) => tokio::select! {
                    biased;
                    cmd = self.commands.recv() => Wake::Command(cmd),
                    result = open => Wake::Opened(result),
                },
                Phase::Streaming(stream) => tokio::select! {
                    biased;
                    cmd = self.commands.recv() => Wake::Command(cmd),
                    frame = stream.next() => Wake::Received(frame),
                },
                Phase::Waiting(timer) => tokio::select! {
                    biased;
                    cmd = self.commands.recv() => Wake::Command(cmd),
                    _ = timer => Wake::RetryDue,
                },
                Phase::Idle | Phase::Closed => Wake::Command(self.commands.recv().await),
            };

            match wake {
                Wake::Command(Some(cmd)) => self.handle_command(cmd),
                Wake::Command(None) => break,
                Wake::Opened(Ok(stream)) => self.on_open(stream),
                Wake::Opened(Err(e)) => self.on_error(e),
                Wake::Received(Some(Ok(frame))) => self.on_frame(&frame),
                Wake::Received(Some(Err(e))) => self.on_error(e),
                Wake::Received(None) => self.on_error(TransportError::Closed),
                Wake::RetryDue => self.retry(),
            }
        }

        self.phase = Phase::Closed;
        tracing::debug!("Connection task stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect(ack) => {
                self.connect();
                let _ = ack.send(());
            }
            Command::Reconnect(ack) => {
                tracing::info!(
                    attempt = self.status.attempt,
                    "Manual reconnect, skipping backoff"
                );
                self.phase = Phase::Idle;
                self.status.attempt = 0;
                self.connect();
                let _ = ack.send(());
            }
            Command::Disconnect(ack) => {
                self.phase = Phase::Closed;
                self.set_state(ConnectionState::Closed);
                tracing::info!("Event stream disconnected");
                let _ = ack.send(());
            }
        }
    }

    fn connect(&mut self) {
        // Replacing the phase drops the previous transport or timer
        self.phase = Phase::Idle;
        self.status.last_error = None;
        self.set_state(ConnectionState::Connecting);
        self.start_open();
    }

    fn retry(&mut self) {
        tracing::info!(attempt = self.status.attempt, "Retrying event stream");
        self.start_open();
    }

    fn start_open(&mut self) {
        let transport = Arc::clone(&self.transport);
        self.phase = Phase::Opening(Box::pin(async move { transport.open().await }));
    }

    fn on_open(&mut self, stream: ByteStream) {
        self.phase = Phase::Streaming(frames(stream));
        self.status.attempt = 0;
        self.status.last_error = None;
        if self.status.state == ConnectionState::Reconnecting {
            self.set_state(ConnectionState::Connecting);
        }
        self.set_state(ConnectionState::Open);

        tracing::info!("Event stream open");
        let _ = self.signals.events.send(ConnectionEvent::Connected);
    }

    fn on_error(&mut self, error: TransportError) {
        self.status.attempt = self.status.attempt.saturating_add(1);
        let attempt = self.status.attempt;
        let retry_in = self.policy.delay(attempt);

        self.phase = Phase::Waiting(Box::pin(tokio::time::sleep(retry_in)));
        self.status.last_error = Some(error.clone());
        self.set_state(ConnectionState::Reconnecting);

        tracing::warn!(
            error = %error,
            attempt,
            retry_in_ms = retry_in.as_millis() as u64,
            "Event stream lost, scheduling retry"
        );
        let _ = self.signals.events.send(ConnectionEvent::Disconnected {
            error,
            attempt,
            retry_in,
        });
    }

    fn on_frame(&mut self, frame: &Frame) {
        match decode_frame(frame) {
            Ok(event) => {
                tracing::debug!(kind = %event.kind, "Event received");
                self.registry.dispatch(&event.kind, &event.payload);
            }
            Err(e) => {
                tracing::error!(error = %e, "Dropping malformed frame");
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.status.state != state {
            tracing::debug!(from = %self.status.state, to = %state, "Connection state");
        }
        self.status.state = state;
        self.status_tx.send_replace(self.status.clone());

        let open = state == ConnectionState::Open;
        self.signals
            .connected
            .send_if_modified(|connected| std::mem::replace(connected, open) != open);
        let _ = self.signals.events.send(ConnectionEvent::StateChanged(state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::messages::{EventKind, EventPayload};
    use crate::realtime::registry::Handler;
    use crate::realtime::test_support::{Script, ScriptedTransport};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager(transport: Arc<ScriptedTransport>, registry: Arc<EventRegistry>) -> ConnectionManager {
        ConnectionManager::spawn(
            transport,
            registry,
            BackoffPolicy::default(),
            ConnectionSignals::default(),
        )
    }

    async fn next_state(events: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionState {
        loop {
            if let ConnectionEvent::StateChanged(state) = events.recv().await.unwrap() {
                return state;
            }
        }
    }

    async fn next_retry(events: &mut broadcast::Receiver<ConnectionEvent>) -> (u32, Duration) {
        loop {
            if let ConnectionEvent::Disconnected {
                attempt, retry_in, ..
            } = events.recv().await.unwrap()
            {
                return (attempt, retry_in);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_idle() {
        let transport = ScriptedTransport::new(vec![]);
        let conn = manager(Arc::clone(&transport), Arc::new(EventRegistry::new()));

        assert_eq!(conn.state(), ConnectionState::Idle);
        assert!(!conn.is_connected());
        assert_eq!(transport.opens(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_grow_to_cap() {
        let transport = ScriptedTransport::always_failing();
        let conn = manager(Arc::clone(&transport), Arc::new(EventRegistry::new()));
        let mut events = conn.events();

        conn.connect().await;

        let mut delays = Vec::new();
        for expected_attempt in 1..=8 {
            let (attempt, retry_in) = next_retry(&mut events).await;
            assert_eq!(attempt, expected_attempt);
            delays.push(retry_in.as_millis());
        }
        assert_eq!(
            delays,
            vec![3000, 4500, 6750, 10125, 15188, 22781, 30000, 30000]
        );
        assert_eq!(conn.status().attempt, 8);
        assert!(conn.status().last_error.is_some());

        conn.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_sequence_three_failures_then_open() {
        let transport = ScriptedTransport::new(vec![
            Script::Fail(TransportError::Connect("refused".to_string())),
            Script::Fail(TransportError::Timeout),
            Script::Fail(TransportError::Status { status: 502 }),
            Script::Stream(vec![]),
        ]);
        let conn = manager(Arc::clone(&transport), Arc::new(EventRegistry::new()));
        let mut events = conn.events();

        conn.connect().await;

        let mut states = Vec::new();
        loop {
            let state = next_state(&mut events).await;
            states.push(state);
            if state == ConnectionState::Open {
                break;
            }
        }

        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Reconnecting,
                ConnectionState::Reconnecting,
                ConnectionState::Reconnecting,
                ConnectionState::Connecting,
                ConnectionState::Open,
            ]
        );
        assert_eq!(transport.opens(), 4);
        assert!(conn.is_connected());
        assert_eq!(conn.status().attempt, 0);
        assert!(conn.status().last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_open_resets_backoff() {
        let transport = ScriptedTransport::new(vec![
            Script::Fail(TransportError::Timeout),
            Script::Fail(TransportError::Timeout),
            Script::StreamThenClose(vec![]),
            Script::Fail(TransportError::Timeout),
        ]);
        let conn = manager(Arc::clone(&transport), Arc::new(EventRegistry::new()));
        let mut events = conn.events();

        conn.connect().await;

        assert_eq!(next_retry(&mut events).await, (1, Duration::from_millis(3000)));
        assert_eq!(next_retry(&mut events).await, (2, Duration::from_millis(4500)));
        // Third open succeeds, then the server closes the stream
        assert_eq!(next_retry(&mut events).await, (1, Duration::from_millis(3000)));
        assert_eq!(next_retry(&mut events).await, (2, Duration::from_millis(4500)));

        conn.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_cancels_pending_timer() {
        let transport = ScriptedTransport::new(vec![
            Script::Fail(TransportError::Connect("refused".to_string())),
            Script::Stream(vec![]),
        ]);
        let conn = manager(Arc::clone(&transport), Arc::new(EventRegistry::new()));
        let mut events = conn.events();

        conn.connect().await;
        let (attempt, retry_in) = next_retry(&mut events).await;
        assert_eq!((attempt, retry_in), (1, Duration::from_millis(3000)));
        assert_eq!(conn.state(), ConnectionState::Reconnecting);

        conn.reconnect().await;
        assert_eq!(conn.status().attempt, 0);

        assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut events).await, ConnectionState::Open);
        assert_eq!(transport.opens(), 2);

        // Well past the cancelled 3s timer: no extra attempt may appear
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.opens(), 2);
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_replaces_open_transport() {
        let transport = ScriptedTransport::new(vec![Script::Stream(vec![]), Script::Stream(vec![])]);
        let conn = manager(Arc::clone(&transport), Arc::new(EventRegistry::new()));
        let mut events = conn.events();

        conn.connect().await;
        while next_state(&mut events).await != ConnectionState::Open {}
        assert_eq!(transport.live_streams(), 1);

        conn.connect().await;
        while next_state(&mut events).await != ConnectionState::Open {}
        assert_eq!(transport.opens(), 2);
        assert_eq!(transport.live_streams(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_opening_drops_pending_open() {
        let transport = ScriptedTransport::new(vec![Script::Hang, Script::Stream(vec![])]);
        let conn = manager(Arc::clone(&transport), Arc::new(EventRegistry::new()));
        let mut events = conn.events();

        conn.connect().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert_eq!(transport.live_streams(), 1);

        conn.connect().await;
        while next_state(&mut events).await != ConnectionState::Open {}
        assert_eq!(transport.opens(), 2);
        assert_eq!(transport.live_streams(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_closes_and_cancels() {
        let transport = ScriptedTransport::always_failing();
        let conn = manager(Arc::clone(&transport), Arc::new(EventRegistry::new()));
        let mut events = conn.events();

        conn.connect().await;
        next_retry(&mut events).await;
        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Closed);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.opens(), 1);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_releases_transport() {
        let transport = ScriptedTransport::new(vec![Script::Stream(vec![])]);
        let signals = ConnectionSignals::default();
        let connected = signals.connected.subscribe();
        let conn = ConnectionManager::spawn(
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::new(EventRegistry::new()),
            BackoffPolicy::default(),
            signals,
        );
        let mut events = conn.events();

        conn.connect().await;
        while next_state(&mut events).await != ConnectionState::Open {}
        assert!(*connected.borrow());

        drop(conn);
        assert!(!*connected.borrow());
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(transport.live_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frame_leaves_connection_alone() {
        let registry = Arc::new(EventRegistry::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let handler = Handler::new("rates", move |payload: &EventPayload| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(payload.clone());
            Ok(())
        });
        registry.subscribe(EventKind::RatesUpdated, &handler);

        let transport = ScriptedTransport::new(vec![Script::Stream(vec![
            b"event: connected\ndata: {\"client_id\": \"c-1\"}\n\n".to_vec(),
            b"event: rates_updated\ndata: {\"timestamp\": oops\n\n".to_vec(),
            b"event: rates_updated\ndata: {\"timestamp\": \"t\", \"source\": \"CMB\", \"count\": 4}\n\n"
                .to_vec(),
        ])]);
        let conn = manager(Arc::clone(&transport), registry);

        conn.connect().await;
        let received = rx.recv().await.unwrap();

        match received {
            EventPayload::RatesUpdated(rates) => assert_eq!(rates.count, 4),
            other => panic!("Expected RatesUpdated, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(conn.state(), ConnectionState::Open);
        assert!(conn.is_connected());
        assert_eq!(transport.opens(), 1);
        assert_eq!(transport.live_streams(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_utf8_frame_is_dropped() {
        let registry = Arc::new(EventRegistry::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Handler::new("rates", move |payload: &EventPayload| {
            let _ = tx.send(payload.clone());
            Ok(())
        });
        registry.subscribe(EventKind::RatesUpdated, &handler);

        let transport = ScriptedTransport::new(vec![Script::Stream(vec![
            b"event: rates_updated\ndata: {\"timestamp\": \"t\", \"source\": \"CM\xff\xfe\", \"count\": 1}\n\n"
                .to_vec(),
            b"event: rates_updated\ndata: {\"timestamp\": \"t\", \"source\": \"CMB\", \"count\": 2}\n\n"
                .to_vec(),
        ])]);
        let conn = manager(Arc::clone(&transport), registry);

        conn.connect().await;
        match rx.recv().await.unwrap() {
            EventPayload::RatesUpdated(rates) => {
                assert_eq!(rates.source, "CMB");
                assert_eq!(rates.count, 2);
            }
            other => panic!("Expected RatesUpdated, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(conn.state(), ConnectionState::Open);
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_failure_does_not_affect_connection() {
        let registry = Arc::new(EventRegistry::new());
        let failing = Handler::new("failing", |_| panic!("consumer bug"));
        registry.subscribe(EventKind::Connected, &failing);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let after = Handler::new("after", move |_| {
            let _ = tx.send(());
            Ok(())
        });
        registry.subscribe(EventKind::Connected, &after);

        let transport = ScriptedTransport::new(vec![Script::Stream(vec![
            b"event: connected\ndata: {\"client_id\": \"c-2\"}\n\n".to_vec(),
        ])]);
        let conn = manager(Arc::clone(&transport), registry);

        conn.connect().await;
        rx.recv().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Open);
        assert_eq!(transport.opens(), 1);
    }
}
