//! Real-time update client
//!
//! Keeps one long-lived server push stream open, recovers from transport
//! failures with exponential backoff, and fans typed events out to
//! independently registered handlers.
//!
//! ```text
//! transport ─► frames ─► decode_frame ─► EventRegistry ─► handlers
//!     ▲
//!     └── ConnectionManager (connect / backoff / reconnect)
//! ```

pub mod backoff;
pub mod client;
pub mod connection;
pub mod decoder;
pub mod messages;
pub mod registry;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use backoff::BackoffPolicy;
pub use client::RealtimeClient;
pub use connection::{
    ConnectionEvent, ConnectionManager, ConnectionSignals, ConnectionState, ConnectionStatus,
};
pub use decoder::{decode_frame, frames, DecodeError, FrameGuard, FrameStream};
pub use messages::{
    AlertCondition, AlertTriggeredPayload, ConnectedPayload, Event, EventKind, EventPayload,
    Frame, RatesUpdatedPayload,
};
pub use registry::{DispatchReport, EventRegistry, Handler, HandlerError, HandlerResult};
pub use transport::{ByteStream, HttpTransport, Transport, TransportError};
