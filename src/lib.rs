//! # ratefeed
//!
//! Real-time exchange-rate update client. Keeps a server push stream open,
//! recovers from connection failures with exponential backoff, and fans
//! typed events out to consumers that refresh cached queries and show
//! desktop notifications.
//!
//! ## Modules
//!
//! - [`realtime`]: stream transport, decoder, connection manager and
//!   handler registry
//! - [`consumers`]: cache invalidation, notifications and local settings
//! - [`devserver`]: a development server speaking the same stream protocol
//! - [`config`]: TOML + environment configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ratefeed::realtime::{EventKind, EventPayload, Handler, RealtimeClient};
//! use ratefeed::Config;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = RealtimeClient::from_config(&Config::load_default())?;
//!
//!     let on_rates = Handler::new("print-rates", |payload: &EventPayload| {
//!         if let EventPayload::RatesUpdated(rates) = payload {
//!             println!("{} rates from {}", rates.count, rates.source);
//!         }
//!         Ok(())
//!     });
//!     client.on(EventKind::RatesUpdated, &on_rates);
//!
//!     client.enable().await;
//!     tokio::signal::ctrl_c().await?;
//!     client.disable().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consumers;
pub mod devserver;
pub mod realtime;

pub use config::{
    BackoffConfig, Config, ConfigError, LoggingConfig, NotificationsConfig, ServerConfig,
    StreamConfig,
};

pub use realtime::{
    BackoffPolicy, ConnectionEvent, ConnectionState, EventKind, EventPayload, Handler,
    HandlerError, RealtimeClient, TransportError,
};

pub use consumers::{
    AlertConsumer, DesktopNotifier, LocalSettings, MemoryQueryCache, NotificationRequest,
    NotificationSurface, Permission, QueryCache, QueryKey, RatesConsumer,
};

pub use devserver::StreamHub;
