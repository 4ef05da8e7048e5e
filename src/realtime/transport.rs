//! Stream Transport
//!
//! The [`Transport`] trait opens one streaming body; the connection manager
//! owns whatever it returns and decides when to open another. Transports
//! never retry on their own.

use async_trait::async_trait;
use futures_util::{Stream, StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE, COOKIE};
use reqwest::Client;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

use crate::config::StreamConfig;

/// Body chunks of an open stream, in arrival order
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, TransportError>> + Send>>;

/// Opens the server push stream
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a new stream; resolves once the server has accepted it
    async fn open(&self) -> Result<ByteStream, TransportError>;
}

/// Connectivity failures; all of them are retried
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection timed out")]
    Timeout,

    #[error("Unexpected status {status}")]
    Status { status: u16 },

    #[error("Unexpected content type: {0}")]
    ContentType(String),

    #[error("Stream read failed: {0}")]
    Read(String),

    #[error("Stream closed by server")]
    Closed,
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else if e.is_body() || e.is_decode() {
            TransportError::Read(e.to_string())
        } else {
            TransportError::Connect(e.to_string())
        }
    }
}

/// `text/event-stream` transport over HTTP
pub struct HttpTransport {
    client: Client,
    url: String,
    cookie: Option<String>,
}

impl HttpTransport {
    /// Build a transport for the configured events endpoint
    pub fn new(config: &StreamConfig) -> Result<Self, TransportError> {
        // No overall timeout: the body stays open indefinitely
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let cookie = config
            .session_cookie
            .as_ref()
            .map(|value| format!("{}={}", config.cookie_name, value));

        Ok(Self {
            client,
            url: config.events_url(),
            cookie,
        })
    }

    /// Endpoint this transport connects to
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self) -> Result<ByteStream, TransportError> {
        let mut request = self
            .client
            .get(&self.url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(cookie) = &self.cookie {
            request = request.header(COOKIE, cookie);
        }

        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.starts_with("text/event-stream") {
            return Err(TransportError::ContentType(content_type));
        }

        tracing::debug!(url = %self.url, "Event stream accepted");

        let body = response
            .bytes_stream()
            .map_ok(|chunk| chunk.to_vec())
            .map_err(TransportError::from);
        Ok(body.boxed())
    }
}
