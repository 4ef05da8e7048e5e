//! Stream Message Types
//!
//! Event kinds and payload shapes carried by the server push stream.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tag identifying the shape of a frame's payload
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Session handshake announced by the server
    Connected,
    /// A fresh batch of exchange rates was stored
    RatesUpdated,
    /// A user-defined rate alert fired
    AlertTriggered,
    /// Any tag outside the known set, kept verbatim
    Other(String),
}

impl EventKind {
    /// Wire name of this kind
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Connected => "connected",
            EventKind::RatesUpdated => "rates_updated",
            EventKind::AlertTriggered => "alert_triggered",
            EventKind::Other(tag) => tag,
        }
    }

    /// Whether this kind belongs to the known, typed set
    pub fn is_known(&self) -> bool {
        !matches!(self, EventKind::Other(_))
    }
}

impl From<&str> for EventKind {
    fn from(tag: &str) -> Self {
        match tag {
            "connected" => EventKind::Connected,
            "rates_updated" => EventKind::RatesUpdated,
            "alert_triggered" => EventKind::AlertTriggered,
            other => EventKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of the `connected` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectedPayload {
    /// Identifier the server assigned to this stream session
    pub client_id: String,
}

/// Payload of the `rates_updated` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatesUpdatedPayload {
    /// ISO 8601 time the refresh completed
    pub timestamp: String,
    /// Upstream rate source (e.g. "CMB")
    pub source: String,
    /// Number of rates stored in this refresh
    pub count: u64,
}

/// Condition attached to a rate alert rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AlertCondition {
    RateAbove,
    RateBelow,
    /// Absolute 24h change, threshold in percent
    DailyChangeAbove,
    Other(String),
}

impl From<String> for AlertCondition {
    fn from(value: String) -> Self {
        match value.as_str() {
            "rate_above" => AlertCondition::RateAbove,
            "rate_below" => AlertCondition::RateBelow,
            "daily_change_above" => AlertCondition::DailyChangeAbove,
            _ => AlertCondition::Other(value),
        }
    }
}

impl From<AlertCondition> for String {
    fn from(condition: AlertCondition) -> Self {
        match condition {
            AlertCondition::RateAbove => "rate_above".to_string(),
            AlertCondition::RateBelow => "rate_below".to_string(),
            AlertCondition::DailyChangeAbove => "daily_change_above".to_string(),
            AlertCondition::Other(value) => value,
        }
    }
}

/// Payload of the `alert_triggered` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertTriggeredPayload {
    /// Unique id of this trigger occurrence, when the server records one
    #[serde(default)]
    pub event_id: Option<i64>,
    /// Alert rule that fired
    pub alert_id: i64,
    pub condition: AlertCondition,
    pub threshold: f64,
    pub current_rate: f64,
    /// Currency pair such as "JPY_CNY"
    pub currency_pair: String,
    #[serde(default)]
    pub triggered_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_email: Option<String>,
}

/// Decoded payload, one variant per known kind
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Connected(ConnectedPayload),
    RatesUpdated(RatesUpdatedPayload),
    AlertTriggered(AlertTriggeredPayload),
    /// Structured data for a kind outside the known set
    Other(serde_json::Value),
}

/// A decoded stream event, alive only for the duration of its dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub payload: EventPayload,
}

/// One raw frame as cut from the stream: an event tag and its data text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: String,
    pub data: String,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }
}
