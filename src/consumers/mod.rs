//! Consumer Adapters
//!
//! Turn dispatched events into side effects on the collaborators around the
//! real-time client:
//! - a query cache that can invalidate results by key
//! - a notification surface (desktop notifications)
//! - local settings storage for the notification permission
//!
//! Consumers must tolerate duplicate delivery; every side effect here is
//! idempotent.

mod adapters;
mod cache;
mod notify;
mod settings;

pub use adapters::{AlertConsumer, RatesConsumer};
pub use cache::MemoryQueryCache;
pub use notify::DesktopNotifier;
pub use settings::{LocalSettings, Settings, SettingsError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hierarchical key of a cached query result
///
/// Invalidating a key also invalidates every key it prefixes, so
/// `["currency", "rates"]` covers `["currency", "rates", "JPY_CNY"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// Whether `prefix` covers this key
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

/// A cache of query results
#[async_trait]
pub trait QueryCache: Send + Sync {
    /// Mark every result under `key` stale
    async fn invalidate(&self, key: &QueryKey);
}

/// A notification to show to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRequest {
    pub title: String,
    pub body: String,
    /// Notifications with the same tag replace each other
    pub tag: String,
}

/// Whether the user allows desktop notifications
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// Never asked
    #[default]
    Default,
    Granted,
    Denied,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Permission::Default => "default",
            Permission::Granted => "granted",
            Permission::Denied => "denied",
        };
        f.write_str(name)
    }
}

/// Where notifications are shown
///
/// `show` never fails; without permission it does nothing.
#[async_trait]
pub trait NotificationSurface: Send + Sync {
    fn permission(&self) -> Permission;

    /// Ask for permission if it has not been decided yet
    fn request_permission(&self) -> Permission;

    async fn show(&self, request: NotificationRequest);
}
