//! Built-in event consumers
//!
//! - [`RatesConsumer`]: a rate refresh makes every rate-derived query stale.
//! - [`AlertConsumer`]: a triggered alert refreshes the alert list and shows
//!   one notification per alert rule.
//!
//! Both do their work on spawned tasks so a slow cache or notifier never
//! holds up the next frame.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::{NotificationRequest, NotificationSurface, QueryCache, QueryKey};
use crate::realtime::{
    AlertCondition, AlertTriggeredPayload, EventKind, EventPayload, Handler, RealtimeClient,
};

/// Queries computed from exchange rates
const RATE_DEPENDENT_QUERIES: [[&str; 2]; 4] = [
    ["currency", "rates"],
    ["currency", "stats"],
    ["currency", "history"],
    ["currency", "profit"],
];

/// How many alert occurrences are remembered for duplicate detection
const SEEN_ALERTS_CAPACITY: usize = 128;

/// Invalidates rate-derived queries on `rates_updated`
pub struct RatesConsumer {
    handler: Handler,
}

impl RatesConsumer {
    pub fn new(cache: Arc<dyn QueryCache>) -> Self {
        let handler = Handler::spawning("rates-cache", move |payload: EventPayload| {
            let cache = Arc::clone(&cache);
            async move {
                if let EventPayload::RatesUpdated(rates) = &payload {
                    tracing::info!(
                        source = %rates.source,
                        count = rates.count,
                        "Rates refreshed"
                    );
                    for parts in RATE_DEPENDENT_QUERIES {
                        cache.invalidate(&QueryKey::new(parts)).await;
                    }
                }
                Ok(())
            }
        });
        Self { handler }
    }

    pub fn attach(&self, client: &RealtimeClient) -> bool {
        client.on(EventKind::RatesUpdated, &self.handler)
    }

    pub fn detach(&self, client: &RealtimeClient) -> bool {
        client.off(EventKind::RatesUpdated, &self.handler)
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }
}

/// Refreshes alerts and notifies the user on `alert_triggered`
pub struct AlertConsumer {
    handler: Handler,
}

impl AlertConsumer {
    pub fn new(cache: Arc<dyn QueryCache>, notifier: Arc<dyn NotificationSurface>) -> Self {
        let seen = Arc::new(SeenAlerts::new(SEEN_ALERTS_CAPACITY));

        let handler = Handler::spawning("alert-notify", move |payload: EventPayload| {
            // Duplicate check happens here, in frame order
            let alert = match payload {
                EventPayload::AlertTriggered(alert) if seen.first_delivery(alert.event_id) => {
                    Some(alert)
                }
                EventPayload::AlertTriggered(alert) => {
                    tracing::debug!(event_id = ?alert.event_id, "Duplicate alert ignored");
                    None
                }
                _ => None,
            };
            let cache = Arc::clone(&cache);
            let notifier = Arc::clone(&notifier);

            async move {
                let Some(alert) = alert else {
                    return Ok(());
                };
                tracing::info!(
                    alert_id = alert.alert_id,
                    pair = %alert.currency_pair,
                    rate = alert.current_rate,
                    "Rate alert triggered"
                );
                cache.invalidate(&QueryKey::new(["currency", "alerts"])).await;
                notifier.show(alert_notification(&alert)).await;
                Ok(())
            }
        });
        Self { handler }
    }

    pub fn attach(&self, client: &RealtimeClient) -> bool {
        client.on(EventKind::AlertTriggered, &self.handler)
    }

    pub fn detach(&self, client: &RealtimeClient) -> bool {
        client.off(EventKind::AlertTriggered, &self.handler)
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }
}

/// Build the notification for a triggered alert
///
/// The tag is per alert rule, so repeated triggers replace each other.
pub fn alert_notification(alert: &AlertTriggeredPayload) -> NotificationRequest {
    let pair = &alert.currency_pair;
    let body = match &alert.condition {
        AlertCondition::RateAbove => format!(
            "{} rose above {} (now {})",
            pair, alert.threshold, alert.current_rate
        ),
        AlertCondition::RateBelow => format!(
            "{} fell below {} (now {})",
            pair, alert.threshold, alert.current_rate
        ),
        AlertCondition::DailyChangeAbove => format!(
            "{} moved more than {}% in 24h (now {})",
            pair, alert.threshold, alert.current_rate
        ),
        AlertCondition::Other(condition) => format!(
            "{} triggered {} at {}",
            pair, condition, alert.current_rate
        ),
    };

    NotificationRequest {
        title: format!("Rate alert: {}", pair),
        body,
        tag: format!("rate-alert-{}", alert.alert_id),
    }
}

/// Bounded memory of delivered alert occurrences
struct SeenAlerts {
    ids: Mutex<VecDeque<i64>>,
    capacity: usize,
}

impl SeenAlerts {
    fn new(capacity: usize) -> Self {
        Self {
            ids: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Occurrences without an id cannot be matched and always pass
    fn first_delivery(&self, event_id: Option<i64>) -> bool {
        let Some(id) = event_id else {
            return true;
        };
        let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        if ids.contains(&id) {
            return false;
        }
        if ids.len() == self.capacity {
            ids.pop_front();
        }
        ids.push_back(id);
        true
    }
}
