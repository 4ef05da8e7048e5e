//! Synthetic rate publisher
//!
//! Stands in for the backend's scheduled rate fetch: every tick it
//! broadcasts `rates_updated`, and every few ticks an `alert_triggered` for a
//! demo rule.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::hub::StreamHub;
use crate::realtime::{AlertCondition, AlertTriggeredPayload, EventKind, RatesUpdatedPayload};

/// Pairs quoted by the demo source, with their reference rates
const DEMO_PAIRS: [(&str, f64); 4] = [
    ("USD_CNY", 7.12),
    ("EUR_CNY", 7.79),
    ("GBP_CNY", 9.04),
    ("JPY_CNY", 0.0472),
];

/// Ticks between demo alerts
const ALERT_EVERY: u64 = 4;

/// Broadcast synthetic updates until the returned task is aborted
pub fn spawn_rate_publisher(hub: Arc<StreamHub>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        let mut tick: u64 = 0;
        loop {
            ticker.tick().await;
            tick += 1;

            let rates = RatesUpdatedPayload {
                timestamp: Utc::now().to_rfc3339(),
                source: "CMB".to_string(),
                count: DEMO_PAIRS.len() as u64,
            };
            if let Err(e) = hub.broadcast(&EventKind::RatesUpdated, &rates) {
                tracing::error!(error = %e, "Failed to publish rates");
                continue;
            }

            if tick % ALERT_EVERY == 0 {
                let alert = demo_alert(tick);
                if let Err(e) = hub.broadcast(&EventKind::AlertTriggered, &alert) {
                    tracing::error!(error = %e, "Failed to publish alert");
                }
            }
        }
    })
}

fn demo_alert(tick: u64) -> AlertTriggeredPayload {
    let (pair, reference) = DEMO_PAIRS[(tick / ALERT_EVERY) as usize % DEMO_PAIRS.len()];
    // Small deterministic drift around the reference rate
    let drift = ((tick as f64).sin() * 0.01 + 1.015) * reference;
    let current_rate = (drift * 10_000.0).round() / 10_000.0;

    AlertTriggeredPayload {
        event_id: Some(tick as i64),
        alert_id: (tick / ALERT_EVERY) as i64 % DEMO_PAIRS.len() as i64 + 1,
        condition: AlertCondition::RateAbove,
        threshold: reference,
        current_rate,
        currency_pair: pair.to_string(),
        triggered_at: Some(Utc::now().to_rfc3339()),
        notify_email: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::Frame;

    #[test]
    fn test_demo_alert_is_above_threshold() {
        for tick in (ALERT_EVERY..=ALERT_EVERY * 8).step_by(ALERT_EVERY as usize) {
            let alert = demo_alert(tick);
            assert!(alert.current_rate > alert.threshold, "tick {}", tick);
            assert_eq!(alert.event_id, Some(tick as i64));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_publisher_emits_rates_then_alert() {
        let hub = Arc::new(StreamHub::default());
        let (_guard, mut rx) = hub.register().unwrap();

        let task = spawn_rate_publisher(Arc::clone(&hub), Duration::from_secs(15));

        let mut kinds = Vec::new();
        while kinds.len() < ALERT_EVERY as usize + 1 {
            let frame: Frame = rx.recv().await.unwrap();
            kinds.push(frame.event);
        }
        task.abort();

        assert_eq!(
            kinds,
            vec![
                "rates_updated",
                "rates_updated",
                "rates_updated",
                "rates_updated",
                "alert_triggered"
            ]
        );
    }
}
