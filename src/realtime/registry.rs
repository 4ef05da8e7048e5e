//! Event Dispatch Registry
//!
//! Maps each [`EventKind`] to the handlers subscribed to it and fans every
//! decoded event out to them.
//!
//! ## Dispatch rules
//!
//! - Handlers run in subscription order, each receiving the same payload.
//! - A failing or panicking handler is logged and skipped; its siblings and
//!   the connection keep going.
//! - Every dispatch works on a snapshot taken when it starts. Handlers added
//!   while a pass is running wait for the next event. A handler removed while
//!   a pass is running is skipped if its turn has not come yet, so nothing is
//!   ever invoked after its removal and nothing is invoked twice.

use futures_util::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;

use super::messages::{EventKind, EventPayload};

/// Outcome of a single handler invocation
pub type HandlerResult = Result<(), HandlerError>;

type Callback = dyn Fn(&EventPayload) -> HandlerResult + Send + Sync;

/// A subscribable callback with a stable identity
///
/// Clones share identity: subscribing a clone of an already subscribed
/// handler is a no-op, and any clone can be used to unsubscribe it.
#[derive(Clone)]
pub struct Handler {
    name: Arc<str>,
    callback: Arc<Callback>,
}

impl Handler {
    /// Wrap a synchronous callback
    pub fn new<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&EventPayload) -> HandlerResult + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name.into()),
            callback: Arc::new(callback),
        }
    }

    /// Wrap a callback whose work continues asynchronously
    ///
    /// The returned future is spawned on the current tokio runtime and does
    /// not hold up later frames. Its error or panic is logged. The future
    /// must check for itself whether the state it acts on is still current.
    pub fn spawning<F, Fut>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(EventPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let name: Arc<str> = Arc::from(name.into());
        let task_name = Arc::clone(&name);

        let callback = move |payload: &EventPayload| -> HandlerResult {
            let runtime =
                tokio::runtime::Handle::try_current().map_err(|_| HandlerError::NoRuntime)?;
            let work = callback(payload.clone());
            let task_name = Arc::clone(&task_name);
            runtime.spawn(async move {
                let _ = run_deferred(&task_name, work).await;
            });
            Ok(())
        };

        Self {
            name,
            callback: Arc::new(callback),
        }
    }

    /// Name used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether two handles refer to the same subscription target
    pub fn same_as(&self, other: &Handler) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.callback) as *const (),
            Arc::as_ptr(&other.callback) as *const (),
        )
    }

    fn invoke(&self, payload: &EventPayload) -> HandlerResult {
        match catch_unwind(AssertUnwindSafe(|| (self.callback)(payload))) {
            Ok(result) => result,
            Err(panic) => Err(HandlerError::Panicked(panic_message(panic))),
        }
    }
}

/// Drive deferred handler work to completion, logging its failure
async fn run_deferred<Fut>(name: &str, work: Fut) -> HandlerResult
where
    Fut: Future<Output = HandlerResult>,
{
    let result = match AssertUnwindSafe(work).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(HandlerError::Panicked(panic_message(panic))),
    };
    if let Err(e) = &result {
        tracing::warn!(handler = %name, error = %e, "Deferred handler work failed");
    }
    result
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler").field("name", &self.name).finish()
    }
}

/// Errors raised by consumer callbacks
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("Handler panicked: {0}")]
    Panicked(String),

    #[error("No async runtime available for deferred handler work")]
    NoRuntime,
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// Summary of one dispatch pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers that ran to completion without error
    pub delivered: usize,
    /// Handlers that returned an error or panicked
    pub failed: usize,
    /// Snapshot members removed before their turn
    pub skipped: usize,
}

struct Subscription {
    handler: Handler,
    active: Arc<AtomicBool>,
}

/// Registry of event handlers keyed by event kind
#[derive(Default)]
pub struct EventRegistry {
    subscriptions: RwLock<HashMap<EventKind, Vec<Subscription>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a handler to a kind
    ///
    /// Returns false if this handler was already subscribed to the kind.
    pub fn subscribe(&self, kind: EventKind, handler: &Handler) -> bool {
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let entries = subs.entry(kind.clone()).or_default();

        if entries.iter().any(|s| s.handler.same_as(handler)) {
            return false;
        }

        entries.push(Subscription {
            handler: handler.clone(),
            active: Arc::new(AtomicBool::new(true)),
        });

        tracing::debug!(kind = %kind, handler = %handler.name(), "Handler subscribed");
        true
    }

    /// Remove a handler from a kind
    ///
    /// Returns false if the handler was not subscribed to the kind.
    pub fn unsubscribe(&self, kind: &EventKind, handler: &Handler) -> bool {
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let Some(entries) = subs.get_mut(kind) else {
            return false;
        };

        let Some(index) = entries.iter().position(|s| s.handler.same_as(handler)) else {
            return false;
        };

        let removed = entries.remove(index);
        removed.active.store(false, Ordering::SeqCst);
        if entries.is_empty() {
            subs.remove(kind);
        }

        tracing::debug!(kind = %kind, handler = %handler.name(), "Handler unsubscribed");
        true
    }

    /// Invoke every handler subscribed to `kind`
    pub fn dispatch(&self, kind: &EventKind, payload: &EventPayload) -> DispatchReport {
        let snapshot: Vec<(Handler, Arc<AtomicBool>)> = {
            let subs = self
                .subscriptions
                .read()
                .unwrap_or_else(|e| e.into_inner());
            match subs.get(kind) {
                Some(entries) => entries
                    .iter()
                    .map(|s| (s.handler.clone(), Arc::clone(&s.active)))
                    .collect(),
                None => Vec::new(),
            }
        };

        let mut report = DispatchReport::default();
        if snapshot.is_empty() {
            tracing::trace!(kind = %kind, "No handlers for event");
            return report;
        }

        for (handler, active) in snapshot {
            if !active.load(Ordering::SeqCst) {
                report.skipped += 1;
                continue;
            }

            match handler.invoke(payload) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(
                        kind = %kind,
                        handler = %handler.name(),
                        error = %e,
                        "Event handler failed"
                    );
                }
            }
        }

        tracing::trace!(
            kind = %kind,
            delivered = report.delivered,
            failed = report.failed,
            "Dispatched event"
        );
        report
    }

    /// Number of handlers subscribed to a kind
    pub fn subscriber_count(&self, kind: &EventKind) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(kind)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }
}
