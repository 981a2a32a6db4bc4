//! In-process handler registration and dispatch.
//!
//! Registrations are process-local and never persisted. A handler is registered
//! either against one event type tag or against all events; dispatch is two map
//! lookups followed by invocation in registration order.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, warn};

use crate::event::DomainEvent;

/// A registered callback. Handlers must be idempotent: delivery is at-least-once.
pub type EventHandler = Arc<dyn Fn(&DomainEvent) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by registration, used to unregister.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// What a handler was registered against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    EventType(String),
    AllEvents,
}

#[derive(Clone)]
struct Registered {
    id: HandlerId,
    handler: EventHandler,
}

/// A handler that returned an error or panicked while handling one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub handler_id: HandlerId,
    pub subscription: Subscription,
    pub error: String,
}

/// Outcome of dispatching one event to every matching handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub invoked: usize,
    pub failures: Vec<HandlerFailure>,
}

impl DispatchReport {
    pub fn succeeded(&self) -> usize {
        self.invoked - self.failures.len()
    }
}

/// Registry of event handlers keyed by type tag, plus catch-all handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    next_id: AtomicU64,
    by_type: RwLock<HashMap<String, Vec<Registered>>>,
    catch_all: RwLock<Vec<Registered>>,
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.len())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> HandlerId {
        HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a handler for one event type tag.
    pub fn register<F>(&self, event_type: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&DomainEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let event_type = event_type.into();
        let id = self.next_id();
        debug!(event_type = %event_type, handler_id = id.0, "registered event handler");

        self.by_type
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event_type)
            .or_default()
            .push(Registered {
                id,
                handler: Arc::new(handler),
            });
        id
    }

    /// Register a handler invoked for every event.
    pub fn register_all<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&DomainEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id();
        debug!(handler_id = id.0, "registered catch-all handler");

        self.catch_all
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registered {
                id,
                handler: Arc::new(handler),
            });
        id
    }

    /// Remove a handler. Returns `false` if the id was not registered.
    pub fn unregister(&self, id: HandlerId) -> bool {
        {
            let mut by_type = self.by_type.write().unwrap_or_else(PoisonError::into_inner);
            let mut removed = false;
            for handlers in by_type.values_mut() {
                if let Some(pos) = handlers.iter().position(|r| r.id == id) {
                    handlers.remove(pos);
                    removed = true;
                    break;
                }
            }
            if removed {
                by_type.retain(|_, hs| !hs.is_empty());
                return true;
            }
        }

        let mut catch_all = self.catch_all.write().unwrap_or_else(PoisonError::into_inner);
        match catch_all.iter().position(|r| r.id == id) {
            Some(pos) => {
                catch_all.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        let typed: usize = self
            .by_type
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum();
        typed + self.catch_all.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the handlers matching `event_type`: type-specific first, then catch-all.
    fn matching(&self, event_type: &str) -> Vec<(Subscription, Registered)> {
        let mut matched = Vec::new();

        if let Some(handlers) = self
            .by_type
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_type)
        {
            matched.extend(
                handlers
                    .iter()
                    .cloned()
                    .map(|r| (Subscription::EventType(event_type.to_string()), r)),
            );
        }

        matched.extend(
            self.catch_all
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .cloned()
                .map(|r| (Subscription::AllEvents, r)),
        );

        matched
    }

    /// Invoke every matching handler.
    ///
    /// Each handler runs in isolation: an error or a panic is logged and recorded in
    /// the report, and the remaining handlers still run. No lock is held while a
    /// handler executes, so handlers may register or unregister other handlers.
    pub fn dispatch(&self, event: &DomainEvent) -> DispatchReport {
        let mut report = DispatchReport::default();

        for (subscription, registered) in self.matching(event.event_type()) {
            report.invoked += 1;

            let outcome = catch_unwind(AssertUnwindSafe(|| (registered.handler)(event)));
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => format!("{err:#}"),
                Err(panic) => panic_message(panic.as_ref()),
            };

            warn!(
                event_id = %event.event_id(),
                event_type = %event.event_type(),
                handler_id = registered.id.0,
                error = %error,
                "event handler failed"
            );
            report.failures.push(HandlerFailure {
                handler_id: registered.id,
                subscription,
                error,
            });
        }

        report
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use eventlog_core::{AggregateId, EventId};
    use std::sync::Mutex;

    fn event(event_type: &str) -> DomainEvent {
        DomainEvent::new(
            EventId::new(),
            AggregateId::new(),
            1,
            Utc::now(),
            event_type,
            serde_json::json!({}),
        )
    }

    #[test]
    fn typed_handlers_run_before_catch_all() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let c = calls.clone();
        registry.register_all(move |_| {
            c.lock().unwrap().push("all");
            Ok(())
        });
        let c = calls.clone();
        registry.register("horse.added", move |_| {
            c.lock().unwrap().push("typed");
            Ok(())
        });

        let report = registry.dispatch(&event("horse.added"));

        assert_eq!(report.invoked, 2);
        assert_eq!(*calls.lock().unwrap(), vec!["typed", "all"]);
    }

    #[test]
    fn other_types_only_reach_catch_all() {
        let registry = HandlerRegistry::new();
        registry.register("horse.added", |_| Ok(()));
        registry.register_all(|_| Ok(()));

        let report = registry.dispatch(&event("member.registered"));
        assert_eq!(report.invoked, 1);
    }

    #[test]
    fn failing_and_panicking_handlers_are_isolated() {
        let registry = HandlerRegistry::new();
        let reached = Arc::new(AtomicU64::new(0));

        registry.register("x", |_| Err(anyhow::anyhow!("boom")));
        registry.register("x", |_| panic!("kaboom"));
        let r = reached.clone();
        registry.register_all(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let report = registry.dispatch(&event("x"));

        assert_eq!(report.invoked, 3);
        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].error, "boom");
        assert!(report.failures[1].error.contains("kaboom"));
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregister_removes_typed_and_catch_all() {
        let registry = HandlerRegistry::new();
        let typed = registry.register("x", |_| Ok(()));
        let all = registry.register_all(|_| Ok(()));
        assert_eq!(registry.len(), 2);

        assert!(registry.unregister(typed));
        assert!(registry.unregister(all));
        assert!(!registry.unregister(all));
        assert!(registry.is_empty());
        assert_eq!(registry.dispatch(&event("x")).invoked, 0);
    }
}
