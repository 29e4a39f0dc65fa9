//! Publish/subscribe hub for canonical events.
//!
//! The bus is an explicitly constructed handle: the host creates one at startup
//! and passes clones to the registry, sessions and consumers. Tests build their
//! own isolated instances.
//!
//! `emit` never fails. Handlers run synchronously in registration order (typed
//! handlers first, then wildcard handlers) with no lock held, so a handler may
//! emit, subscribe or unsubscribe re-entrantly. A handler that returns an error
//! or panics is logged and skipped; the remaining handlers still run.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::events::{AIEvent, AIEventType};

/// Error type handlers may return; it is logged and never reaches the emitter.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult = Result<(), HandlerError>;

type Handler = Arc<dyn Fn(&AIEvent) -> HandlerResult + Send + Sync>;

struct Entry {
    id: u64,
    handler: Handler,
    active: Arc<AtomicBool>,
}

#[derive(Default)]
struct Handlers {
    next_id: u64,
    typed: HashMap<AIEventType, Vec<Entry>>,
    any: Vec<Entry>,
}

impl Handlers {
    fn remove(&mut self, id: u64, slot: Option<AIEventType>) {
        let list = match slot {
            Some(event_type) => match self.typed.get_mut(&event_type) {
                Some(list) => list,
                None => return,
            },
            None => &mut self.any,
        };
        list.retain(|entry| entry.id != id);
    }
}

/// Cloneable handle to a shared set of subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Handlers>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for exactly one event type.
    pub fn on<F>(&self, event_type: AIEventType, handler: F) -> Subscription
    where
        F: Fn(&AIEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.subscribe(Some(event_type), Arc::new(handler))
    }

    /// Registers `handler` for every event. Meant for passive observers.
    pub fn on_any<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&AIEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.subscribe(None, Arc::new(handler))
    }

    fn subscribe(&self, slot: Option<AIEventType>, handler: Handler) -> Subscription {
        let active = Arc::new(AtomicBool::new(true));
        let mut handlers = self.inner.lock();
        let id = handlers.next_id;
        handlers.next_id += 1;
        let entry = Entry {
            id,
            handler,
            active: Arc::clone(&active),
        };
        match slot {
            Some(event_type) => handlers.typed.entry(event_type).or_default().push(entry),
            None => handlers.any.push(entry),
        }
        Subscription {
            bus: Arc::downgrade(&self.inner),
            id,
            slot,
            active,
        }
    }

    /// Delivers `event` to every matching handler.
    pub fn emit(&self, event: &AIEvent) {
        let snapshot: Vec<(Handler, Arc<AtomicBool>)> = {
            let handlers = self.inner.lock();
            handlers
                .typed
                .get(&event.event_type())
                .into_iter()
                .flatten()
                .chain(handlers.any.iter())
                .map(|entry| (Arc::clone(&entry.handler), Arc::clone(&entry.active)))
                .collect()
        };

        for (handler, active) in snapshot {
            // Unsubscribed by an earlier handler of this same emit.
            if !active.load(Ordering::Acquire) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::error!("[bus] handler for {} failed: {}", event.event_type(), e);
                }
                Err(_) => {
                    log::error!("[bus] handler for {} panicked", event.event_type());
                }
            }
        }
    }

    /// Number of registered handlers across all event types.
    pub fn handler_count(&self) -> usize {
        let handlers = self.inner.lock();
        handlers.typed.values().map(Vec::len).sum::<usize>() + handlers.any.len()
    }

    /// Drops every subscription. Outstanding [`Subscription`] handles become no-ops.
    pub fn clear(&self) {
        let mut handlers = self.inner.lock();
        for entry in handlers.typed.values().flatten().chain(handlers.any.iter()) {
            entry.active.store(false, Ordering::Release);
        }
        handlers.typed.clear();
        handlers.any.clear();
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handler_count())
            .finish()
    }
}

/// Handle returned by [`EventBus::on`] and [`EventBus::on_any`].
///
/// Dropping it leaves the handler registered; call [`Subscription::unsubscribe`]
/// or convert it with [`Subscription::into_guard`].
#[derive(Clone)]
pub struct Subscription {
    bus: Weak<Mutex<Handlers>>,
    id: u64,
    slot: Option<AIEventType>,
    active: Arc<AtomicBool>,
}

impl Subscription {
    /// Removes the handler. Safe to call repeatedly and from inside a handler.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = self.bus.upgrade() {
            inner.lock().remove(self.id, self.slot);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn into_guard(self) -> SubscriptionGuard {
        SubscriptionGuard(self)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("slot", &self.slot)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Unsubscribes when dropped.
#[derive(Debug)]
pub struct SubscriptionGuard(Subscription);

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.0.unsubscribe();
    }
}
