//! Message dispatcher
//!
//! Routes each `RealtimeMessage` to the listeners registered for its exact
//! type, then to wildcard listeners, each group in subscription order.
//! Listeners run synchronously on the channel's event task, so messages are
//! never reordered or delivered concurrently. A panicking listener is
//! logged and skipped; the rest still receive the message.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, warn};

use crate::frame::RealtimeMessage;

type Listener = Arc<dyn Fn(&RealtimeMessage) + Send + Sync>;

/// What a listener is registered for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    Exact(String),
    All,
}

struct Entry {
    id: u64,
    subscription: Subscription,
    listener: Listener,
}

#[derive(Default)]
struct Registry {
    entries: Mutex<Vec<Entry>>,
    next_id: Mutex<u64>,
}

impl Registry {
    fn entries(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove(&self, id: u64) {
        self.entries().retain(|e| e.id != id);
    }
}

#[derive(Clone, Default)]
pub struct MessageDispatcher {
    registry: Arc<Registry>,
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen for messages of one type.
    pub fn subscribe<F>(&self, kind: impl Into<String>, listener: F) -> SubscriptionGuard
    where
        F: Fn(&RealtimeMessage) + Send + Sync + 'static,
    {
        self.subscribe_to(Subscription::Exact(kind.into()), listener)
    }

    /// Listen for every message, after type-specific listeners.
    pub fn subscribe_wildcard<F>(&self, listener: F) -> SubscriptionGuard
    where
        F: Fn(&RealtimeMessage) + Send + Sync + 'static,
    {
        self.subscribe_to(Subscription::All, listener)
    }

    pub fn subscribe_to<F>(&self, subscription: Subscription, listener: F) -> SubscriptionGuard
    where
        F: Fn(&RealtimeMessage) + Send + Sync + 'static,
    {
        let id = {
            let mut next = self.registry.next_id.lock().unwrap_or_else(|p| p.into_inner());
            *next += 1;
            *next
        };
        debug!(id, ?subscription, "listener subscribed");
        self.registry.entries().push(Entry {
            id,
            subscription,
            listener: Arc::new(listener),
        });
        SubscriptionGuard {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver one message. Returns how many listeners completed normally.
    pub fn dispatch(&self, message: &RealtimeMessage) -> usize {
        // Snapshot so listeners can subscribe or unsubscribe while running
        let targets: Vec<(u64, Listener)> = {
            let entries = self.registry.entries();
            let exact = entries.iter().filter(|e| {
                matches!(&e.subscription, Subscription::Exact(kind) if *kind == message.kind)
            });
            let wildcard = entries
                .iter()
                .filter(|e| e.subscription == Subscription::All);
            exact
                .chain(wildcard)
                .map(|e| (e.id, e.listener.clone()))
                .collect()
        };

        let mut delivered = 0;
        for (id, listener) in targets {
            match catch_unwind(AssertUnwindSafe(|| listener(message))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".into());
                    warn!(
                        listener = id,
                        kind = %message.kind,
                        reason = %reason,
                        "listener panicked"
                    );
                }
            }
        }
        delivered
    }

    pub fn listener_count(&self) -> usize {
        self.registry.entries().len()
    }
}

/// Keeps a listener registered. Dropping it unsubscribes.
#[must_use = "the listener is removed as soon as the guard drops"]
pub struct SubscriptionGuard {
    id: u64,
    registry: Weak<Registry>,
}

impl SubscriptionGuard {
    /// Keep the listener for the dispatcher's lifetime.
    pub fn detach(mut self) {
        self.registry = Weak::new();
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}
