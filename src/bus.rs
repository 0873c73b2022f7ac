//! In-process event registry for realtime messages.
//!
//! Subscribers register a callback for an event type; every [`EventBus::publish`] for that type
//! invokes them in registration order, followed by every subscriber of the [`WILDCARD`] channel.
//! Wildcard subscribers receive the whole `{ "type": ..., "data": ... }` envelope rather than the
//! bare payload.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde_json::{Value, json};

/// Event type whose subscribers see every publish.
pub const WILDCARD: &str = "*";

/// Identifier of a single registration, unique for the lifetime of its [`EventBus`].
pub type SubscriptionId = u64;

type Callback = Arc<dyn Fn(&Value) + Send + Sync + 'static>;

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    handlers: DashMap<String, Vec<(SubscriptionId, Callback)>>,
}

impl Registry {
    fn snapshot(&self, event_type: &str) -> Vec<Callback> {
        self.handlers
            .get(event_type)
            .map(|entry| entry.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }

    fn remove(&self, event_type: &str, id: SubscriptionId) {
        // Empty keys are dropped
        _ = self.handlers.remove_if_mut(event_type, |_, entries| {
            entries.retain(|(existing, _)| *existing != id);
            entries.is_empty()
        });
    }
}

/// Handle returned by [`EventBus::subscribe`].
///
/// Dropping the handle does not unsubscribe; call [`Subscription::unsubscribe`].
#[derive(Clone)]
pub struct Subscription {
    id: SubscriptionId,
    event_type: String,
    registry: Weak<Registry>,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Remove this registration. Calling it more than once is a no-op.
    ///
    /// Once this returns, no `publish` that starts afterwards will invoke the callback.
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.event_type, self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("event_type", &self.event_type)
            .finish_non_exhaustive()
    }
}

/// Registry mapping event types to callbacks.
///
/// Cloning is cheap and every clone shares the same registrations.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Registry>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `event_type`. Use [`WILDCARD`] to receive every event.
    pub fn subscribe<F>(&self, event_type: &str, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .handlers
            .entry(event_type.to_owned())
            .or_default()
            .push((id, Arc::new(callback)));

        Subscription {
            id,
            event_type: event_type.to_owned(),
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver `data` to every subscriber of `event_type`, then the envelope to every wildcard
    /// subscriber. Returns the number of callbacks that completed without panicking.
    ///
    /// Callbacks run outside the registry lock, so they may subscribe or unsubscribe freely.
    pub fn publish(&self, event_type: &str, data: &Value) -> usize {
        let typed = self.registry.snapshot(event_type);
        let wildcard = if event_type == WILDCARD {
            Vec::new()
        } else {
            self.registry.snapshot(WILDCARD)
        };

        let mut delivered = typed
            .iter()
            .filter(|cb| invoke(event_type, cb, data))
            .count();

        if !wildcard.is_empty() {
            let envelope = json!({ "type": event_type, "data": data });
            delivered += wildcard
                .iter()
                .filter(|cb| invoke(event_type, cb, &envelope))
                .count();
        }

        delivered
    }

    /// Number of live registrations for `event_type`.
    #[must_use]
    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.registry
            .handlers
            .get(event_type)
            .map_or(0, |entry| entry.len())
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("event_types", &self.registry.handlers.len())
            .finish()
    }
}

fn invoke(event_type: &str, callback: &Callback, data: &Value) -> bool {
    match catch_unwind(AssertUnwindSafe(|| callback(data))) {
        Ok(()) => true,
        Err(panic) => {
            #[cfg(feature = "tracing")]
            {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_owned());
                tracing::error!(%event_type, %reason, "event subscriber panicked");
            }
            #[cfg(not(feature = "tracing"))]
            let _ = (event_type, &panic);
            false
        }
    }
}
