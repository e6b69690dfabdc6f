//! Subscription registry: event name → bound handler descriptors.
//!
//! Shared by the facade (mutations) and the dispatcher (reads from
//! in-flight message tasks). Mutations are serialized behind a single
//! writer lock; dispatch paths take cloned snapshots under the read lock
//! and never hold it across an await.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::dispatch::Invoker;
use crate::handler::HandlerId;

/// Errors from registry mutations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler {handler} is already subscribed to '{event_name}'")]
    DuplicateSubscription {
        event_name: String,
        handler: &'static str,
    },

    #[error("handler {handler} has no subscription to '{event_name}'")]
    SubscriptionNotFound {
        event_name: String,
        handler: &'static str,
    },
}

/// How a subscription was bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionDescriptor {
    pub event_name: String,
    pub handler: HandlerId,
    pub is_dynamic: bool,
}

/// A descriptor paired with the invoker built for it at subscribe time.
#[derive(Clone)]
pub struct BoundSubscription {
    pub descriptor: SubscriptionDescriptor,
    pub invoker: Invoker,
}

/// Report of a successful removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    /// Set when the last descriptor for the event name was removed.
    pub removed_event: Option<String>,
    /// True when the registry no longer holds any subscription.
    pub registry_empty: bool,
}

type RemovalListener = Box<dyn Fn(&str) + Send + Sync>;

/// In-memory subscription table.
pub struct SubscriptionRegistry {
    inner: RwLock<Inner>,
    on_event_removed: Option<RemovalListener>,
}

#[derive(Default)]
struct Inner {
    subscriptions: HashMap<String, Vec<BoundSubscription>>,
    payload_types: HashMap<String, &'static str>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            on_event_removed: None,
        }
    }

    /// Create a registry with a listener fired exactly once, synchronously,
    /// when the last descriptor for an event name is removed. Registered
    /// once, at bus construction.
    pub fn with_removal_listener(listener: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            on_event_removed: Some(Box::new(listener)),
        }
    }

    /// Record a binding; `payload_type` is set for typed subscriptions.
    pub fn add(
        &self,
        subscription: BoundSubscription,
        payload_type: Option<&'static str>,
    ) -> Result<(), RegistryError> {
        let event_name = subscription.descriptor.event_name.clone();
        let handler = subscription.descriptor.handler;

        let mut inner = self.inner.write().expect("subscription registry lock poisoned");
        if let Some(existing) = inner.subscriptions.get(&event_name) {
            if existing.iter().any(|s| s.descriptor.handler == handler) {
                return Err(RegistryError::DuplicateSubscription {
                    event_name,
                    handler: handler.name(),
                });
            }
        }
        if let Some(payload_type) = payload_type {
            inner.payload_types.insert(event_name.clone(), payload_type);
        }
        inner
            .subscriptions
            .entry(event_name)
            .or_default()
            .push(subscription);
        Ok(())
    }

    /// Remove a binding. Fires the removal listener when the last
    /// descriptor for the event name goes away.
    pub fn remove(&self, event_name: &str, handler: HandlerId) -> Result<Removal, RegistryError> {
        let removal = {
            let mut inner = self.inner.write().expect("subscription registry lock poisoned");
            let not_found = || RegistryError::SubscriptionNotFound {
                event_name: event_name.to_string(),
                handler: handler.name(),
            };

            let slot = inner.subscriptions.get_mut(event_name).ok_or_else(not_found)?;
            let position = slot
                .iter()
                .position(|s| s.descriptor.handler == handler)
                .ok_or_else(not_found)?;
            slot.remove(position);

            let removed_event = if slot.is_empty() {
                inner.subscriptions.remove(event_name);
                inner.payload_types.remove(event_name);
                Some(event_name.to_string())
            } else {
                None
            };
            Removal {
                removed_event,
                registry_empty: inner.subscriptions.is_empty(),
            }
        };

        if let (Some(name), Some(listener)) = (&removal.removed_event, &self.on_event_removed) {
            listener(name);
        }
        Ok(removal)
    }

    pub fn has_subscriptions_for(&self, event_name: &str) -> bool {
        self.inner
            .read()
            .expect("subscription registry lock poisoned")
            .subscriptions
            .contains_key(event_name)
    }

    /// Snapshot of the bound subscriptions for an event name.
    pub fn handlers_for(&self, event_name: &str) -> Vec<BoundSubscription> {
        self.inner
            .read()
            .expect("subscription registry lock poisoned")
            .subscriptions
            .get(event_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Payload type name recorded for a typed event, for diagnostics.
    pub fn payload_type_of(&self, event_name: &str) -> Option<&'static str> {
        self.inner
            .read()
            .expect("subscription registry lock poisoned")
            .payload_types
            .get(event_name)
            .copied()
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .read()
            .expect("subscription registry lock poisoned")
            .subscriptions
            .is_empty()
    }

    /// Drop every binding without firing removal notifications.
    pub fn clear(&self) {
        let mut inner = self.inner.write().expect("subscription registry lock poisoned");
        inner.subscriptions.clear();
        inner.payload_types.clear();
    }
}
