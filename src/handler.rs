//! Handler contracts and the per-message resolution seam.
//!
//! Handlers are resolved through a [`HandlerScope`] opened once per
//! dispatched message. A handler the scope cannot produce is skipped by
//! the dispatcher, not treated as an error.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::event::{Envelope, IntegrationEvent};

/// Error surfaced by handlers; caught and logged by the dispatcher.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Handler bound to a concrete payload type.
#[async_trait]
pub trait IntegrationEventHandler<E: IntegrationEvent>: Send + Sync {
    async fn handle(&self, event: Envelope<E>) -> Result<(), HandlerError>;
}

/// Handler bound only by event name; receives the parsed wire payload.
#[async_trait]
pub trait DynamicIntegrationEventHandler: Send + Sync {
    async fn handle(&self, event_name: &str, payload: Value) -> Result<(), HandlerError>;
}

/// Identifies a handler type within the registry and resolution scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId {
    type_id: TypeId,
    name: &'static str,
}

impl HandlerId {
    pub fn of<H: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<H>(),
            name: std::any::type_name::<H>(),
        }
    }

    /// Fully qualified type name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Bare type name, for log fields.
    pub fn short_name(&self) -> &'static str {
        self.name.rsplit("::").next().unwrap_or(self.name)
    }
}

/// Per-message handler resolution context.
pub trait HandlerScope: Send + Sync {
    /// Produce the handler instance for `handler`, or `None` when it is
    /// not registered in this scope.
    fn resolve(&self, handler: &HandlerId) -> Option<Arc<dyn Any + Send + Sync>>;
}

/// Opens one [`HandlerScope`] per dispatched message.
pub trait ScopeFactory: Send + Sync {
    fn begin_scope(&self) -> Box<dyn HandlerScope>;
}

/// Registry of shared handler instances; the crate's stock [`ScopeFactory`].
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<HandlerId, Arc<dyn Any + Send + Sync>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler instance resolvable by its type.
    pub fn register<H: Send + Sync + 'static>(&mut self, handler: H) -> &mut Self {
        self.handlers.insert(HandlerId::of::<H>(), Arc::new(handler));
        self
    }
}

impl ScopeFactory for HandlerRegistry {
    fn begin_scope(&self) -> Box<dyn HandlerScope> {
        Box::new(SharedScope {
            handlers: self.handlers.clone(),
        })
    }
}

struct SharedScope {
    handlers: HashMap<HandlerId, Arc<dyn Any + Send + Sync>>,
}

impl HandlerScope for SharedScope {
    fn resolve(&self, handler: &HandlerId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.handlers.get(handler).cloned()
    }
}
