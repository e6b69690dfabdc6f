//! Broker-agnostic event bus facade.
//!
//! This module contains:
//! - `EventBus` trait: the object-safe core a backend implements
//! - `EventBusExt` trait: the typed publish/subscribe surface
//! - `BusError`: error taxonomy for all bus operations
//! - Implementations: AMQP (RabbitMQ), in-process memory

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::BusSettings;
use crate::dispatch::{dynamic_invoker, typed_invoker};
use crate::event::{IntegrationEvent, OutboundEvent};
use crate::handler::{
    DynamicIntegrationEventHandler, HandlerId, IntegrationEventHandler, ScopeFactory,
};
use crate::registry::{BoundSubscription, RegistryError, SubscriptionDescriptor};

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpEventBus;
pub use memory::MemoryEventBus;

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Broker unreachable; the only retryable publish failure.
    #[error("broker connection failed: {0}")]
    Connection(String),

    /// Publish gave up after the bounded retry schedule.
    #[error("publish failed after {attempts} attempts")]
    PublishExhausted {
        attempts: u32,
        #[source]
        source: Box<BusError>,
    },

    /// Event could not be serialized; never retried.
    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Broker-side routing setup failed for a reason other than the
    /// route already existing.
    #[error("routing provisioning failed: {0}")]
    RoutingProvision(String),

    #[error(transparent)]
    Subscription(#[from] RegistryError),

    /// The bus has been closed.
    #[error("event bus is closed")]
    Closed,
}

impl BusError {
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(self, BusError::Connection(_))
    }
}

// ============================================================================
// Traits
// ============================================================================

/// A subscription prepared by the typed surface for a backend to record.
pub struct Binding {
    pub(crate) subscription: BoundSubscription,
    pub(crate) payload_type: Option<&'static str>,
}

/// Interface every backend implements.
///
/// Callers normally go through [`EventBusExt`], which builds the invoker
/// closures; these methods are the type-erased seam that keeps the trait
/// object safe.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a serialized event under its routing key.
    async fn publish_raw(&self, event: OutboundEvent) -> Result<()>;

    /// Record a prepared subscription. The first binding for an event name
    /// provisions broker-side routing before the binding is recorded.
    async fn subscribe_binding(&self, binding: Binding) -> Result<()>;

    /// Remove a binding. The last binding for an event name releases the
    /// broker-side routing.
    async fn unsubscribe_binding(&self, event_name: &str, handler: HandlerId) -> Result<()>;

    /// Clear all subscriptions and release broker resources.
    async fn close(&self) -> Result<()>;
}

/// Typed publish/subscribe surface over any [`EventBus`].
#[async_trait]
pub trait EventBusExt: EventBus {
    /// Publish `event` wrapped in a fresh envelope.
    async fn publish<E>(&self, event: E) -> Result<()>
    where
        E: IntegrationEvent,
    {
        let outbound = OutboundEvent::from_event(event)?;
        self.publish_raw(outbound).await
    }

    /// Subscribe handler type `H` to payload type `E`.
    async fn subscribe<E, H>(&self) -> Result<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E> + 'static,
    {
        let event_name = E::event_name();
        info!(
            event_name = %event_name,
            handler = HandlerId::of::<H>().short_name(),
            "Subscribing to event"
        );
        self.subscribe_binding(Binding {
            subscription: BoundSubscription {
                descriptor: SubscriptionDescriptor {
                    event_name: event_name.to_string(),
                    handler: HandlerId::of::<H>(),
                    is_dynamic: false,
                },
                invoker: typed_invoker::<E, H>(),
            },
            payload_type: Some(std::any::type_name::<E>()),
        })
        .await
    }

    /// Subscribe a dynamic handler by event name alone.
    async fn subscribe_dynamic<H>(&self, event_name: &str) -> Result<()>
    where
        H: DynamicIntegrationEventHandler + 'static,
    {
        info!(
            event_name = %event_name,
            handler = HandlerId::of::<H>().short_name(),
            "Subscribing to dynamic event"
        );
        self.subscribe_binding(Binding {
            subscription: BoundSubscription {
                descriptor: SubscriptionDescriptor {
                    event_name: event_name.to_string(),
                    handler: HandlerId::of::<H>(),
                    is_dynamic: true,
                },
                invoker: dynamic_invoker::<H>(event_name.to_string()),
            },
            payload_type: None,
        })
        .await
    }

    async fn unsubscribe<E, H>(&self) -> Result<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E> + 'static,
    {
        let event_name = E::event_name();
        info!(event_name = %event_name, "Unsubscribing from event");
        self.unsubscribe_binding(event_name, HandlerId::of::<H>()).await
    }

    async fn unsubscribe_dynamic<H>(&self, event_name: &str) -> Result<()>
    where
        H: DynamicIntegrationEventHandler + 'static,
    {
        info!(event_name = %event_name, "Unsubscribing from dynamic event");
        self.unsubscribe_binding(event_name, HandlerId::of::<H>()).await
    }
}

impl<B: EventBus + ?Sized> EventBusExt for B {}

// ============================================================================
// Factory
// ============================================================================

/// Initialize an event bus from configuration.
///
/// Returns the backend selected by `messaging_type`. AMQP requires the
/// `amqp` feature (included in default).
pub async fn init_event_bus(
    settings: &BusSettings,
    scopes: Arc<dyn ScopeFactory>,
) -> Result<Arc<dyn EventBus>> {
    match settings.messaging_type {
        crate::config::MessagingType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                let bus = AmqpEventBus::connect(
                    settings.amqp.clone(),
                    settings.dispatch.clone(),
                    scopes,
                )
                .await?;
                info!(messaging_type = "amqp", "Event bus initialized");
                Ok(Arc::new(bus))
            }

            #[cfg(not(feature = "amqp"))]
            {
                let _ = scopes;
                Err(BusError::Connection(
                    "AMQP support requires the 'amqp' feature. Rebuild with --features amqp"
                        .to_string(),
                ))
            }
        }
        crate::config::MessagingType::Memory => {
            let bus = MemoryEventBus::start(settings.dispatch.clone(), scopes);
            info!(messaging_type = "memory", "Event bus initialized");
            Ok(Arc::new(bus))
        }
    }
}
