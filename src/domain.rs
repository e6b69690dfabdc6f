//! Domain-event source collaborator and the forwarding decorator.
//!
//! Domain events stay inside a service; after a unit of work completes,
//! the forwarder drains the pending ones and publishes their integration
//! counterparts through the bus.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::bus::{EventBus, Result};
use crate::event::OutboundEvent;

/// An in-process domain event pending translation.
pub trait DomainEvent: Send + Sync {
    fn id(&self) -> Uuid;
    fn occurred_on(&self) -> DateTime<Utc>;
    /// Logical name, used by translators to pick a mapping.
    fn name(&self) -> &str;
    /// Payload snapshot handed to translators.
    fn payload(&self) -> Value;
}

/// Sources pending domain events from a unit of work.
pub trait DomainEventsAccessor: Send + Sync {
    fn all_pending(&self) -> Vec<Arc<dyn DomainEvent>>;
    fn clear_pending(&self);
}

/// Maps a domain event to an outbound integration event, or `None` for
/// events that stay inside the service boundary.
pub type DomainEventTranslator =
    Box<dyn Fn(&dyn DomainEvent) -> Option<OutboundEvent> + Send + Sync>;

/// Drains pending domain events after a unit of work and publishes their
/// integration counterparts.
pub struct DomainEventsForwarder {
    accessor: Arc<dyn DomainEventsAccessor>,
    translator: DomainEventTranslator,
    bus: Arc<dyn EventBus>,
}

impl DomainEventsForwarder {
    pub fn new(
        accessor: Arc<dyn DomainEventsAccessor>,
        translator: DomainEventTranslator,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            accessor,
            translator,
            bus,
        }
    }

    /// Drain pending domain events and publish the translated ones.
    ///
    /// Pending events are cleared before publishing so a publish failure
    /// cannot replay the batch. Returns the number of events published.
    pub async fn dispatch_pending(&self) -> Result<usize> {
        let pending = self.accessor.all_pending();
        self.accessor.clear_pending();

        let mut published = 0usize;
        for event in pending {
            match (self.translator)(event.as_ref()) {
                Some(outbound) => {
                    debug!(
                        domain_event = %event.name(),
                        event_name = %outbound.event_name,
                        "Forwarding domain event"
                    );
                    self.bus.publish_raw(outbound).await?;
                    published += 1;
                }
                None => {
                    debug!(
                        domain_event = %event.name(),
                        "No integration mapping for domain event"
                    );
                }
            }
        }
        Ok(published)
    }
}
