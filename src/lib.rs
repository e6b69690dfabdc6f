//! crossbus - broker-agnostic integration event bus.
//!
//! Services publish domain-crossing events and subscribe typed or dynamic
//! handlers to them; the bus hides broker connection management, publish
//! retry, routing provisioning, and the consume/dispatch/acknowledge
//! cycle.

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod event;
pub mod handler;
pub mod registry;
pub mod retry;

pub use bus::{init_event_bus, BusError, EventBus, EventBusExt, MemoryEventBus, Result};
#[cfg(feature = "amqp")]
pub use bus::AmqpEventBus;
pub use event::{Envelope, IntegrationEvent, OutboundEvent};
pub use handler::{
    DynamicIntegrationEventHandler, HandlerRegistry, IntegrationEventHandler, ScopeFactory,
};
