//! Integration event envelope and event naming.
//!
//! Payloads are plain serde types; the wire name of an event is derived
//! from its type name with the `IntegrationEvent` suffix stripped, so a
//! type called `OrderCreatedIntegrationEvent` travels as `OrderCreated`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::ser::Error as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Suffix stripped from payload type names for wire transmission.
const EVENT_SUFFIX: &str = "IntegrationEvent";

/// Marker trait for integration event payloads.
pub trait IntegrationEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Wire name of this event, derived from the type name.
    fn event_name() -> &'static str {
        event_key(std::any::type_name::<Self>())
    }
}

/// Derive the wire event name from a (possibly module-qualified) type name.
///
/// Strips the module path and the `IntegrationEvent` suffix. A type named
/// exactly `IntegrationEvent` keeps its full name rather than producing an
/// empty key.
pub fn event_key(type_name: &'static str) -> &'static str {
    let bare = type_name.rsplit("::").next().unwrap_or(type_name);
    match bare.strip_suffix(EVENT_SUFFIX) {
        Some(stripped) if !stripped.is_empty() => stripped,
        _ => bare,
    }
}

/// The serializable unit carried over the wire.
///
/// Wire form is a flat JSON object: `id`, `occurredAt`, then the payload's
/// own fields at the top level.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<E> {
    /// Globally unique per published instance.
    pub id: Uuid,
    /// When the event was created on the publishing side.
    #[serde(alias = "occurred_at")]
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: E,
}

impl<E: IntegrationEvent> Envelope<E> {
    /// Wrap a payload with a fresh identity and timestamp.
    pub fn new(event: E) -> Self {
        Self {
            id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            event,
        }
    }
}

/// A serialized event ready for the publish path.
#[derive(Debug, Clone)]
pub struct OutboundEvent {
    pub id: Uuid,
    /// Routing key / rule name: the bare, suffix-stripped event name.
    pub event_name: String,
    /// UTF-8 JSON envelope body.
    pub body: Vec<u8>,
}

impl OutboundEvent {
    /// Wrap a typed payload in a fresh envelope and serialize it.
    pub fn from_event<E: IntegrationEvent>(event: E) -> serde_json::Result<Self> {
        let envelope = Envelope::new(event);
        let body = serde_json::to_vec(&envelope)?;
        Ok(Self {
            id: envelope.id,
            event_name: E::event_name().to_string(),
            body,
        })
    }

    /// Build an outbound event from an already-shaped JSON payload.
    ///
    /// Stamps `id` and `occurredAt` into the top level. Used where payloads
    /// are assembled dynamically, e.g. by the domain-event forwarder.
    pub fn from_value(
        event_name: impl Into<String>,
        payload: serde_json::Value,
    ) -> serde_json::Result<Self> {
        let event_name = event_name.into();
        if event_name.is_empty() {
            return Err(serde_json::Error::custom("event name must not be empty"));
        }
        let mut object = match payload {
            serde_json::Value::Object(object) => object,
            other => {
                return Err(serde_json::Error::custom(format!(
                    "event payload must be a JSON object, got {other}"
                )))
            }
        };
        let id = Uuid::new_v4();
        object.insert("id".to_string(), serde_json::to_value(id)?);
        object.insert("occurredAt".to_string(), serde_json::to_value(Utc::now())?);
        let body = serde_json::to_vec(&serde_json::Value::Object(object))?;
        Ok(Self {
            id,
            event_name,
            body,
        })
    }
}
