//! Consumption path: resolve handlers, deserialize, invoke, decide the
//! message's terminal disposition.
//!
//! Invokers are closures built at subscribe time that capture the concrete
//! payload type and the handler call, so the dispatch path needs no type
//! lookup beyond resolving the handler instance from the per-message scope.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::event::{Envelope, IntegrationEvent};
use crate::handler::{
    DynamicIntegrationEventHandler, HandlerId, HandlerScope, IntegrationEventHandler, ScopeFactory,
};
use crate::registry::SubscriptionRegistry;

/// What happened to one bound subscription for one message.
#[derive(Debug)]
pub enum InvocationOutcome {
    /// Handler ran to completion.
    Handled,
    /// The scope could not produce the handler; not an error.
    Skipped,
    /// Payload could not be deserialized for this subscription.
    Unprocessable(String),
    /// Handler ran and returned an error.
    Failed(crate::handler::HandlerError),
}

/// Per-subscription closure capturing deserialization and the handler call.
pub type Invoker =
    Arc<dyn Fn(&dyn HandlerScope, &[u8]) -> BoxFuture<'static, InvocationOutcome> + Send + Sync>;

/// Build the invoker for a typed subscription.
pub(crate) fn typed_invoker<E, H>() -> Invoker
where
    E: IntegrationEvent,
    H: IntegrationEventHandler<E> + 'static,
{
    Arc::new(|scope: &dyn HandlerScope, body: &[u8]| {
        let Some(instance) = scope.resolve(&HandlerId::of::<H>()) else {
            return futures::future::ready(InvocationOutcome::Skipped).boxed();
        };
        let Ok(handler) = instance.downcast::<H>() else {
            return futures::future::ready(InvocationOutcome::Skipped).boxed();
        };
        let envelope = match deserialize_tolerant::<Envelope<E>>(body) {
            Ok(envelope) => envelope,
            Err(error) => {
                return futures::future::ready(InvocationOutcome::Unprocessable(error.to_string()))
                    .boxed();
            }
        };
        async move {
            match handler.handle(envelope).await {
                Ok(()) => InvocationOutcome::Handled,
                Err(error) => InvocationOutcome::Failed(error),
            }
        }
        .boxed()
    })
}

/// Build the invoker for a dynamic subscription.
pub(crate) fn dynamic_invoker<H>(event_name: String) -> Invoker
where
    H: DynamicIntegrationEventHandler + 'static,
{
    Arc::new(move |scope: &dyn HandlerScope, body: &[u8]| {
        let Some(instance) = scope.resolve(&HandlerId::of::<H>()) else {
            return futures::future::ready(InvocationOutcome::Skipped).boxed();
        };
        let Ok(handler) = instance.downcast::<H>() else {
            return futures::future::ready(InvocationOutcome::Skipped).boxed();
        };
        let payload = match serde_json::from_slice::<Value>(body) {
            Ok(payload) => payload,
            Err(error) => {
                return futures::future::ready(InvocationOutcome::Unprocessable(error.to_string()))
                    .boxed();
            }
        };
        let event_name = event_name.clone();
        async move {
            match handler.handle(&event_name, payload).await {
                Ok(()) => InvocationOutcome::Handled,
                Err(error) => InvocationOutcome::Failed(error),
            }
        }
        .boxed()
    })
}

/// Terminal disposition policy for processed messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Acknowledge regardless of handler outcome. Trades delivery
    /// reliability for consumer-loop simplicity: a failing handler will
    /// not see the message again.
    #[default]
    Always,
    /// Acknowledge only when every invoked handler succeeded; otherwise
    /// the message is rejected without requeue.
    OnSuccess,
}

/// Result of processing one message through the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// Every invoked handler succeeded.
    Success,
    /// At least one handler failed or could not process the payload.
    HandlerFailed,
    /// No subscriptions were bound for the event name.
    NoSubscriptions,
}

impl DispatchResult {
    /// Whether the message should be acknowledged under `policy`.
    pub fn should_ack(&self, policy: AckPolicy) -> bool {
        match policy {
            AckPolicy::Always => true,
            AckPolicy::OnSuccess => matches!(self, Self::Success | Self::NoSubscriptions),
        }
    }
}

/// Run one received message through every bound subscription.
///
/// Each handler is resolved and invoked independently: a resolution miss
/// is skipped, a failing handler is logged and does not stop the
/// remaining handlers. The receive loop yields between invocations.
pub async fn dispatch_message(
    registry: &SubscriptionRegistry,
    scopes: &dyn ScopeFactory,
    event_name: &str,
    body: &[u8],
) -> DispatchResult {
    debug!(event_name = %event_name, "Processing event");

    if !registry.has_subscriptions_for(event_name) {
        warn!(event_name = %event_name, "No subscription for event");
        return DispatchResult::NoSubscriptions;
    }

    let subscriptions = registry.handlers_for(event_name);
    let scope = scopes.begin_scope();
    let mut all_succeeded = true;

    for subscription in &subscriptions {
        tokio::task::yield_now().await;
        let handler = subscription.descriptor.handler.short_name();
        match (subscription.invoker)(scope.as_ref(), body).await {
            InvocationOutcome::Handled => {}
            InvocationOutcome::Skipped => {
                debug!(
                    event_name = %event_name,
                    handler = handler,
                    "Handler not resolvable in scope, skipping"
                );
            }
            InvocationOutcome::Unprocessable(reason) => {
                warn!(
                    event_name = %event_name,
                    handler = handler,
                    payload_type = registry.payload_type_of(event_name).unwrap_or("<dynamic>"),
                    reason = %reason,
                    message = %String::from_utf8_lossy(body),
                    "Payload not processable for handler"
                );
                all_succeeded = false;
            }
            InvocationOutcome::Failed(error) => {
                warn!(
                    event_name = %event_name,
                    handler = handler,
                    error = %error,
                    message = %String::from_utf8_lossy(body),
                    "Handler failed while processing event"
                );
                all_succeeded = false;
            }
        }
    }

    if all_succeeded {
        DispatchResult::Success
    } else {
        DispatchResult::HandlerFailed
    }
}

/// Deserialize with tolerant field matching: exact names first, then a
/// retry with object keys normalized to snake_case so producers using
/// camelCase or PascalCase field names still match.
pub(crate) fn deserialize_tolerant<T: DeserializeOwned>(body: &[u8]) -> serde_json::Result<T> {
    match serde_json::from_slice(body) {
        Ok(value) => Ok(value),
        Err(first) => {
            let Ok(raw) = serde_json::from_slice::<Value>(body) else {
                return Err(first);
            };
            serde_json::from_value(normalize_keys(raw)).map_err(|_| first)
        }
    }
}

fn normalize_keys(value: Value) -> Value {
    match value {
        Value::Object(object) => Value::Object(
            object
                .into_iter()
                .map(|(key, value)| (to_snake_case(&key), normalize_keys(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_keys).collect()),
        other => other,
    }
}

fn to_snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 2);
    let mut prev_lower = false;
    for ch in key.chars() {
        if ch.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
            prev_lower = false;
        } else {
            prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
            out.push(ch);
        }
    }
    out
}
