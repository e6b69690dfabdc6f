//! End-to-end scenarios over the in-process backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crossbus::bus::MemoryEventBus;
use crossbus::config::DispatchSettings;
use crossbus::domain::{
    DomainEvent, DomainEventsAccessor, DomainEventsForwarder,
};
use crossbus::handler::HandlerError;
use crossbus::registry::RegistryError;
use crossbus::{
    BusError, DynamicIntegrationEventHandler, Envelope, EventBus, EventBusExt, HandlerRegistry,
    IntegrationEvent, IntegrationEventHandler, OutboundEvent,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PaymentReceivedIntegrationEvent {
    amount: u64,
    currency: String,
}

impl IntegrationEvent for PaymentReceivedIntegrationEvent {}

struct PaymentHandler {
    received: mpsc::UnboundedSender<Envelope<PaymentReceivedIntegrationEvent>>,
}

#[async_trait]
impl IntegrationEventHandler<PaymentReceivedIntegrationEvent> for PaymentHandler {
    async fn handle(
        &self,
        event: Envelope<PaymentReceivedIntegrationEvent>,
    ) -> Result<(), HandlerError> {
        let _ = self.received.send(event);
        Ok(())
    }
}

struct SecondPaymentHandler {
    count: Arc<AtomicUsize>,
}

#[async_trait]
impl IntegrationEventHandler<PaymentReceivedIntegrationEvent> for SecondPaymentHandler {
    async fn handle(
        &self,
        _event: Envelope<PaymentReceivedIntegrationEvent>,
    ) -> Result<(), HandlerError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FailingPaymentHandler;

#[async_trait]
impl IntegrationEventHandler<PaymentReceivedIntegrationEvent> for FailingPaymentHandler {
    async fn handle(
        &self,
        _event: Envelope<PaymentReceivedIntegrationEvent>,
    ) -> Result<(), HandlerError> {
        Err("payment processing blew up".into())
    }
}

struct LegacyNoticeHandler {
    received: mpsc::UnboundedSender<Value>,
}

#[async_trait]
impl DynamicIntegrationEventHandler for LegacyNoticeHandler {
    async fn handle(&self, event_name: &str, payload: Value) -> Result<(), HandlerError> {
        assert_eq!(event_name, "LegacyNotice");
        let _ = self.received.send(payload);
        Ok(())
    }
}

struct SlowHandler {
    inflight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    done: Arc<AtomicUsize>,
}

#[async_trait]
impl IntegrationEventHandler<PaymentReceivedIntegrationEvent> for SlowHandler {
    async fn handle(
        &self,
        _event: Envelope<PaymentReceivedIntegrationEvent>,
    ) -> Result<(), HandlerError> {
        let current = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.inflight.fetch_sub(1, Ordering::SeqCst);
        self.done.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_typed_payment_scenario() {
    init_tracing();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut handlers = HandlerRegistry::new();
    handlers.register(PaymentHandler { received: tx });

    let bus = MemoryEventBus::start(DispatchSettings::default(), Arc::new(handlers));
    bus.subscribe::<PaymentReceivedIntegrationEvent, PaymentHandler>()
        .await
        .unwrap();

    bus.publish(PaymentReceivedIntegrationEvent {
        amount: 100,
        currency: "USD".to_string(),
    })
    .await
    .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for handler")
        .expect("channel closed");

    assert_eq!(received.event.amount, 100);
    assert_eq!(received.event.currency, "USD");

    // Acknowledged exactly once.
    assert!(wait_until(Duration::from_secs(2), || bus.acked_count() == 1).await);
    assert_eq!(bus.delivered_count(), 1);
}

#[tokio::test]
async fn test_dynamic_legacy_notice_scenario() {
    init_tracing();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut handlers = HandlerRegistry::new();
    handlers.register(LegacyNoticeHandler { received: tx });

    let bus = MemoryEventBus::start(DispatchSettings::default(), Arc::new(handlers));
    bus.subscribe_dynamic::<LegacyNoticeHandler>("LegacyNotice")
        .await
        .unwrap();

    let outbound =
        OutboundEvent::from_value("LegacyNotice", serde_json::json!({"text": "hi"})).unwrap();
    bus.publish_raw(outbound).await.unwrap();

    let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for handler")
        .expect("channel closed");

    assert_eq!(payload["text"], "hi");
    assert!(wait_until(Duration::from_secs(2), || bus.acked_count() == 1).await);
}

#[tokio::test]
async fn test_failing_handler_still_acks_and_fans_out() {
    init_tracing();
    let count = Arc::new(AtomicUsize::new(0));
    let mut handlers = HandlerRegistry::new();
    handlers.register(FailingPaymentHandler);
    handlers.register(SecondPaymentHandler {
        count: count.clone(),
    });

    let bus = MemoryEventBus::start(DispatchSettings::default(), Arc::new(handlers));
    bus.subscribe::<PaymentReceivedIntegrationEvent, FailingPaymentHandler>()
        .await
        .unwrap();
    bus.subscribe::<PaymentReceivedIntegrationEvent, SecondPaymentHandler>()
        .await
        .unwrap();

    bus.publish(PaymentReceivedIntegrationEvent {
        amount: 5,
        currency: "EUR".to_string(),
    })
    .await
    .unwrap();

    // The sibling handler still ran, and the message was acknowledged.
    assert!(wait_until(Duration::from_secs(2), || {
        count.load(Ordering::SeqCst) == 1
    })
    .await);
    assert!(wait_until(Duration::from_secs(2), || bus.acked_count() == 1).await);
}

#[tokio::test]
async fn test_duplicate_subscription_is_rejected() {
    let bus = MemoryEventBus::start(
        DispatchSettings::default(),
        Arc::new(HandlerRegistry::new()),
    );

    bus.subscribe::<PaymentReceivedIntegrationEvent, FailingPaymentHandler>()
        .await
        .unwrap();
    let result = bus
        .subscribe::<PaymentReceivedIntegrationEvent, FailingPaymentHandler>()
        .await;

    assert!(matches!(
        result,
        Err(BusError::Subscription(
            RegistryError::DuplicateSubscription { .. }
        ))
    ));
}

#[tokio::test]
async fn test_unsubscribing_unknown_binding_is_rejected() {
    let bus = MemoryEventBus::start(
        DispatchSettings::default(),
        Arc::new(HandlerRegistry::new()),
    );

    let result = bus
        .unsubscribe::<PaymentReceivedIntegrationEvent, FailingPaymentHandler>()
        .await;

    assert!(matches!(
        result,
        Err(BusError::Subscription(
            RegistryError::SubscriptionNotFound { .. }
        ))
    ));
}

#[tokio::test]
async fn test_unsubscribe_releases_routing() {
    init_tracing();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut handlers = HandlerRegistry::new();
    handlers.register(PaymentHandler { received: tx });

    let bus = MemoryEventBus::start(DispatchSettings::default(), Arc::new(handlers));
    bus.subscribe::<PaymentReceivedIntegrationEvent, PaymentHandler>()
        .await
        .unwrap();
    bus.unsubscribe::<PaymentReceivedIntegrationEvent, PaymentHandler>()
        .await
        .unwrap();

    bus.publish(PaymentReceivedIntegrationEvent {
        amount: 1,
        currency: "GBP".to_string(),
    })
    .await
    .unwrap();

    // Routing rule is gone: the broker discarded the message.
    assert!(wait_until(Duration::from_secs(2), || bus.dropped_count() == 1).await);
    assert_eq!(bus.delivered_count(), 0);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_bounded_concurrent_dispatch() {
    init_tracing();
    let inflight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    let mut handlers = HandlerRegistry::new();
    handlers.register(SlowHandler {
        inflight: inflight.clone(),
        peak: peak.clone(),
        done: done.clone(),
    });

    let settings = DispatchSettings {
        max_concurrent_dispatches: 2,
        ..Default::default()
    };
    let bus = MemoryEventBus::start(settings, Arc::new(handlers));
    bus.subscribe::<PaymentReceivedIntegrationEvent, SlowHandler>()
        .await
        .unwrap();

    for _ in 0..6 {
        bus.publish(PaymentReceivedIntegrationEvent {
            amount: 1,
            currency: "USD".to_string(),
        })
        .await
        .unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || {
        done.load(Ordering::SeqCst) == 6
    })
    .await);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(bus.acked_count(), 6);
}

#[tokio::test]
async fn test_close_drains_inflight_work() {
    init_tracing();
    let inflight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    let mut handlers = HandlerRegistry::new();
    handlers.register(SlowHandler {
        inflight: inflight.clone(),
        peak: peak.clone(),
        done: done.clone(),
    });

    let bus = MemoryEventBus::start(DispatchSettings::default(), Arc::new(handlers));
    bus.subscribe::<PaymentReceivedIntegrationEvent, SlowHandler>()
        .await
        .unwrap();

    for _ in 0..3 {
        bus.publish(PaymentReceivedIntegrationEvent {
            amount: 1,
            currency: "USD".to_string(),
        })
        .await
        .unwrap();
    }

    // Wait for the loop to pick everything up, then shut down.
    assert!(wait_until(Duration::from_secs(2), || bus.delivered_count() == 3).await);
    bus.close().await.unwrap();

    // In-flight dispatches finished before close returned.
    assert_eq!(done.load(Ordering::SeqCst), 3);
    assert_eq!(bus.acked_count(), 3);
}

// ---------------------------------------------------------------------------
// Domain-event forwarding
// ---------------------------------------------------------------------------

struct RecordedDomainEvent {
    id: uuid::Uuid,
    occurred_on: chrono::DateTime<chrono::Utc>,
    name: String,
    payload: Value,
}

impl DomainEvent for RecordedDomainEvent {
    fn id(&self) -> uuid::Uuid {
        self.id
    }

    fn occurred_on(&self) -> chrono::DateTime<chrono::Utc> {
        self.occurred_on
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn payload(&self) -> Value {
        self.payload.clone()
    }
}

#[derive(Default)]
struct RecordingAccessor {
    pending: std::sync::Mutex<Vec<Arc<dyn DomainEvent>>>,
}

impl DomainEventsAccessor for RecordingAccessor {
    fn all_pending(&self) -> Vec<Arc<dyn DomainEvent>> {
        self.pending.lock().unwrap().clone()
    }

    fn clear_pending(&self) {
        self.pending.lock().unwrap().clear();
    }
}

#[tokio::test]
async fn test_forwarded_domain_event_reaches_dynamic_subscriber() {
    init_tracing();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut handlers = HandlerRegistry::new();
    handlers.register(LegacyNoticeHandler { received: tx });

    let bus = Arc::new(MemoryEventBus::start(
        DispatchSettings::default(),
        Arc::new(handlers),
    ));
    bus.subscribe_dynamic::<LegacyNoticeHandler>("LegacyNotice")
        .await
        .unwrap();

    let accessor = Arc::new(RecordingAccessor::default());
    accessor
        .pending
        .lock()
        .unwrap()
        .push(Arc::new(RecordedDomainEvent {
            id: uuid::Uuid::new_v4(),
            occurred_on: chrono::Utc::now(),
            name: "NoticeRaised".to_string(),
            payload: serde_json::json!({"text": "hi"}),
        }));

    let forwarder = DomainEventsForwarder::new(
        accessor.clone(),
        Box::new(|event| {
            (event.name() == "NoticeRaised")
                .then(|| OutboundEvent::from_value("LegacyNotice", event.payload()).ok())
                .flatten()
        }),
        bus.clone(),
    );

    assert_eq!(forwarder.dispatch_pending().await.unwrap(), 1);
    assert!(accessor.all_pending().is_empty());

    let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for handler")
        .expect("channel closed");
    assert_eq!(payload["text"], "hi");
}
