//! In-process event bus backend.
//!
//! Models a topic broker: a routing rule is provisioned per event name at
//! subscribe time, publishes without a matching rule are discarded, and
//! delivery fans out through a bounded pool of concurrent dispatches.
//! Useful for tests and single-process deployments.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info};

use super::{Binding, BusError, EventBus, Result};
use crate::config::DispatchSettings;
use crate::dispatch::{dispatch_message, AckPolicy};
use crate::event::OutboundEvent;
use crate::handler::{HandlerId, ScopeFactory};
use crate::registry::SubscriptionRegistry;

/// In-process event bus.
pub struct MemoryEventBus {
    registry: Arc<SubscriptionRegistry>,
    rules: Arc<RwLock<HashSet<String>>>,
    sender: mpsc::UnboundedSender<OutboundEvent>,
    stop: watch::Sender<bool>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    delivered: Arc<AtomicUsize>,
    acked: Arc<AtomicUsize>,
    dropped: AtomicUsize,
    closed: AtomicBool,
}

impl MemoryEventBus {
    /// Start the bus and its delivery loop.
    pub fn start(settings: DispatchSettings, scopes: Arc<dyn ScopeFactory>) -> Self {
        let rules: Arc<RwLock<HashSet<String>>> = Arc::new(RwLock::new(HashSet::new()));
        let released = Arc::clone(&rules);
        let registry = Arc::new(SubscriptionRegistry::with_removal_listener(
            move |event_name| {
                released
                    .write()
                    .expect("rule set lock poisoned")
                    .remove(event_name);
                debug!(event_name = %event_name, "Released routing rule");
            },
        ));

        let (sender, receiver) = mpsc::unbounded_channel();
        let (stop, stop_rx) = watch::channel(false);
        let delivered = Arc::new(AtomicUsize::new(0));
        let acked = Arc::new(AtomicUsize::new(0));

        let consumer = tokio::spawn(deliver_loop(DeliveryContext {
            receiver,
            stop: stop_rx,
            registry: Arc::clone(&registry),
            scopes,
            ack_policy: settings.ack_policy,
            max_concurrent: settings.max_concurrent_dispatches.max(1),
            delivered: Arc::clone(&delivered),
            acked: Arc::clone(&acked),
        }));

        Self {
            registry,
            rules,
            sender,
            stop,
            consumer: Mutex::new(Some(consumer)),
            delivered,
            acked,
            dropped: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Messages handed to the delivery loop so far.
    pub fn delivered_count(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Messages acknowledged after dispatch.
    pub fn acked_count(&self) -> usize {
        self.acked.load(Ordering::SeqCst)
    }

    /// Messages discarded because no routing rule matched.
    pub fn dropped_count(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }
}

struct DeliveryContext {
    receiver: mpsc::UnboundedReceiver<OutboundEvent>,
    stop: watch::Receiver<bool>,
    registry: Arc<SubscriptionRegistry>,
    scopes: Arc<dyn ScopeFactory>,
    ack_policy: AckPolicy,
    max_concurrent: usize,
    delivered: Arc<AtomicUsize>,
    acked: Arc<AtomicUsize>,
}

async fn deliver_loop(ctx: DeliveryContext) {
    let DeliveryContext {
        mut receiver,
        mut stop,
        registry,
        scopes,
        ack_policy,
        max_concurrent,
        delivered,
        acked,
    } = ctx;

    let semaphore = Arc::new(Semaphore::new(max_concurrent));
    let mut inflight: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            message = receiver.recv() => {
                let Some(event) = message else { break };
                delivered.fetch_add(1, Ordering::SeqCst);

                // Bounded pool: block intake while all slots are in use.
                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    break;
                };
                while inflight.try_join_next().is_some() {}

                let registry = Arc::clone(&registry);
                let scopes = Arc::clone(&scopes);
                let acked = Arc::clone(&acked);
                inflight.spawn(async move {
                    let result = dispatch_message(
                        &registry,
                        scopes.as_ref(),
                        &event.event_name,
                        &event.body,
                    )
                    .await;
                    if result.should_ack(ack_policy) {
                        acked.fetch_add(1, Ordering::SeqCst);
                    } else {
                        debug!(event_name = %event.event_name, "Message rejected");
                    }
                    drop(permit);
                });
            }
        }
    }

    // Cooperative shutdown: finish in-flight dispatches before exiting.
    while inflight.join_next().await.is_some() {}
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish_raw(&self, event: OutboundEvent) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }

        let matched = self
            .rules
            .read()
            .expect("rule set lock poisoned")
            .contains(&event.event_name);
        if !matched {
            debug!(
                event_id = %event.id,
                event_name = %event.event_name,
                "No routing rule for event, discarding"
            );
            self.dropped.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }

        debug!(event_id = %event.id, event_name = %event.event_name, "Publishing event");
        self.sender.send(event).map_err(|_| BusError::Closed)
    }

    async fn subscribe_binding(&self, binding: Binding) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }

        let event_name = binding.subscription.descriptor.event_name.clone();

        // Re-creating an existing rule is success: subscribe is idempotent
        // on the broker side.
        let newly_provisioned = self
            .rules
            .write()
            .expect("rule set lock poisoned")
            .insert(event_name.clone());
        if newly_provisioned {
            info!(event_name = %event_name, "Provisioned routing rule");
        }

        self.registry.add(binding.subscription, binding.payload_type)?;
        Ok(())
    }

    async fn unsubscribe_binding(&self, event_name: &str, handler: HandlerId) -> Result<()> {
        // The removal listener releases the routing rule when the last
        // binding for the event name goes away.
        self.registry.remove(event_name, handler)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.registry.clear();
        self.stop.send_replace(true);
        if let Some(task) = self.consumer.lock().await.take() {
            let _ = task.await;
        }
        info!(messaging_type = "memory", "Event bus closed");
        Ok(())
    }
}
