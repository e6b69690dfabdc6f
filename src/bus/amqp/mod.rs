//! AMQP (RabbitMQ) event bus backend.
//!
//! Events go through a direct exchange with the bare event name as the
//! routing key. Each subscriber group owns a durable queue bound to the
//! exchange once per subscribed event name; a single logical consumer
//! dispatches deliveries and yields between handler invocations.

mod connection;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicRejectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, ExchangeKind};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Binding, BusError, EventBus, Result};
use crate::config::{AmqpSettings, DispatchSettings};
use crate::dispatch::{dispatch_message, AckPolicy};
use crate::event::OutboundEvent;
use crate::handler::{HandlerId, ScopeFactory};
use crate::registry::SubscriptionRegistry;
use crate::retry::{publish_with_retry, RetryPolicy};

pub use connection::{AmqpConnection, ConnectionState};

/// AMQP event bus implementation using RabbitMQ.
pub struct AmqpEventBus {
    settings: AmqpSettings,
    ack_policy: AckPolicy,
    retry: RetryPolicy,
    connection: Arc<AmqpConnection>,
    registry: Arc<SubscriptionRegistry>,
    scopes: Arc<dyn ScopeFactory>,
    consumer_stop: watch::Sender<bool>,
    consumer_task: Mutex<Option<JoinHandle<()>>>,
}

impl AmqpEventBus {
    /// Connect to the broker and declare the exchange and subscriber queue.
    pub async fn connect(
        settings: AmqpSettings,
        dispatch: DispatchSettings,
        scopes: Arc<dyn ScopeFactory>,
    ) -> Result<Self> {
        let connection = Arc::new(AmqpConnection::new(&settings.url));

        let channel = connection.open_channel().await?;
        channel
            .exchange_declare(
                &settings.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connection(format!("failed to declare exchange: {e}")))?;
        channel
            .queue_declare(
                &settings.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connection(format!("failed to declare queue: {e}")))?;

        info!(
            exchange = %settings.exchange,
            queue = %settings.queue,
            url = %settings.url,
            "Connected to AMQP"
        );

        // Event-removed notifications flow through this channel from the
        // registry to the unbind task.
        let (removed_tx, removed_rx) = mpsc::unbounded_channel::<String>();
        let registry = Arc::new(SubscriptionRegistry::with_removal_listener(
            move |event_name| {
                let _ = removed_tx.send(event_name.to_string());
            },
        ));

        let (consumer_stop, _) = watch::channel(false);

        let bus = Self {
            settings,
            ack_policy: dispatch.ack_policy,
            retry: RetryPolicy::new(dispatch.retry_count),
            connection,
            registry,
            scopes,
            consumer_stop,
            consumer_task: Mutex::new(None),
        };
        bus.spawn_unbind_task(removed_rx);
        Ok(bus)
    }

    /// Releases broker routing for removed event names and stops the
    /// consumer once no subscriptions remain.
    fn spawn_unbind_task(&self, mut removed: mpsc::UnboundedReceiver<String>) {
        let connection = Arc::clone(&self.connection);
        let exchange = self.settings.exchange.clone();
        let queue = self.settings.queue.clone();
        let registry = Arc::clone(&self.registry);
        let stop = self.consumer_stop.clone();

        tokio::spawn(async move {
            while let Some(event_name) = removed.recv().await {
                if !connection.is_connected().await {
                    connection.try_connect().await;
                }
                match connection.open_channel().await {
                    Ok(channel) => {
                        match channel
                            .queue_unbind(&queue, &exchange, &event_name, FieldTable::default())
                            .await
                        {
                            Ok(()) => {
                                info!(event_name = %event_name, queue = %queue, "Released routing for event")
                            }
                            Err(error) => {
                                warn!(event_name = %event_name, error = %error, "Failed to unbind queue")
                            }
                        }
                    }
                    Err(error) => {
                        warn!(event_name = %event_name, error = %error, "No channel to unbind routing")
                    }
                }

                if registry.is_empty() {
                    debug!(queue = %queue, "No subscriptions remain, stopping consumer");
                    stop.send_replace(true);
                }
            }
        });
    }

    /// Bind the subscriber queue for an event name.
    async fn provision_routing(&self, event_name: &str) -> Result<()> {
        if !self.connection.is_connected().await {
            self.connection.try_connect().await;
        }
        let channel = self.connection.open_channel().await?;
        channel
            .queue_bind(
                &self.settings.queue,
                &self.settings.exchange,
                event_name,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BusError::RoutingProvision(format!("failed to bind '{event_name}': {e}"))
            })?;
        info!(
            event_name = %event_name,
            queue = %self.settings.queue,
            "Bound queue for event"
        );
        Ok(())
    }

    /// One publish attempt over a fresh channel.
    async fn publish_once(&self, event: &OutboundEvent) -> Result<()> {
        if !self.connection.is_connected().await {
            self.connection.try_connect().await;
        }
        let channel = self.connection.open_channel().await?;

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_message_id(event.id.to_string().into())
            .with_delivery_mode(2); // persistent

        let confirm = channel
            .basic_publish(
                &self.settings.exchange,
                &event.event_name,
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                &event.body,
                properties,
            )
            .await
            .map_err(|e| BusError::Connection(format!("failed to publish: {e}")))?;
        confirm
            .await
            .map_err(|e| BusError::Connection(format!("publish confirmation failed: {e}")))?;

        debug!(
            event_id = %event.id,
            event_name = %event.event_name,
            "Published event"
        );
        Ok(())
    }

    /// Start the consumer loop if it is not already running.
    async fn ensure_consumer(&self) {
        let mut slot = self.consumer_task.lock().await;
        match slot.as_ref() {
            Some(handle) if !handle.is_finished() && !*self.consumer_stop.borrow() => return,
            _ => {}
        }
        if let Some(handle) = slot.take() {
            // A stopping loop winds down after its in-flight work.
            let _ = handle.await;
        }
        self.consumer_stop.send_replace(false);

        let ctx = ConsumerContext {
            connection: Arc::clone(&self.connection),
            queue: self.settings.queue.clone(),
            ack_policy: self.ack_policy,
            registry: Arc::clone(&self.registry),
            scopes: Arc::clone(&self.scopes),
        };
        let stop = self.consumer_stop.subscribe();
        *slot = Some(tokio::spawn(consume_loop(ctx, stop)));
    }
}

struct ConsumerContext {
    connection: Arc<AmqpConnection>,
    queue: String,
    ack_policy: AckPolicy,
    registry: Arc<SubscriptionRegistry>,
    scopes: Arc<dyn ScopeFactory>,
}

/// Consumer loop with automatic reconnection and exponential backoff with
/// jitter. Transport-level errors never terminate the loop; only the stop
/// signal does, and in-flight dispatches finish first.
async fn consume_loop(ctx: ConsumerContext, mut stop: watch::Receiver<bool>) {
    let backoff_builder = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(30))
        .with_jitter();
    let mut backoff = backoff_builder.build();

    'reconnect: loop {
        if *stop.borrow() {
            break;
        }

        match setup_consumer(&ctx).await {
            Ok(mut consumer) => {
                info!(queue = %ctx.queue, "Consumer connected, processing messages");
                // Reset backoff on successful connection.
                backoff = backoff_builder.build();

                loop {
                    tokio::select! {
                        changed = stop.changed() => {
                            if changed.is_err() || *stop.borrow() {
                                break 'reconnect;
                            }
                        }
                        delivery = consumer.next() => match delivery {
                            Some(Ok(delivery)) => process_delivery(&ctx, delivery).await,
                            Some(Err(error)) => {
                                error!(error = %error, "Consumer delivery error, reconnecting");
                                break;
                            }
                            None => {
                                info!(queue = %ctx.queue, "Consumer stream ended, reconnecting");
                                break;
                            }
                        }
                    }
                }
            }
            Err(error) => {
                let delay = backoff.next().unwrap_or(Duration::from_secs(30));
                error!(
                    error = %error,
                    backoff_ms = %delay.as_millis(),
                    queue = %ctx.queue,
                    "Failed to set up consumer, retrying after backoff"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        }
    }

    info!(queue = %ctx.queue, "Consumer loop stopped");
}

/// Open a channel and start consuming from the subscriber queue.
async fn setup_consumer(ctx: &ConsumerContext) -> Result<lapin::Consumer> {
    let channel = ctx.connection.open_channel().await?;

    channel
        .queue_declare(
            &ctx.queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BusError::Connection(format!("failed to declare queue: {e}")))?;

    channel
        .basic_consume(
            &ctx.queue,
            "crossbus-consumer",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| BusError::Connection(format!("failed to start consumer: {e}")))
}

/// Process a single delivery: dispatch, then settle per the ack policy.
async fn process_delivery(ctx: &ConsumerContext, delivery: Delivery) {
    let event_name = delivery.routing_key.as_str().to_string();

    let result = dispatch_message(
        &ctx.registry,
        ctx.scopes.as_ref(),
        &event_name,
        &delivery.data,
    )
    .await;

    if result.should_ack(ctx.ack_policy) {
        if let Err(error) = delivery.ack(BasicAckOptions::default()).await {
            error!(error = %error, event_name = %event_name, "Failed to ack message");
        }
    } else if let Err(error) = delivery
        .reject(BasicRejectOptions { requeue: false })
        .await
    {
        error!(error = %error, event_name = %event_name, "Failed to reject message");
    }
}

#[async_trait]
impl EventBus for AmqpEventBus {
    async fn publish_raw(&self, event: OutboundEvent) -> Result<()> {
        debug!(
            event_id = %event.id,
            event_name = %event.event_name,
            "Creating channel to publish event"
        );
        let event = &event;
        publish_with_retry(&self.retry, event.id, move || self.publish_once(event)).await
    }

    async fn subscribe_binding(&self, binding: Binding) -> Result<()> {
        let event_name = binding.subscription.descriptor.event_name.clone();

        if !self.registry.has_subscriptions_for(&event_name) {
            self.provision_routing(&event_name).await?;
        }
        self.registry.add(binding.subscription, binding.payload_type)?;
        self.ensure_consumer().await;
        Ok(())
    }

    async fn unsubscribe_binding(&self, event_name: &str, handler: HandlerId) -> Result<()> {
        // The removal listener routes the unbind through the broker and
        // stops the consumer when the registry empties.
        self.registry.remove(event_name, handler)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.registry.clear();
        self.consumer_stop.send_replace(true);
        if let Some(task) = self.consumer_task.lock().await.take() {
            let _ = task.await;
        }
        self.connection.close().await;
        info!(messaging_type = "amqp", "Event bus closed");
        Ok(())
    }
}
