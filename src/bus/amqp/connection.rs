//! Persistent AMQP connection handle.

use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::bus::{BusError, Result};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Lazily (re)established connection shared by the publish and consume
/// paths.
///
/// A connection the broker has closed underneath us is replaced the next
/// time a channel is requested, so callers always observe a usable handle.
pub struct AmqpConnection {
    url: String,
    slot: Mutex<Slot>,
}

struct Slot {
    state: ConnectionState,
    connection: Option<Connection>,
}

impl AmqpConnection {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            slot: Mutex::new(Slot {
                state: ConnectionState::Disconnected,
                connection: None,
            }),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        self.slot.lock().await.state
    }

    /// True when a live connection is held.
    pub async fn is_connected(&self) -> bool {
        let slot = self.slot.lock().await;
        slot.state == ConnectionState::Connected
            && slot
                .connection
                .as_ref()
                .is_some_and(|c| c.status().connected())
    }

    /// Idempotent connect: returns true immediately when already
    /// connected, otherwise makes exactly one establishment attempt and
    /// returns false on failure without erroring.
    pub async fn try_connect(&self) -> bool {
        let mut slot = self.slot.lock().await;
        self.establish(&mut slot).await
    }

    async fn establish(&self, slot: &mut Slot) -> bool {
        if slot.state == ConnectionState::Closed {
            return false;
        }

        if let Some(connection) = &slot.connection {
            if connection.status().connected() {
                slot.state = ConnectionState::Connected;
                return true;
            }
            // Broker closed it underneath us; replace on this attempt.
            debug!(url = %self.url, "AMQP connection no longer live, reconnecting");
            slot.connection = None;
        }

        slot.state = ConnectionState::Connecting;
        match Connection::connect(&self.url, ConnectionProperties::default()).await {
            Ok(connection) => {
                info!(url = %self.url, "Connected to AMQP broker");
                slot.connection = Some(connection);
                slot.state = ConnectionState::Connected;
                true
            }
            Err(error) => {
                warn!(url = %self.url, error = %error, "AMQP connection attempt failed");
                slot.state = ConnectionState::Disconnected;
                false
            }
        }
    }

    /// Open a fresh channel, re-establishing the connection if needed.
    pub async fn open_channel(&self) -> Result<Channel> {
        let mut slot = self.slot.lock().await;
        if slot.state == ConnectionState::Closed {
            return Err(BusError::Closed);
        }
        if !self.establish(&mut slot).await {
            return Err(BusError::Connection(format!(
                "broker unreachable at {}",
                self.url
            )));
        }

        let Some(connection) = slot.connection.as_ref() else {
            return Err(BusError::Connection(
                "connection slot empty after connect".to_string(),
            ));
        };
        connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("failed to create channel: {e}")))
    }

    /// Close permanently; subsequent calls fail with `Closed`.
    pub async fn close(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(connection) = slot.connection.take() {
            if let Err(error) = connection.close(200, "closing").await {
                debug!(error = %error, "AMQP close reported an error");
            }
        }
        slot.state = ConnectionState::Closed;
    }
}
