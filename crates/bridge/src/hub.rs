//! Fan-out of JSON events to dashboard subscribers.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use unitboard_protocol::Message;

/// Events buffered per subscriber before a slow one starts skipping.
const HUB_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub rx: bool,
    pub tx: bool,
}

impl ConnectionStatus {
    pub fn new(rx: bool, tx: bool) -> Self {
        Self {
            connected: rx && tx,
            rx,
            tx,
        }
    }
}

/// `{"type": ..., "data": ...}` as seen by WebSocket clients.
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HubEvent<'a> {
    SensorUpdate(&'a Message),
    AckReceived(&'a Message),
    AckInitializeReceived(&'a Message),
    SystemConnectionStatus(ConnectionStatus),
}

impl<'a> HubEvent<'a> {
    /// Dashboard event for an inbound controller message.
    pub fn for_message(msg: &'a Message) -> Self {
        match msg {
            Message::Sensor(_) => Self::SensorUpdate(msg),
            Message::Ack(_) => Self::AckReceived(msg),
            Message::AckInitialize(_) => Self::AckInitializeReceived(msg),
        }
    }
}

#[derive(Clone)]
pub struct Hub {
    tx: broadcast::Sender<String>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(HUB_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// Serialize and publish one event. Having no subscribers is normal.
    pub fn broadcast(&self, event: &HubEvent<'_>) {
        let text = match serde_json::to_string(event) {
            Ok(text) => text,
            Err(e) => {
                warn!("hub: failed to serialize event: {e}");
                return;
            }
        };
        match self.tx.send(text) {
            Ok(n) => debug!(subscribers = n, "hub: event published"),
            Err(_) => debug!("hub: no subscribers"),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
