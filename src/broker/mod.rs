//! Message channels between the producer side and the lamp side.
//!
//! Three logical channels are bound per process:
//!
//! | Channel | Producer | Consumer |
//! |---|---|---|
//! | command | HTTP API or any external producer | [`crate::dispatcher::CommandConsumer`] |
//! | status | [`crate::publisher::StatusPublisher`] | every observer |
//! | morse-progress | Morse playback via the publisher | every observer |
//!
//! All channels are fanout: every active subscriber receives every message
//! and nothing is retained for subscribers that join later.

mod memory;
mod mqtt;

pub use memory::MemoryBroker;
pub use mqtt::MqttTransport;

use crate::{
    config::{BrokerKind, BrokerSettings},
    error::AppError,
};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::info;

/// How hard the transport should try to hand a message to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Acknowledged by the broker and redelivered after transport failures.
    Reliable,
    /// Fire and forget.
    BestEffort,
}

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acker: Send {
    async fn ack(self: Box<Self>) -> Result<(), AppError>;
}

pub struct Delivery {
    pub payload: Vec<u8>,
    acker: Option<Box<dyn Acker>>,
}

impl Delivery {
    /// A delivery that needs no acknowledgement.
    pub fn settled(payload: Vec<u8>) -> Self {
        Self {
            payload,
            acker: None,
        }
    }

    pub fn with_acker(payload: Vec<u8>, acker: Box<dyn Acker>) -> Self {
        Self {
            payload,
            acker: Some(acker),
        }
    }

    pub async fn ack(self) -> Result<(), AppError> {
        match self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }
}

/// Messages arriving on one bound channel, in publish order.
pub struct Subscription {
    channel: String,
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, receiver: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self {
            channel: channel.into(),
            receiver,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// `None` once the transport has been closed.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Hands `payload` to the broker. Fails with [`AppError::Transport`]
    /// instead of queueing while the connection is down.
    async fn publish(
        &self,
        channel: &str,
        payload: Vec<u8>,
        mode: DeliveryMode,
    ) -> Result<(), AppError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, AppError>;

    fn is_connected(&self) -> bool;

    async fn close(&self);
}

/// Periodic retry on a fixed delay, forever.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub delay: Duration,
}

impl ReconnectPolicy {
    pub async fn wait(&self) {
        tokio::time::sleep(self.delay).await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelBindings {
    pub command: String,
    pub status: String,
    pub morse: String,
}

impl ChannelBindings {
    pub fn from_settings(settings: &BrokerSettings) -> Self {
        Self {
            command: settings.command_channel.clone(),
            status: settings.status_channel.clone(),
            morse: settings.morse_channel.clone(),
        }
    }
}

impl Default for ChannelBindings {
    fn default() -> Self {
        Self {
            command: "lamp.commands.exchange".to_string(),
            status: "lamp.status.exchange".to_string(),
            morse: "lamp.morse.exchange".to_string(),
        }
    }
}

/// Owns one connection per role (command traffic, status traffic).
/// Built once in `main` and shared by reference.
pub struct ConnectionManager {
    bindings: ChannelBindings,
    command: Arc<dyn Transport>,
    status: Arc<dyn Transport>,
}

impl ConnectionManager {
    pub async fn connect(settings: &BrokerSettings) -> Result<Self, AppError> {
        let bindings = ChannelBindings::from_settings(settings);
        match settings.kind {
            BrokerKind::Memory => {
                info!("Using in-process broker");
                Ok(Self::in_memory(bindings, settings.capacity))
            }
            BrokerKind::Mqtt => {
                let policy = ReconnectPolicy {
                    delay: settings.reconnect_delay(),
                };
                let command = MqttTransport::connect(settings, "command", policy)?;
                let status = MqttTransport::connect(settings, "status", policy)?;
                info!(url = %settings.url, "MQTT transports started");
                Ok(Self {
                    bindings,
                    command: Arc::new(command),
                    status: Arc::new(status),
                })
            }
        }
    }

    pub fn in_memory(bindings: ChannelBindings, capacity: usize) -> Self {
        let broker = Arc::new(MemoryBroker::new(capacity));
        Self {
            bindings,
            command: broker.clone(),
            status: broker,
        }
    }

    pub fn bindings(&self) -> &ChannelBindings {
        &self.bindings
    }

    pub fn command_transport(&self) -> Arc<dyn Transport> {
        self.command.clone()
    }

    pub fn status_transport(&self) -> Arc<dyn Transport> {
        self.status.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.command.is_connected() && self.status.is_connected()
    }

    pub async fn close(&self) {
        self.command.close().await;
        self.status.close().await;
        info!("Broker connections closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_roles_share_one_broker() {
        let connections = ConnectionManager::in_memory(ChannelBindings::default(), 16);
        let mut sub = connections
            .status_transport()
            .subscribe("probe")
            .await
            .unwrap();

        connections
            .command_transport()
            .publish("probe", b"hello".to_vec(), DeliveryMode::BestEffort)
            .await
            .unwrap();

        let delivery = sub.next().await.unwrap();
        assert_eq!(delivery.payload, b"hello");
        assert!(connections.is_connected());
    }

    #[tokio::test]
    async fn close_ends_subscriptions() {
        let connections = ConnectionManager::in_memory(ChannelBindings::default(), 16);
        let mut sub = connections
            .command_transport()
            .subscribe(&connections.bindings().command)
            .await
            .unwrap();

        connections.close().await;
        assert!(sub.next().await.is_none());
        assert!(!connections.is_connected());
    }
}
