// broker/memory.rs
use super::{Delivery, DeliveryMode, Subscription, Transport};
use crate::error::AppError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, mpsc};
use tracing::{trace, warn};

/// In-process fanout broker. Every channel is a `broadcast` channel created
/// on first use; publishing with nobody listening drops the message.
pub struct MemoryBroker {
    channels: DashMap<String, broadcast::Sender<Vec<u8>>>,
    capacity: usize,
    closed: AtomicBool,
}

impl MemoryBroker {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    fn ensure_open(&self) -> Result<(), AppError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::Transport("in-process broker is closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn publish(
        &self,
        channel: &str,
        payload: Vec<u8>,
        _mode: DeliveryMode,
    ) -> Result<(), AppError> {
        self.ensure_open()?;
        match self.sender(channel).send(payload) {
            Ok(receivers) => trace!(channel, receivers, "Published"),
            Err(_) => trace!(channel, "Published with no subscribers"),
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, AppError> {
        self.ensure_open()?;
        let mut source = self.sender(channel).subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let name = channel.to_string();

        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if tx.send(Delivery::settled(payload)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(channel = %name, lagged_by = n, "Subscriber lagged, messages lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(channel, rx))
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.channels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_gets_every_message_in_order() {
        let broker = MemoryBroker::new(16);
        let mut first = broker.subscribe("status").await.unwrap();
        let mut second = broker.subscribe("status").await.unwrap();

        for n in 0..3u8 {
            broker
                .publish("status", vec![n], DeliveryMode::BestEffort)
                .await
                .unwrap();
        }

        for sub in [&mut first, &mut second] {
            for n in 0..3u8 {
                assert_eq!(sub.next().await.unwrap().payload, vec![n]);
            }
        }
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let broker = MemoryBroker::new(16);
        let mut morse = broker.subscribe("morse").await.unwrap();
        broker
            .publish("status", b"x".to_vec(), DeliveryMode::BestEffort)
            .await
            .unwrap();

        let waited =
            tokio::time::timeout(std::time::Duration::from_millis(50), morse.next()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped_silently() {
        let broker = MemoryBroker::new(16);
        broker
            .publish("nobody", b"x".to_vec(), DeliveryMode::Reliable)
            .await
            .unwrap();
        // late subscribers see nothing from before they joined
        let mut late = broker.subscribe("nobody").await.unwrap();
        let waited =
            tokio::time::timeout(std::time::Duration::from_millis(50), late.next()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn publish_after_close_fails() {
        let broker = MemoryBroker::new(16);
        broker.close().await;
        let err = broker
            .publish("status", b"x".to_vec(), DeliveryMode::BestEffort)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Transport(_)));
    }
}
