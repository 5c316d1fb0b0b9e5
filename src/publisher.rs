// publisher.rs
use crate::{
    broker::{ConnectionManager, DeliveryMode, Transport},
    error::AppError,
    metrics as app_metrics,
    models::{MorseProgressEvent, StatusEnvelope},
};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Receives Morse playback milestones.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn emit(&self, event: MorseProgressEvent);
}

/// Broadcasts status envelopes and Morse progress to every observer.
/// Best effort: a message that cannot be handed to the broker is dropped.
#[derive(Clone)]
pub struct StatusPublisher {
    transport: Arc<dyn Transport>,
    status_channel: String,
    morse_channel: String,
}

impl StatusPublisher {
    pub fn new(connections: &ConnectionManager) -> Self {
        let bindings = connections.bindings();
        Self {
            transport: connections.status_transport(),
            status_channel: bindings.status.clone(),
            morse_channel: bindings.morse.clone(),
        }
    }

    pub async fn publish_status(&self, envelope: &StatusEnvelope) -> Result<(), AppError> {
        self.publish_json(&self.status_channel, envelope).await
    }

    pub async fn publish_progress(&self, event: &MorseProgressEvent) -> Result<(), AppError> {
        self.publish_json(&self.morse_channel, event).await
    }

    async fn publish_json<T: Serialize + Sync>(
        &self,
        channel: &str,
        value: &T,
    ) -> Result<(), AppError> {
        let payload = serde_json::to_vec(value).map_err(|e| AppError::Internal(e.into()))?;
        debug!(channel, payload = %String::from_utf8_lossy(&payload), "Publishing");
        if let Err(e) = self
            .transport
            .publish(channel, payload, DeliveryMode::BestEffort)
            .await
        {
            warn!(channel, error = %e, "Dropping message");
            metrics::counter!(app_metrics::PUBLISH_DROPPED_TOTAL, "channel" => channel.to_string())
                .increment(1);
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl ProgressSink for StatusPublisher {
    async fn emit(&self, event: MorseProgressEvent) {
        // failures are already logged and counted
        let _ = self.publish_progress(&event).await;
    }
}
