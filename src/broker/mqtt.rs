// broker/mqtt.rs
use super::{Acker, Delivery, DeliveryMode, ReconnectPolicy, Subscription, Transport};
use crate::{config::BrokerSettings, error::AppError};
use async_trait::async_trait;
use dashmap::DashMap;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS};
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

type Routes = Arc<DashMap<String, Vec<mpsc::UnboundedSender<Delivery>>>>;

/// One MQTT connection. Reconnects on its own and re-subscribes every bound
/// channel after each successful connect.
pub struct MqttTransport {
    role: &'static str,
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    routes: Routes,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

/// One incoming publish shared by every local subscriber of its topic.
/// The broker sees a single ack, sent when the last copy is settled.
struct SharedPublish {
    client: AsyncClient,
    publish: Publish,
    pending: AtomicUsize,
}

impl SharedPublish {
    fn settle(&self) -> Result<(), AppError> {
        if self.pending.fetch_sub(1, Ordering::AcqRel) != 1 {
            return Ok(());
        }
        // try_ack never waits on the request queue the event loop drains
        self.client
            .try_ack(&self.publish)
            .map_err(|e| AppError::Transport(format!("ack failed: {e}")))
    }
}

struct MqttAcker {
    shared: Arc<SharedPublish>,
}

#[async_trait]
impl Acker for MqttAcker {
    async fn ack(self: Box<Self>) -> Result<(), AppError> {
        self.shared.settle()
    }
}

/// Hands `publish` to every live subscriber of its topic, pruning the ones
/// that went away. Unrouted publishes are acked straight away.
fn fan_out(routes: &Routes, client: &AsyncClient, publish: Publish, role: &str) {
    let senders = match routes.get_mut(&publish.topic) {
        Some(mut senders) => {
            senders.retain(|tx| !tx.is_closed());
            senders.clone()
        }
        None => Vec::new(),
    };
    if senders.is_empty() {
        let _ = client.try_ack(&publish);
        return;
    }

    let payload = publish.payload.to_vec();
    let shared = Arc::new(SharedPublish {
        client: client.clone(),
        publish,
        pending: AtomicUsize::new(senders.len()),
    });
    for tx in senders {
        let acker = Box::new(MqttAcker {
            shared: shared.clone(),
        });
        if tx.send(Delivery::with_acker(payload.clone(), acker)).is_err() {
            debug!(role, "Subscription dropped during fan-out");
            let _ = shared.settle();
        }
    }
}

fn qos(mode: DeliveryMode) -> QoS {
    match mode {
        DeliveryMode::Reliable => QoS::AtLeastOnce,
        DeliveryMode::BestEffort => QoS::AtMostOnce,
    }
}

pub(crate) fn mqtt_options(settings: &BrokerSettings, role: &str) -> Result<MqttOptions, AppError> {
    let url = Url::parse(&settings.url)
        .map_err(|e| AppError::Transport(format!("invalid broker url '{}': {e}", settings.url)))?;
    if !matches!(url.scheme(), "mqtt" | "tcp") {
        return Err(AppError::Transport(format!(
            "unsupported broker scheme '{}'",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| AppError::Transport("broker url has no host".into()))?;
    let port = url.port().unwrap_or(1883);

    let client_id = format!(
        "{}-{}-{}",
        settings.client_id_prefix,
        role,
        Uuid::new_v4().simple()
    );
    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_manual_acks(true);
    if !url.username().is_empty() {
        options.set_credentials(url.username(), url.password().unwrap_or_default());
    }
    Ok(options)
}

impl MqttTransport {
    /// Starts the event loop. The first connection attempt happens in the
    /// background, so this never blocks on the broker being up.
    pub fn connect(
        settings: &BrokerSettings,
        role: &'static str,
        policy: ReconnectPolicy,
    ) -> Result<Self, AppError> {
        let options = mqtt_options(settings, role)?;
        let (client, event_loop) = AsyncClient::new(options, 64);

        let connected = Arc::new(AtomicBool::new(false));
        let closing = Arc::new(AtomicBool::new(false));
        let routes: Routes = Arc::new(DashMap::new());

        let handle = tokio::spawn(run_event_loop(
            event_loop,
            client.clone(),
            connected.clone(),
            closing.clone(),
            routes.clone(),
            policy,
            role,
        ));

        Ok(Self {
            role,
            client,
            connected,
            closing,
            routes,
            event_loop: Mutex::new(Some(handle)),
        })
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    routes: Routes,
    policy: ReconnectPolicy,
    role: &'static str,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                connected.store(true, Ordering::SeqCst);
                info!(role, "MQTT connection established");
                for route in routes.iter().filter(|route| !route.value().is_empty()) {
                    if let Err(e) = client.try_subscribe(route.key().as_str(), QoS::AtLeastOnce) {
                        warn!(role, channel = %route.key(), error = %e, "Re-subscribe failed");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                fan_out(&routes, &client, publish, role);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                connected.store(false, Ordering::SeqCst);
                info!(role, "MQTT connection closed");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                connected.store(false, Ordering::SeqCst);
                if closing.load(Ordering::SeqCst) {
                    break;
                }
                warn!(
                    role,
                    error = %e,
                    retry_in_ms = policy.delay.as_millis() as u64,
                    "MQTT connection lost, reconnecting"
                );
                policy.wait().await;
            }
        }
    }
    routes.clear();
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(
        &self,
        channel: &str,
        payload: Vec<u8>,
        mode: DeliveryMode,
    ) -> Result<(), AppError> {
        if !self.is_connected() {
            return Err(AppError::Transport(format!(
                "{} connection is down",
                self.role
            )));
        }
        self.client
            .publish(channel, qos(mode), false, payload)
            .await
            .map_err(|e| AppError::Transport(e.to_string()))
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, AppError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let first = {
            let mut senders = self.routes.entry(channel.to_string()).or_default();
            senders.retain(|sender| !sender.is_closed());
            senders.push(tx);
            senders.len() == 1
        };
        // later local subscribers share the broker subscription; when
        // disconnected, the next ConnAck subscribes it
        if first && self.is_connected() {
            self.client
                .subscribe(channel, QoS::AtLeastOnce)
                .await
                .map_err(|e| AppError::Transport(e.to_string()))?;
        }
        info!(role = self.role, channel, "Subscribed");
        Ok(Subscription::new(channel, rx))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.client.try_disconnect();
        let handle = self.event_loop.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(Duration::from_secs(1), handle).await.is_err() {
                abort.abort();
            }
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}
