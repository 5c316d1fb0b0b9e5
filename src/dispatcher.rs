// dispatcher.rs
use crate::{
    broker::{ConnectionManager, Subscription, Transport},
    commands::StrategyRegistry,
    devices::{Device, DeviceResolver, ResolvedDevice},
    error::AppError,
    metrics as app_metrics,
    models::{Command, LampState, StatusEnvelope},
    morse::MorsePlayer,
    publisher::StatusPublisher,
};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Turns commands into device actions and publishes exactly one status
/// envelope per command, success or not.
///
/// Commands are handled strictly one at a time; `&mut self` on every entry
/// point is the only exclusion there is.
pub struct Dispatcher {
    resolver: Arc<dyn DeviceResolver>,
    registry: StrategyRegistry,
    player: MorsePlayer,
    publisher: StatusPublisher,
    timeout: Duration,
    last_known: Option<LampState>,
}

impl Dispatcher {
    pub fn new(
        resolver: Arc<dyn DeviceResolver>,
        publisher: StatusPublisher,
        player: MorsePlayer,
        timeout: Duration,
    ) -> Self {
        Self {
            resolver,
            registry: StrategyRegistry::new(),
            player,
            publisher,
            timeout,
            last_known: None,
        }
    }

    /// Handles one raw message from the command channel. Malformed payloads
    /// are logged and dropped without publishing anything.
    pub async fn handle_payload(&mut self, payload: &[u8]) -> Option<StatusEnvelope> {
        match Command::parse(payload) {
            Ok(command) => Some(self.dispatch(&command).await),
            Err(AppError::UnsupportedCommand(name)) => {
                warn!(command = %name, "Unsupported command");
                metrics::counter!(
                    app_metrics::COMMANDS_TOTAL,
                    "command" => "unsupported",
                    "outcome" => "error"
                )
                .increment(1);
                let message = AppError::UnsupportedCommand(name.clone()).to_string();
                let envelope = StatusEnvelope::failure(self.base_state(), name, message, None);
                self.publish(&envelope).await;
                Some(envelope)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    payload = %String::from_utf8_lossy(payload),
                    "Discarding malformed command"
                );
                metrics::counter!(
                    app_metrics::COMMANDS_TOTAL,
                    "command" => "unknown",
                    "outcome" => "malformed"
                )
                .increment(1);
                None
            }
        }
    }

    pub async fn dispatch(&mut self, command: &Command) -> StatusEnvelope {
        let started = Instant::now();
        let kind = command.kind();
        info!(command = %kind, "Handling command");

        let expected = self.expected_state(command);
        let ResolvedDevice {
            device,
            is_simulated,
        } = self.resolver.resolve().await;

        let outcome = match self.execute(device.as_ref(), command).await {
            Ok(()) => self.bounded(device.get_state()).await,
            Err(e) => Err(e),
        };

        let (envelope, outcome_label) = match outcome {
            Ok(state) => {
                info!(command = %kind, simulated = is_simulated, "Command applied");
                self.last_known = Some(state.clone());
                (StatusEnvelope::success(state, is_simulated), "ok")
            }
            Err(e) => {
                error!(command = %kind, simulated = is_simulated, error = %e, "Command failed");
                let label = match e {
                    AppError::ExecutionTimeout(_) => "timeout",
                    _ => "error",
                };
                (
                    StatusEnvelope::failure(expected, kind.as_str(), e.to_string(), Some(is_simulated)),
                    label,
                )
            }
        };

        self.publish(&envelope).await;

        metrics::counter!(
            app_metrics::COMMANDS_TOTAL,
            "command" => kind.as_str(),
            "outcome" => outcome_label
        )
        .increment(1);
        metrics::histogram!(app_metrics::DISPATCH_SECONDS, "command" => kind.as_str())
            .record(started.elapsed().as_secs_f64());

        envelope
    }

    /// Best-effort projection of what the lamp should look like after
    /// `command`. Only ever published alongside an error.
    pub fn expected_state(&self, command: &Command) -> LampState {
        let base = self.base_state();
        match command {
            Command::On => LampState {
                powered_on: true,
                ..base
            },
            Command::Off => LampState {
                powered_on: false,
                ..base
            },
            Command::Brightness(brightness) => LampState {
                brightness: *brightness,
                ..base
            },
            Command::Color(color) => LampState {
                color: color.clone(),
                ..base
            },
            Command::Morse(_) | Command::GetStatus => base,
        }
    }

    fn base_state(&self) -> LampState {
        self.last_known.clone().unwrap_or_default()
    }

    async fn execute(&self, device: &dyn Device, command: &Command) -> Result<(), AppError> {
        match command {
            Command::GetStatus => Ok(()),
            Command::Morse(text) => self.player.play(device, text, &self.publisher).await,
            other => self.bounded(self.registry.execute(device, other)).await,
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, AppError>>,
    ) -> Result<T, AppError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| AppError::ExecutionTimeout(self.timeout))?
    }

    async fn publish(&self, envelope: &StatusEnvelope) {
        // dropped publishes are logged by the publisher
        let _ = self.publisher.publish_status(envelope).await;
    }
}

/// Feeds the command channel into a [`Dispatcher`], one message at a time.
/// The next message is only taken after the current one has been published
/// and acknowledged.
pub struct CommandConsumer {
    dispatcher: Dispatcher,
    subscription: Subscription,
}

impl CommandConsumer {
    pub async fn bind(
        dispatcher: Dispatcher,
        connections: &ConnectionManager,
    ) -> Result<Self, AppError> {
        let channel = &connections.bindings().command;
        let subscription = connections.command_transport().subscribe(channel).await?;
        info!(%channel, "Waiting for commands");
        Ok(Self {
            dispatcher,
            subscription,
        })
    }

    pub async fn run(mut self) {
        while let Some(delivery) = self.subscription.next().await {
            self.dispatcher.handle_payload(&delivery.payload).await;
            // errors were already surfaced on the status channel, so ack regardless
            if let Err(e) = delivery.ack().await {
                warn!(error = %e, "Failed to acknowledge command");
            }
        }
        info!(channel = self.subscription.channel(), "Command channel closed, consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{ChannelBindings, DeliveryMode},
        devices::{
            FallbackResolver, SimulatedLamp,
            testing::{BrokenDevice, CountingDevice, FailingConnector, FixedResolver, SlowDevice},
        },
        models::{MorseProgressEvent, MorseStatus},
        morse::MorseTiming,
    };

    const WAIT: Duration = Duration::from_secs(2);

    struct Harness {
        connections: ConnectionManager,
        status: Subscription,
        morse: Subscription,
    }

    impl Harness {
        async fn new() -> Self {
            let connections = ConnectionManager::in_memory(ChannelBindings::default(), 64);
            let transport = connections.status_transport();
            let status = transport
                .subscribe(&connections.bindings().status)
                .await
                .unwrap();
            let morse = transport
                .subscribe(&connections.bindings().morse)
                .await
                .unwrap();
            Self {
                connections,
                status,
                morse,
            }
        }

        fn dispatcher(&self, resolver: Arc<dyn DeviceResolver>, timeout: Duration) -> Dispatcher {
            Dispatcher::new(
                resolver,
                StatusPublisher::new(&self.connections),
                MorsePlayer::new(MorseTiming::instant(), timeout),
                timeout,
            )
        }

        async fn next_status(&mut self) -> StatusEnvelope {
            let delivery = tokio::time::timeout(WAIT, self.status.next())
                .await
                .expect("status published")
                .unwrap();
            serde_json::from_slice(&delivery.payload).unwrap()
        }

        async fn next_progress(&mut self) -> MorseProgressEvent {
            let delivery = tokio::time::timeout(WAIT, self.morse.next())
                .await
                .expect("progress published")
                .unwrap();
            serde_json::from_slice(&delivery.payload).unwrap()
        }

        async fn assert_no_status(&mut self) {
            let waited = tokio::time::timeout(Duration::from_millis(50), self.status.next()).await;
            assert!(waited.is_err(), "unexpected status publication");
        }
    }

    fn fixed(device: Arc<dyn Device>, is_simulated: bool) -> Arc<dyn DeviceResolver> {
        Arc::new(FixedResolver {
            device,
            is_simulated,
        })
    }

    #[tokio::test]
    async fn brightness_on_reachable_lamp_publishes_actual_state() {
        let mut harness = Harness::new().await;
        let lamp = Arc::new(SimulatedLamp::new());
        lamp.turn_on().await.unwrap();
        lamp.set_brightness(Some(10)).await.unwrap();

        let mut dispatcher = harness.dispatcher(fixed(lamp, false), WAIT);
        dispatcher
            .handle_payload(br#"{"command":"brightness","value":42}"#)
            .await;

        let envelope = harness.next_status().await;
        assert_eq!(
            envelope.state,
            LampState {
                powered_on: true,
                brightness: 42,
                color: "#ffffff".into(),
            }
        );
        assert_eq!(envelope.is_simulated, Some(false));
        assert!(envelope.error.is_none());
    }

    #[tokio::test]
    async fn every_valid_brightness_is_applied() {
        let mut harness = Harness::new().await;
        let lamp: Arc<dyn Device> = Arc::new(SimulatedLamp::new());
        let mut dispatcher = harness.dispatcher(fixed(lamp, false), WAIT);

        for level in [0u8, 1, 50, 99, 100] {
            dispatcher.dispatch(&Command::Brightness(level)).await;
            assert_eq!(harness.next_status().await.state.brightness, level);
        }
    }

    #[tokio::test]
    async fn unknown_kind_publishes_error_without_touching_device() {
        let mut harness = Harness::new().await;
        let device = Arc::new(CountingDevice::default());
        let mut dispatcher = harness.dispatcher(fixed(device.clone(), false), WAIT);

        dispatcher.handle_payload(br#"{"command":"blink"}"#).await;

        let envelope = harness.next_status().await;
        let error = envelope.error.expect("error envelope");
        assert_eq!(error.command, "blink");
        assert!(!error.message.is_empty());
        assert_eq!(device.calls(), 0);
    }

    #[tokio::test]
    async fn malformed_payload_publishes_nothing() {
        let mut harness = Harness::new().await;
        let device = Arc::new(CountingDevice::default());
        let mut dispatcher = harness.dispatcher(fixed(device.clone(), false), WAIT);

        assert!(dispatcher.handle_payload(b"{not json").await.is_none());
        assert!(
            dispatcher
                .handle_payload(br#"{"command":"brightness"}"#)
                .await
                .is_none()
        );
        harness.assert_no_status().await;
        assert_eq!(device.calls(), 0);
    }

    #[tokio::test]
    async fn unreachable_lamp_falls_back_to_simulated() {
        let mut harness = Harness::new().await;
        let resolver = Arc::new(FallbackResolver::new(
            Some(Arc::new(FailingConnector)),
            Arc::new(SimulatedLamp::new()),
            Duration::from_millis(50),
        ));
        let mut dispatcher = harness.dispatcher(resolver, WAIT);

        dispatcher.dispatch(&Command::On).await;

        let envelope = harness.next_status().await;
        assert_eq!(envelope.is_simulated, Some(true));
        assert!(envelope.error.is_none());
        assert!(envelope.state.powered_on);
    }

    #[tokio::test]
    async fn timeout_publishes_expected_state_with_error() {
        let mut harness = Harness::new().await;
        let slow = Arc::new(SlowDevice {
            inner: SimulatedLamp::new(),
            delay: Duration::from_millis(300),
        });
        let mut dispatcher = harness.dispatcher(fixed(slow, false), Duration::from_millis(20));

        dispatcher.dispatch(&Command::Brightness(42)).await;

        let envelope = harness.next_status().await;
        assert_eq!(envelope.state.brightness, 42);
        let error = envelope.error.expect("timeout error");
        assert_eq!(error.command, "brightness");
        assert!(!error.message.is_empty());
    }

    #[tokio::test]
    async fn execution_failure_reports_projection_from_last_known_state() {
        let mut harness = Harness::new().await;
        let lamp: Arc<dyn Device> = Arc::new(SimulatedLamp::new());
        let mut dispatcher = harness.dispatcher(fixed(lamp, false), WAIT);
        dispatcher.dispatch(&Command::Brightness(10)).await;
        harness.next_status().await;

        // same dispatcher, lamp now refuses every mutation
        dispatcher.resolver = fixed(Arc::new(BrokenDevice::default()), false);
        dispatcher.dispatch(&Command::On).await;

        let envelope = harness.next_status().await;
        assert_eq!(
            envelope.state,
            LampState {
                powered_on: true,
                brightness: 10,
                color: "#ffffff".into(),
            }
        );
        assert_eq!(envelope.error.unwrap().command, "on");
        assert_eq!(envelope.is_simulated, Some(false));
    }

    #[tokio::test]
    async fn repeated_color_is_idempotent() {
        let mut harness = Harness::new().await;
        let lamp: Arc<dyn Device> = Arc::new(SimulatedLamp::new());
        let mut dispatcher = harness.dispatcher(fixed(lamp, true), WAIT);

        let command = Command::Color("#ff8800".into());
        dispatcher.dispatch(&command).await;
        let first = harness.next_status().await;
        dispatcher.dispatch(&command).await;
        let second = harness.next_status().await;

        assert_eq!(first.state.color, "#ff8800");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn get_status_republishes_without_mutation() {
        let mut harness = Harness::new().await;
        let device = Arc::new(CountingDevice::default());
        device.inner.turn_on().await.unwrap();
        let mut dispatcher = harness.dispatcher(fixed(device.clone(), true), WAIT);

        dispatcher.dispatch(&Command::GetStatus).await;

        let envelope = harness.next_status().await;
        assert!(envelope.state.powered_on);
        assert_eq!(envelope.is_simulated, Some(true));
        // only the state read
        assert_eq!(device.calls(), 1);
    }

    #[tokio::test]
    async fn morse_emits_progress_then_one_unchanged_status() {
        let mut harness = Harness::new().await;
        let lamp = Arc::new(SimulatedLamp::new());
        lamp.set_color(Some("#00ff00")).await.unwrap();
        let before = lamp.get_state().await.unwrap();
        let mut dispatcher = harness.dispatcher(fixed(lamp, false), WAIT);

        dispatcher
            .handle_payload(br#"{"command":"morse","value":"SOS"}"#)
            .await;

        let mut events = vec![harness.next_progress().await];
        while events.last().unwrap().status != MorseStatus::Completed {
            events.push(harness.next_progress().await);
        }
        assert_eq!(events.first().unwrap().status, MorseStatus::Started);
        let progress: Vec<u8> = events.iter().filter_map(|e| e.progress).collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress.last(), Some(&100));

        let envelope = harness.next_status().await;
        assert_eq!(envelope.state, before);
        assert!(envelope.error.is_none());
        harness.assert_no_status().await;
    }

    #[tokio::test]
    async fn consumer_processes_commands_in_order() {
        let mut harness = Harness::new().await;
        let lamp: Arc<dyn Device> = Arc::new(SimulatedLamp::new());
        let dispatcher = harness.dispatcher(fixed(lamp, true), WAIT);
        let consumer = CommandConsumer::bind(dispatcher, &harness.connections)
            .await
            .unwrap();
        let handle = tokio::spawn(consumer.run());

        let transport = harness.connections.command_transport();
        let channel = harness.connections.bindings().command.clone();
        for payload in [
            r#"{"command":"on"}"#,
            "garbage",
            r#"{"command":"brightness","value":5}"#,
            r#"{"command":"off"}"#,
        ] {
            transport
                .publish(&channel, payload.as_bytes().to_vec(), DeliveryMode::Reliable)
                .await
                .unwrap();
        }

        assert!(harness.next_status().await.state.powered_on);
        assert_eq!(harness.next_status().await.state.brightness, 5);
        assert!(!harness.next_status().await.state.powered_on);
        harness.assert_no_status().await;

        harness.connections.close().await;
        tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
    }
}
