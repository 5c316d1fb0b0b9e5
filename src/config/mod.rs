// config/mod.rs
use config::Config;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub device: DeviceSettings,
    pub dispatcher: DispatcherSettings,
    pub morse: MorseSettings,
    pub metrics: MetricsSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub address: String,
    pub api_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    Memory,
    Mqtt,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerSettings {
    pub kind: BrokerKind,
    pub url: String,
    pub client_id_prefix: String,
    pub reconnect_delay_ms: u64,
    pub command_channel: String,
    pub status_channel: String,
    pub morse_channel: String,
    pub capacity: usize,
}

impl BrokerSettings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[derive(Clone, Deserialize)]
pub struct DeviceSettings {
    pub base_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connect_timeout_ms: u64,
}

impl std::fmt::Debug for DeviceSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSettings")
            .field("base_url", &self.base_url)
            .field("username", &self.username.as_ref().map(|_| "<redacted>"))
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherSettings {
    pub execution_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MorseSettings {
    pub dot_ms: u64,
    pub dash_ms: u64,
    pub gap_ms: u64,
    pub letter_gap_ms: u64,
    pub word_gap_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub port: u16,
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let settings = Self::defaults()?
            .add_source(config::File::with_name("config/config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        settings.try_deserialize()
    }

    fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
        Config::builder()
            .set_default("server.address", "0.0.0.0:3000")?
            .set_default("server.api_enabled", true)?
            .set_default("broker.kind", "memory")?
            .set_default("broker.url", "mqtt://localhost:1883")?
            .set_default("broker.client_id_prefix", "lamp-relay")?
            .set_default("broker.reconnect_delay_ms", 5000)?
            .set_default("broker.command_channel", "lamp.commands.exchange")?
            .set_default("broker.status_channel", "lamp.status.exchange")?
            .set_default("broker.morse_channel", "lamp.morse.exchange")?
            .set_default("broker.capacity", 256)?
            .set_default("device.connect_timeout_ms", 2000)?
            .set_default("dispatcher.execution_timeout_ms", 5000)?
            .set_default("morse.dot_ms", 100)?
            .set_default("morse.dash_ms", 300)?
            .set_default("morse.gap_ms", 100)?
            .set_default("morse.letter_gap_ms", 300)?
            .set_default("morse.word_gap_ms", 500)?
            .set_default("metrics.enabled", false)?
            .set_default("metrics.port", 9000)
    }
}
