use crate::{broker::ConnectionManager, devices::color, error::AppError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, sync::Arc};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError};

pub const DEFAULT_BRIGHTNESS: u8 = 100;
pub const DEFAULT_COLOR: &str = "#ffffff";

/// Last known or expected condition of the lamp. Always replaced whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LampState {
    pub powered_on: bool,
    pub brightness: u8,
    pub color: String,
}

impl Default for LampState {
    fn default() -> Self {
        Self {
            powered_on: false,
            brightness: DEFAULT_BRIGHTNESS,
            color: DEFAULT_COLOR.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    On,
    Off,
    Brightness,
    Color,
    Morse,
    GetStatus,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::On => "on",
            CommandKind::Off => "off",
            CommandKind::Brightness => "brightness",
            CommandKind::Color => "color",
            CommandKind::Morse => "morse",
            CommandKind::GetStatus => "getStatus",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "on" => Some(CommandKind::On),
            "off" => Some(CommandKind::Off),
            "brightness" => Some(CommandKind::Brightness),
            "color" => Some(CommandKind::Color),
            "morse" => Some(CommandKind::Morse),
            "getStatus" => Some(CommandKind::GetStatus),
            _ => None,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated lamp command. Constructed once per incoming message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    On,
    Off,
    Brightness(u8),
    Color(String),
    Morse(String),
    GetStatus,
}

/// Raw shape of a command on the command channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMessage {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::On => CommandKind::On,
            Command::Off => CommandKind::Off,
            Command::Brightness(_) => CommandKind::Brightness,
            Command::Color(_) => CommandKind::Color,
            Command::Morse(_) => CommandKind::Morse,
            Command::GetStatus => CommandKind::GetStatus,
        }
    }

    /// Parses a command payload.
    ///
    /// Payloads that are not JSON, lack a `command` field or carry a bad
    /// `value` yield [`AppError::MalformedCommand`]. A well-formed payload
    /// naming a kind we do not know yields [`AppError::UnsupportedCommand`]
    /// so the caller can still report it.
    pub fn parse(payload: &[u8]) -> Result<Self, AppError> {
        let message: CommandMessage = serde_json::from_slice(payload)
            .map_err(|e| AppError::MalformedCommand(e.to_string()))?;
        Self::try_from(message)
    }

    pub fn to_message(&self) -> CommandMessage {
        let value = match self {
            Command::Brightness(level) => Some(Value::from(*level)),
            Command::Color(color) | Command::Morse(color) => Some(Value::from(color.as_str())),
            Command::On | Command::Off | Command::GetStatus => None,
        };
        CommandMessage {
            command: self.kind().as_str().to_string(),
            value,
        }
    }
}

/// Any JSON number with an integral value in 0..=100, so `42` and `42.0`
/// are the same level.
fn brightness_level(value: &Value) -> Option<u8> {
    let level = value.as_f64()?;
    (level.fract() == 0.0 && (0.0..=100.0).contains(&level)).then_some(level as u8)
}

impl TryFrom<CommandMessage> for Command {
    type Error = AppError;

    fn try_from(message: CommandMessage) -> Result<Self, Self::Error> {
        let kind = CommandKind::from_name(&message.command)
            .ok_or_else(|| AppError::UnsupportedCommand(message.command.clone()))?;

        let text_value = |value: Option<Value>| match value {
            Some(Value::String(text)) => Ok(text),
            other => Err(AppError::MalformedCommand(format!(
                "'{kind}' expects a string value, got {other:?}"
            ))),
        };

        match kind {
            CommandKind::On => Ok(Command::On),
            CommandKind::Off => Ok(Command::Off),
            CommandKind::GetStatus => Ok(Command::GetStatus),
            CommandKind::Brightness => {
                let level = message
                    .value
                    .as_ref()
                    .and_then(brightness_level)
                    .ok_or_else(|| {
                        AppError::MalformedCommand(format!(
                            "'brightness' expects an integer between 0 and 100, got {:?}",
                            message.value
                        ))
                    })?;
                Ok(Command::Brightness(level))
            }
            CommandKind::Color => {
                let color = text_value(message.value)?;
                validate_hex_color(&color)
                    .map_err(|_| AppError::MalformedCommand(format!("invalid color '{color}'")))?;
                Ok(Command::Color(color))
            }
            CommandKind::Morse => {
                let text = text_value(message.value)?;
                if text.is_empty() {
                    return Err(AppError::MalformedCommand(
                        "'morse' expects non-empty text".into(),
                    ));
                }
                Ok(Command::Morse(text))
            }
        }
    }
}

/// Accepts `#RRGGBB` and `#RGB`.
pub fn validate_hex_color(value: &str) -> Result<(), ValidationError> {
    if !value.starts_with('#') || color::parse_hex(value).is_err() {
        return Err(ValidationError::new("hex_color"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CommandError {
    pub message: String,
    pub command: String,
}

/// The only payload ever broadcast on the status channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusEnvelope {
    #[serde(flatten)]
    pub state: LampState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_simulated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandError>,
}

impl StatusEnvelope {
    pub fn success(state: LampState, is_simulated: bool) -> Self {
        Self {
            state,
            is_simulated: Some(is_simulated),
            error: None,
        }
    }

    pub fn failure(
        expected: LampState,
        command: impl Into<String>,
        message: impl Into<String>,
        is_simulated: Option<bool>,
    ) -> Self {
        Self {
            state: expected,
            is_simulated,
            error: Some(CommandError {
                message: message.into(),
                command: command.into(),
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MorseStatus {
    Started,
    Progress,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct MorseProgressEvent {
    pub status: MorseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
}

impl MorseProgressEvent {
    pub fn started() -> Self {
        Self {
            status: MorseStatus::Started,
            progress: None,
        }
    }

    pub fn progress(percent: u8) -> Self {
        Self {
            status: MorseStatus::Progress,
            progress: Some(percent),
        }
    }

    pub fn completed() -> Self {
        Self {
            status: MorseStatus::Completed,
            progress: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub model: String,
    pub mac: String,
    pub ip: String,
    #[serde(default)]
    pub fw_ver: String,
    #[serde(default)]
    pub device_on: bool,
    /// Seconds since the lamp was last switched on.
    #[serde(default)]
    pub on_time: i64,
}

/// Frame pushed to WebSocket observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ObserverMessage {
    Status(StatusEnvelope),
    MorseProgress(MorseProgressEvent),
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct BrightnessRequest {
    #[validate(range(max = 100))]
    pub value: u8,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct ColorRequest {
    #[validate(custom(function = "validate_hex_color"))]
    pub value: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct MorseRequest {
    #[validate(length(min = 1))]
    pub value: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CommandAccepted {
    pub success: bool,
    pub message: String,
}

pub struct AppState {
    pub connections: Arc<ConnectionManager>,
    pub observers: DashMap<Uuid, DateTime<Utc>>,
}

impl AppState {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self {
            connections,
            observers: DashMap::new(),
        }
    }
}
