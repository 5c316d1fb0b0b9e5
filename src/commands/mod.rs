// commands/mod.rs
use crate::{
    devices::Device,
    error::AppError,
    models::{Command, CommandKind},
};
use async_trait::async_trait;
use std::collections::HashMap;

/// Maps one command kind onto the device operation it triggers.
#[async_trait]
pub trait CommandStrategy: Send + Sync {
    fn kind(&self) -> CommandKind;
    async fn execute(&self, device: &dyn Device, command: &Command) -> Result<(), AppError>;
}

inventory::collect!(&'static dyn CommandStrategy);

pub struct TurnOnStrategy;

#[async_trait]
impl CommandStrategy for TurnOnStrategy {
    fn kind(&self) -> CommandKind {
        CommandKind::On
    }

    async fn execute(&self, device: &dyn Device, _command: &Command) -> Result<(), AppError> {
        device.turn_on().await
    }
}

pub struct TurnOffStrategy;

#[async_trait]
impl CommandStrategy for TurnOffStrategy {
    fn kind(&self) -> CommandKind {
        CommandKind::Off
    }

    async fn execute(&self, device: &dyn Device, _command: &Command) -> Result<(), AppError> {
        device.turn_off().await
    }
}

pub struct SetBrightnessStrategy;

#[async_trait]
impl CommandStrategy for SetBrightnessStrategy {
    fn kind(&self) -> CommandKind {
        CommandKind::Brightness
    }

    async fn execute(&self, device: &dyn Device, command: &Command) -> Result<(), AppError> {
        match command {
            Command::Brightness(level) => device.set_brightness(Some(*level)).await,
            other => Err(AppError::UnsupportedCommand(other.kind().to_string())),
        }
    }
}

pub struct SetColorStrategy;

#[async_trait]
impl CommandStrategy for SetColorStrategy {
    fn kind(&self) -> CommandKind {
        CommandKind::Color
    }

    async fn execute(&self, device: &dyn Device, command: &Command) -> Result<(), AppError> {
        match command {
            Command::Color(color) => device.set_color(Some(color.as_str())).await,
            other => Err(AppError::UnsupportedCommand(other.kind().to_string())),
        }
    }
}

inventory::submit! { &TurnOnStrategy as &'static dyn CommandStrategy }
inventory::submit! { &TurnOffStrategy as &'static dyn CommandStrategy }
inventory::submit! { &SetBrightnessStrategy as &'static dyn CommandStrategy }
inventory::submit! { &SetColorStrategy as &'static dyn CommandStrategy }

/// Lookup table over every registered strategy. `morse` and `getStatus`
/// are deliberately absent; the dispatcher handles them itself.
pub struct StrategyRegistry {
    strategies: HashMap<CommandKind, &'static dyn CommandStrategy>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        let strategies = inventory::iter::<&'static dyn CommandStrategy>
            .into_iter()
            .map(|strategy| (strategy.kind(), *strategy))
            .collect();
        Self { strategies }
    }

    pub fn resolve(&self, kind: CommandKind) -> Option<&'static dyn CommandStrategy> {
        self.strategies.get(&kind).copied()
    }

    /// Resolves and runs the strategy for `command`.
    pub async fn execute(&self, device: &dyn Device, command: &Command) -> Result<(), AppError> {
        let strategy = self
            .resolve(command.kind())
            .ok_or_else(|| AppError::UnsupportedCommand(command.kind().to_string()))?;
        strategy.execute(device, command).await
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
