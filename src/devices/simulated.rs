// simulated.rs
use crate::{
    error::AppError,
    models::{DEFAULT_BRIGHTNESS, DEFAULT_COLOR, DeviceInfo, LampState},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

struct Inner {
    state: LampState,
    on_since: Option<DateTime<Utc>>,
}

/// In-memory stand-in for a physical lamp. Never fails.
pub struct SimulatedLamp {
    inner: RwLock<Inner>,
}

impl SimulatedLamp {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: LampState::default(),
                on_since: None,
            }),
        }
    }
}

impl Default for SimulatedLamp {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl super::Device for SimulatedLamp {
    async fn turn_on(&self) -> Result<(), AppError> {
        debug!("Simulated lamp: ON");
        let mut inner = self.inner.write().await;
        if !inner.state.powered_on {
            inner.on_since = Some(Utc::now());
        }
        inner.state = LampState {
            powered_on: true,
            ..inner.state.clone()
        };
        Ok(())
    }

    async fn turn_off(&self) -> Result<(), AppError> {
        debug!("Simulated lamp: OFF");
        let mut inner = self.inner.write().await;
        inner.on_since = None;
        inner.state = LampState {
            powered_on: false,
            ..inner.state.clone()
        };
        Ok(())
    }

    async fn set_brightness(&self, level: Option<u8>) -> Result<(), AppError> {
        let brightness = level.unwrap_or(DEFAULT_BRIGHTNESS);
        debug!(brightness, "Simulated lamp: brightness");
        let mut inner = self.inner.write().await;
        inner.state = LampState {
            brightness,
            ..inner.state.clone()
        };
        Ok(())
    }

    async fn set_color(&self, color: Option<&str>) -> Result<(), AppError> {
        let color = color.unwrap_or(DEFAULT_COLOR).to_string();
        debug!(%color, "Simulated lamp: color");
        let mut inner = self.inner.write().await;
        inner.state = LampState {
            color,
            ..inner.state.clone()
        };
        Ok(())
    }

    async fn get_state(&self) -> Result<LampState, AppError> {
        Ok(self.inner.read().await.state.clone())
    }

    async fn get_device_info(&self) -> Result<DeviceInfo, AppError> {
        let inner = self.inner.read().await;
        let on_time = inner
            .on_since
            .map(|since| (Utc::now() - since).num_seconds())
            .unwrap_or(0);
        Ok(DeviceInfo {
            device_id: "simulated-lamp".to_string(),
            model: "SimulatedLamp".to_string(),
            mac: "00:00:00:00:00:00".to_string(),
            ip: "127.0.0.1".to_string(),
            fw_ver: env!("CARGO_PKG_VERSION").to_string(),
            device_on: inner.state.powered_on,
            on_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::Device;

    #[tokio::test]
    async fn starts_off_at_full_white() {
        let lamp = SimulatedLamp::new();
        assert_eq!(lamp.get_state().await.unwrap(), LampState::default());
    }

    #[tokio::test]
    async fn mutations_are_reflected_in_state() {
        let lamp = SimulatedLamp::new();
        lamp.turn_on().await.unwrap();
        lamp.set_brightness(Some(30)).await.unwrap();
        lamp.set_color(Some("#00ff00")).await.unwrap();

        let state = lamp.get_state().await.unwrap();
        assert_eq!(
            state,
            LampState {
                powered_on: true,
                brightness: 30,
                color: "#00ff00".into(),
            }
        );

        lamp.turn_off().await.unwrap();
        assert!(!lamp.get_state().await.unwrap().powered_on);
    }

    #[tokio::test]
    async fn missing_values_fall_back_to_defaults() {
        let lamp = SimulatedLamp::new();
        lamp.set_brightness(Some(5)).await.unwrap();
        lamp.set_color(Some("#123456")).await.unwrap();

        lamp.set_brightness(None).await.unwrap();
        lamp.set_color(None).await.unwrap();

        let state = lamp.get_state().await.unwrap();
        assert_eq!(state.brightness, 100);
        assert_eq!(state.color, "#ffffff");
    }

    #[tokio::test]
    async fn device_info_tracks_power() {
        let lamp = SimulatedLamp::new();
        assert!(!lamp.get_device_info().await.unwrap().device_on);
        lamp.turn_on().await.unwrap();
        let info = lamp.get_device_info().await.unwrap();
        assert!(info.device_on);
        assert!(info.on_time >= 0);
    }
}
