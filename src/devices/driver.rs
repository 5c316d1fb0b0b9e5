// driver.rs
use super::{
    Device, DeviceConnector,
    color::{self, Hsl},
};
use crate::{
    config::DeviceSettings,
    error::AppError,
    models::{DEFAULT_BRIGHTNESS, DEFAULT_COLOR, DeviceInfo, LampState},
};
use async_trait::async_trait;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

/// Wire protocol of a physical lamp. Implementations are stateless; they
/// neither remember nor report what they were last told.
#[async_trait]
pub trait LampDriver: Send + Sync {
    async fn power(&self, on: bool) -> Result<(), AppError>;
    async fn brightness(&self, level: u8) -> Result<(), AppError>;
    async fn hsl(&self, hsl: Hsl) -> Result<(), AppError>;
    async fn info(&self) -> Result<DeviceInfo, AppError>;
}

/// Talks to a lamp bridge exposing a small JSON API:
/// `POST power|brightness|hsl`, `GET info`.
#[derive(Clone)]
pub struct HttpLampDriver {
    client: reqwest::Client,
    base_url: Url,
    credentials: Option<(String, String)>,
}

impl HttpLampDriver {
    pub fn new(
        base_url: &str,
        credentials: Option<(String, String)>,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| AppError::DeviceUnreachable(format!("invalid lamp url '{base_url}': {e}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::DeviceUnreachable(format!("http client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            credentials,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, AppError> {
        self.base_url
            .join(path)
            .map_err(|e| AppError::DeviceUnreachable(e.to_string()))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, AppError> {
        let request = match &self.credentials {
            Some((username, password)) => request.basic_auth(username, Some(password)),
            None => request,
        };
        let response = request
            .send()
            .await
            .map_err(|e| AppError::DeviceUnreachable(format!("lamp request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(AppError::DeviceUnreachable(format!(
                "lamp responded with {}",
                response.status()
            )));
        }
        Ok(response)
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<(), AppError> {
        let url = self.endpoint(path)?;
        debug!(%url, %body, "Lamp request");
        self.send(self.client.post(url).json(&body)).await?;
        Ok(())
    }
}

#[async_trait]
impl LampDriver for HttpLampDriver {
    async fn power(&self, on: bool) -> Result<(), AppError> {
        self.post("power", json!({ "on": on })).await
    }

    async fn brightness(&self, level: u8) -> Result<(), AppError> {
        self.post("brightness", json!({ "brightness": level })).await
    }

    async fn hsl(&self, hsl: Hsl) -> Result<(), AppError> {
        self.post(
            "hsl",
            json!({
                "hue": hsl.hue,
                "saturation": hsl.saturation,
                "luminance": hsl.luminance,
            }),
        )
        .await
    }

    async fn info(&self) -> Result<DeviceInfo, AppError> {
        let url = self.endpoint("info")?;
        self.send(self.client.get(url))
            .await?
            .json::<DeviceInfo>()
            .await
            .map_err(|e| AppError::DeviceUnreachable(format!("unexpected device info: {e}")))
    }
}

/// Gives a stateless [`LampDriver`] the full [`Device`] capability set by
/// recording every successfully applied mutation.
pub struct TrackedLamp<D> {
    driver: D,
    state: Arc<RwLock<LampState>>,
}

impl<D: LampDriver> TrackedLamp<D> {
    pub fn new(driver: D, state: Arc<RwLock<LampState>>) -> Self {
        Self { driver, state }
    }

    async fn record(&self, update: impl FnOnce(LampState) -> LampState) {
        let mut state = self.state.write().await;
        *state = update(state.clone());
    }
}

#[async_trait]
impl<D: LampDriver> Device for TrackedLamp<D> {
    async fn turn_on(&self) -> Result<(), AppError> {
        self.driver.power(true).await?;
        self.record(|s| LampState { powered_on: true, ..s }).await;
        Ok(())
    }

    async fn turn_off(&self) -> Result<(), AppError> {
        self.driver.power(false).await?;
        self.record(|s| LampState { powered_on: false, ..s }).await;
        Ok(())
    }

    async fn set_brightness(&self, level: Option<u8>) -> Result<(), AppError> {
        let brightness = level.unwrap_or(DEFAULT_BRIGHTNESS);
        self.driver.brightness(brightness).await?;
        self.record(|s| LampState { brightness, ..s }).await;
        Ok(())
    }

    async fn set_color(&self, color: Option<&str>) -> Result<(), AppError> {
        let color = color.unwrap_or(DEFAULT_COLOR);
        let hsl = color::hex_to_hsl(color)?;
        self.driver.hsl(hsl).await?;
        let color = color.to_string();
        self.record(|s| LampState { color, ..s }).await;
        Ok(())
    }

    async fn get_state(&self) -> Result<LampState, AppError> {
        Ok(self.state.read().await.clone())
    }

    async fn get_device_info(&self) -> Result<DeviceInfo, AppError> {
        self.driver.info().await
    }
}

/// Connects to the configured lamp bridge. The tracked state is shared by
/// every handle it hands out, so it outlives individual dispatches.
pub struct HttpLampConnector {
    driver: HttpLampDriver,
    state: Arc<RwLock<LampState>>,
}

impl HttpLampConnector {
    /// Returns `None` when no lamp is configured.
    pub fn from_settings(settings: &DeviceSettings) -> Result<Option<Self>, AppError> {
        let Some(base_url) = settings.base_url.as_deref() else {
            return Ok(None);
        };
        let credentials = match (&settings.username, &settings.password) {
            (Some(username), Some(password)) => Some((username.clone(), password.clone())),
            _ => None,
        };
        let driver = HttpLampDriver::new(
            base_url,
            credentials,
            Duration::from_millis(settings.connect_timeout_ms),
        )?;
        Ok(Some(Self {
            driver,
            state: Arc::new(RwLock::new(LampState::default())),
        }))
    }
}

#[async_trait]
impl DeviceConnector for HttpLampConnector {
    async fn connect(&self) -> Result<Arc<dyn Device>, AppError> {
        let info = self.driver.info().await?;
        debug!(device_id = %info.device_id, model = %info.model, "Lamp bridge reachable");
        Ok(Arc::new(TrackedLamp::new(self.driver.clone(), self.state.clone())))
    }
}
