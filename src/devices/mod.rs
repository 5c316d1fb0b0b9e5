// devices/mod.rs
pub mod color;
mod driver;
mod simulated;

pub use driver::{HttpLampConnector, HttpLampDriver, LampDriver, TrackedLamp};
pub use simulated::SimulatedLamp;

use crate::{
    error::AppError,
    metrics as app_metrics,
    models::{DeviceInfo, LampState},
};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

/// Capabilities every lamp exposes. A mutation completes before the call
/// returns and is visible through [`Device::get_state`] afterwards.
#[async_trait]
pub trait Device: Send + Sync {
    async fn turn_on(&self) -> Result<(), AppError>;
    async fn turn_off(&self) -> Result<(), AppError>;
    /// `None` means full brightness.
    async fn set_brightness(&self, level: Option<u8>) -> Result<(), AppError>;
    /// `None` means white.
    async fn set_color(&self, color: Option<&str>) -> Result<(), AppError>;
    async fn get_state(&self) -> Result<LampState, AppError>;
    async fn get_device_info(&self) -> Result<DeviceInfo, AppError>;
}

/// Acquires a handle to a physical lamp.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Device>, AppError>;
}

pub struct ResolvedDevice {
    pub device: Arc<dyn Device>,
    pub is_simulated: bool,
}

/// Picks the device a single dispatch runs against.
#[async_trait]
pub trait DeviceResolver: Send + Sync {
    async fn resolve(&self) -> ResolvedDevice;
}

/// Prefers the real lamp and silently falls back to the simulated one when
/// it cannot be acquired in time.
pub struct FallbackResolver {
    connector: Option<Arc<dyn DeviceConnector>>,
    simulated: Arc<SimulatedLamp>,
    connect_timeout: Duration,
}

impl FallbackResolver {
    pub fn new(
        connector: Option<Arc<dyn DeviceConnector>>,
        simulated: Arc<SimulatedLamp>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            simulated,
            connect_timeout,
        }
    }

    pub fn simulated_only(simulated: Arc<SimulatedLamp>) -> Self {
        Self::new(None, simulated, Duration::ZERO)
    }

    fn fallback(&self) -> ResolvedDevice {
        ResolvedDevice {
            device: self.simulated.clone(),
            is_simulated: true,
        }
    }
}

#[async_trait]
impl DeviceResolver for FallbackResolver {
    async fn resolve(&self) -> ResolvedDevice {
        let Some(connector) = &self.connector else {
            debug!("No real lamp configured, using simulated lamp");
            return self.fallback();
        };

        match tokio::time::timeout(self.connect_timeout, connector.connect()).await {
            Ok(Ok(device)) => {
                info!("Real lamp acquired");
                return ResolvedDevice {
                    device,
                    is_simulated: false,
                };
            }
            Ok(Err(e)) => warn!(error = %e, "Real lamp unreachable, using simulated lamp"),
            Err(_) => warn!(
                timeout_ms = self.connect_timeout.as_millis() as u64,
                "Real lamp connection timed out, using simulated lamp"
            ),
        }
        metrics::counter!(app_metrics::DEVICE_FALLBACK_TOTAL).increment(1);
        self.fallback()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Hand-written devices and connectors for exercising failure paths.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub struct FailingConnector;

    #[async_trait]
    impl DeviceConnector for FailingConnector {
        async fn connect(&self) -> Result<Arc<dyn Device>, AppError> {
            Err(AppError::DeviceUnreachable("connection refused".into()))
        }
    }

    pub struct StaticConnector(pub Arc<dyn Device>);

    #[async_trait]
    impl DeviceConnector for StaticConnector {
        async fn connect(&self) -> Result<Arc<dyn Device>, AppError> {
            Ok(self.0.clone())
        }
    }

    /// Hands out the same device every time and never falls back.
    pub struct FixedResolver {
        pub device: Arc<dyn Device>,
        pub is_simulated: bool,
    }

    #[async_trait]
    impl DeviceResolver for FixedResolver {
        async fn resolve(&self) -> ResolvedDevice {
            ResolvedDevice {
                device: self.device.clone(),
                is_simulated: self.is_simulated,
            }
        }
    }

    /// Counts every call and delegates to a simulated lamp.
    #[derive(Default)]
    pub struct CountingDevice {
        pub inner: SimulatedLamp,
        pub calls: AtomicUsize,
    }

    impl CountingDevice {
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn hit(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Device for CountingDevice {
        async fn turn_on(&self) -> Result<(), AppError> {
            self.hit();
            self.inner.turn_on().await
        }
        async fn turn_off(&self) -> Result<(), AppError> {
            self.hit();
            self.inner.turn_off().await
        }
        async fn set_brightness(&self, level: Option<u8>) -> Result<(), AppError> {
            self.hit();
            self.inner.set_brightness(level).await
        }
        async fn set_color(&self, color: Option<&str>) -> Result<(), AppError> {
            self.hit();
            self.inner.set_color(color).await
        }
        async fn get_state(&self) -> Result<LampState, AppError> {
            self.hit();
            self.inner.get_state().await
        }
        async fn get_device_info(&self) -> Result<DeviceInfo, AppError> {
            self.hit();
            self.inner.get_device_info().await
        }
    }

    /// Sleeps before every mutation.
    pub struct SlowDevice {
        pub inner: SimulatedLamp,
        pub delay: Duration,
    }

    #[async_trait]
    impl Device for SlowDevice {
        async fn turn_on(&self) -> Result<(), AppError> {
            tokio::time::sleep(self.delay).await;
            self.inner.turn_on().await
        }
        async fn turn_off(&self) -> Result<(), AppError> {
            tokio::time::sleep(self.delay).await;
            self.inner.turn_off().await
        }
        async fn set_brightness(&self, level: Option<u8>) -> Result<(), AppError> {
            tokio::time::sleep(self.delay).await;
            self.inner.set_brightness(level).await
        }
        async fn set_color(&self, color: Option<&str>) -> Result<(), AppError> {
            tokio::time::sleep(self.delay).await;
            self.inner.set_color(color).await
        }
        async fn get_state(&self) -> Result<LampState, AppError> {
            self.inner.get_state().await
        }
        async fn get_device_info(&self) -> Result<DeviceInfo, AppError> {
            self.inner.get_device_info().await
        }
    }

    /// Accepts reads but fails every mutation.
    #[derive(Default)]
    pub struct BrokenDevice {
        pub inner: SimulatedLamp,
    }

    #[async_trait]
    impl Device for BrokenDevice {
        async fn turn_on(&self) -> Result<(), AppError> {
            Err(AppError::DeviceUnreachable("lamp went away".into()))
        }
        async fn turn_off(&self) -> Result<(), AppError> {
            Err(AppError::DeviceUnreachable("lamp went away".into()))
        }
        async fn set_brightness(&self, _level: Option<u8>) -> Result<(), AppError> {
            Err(AppError::DeviceUnreachable("lamp went away".into()))
        }
        async fn set_color(&self, _color: Option<&str>) -> Result<(), AppError> {
            Err(AppError::DeviceUnreachable("lamp went away".into()))
        }
        async fn get_state(&self) -> Result<LampState, AppError> {
            self.inner.get_state().await
        }
        async fn get_device_info(&self) -> Result<DeviceInfo, AppError> {
            self.inner.get_device_info().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn falls_back_to_simulated_when_connector_fails() {
        let simulated = Arc::new(SimulatedLamp::new());
        let resolver = FallbackResolver::new(
            Some(Arc::new(FailingConnector)),
            simulated,
            Duration::from_millis(50),
        );
        let resolved = resolver.resolve().await;
        assert!(resolved.is_simulated);
    }

    #[tokio::test]
    async fn prefers_real_device_when_reachable() {
        let real: Arc<dyn Device> = Arc::new(CountingDevice::default());
        let resolver = FallbackResolver::new(
            Some(Arc::new(StaticConnector(real))),
            Arc::new(SimulatedLamp::new()),
            Duration::from_millis(50),
        );
        assert!(!resolver.resolve().await.is_simulated);
    }

    #[tokio::test]
    async fn no_connector_means_simulated() {
        let resolver = FallbackResolver::simulated_only(Arc::new(SimulatedLamp::new()));
        assert!(resolver.resolve().await.is_simulated);
    }
}
