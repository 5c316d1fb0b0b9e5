// main.rs
mod broker;
mod commands;
mod config;
mod devices;
mod dispatcher;
mod docs;
mod error;
mod handlers;
mod metrics;
mod models;
mod morse;
mod publisher;
mod utils;

use axum::{
    Router,
    routing::{get, post},
};
use broker::ConnectionManager;
use devices::{Device, DeviceConnector, FallbackResolver, HttpLampConnector, SimulatedLamp};
use dispatcher::{CommandConsumer, Dispatcher};
use handlers::*;
use models::AppState;
use morse::{MorsePlayer, MorseTiming};
use publisher::StatusPublisher;
use std::{sync::Arc, time::Duration};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

fn build_resolver(settings: &config::Settings) -> anyhow::Result<Arc<FallbackResolver>> {
    let simulated = Arc::new(SimulatedLamp::new());
    let connector = HttpLampConnector::from_settings(&settings.device)
        .map_err(|e| anyhow::anyhow!("Invalid device settings: {}", e))?
        .map(|connector| Arc::new(connector) as Arc<dyn DeviceConnector>);

    if connector.is_none() {
        info!("No lamp configured, every command runs on the simulated lamp");
    }

    Ok(Arc::new(FallbackResolver::new(
        connector,
        simulated,
        Duration::from_millis(settings.device.connect_timeout_ms),
    )))
}

async fn log_startup_device(resolver: &FallbackResolver) {
    use devices::DeviceResolver;

    let resolved = resolver.resolve().await;
    match resolved.device.get_device_info().await {
        Ok(device_info) => info!(
            device_id = %device_info.device_id,
            model = %device_info.model,
            simulated = resolved.is_simulated,
            "Lamp ready"
        ),
        Err(e) => warn!(error = %e, "Lamp info unavailable"),
    }
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/lamp/on", post(turn_on))
        .route("/api/lamp/off", post(turn_off))
        .route("/api/lamp/status", post(request_status))
        .route("/api/lamp/brightness", post(set_brightness))
        .route("/api/lamp/color", post(set_color))
        .route("/api/lamp/morse", post(send_morse))
        .route("/ws/status", get(handle_observer_ws_upgrade))
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", docs::ApiDoc::openapi()))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = config::Settings::new()
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    if settings.metrics.enabled {
        metrics::setup_metrics(settings.metrics.port)
            .map_err(|e| anyhow::anyhow!("Failed to start metrics exporter: {}", e))?;
    }

    let connections = Arc::new(
        ConnectionManager::connect(&settings.broker)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to set up broker connections: {}", e))?,
    );

    let resolver = build_resolver(&settings)?;
    log_startup_device(&resolver).await;

    let execution_timeout = Duration::from_millis(settings.dispatcher.execution_timeout_ms);
    let dispatcher = Dispatcher::new(
        resolver,
        StatusPublisher::new(&connections),
        MorsePlayer::new(MorseTiming::from(&settings.morse), execution_timeout),
        execution_timeout,
    );
    let consumer = CommandConsumer::bind(dispatcher, &connections)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind command channel: {}", e))?;
    let consumer_task = tokio::spawn(consumer.run());

    if settings.server.api_enabled {
        let app = router(Arc::new(AppState::new(connections.clone())));
        let listener = tokio::net::TcpListener::bind(&settings.server.address)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind address: {}", e))?;

        info!("Server started on {}", settings.server.address);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;
    } else {
        info!("HTTP API disabled, relaying commands only");
        shutdown_signal().await;
    }

    connections.close().await;
    consumer_task.abort();
    Ok(())
}
