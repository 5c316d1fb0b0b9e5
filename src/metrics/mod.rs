// metrics/mod.rs
use crate::error::AppError;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

pub const COMMANDS_TOTAL: &str = "lamp_commands_total";
pub const DISPATCH_SECONDS: &str = "lamp_dispatch_seconds";
pub const DEVICE_FALLBACK_TOTAL: &str = "lamp_device_fallback_total";
pub const PUBLISH_DROPPED_TOTAL: &str = "lamp_publish_dropped_total";
pub const MORSE_UNITS_TOTAL: &str = "lamp_morse_units_total";

pub fn setup_metrics(port: u16) -> Result<(), AppError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to setup metrics: {e}")))?;

    metrics::describe_counter!(COMMANDS_TOTAL, "Commands handled, by kind and outcome");
    metrics::describe_histogram!(
        DISPATCH_SECONDS,
        metrics::Unit::Seconds,
        "Time from receipt to status publication"
    );
    metrics::describe_counter!(
        DEVICE_FALLBACK_TOTAL,
        "Dispatches that fell back to the simulated lamp"
    );
    metrics::describe_counter!(
        PUBLISH_DROPPED_TOTAL,
        "Status or progress messages dropped while the broker was unavailable"
    );
    metrics::describe_counter!(MORSE_UNITS_TOTAL, "Morse units played");
    Ok(())
}
