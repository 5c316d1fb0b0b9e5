// error.rs
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Malformed command: {0}")]
    MalformedCommand(String),
    #[error("Unsupported command: {0}")]
    UnsupportedCommand(String),
    #[error("Device unreachable: {0}")]
    DeviceUnreachable(String),
    #[error("Timed out after {}ms waiting for the device", .0.as_millis())]
    ExecutionTimeout(Duration),
    #[error("Broker transport failure: {0}")]
    Transport(String),
    #[error("Invalid HEX color: {0}")]
    InvalidColor(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AppError::Validation(errors.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::Validation(_)
            | AppError::MalformedCommand(_)
            | AppError::InvalidColor(_) => StatusCode::BAD_REQUEST,
            AppError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({ "success": false, "error": self.to_string() }));
        (status, body).into_response()
    }
}
