// handlers.rs

use crate::{
    broker::{DeliveryMode, Subscription, Transport},
    error::AppError,
    models::{
        AppState, BrightnessRequest, ColorRequest, Command, CommandAccepted, MorseProgressEvent,
        MorseRequest, ObserverMessage, StatusEnvelope,
    },
    utils,
};
use axum::{
    Json,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;
use validator::Validate;

type ApiResult = Result<Json<CommandAccepted>, AppError>;

async fn send_command(state: &AppState, command: Command, message: String) -> ApiResult {
    let payload = serde_json::to_vec(&command.to_message()).map_err(|e| AppError::Internal(e.into()))?;
    state
        .connections
        .command_transport()
        .publish(
            &state.connections.bindings().command,
            payload,
            DeliveryMode::Reliable,
        )
        .await?;
    info!(command = %command.kind(), "Command sent");
    Ok(Json(CommandAccepted {
        success: true,
        message,
    }))
}

#[utoipa::path(
    post,
    path = "/api/lamp/on",
    responses(
        (status = 200, description = "Command published", body = CommandAccepted),
        (status = 503, description = "Broker unavailable")
    ),
    tag = "lamp"
)]
pub async fn turn_on(State(state): State<Arc<AppState>>) -> ApiResult {
    send_command(&state, Command::On, "Lamp turned on".into()).await
}

#[utoipa::path(
    post,
    path = "/api/lamp/off",
    responses(
        (status = 200, description = "Command published", body = CommandAccepted),
        (status = 503, description = "Broker unavailable")
    ),
    tag = "lamp"
)]
pub async fn turn_off(State(state): State<Arc<AppState>>) -> ApiResult {
    send_command(&state, Command::Off, "Lamp turned off".into()).await
}

#[utoipa::path(
    post,
    path = "/api/lamp/brightness",
    request_body = BrightnessRequest,
    responses(
        (status = 200, description = "Command published", body = CommandAccepted),
        (status = 400, description = "Brightness must be between 0 and 100"),
        (status = 503, description = "Broker unavailable")
    ),
    tag = "lamp"
)]
pub async fn set_brightness(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BrightnessRequest>,
) -> ApiResult {
    request.validate()?;
    let message = format!("Brightness set to {}%", request.value);
    send_command(&state, Command::Brightness(request.value), message).await
}

#[utoipa::path(
    post,
    path = "/api/lamp/color",
    request_body = ColorRequest,
    responses(
        (status = 200, description = "Command published", body = CommandAccepted),
        (status = 400, description = "Color must be a hex color such as #FF0000"),
        (status = 503, description = "Broker unavailable")
    ),
    tag = "lamp"
)]
pub async fn set_color(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ColorRequest>,
) -> ApiResult {
    request.validate()?;
    let message = format!("Color set to {}", request.value);
    send_command(&state, Command::Color(request.value), message).await
}

#[utoipa::path(
    post,
    path = "/api/lamp/morse",
    request_body = MorseRequest,
    responses(
        (status = 200, description = "Command published", body = CommandAccepted),
        (status = 400, description = "Message must not be empty"),
        (status = 503, description = "Broker unavailable")
    ),
    tag = "lamp"
)]
pub async fn send_morse(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MorseRequest>,
) -> ApiResult {
    request.validate()?;
    send_command(&state, Command::Morse(request.value), "Morse message sent".into()).await
}

#[utoipa::path(
    post,
    path = "/api/lamp/status",
    responses(
        (status = 200, description = "Status requested; the answer arrives on /ws/status", body = CommandAccepted),
        (status = 503, description = "Broker unavailable")
    ),
    tag = "lamp"
)]
pub async fn request_status(State(state): State<Arc<AppState>>) -> ApiResult {
    send_command(&state, Command::GetStatus, "Status requested".into()).await
}

#[utoipa::path(get, path = "/health", responses((status = 200, description = "Service is up")))]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "broker_connected": state.connections.is_connected(),
        "observers": state.observers.len(),
    }))
}

pub async fn handle_observer_ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("Observer connection attempt");
    ws.on_upgrade(|socket| handle_observer(socket, state))
}

fn decode<T: DeserializeOwned>(channel: &str, payload: &[u8]) -> Option<T> {
    serde_json::from_slice(payload)
        .map_err(|e| warn!(channel, error = %e, "Skipping undecodable broadcast"))
        .ok()
}

async fn subscribe_observer(state: &AppState) -> Result<(Subscription, Subscription), AppError> {
    let transport = state.connections.status_transport();
    let bindings = state.connections.bindings();
    let status = transport.subscribe(&bindings.status).await?;
    let morse = transport.subscribe(&bindings.morse).await?;
    Ok((status, morse))
}

async fn handle_observer(socket: WebSocket, state: Arc<AppState>) {
    let (mut status_sub, mut morse_sub) = match subscribe_observer(&state).await {
        Ok(subscriptions) => subscriptions,
        Err(e) => {
            error!(error = %e, "Cannot subscribe observer");
            return;
        }
    };

    let observer_id = Uuid::new_v4();
    state.observers.insert(observer_id, Utc::now());
    info!(%observer_id, "Observer connected");

    let (mut sender, mut receiver) = socket.split();
    let status_channel = status_sub.channel().to_string();
    let morse_channel = morse_sub.channel().to_string();

    let send_task = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                Some(delivery) = status_sub.next() => {
                    let frame = decode::<StatusEnvelope>(&status_channel, &delivery.payload)
                        .map(ObserverMessage::Status);
                    let _ = delivery.ack().await;
                    frame
                }
                Some(delivery) = morse_sub.next() => {
                    let frame = decode::<MorseProgressEvent>(&morse_channel, &delivery.payload)
                        .map(ObserverMessage::MorseProgress);
                    let _ = delivery.ack().await;
                    frame
                }
                else => break,
            };
            let Some(frame) = frame else { continue };

            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Cannot encode observer frame");
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    tokio::pin!(send_task, recv_task);
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    };

    utils::cleanup_observer_connection(observer_id, &state).await;
}
