// utils.rs
use super::models::AppState;
use tracing::info;
use uuid::Uuid;

pub async fn cleanup_observer_connection(observer_id: Uuid, state: &AppState) {
    if let Some((_, connected_at)) = state.observers.remove(&observer_id) {
        let seconds = (chrono::Utc::now() - connected_at).num_seconds();
        info!(%observer_id, seconds, "Observer disconnected");
    }
}
