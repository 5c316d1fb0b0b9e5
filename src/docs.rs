use crate::{handlers, models};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::turn_on,
        handlers::turn_off,
        handlers::set_brightness,
        handlers::set_color,
        handlers::send_morse,
        handlers::request_status,
        handlers::health
    ),
    components(
        schemas(
            models::LampState,
            models::StatusEnvelope,
            models::CommandError,
            models::MorseStatus,
            models::MorseProgressEvent,
            models::BrightnessRequest,
            models::ColorRequest,
            models::MorseRequest,
            models::CommandAccepted
        )
    ),
    tags((name = "lamp", description = "Lamp commands, relayed through the command channel"))
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_lamp_route_is_documented() {
        let doc = ApiDoc::openapi();
        for path in [
            "/api/lamp/on",
            "/api/lamp/off",
            "/api/lamp/brightness",
            "/api/lamp/color",
            "/api/lamp/morse",
            "/api/lamp/status",
            "/health",
        ] {
            assert!(doc.paths.paths.contains_key(path), "{path} missing");
        }
    }
}
