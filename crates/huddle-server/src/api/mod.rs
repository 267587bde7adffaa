mod ice;

use crate::state::AppState;
use crate::ws;
use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use ice::{IceServer, IceServersResponse};

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(|| async { "OK" }))
        // WebRTC configuration
        .route("/api/rtc/ice-servers", get(ice::get_ice_servers))
        // Signaling
        .route("/webrtc", get(ws::handler::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
