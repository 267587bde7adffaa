use crate::state::AppState;
use axum::{extract::State, Json};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IceServersResponse {
    pub ice_servers: Vec<IceServer>,
}

/// ICE servers clients should configure, matching the server's own
pub async fn get_ice_servers(State(state): State<AppState>) -> Json<IceServersResponse> {
    let stun = state.config.stun_servers.iter().map(|url| IceServer {
        urls: vec![url.clone()],
        username: None,
        credential: None,
    });

    let turn = state.config.turn_servers.iter().map(|turn| IceServer {
        urls: vec![turn.url.clone()],
        username: Some(turn.username.clone()),
        credential: Some(turn.credential.clone()),
    });

    Json(IceServersResponse {
        ice_servers: stun.chain(turn).collect(),
    })
}
