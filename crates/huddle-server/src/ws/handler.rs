use super::Outbound;
use crate::error::{Result, SignalError};
use crate::sfu::{MediaTransport, SessionManager};
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use huddle_protocol::{ChannelId, ClientMessage, Envelope, ErrorEnvelope, PeerId, ServerMessage};
use std::collections::HashSet;
use std::sync::Arc;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.sessions))
}

async fn handle_socket<T: MediaTransport>(socket: WebSocket, sessions: Arc<SessionManager<T>>) {
    let (mut sender, mut receiver) = socket.split();

    // The client learns its id before anything else is read
    let connection_id = PeerId::generate();
    let hello = match serde_json::to_string(&ServerMessage::ConnectionSuccess {
        socket_id: connection_id,
    }) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("Failed to serialize connection-success: {}", e);
            return;
        }
    };
    if sender.send(Message::Text(hello.into())).await.is_err() {
        return;
    }

    tracing::info!("Signaling connection {} established", connection_id);

    let (outbound, mut rx) = Outbound::channel(connection_id);

    // Spawn task to forward messages from channel to WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let mut joined: HashSet<(ChannelId, PeerId)> = HashSet::new();

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let envelope = match Envelope::decode(&text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::warn!("Malformed frame from connection {}: {}", connection_id, e);
                        outbound.send_error(&ErrorEnvelope::malformed_frame());
                        break;
                    }
                };

                let message = match ClientMessage::from_envelope(envelope) {
                    Ok(Some(message)) => message,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!("Invalid message from connection {}: {}", connection_id, e);
                        outbound.send_error(&SignalError::from(e).to_envelope());
                        continue;
                    }
                };

                if let Err(e) = handle_client_message(&sessions, &outbound, &mut joined, message).await {
                    tracing::warn!("Signaling error on connection {}: {}", connection_id, e);
                    outbound.send_error(&e.to_envelope());
                }
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::error!("WebSocket error on connection {}: {}", connection_id, e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup on disconnect
    release_peers(&sessions, connection_id, joined).await;

    // Queued frames (such as a final error) are flushed once every sender is gone
    drop(outbound);
    if tokio::time::timeout(std::time::Duration::from_secs(1), &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }

    tracing::info!("Signaling connection {} closed", connection_id);
}

/// Dispatch one client message to the session manager, replying on `outbound`
async fn handle_client_message<T: MediaTransport>(
    sessions: &Arc<SessionManager<T>>,
    outbound: &Outbound,
    joined: &mut HashSet<(ChannelId, PeerId)>,
    message: ClientMessage,
) -> Result<()> {
    match message {
        ClientMessage::JoinChannel(peer) => {
            sessions
                .join(peer.channel_id, peer.socket_id, outbound.clone())
                .await?;
            joined.insert((peer.channel_id, peer.socket_id));
            outbound.send(&ServerMessage::JoinedChannel);
        }
        ClientMessage::Offer(payload) => {
            let answer = sessions
                .offer(payload.channel_id, payload.socket_id, payload.offer)
                .await?;
            outbound.send(&ServerMessage::Answer { answer });
        }
        ClientMessage::IceCandidate(payload) => {
            sessions
                .add_ice_candidate(payload.channel_id, payload.socket_id, payload.candidate)
                .await?;
        }
        ClientMessage::Disconnect(peer) => {
            joined.remove(&(peer.channel_id, peer.socket_id));
            sessions.disconnect(peer.channel_id, peer.socket_id).await?;
        }
    }

    Ok(())
}

/// Disconnect the peers a closed connection joined. A peer id that has since
/// been rejoined through another connection is left alone.
async fn release_peers<T: MediaTransport>(
    sessions: &SessionManager<T>,
    connection_id: PeerId,
    joined: HashSet<(ChannelId, PeerId)>,
) {
    for (channel_id, peer_id) in joined {
        let Some(peer) = sessions.peer(channel_id, peer_id).await else {
            tracing::debug!("Peer {} of connection {} already gone", peer_id, connection_id);
            continue;
        };
        if peer.outbound().connection_id() != connection_id {
            tracing::debug!("Peer {} now belongs to another connection, keeping it", peer_id);
            continue;
        }

        match sessions.disconnect(channel_id, peer_id).await {
            Ok(()) => tracing::debug!("Released peer {} of closed connection {}", peer_id, connection_id),
            Err(e) => tracing::debug!("Peer {} already gone: {}", peer_id, e),
        }
    }
}
