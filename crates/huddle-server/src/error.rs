use crate::sfu::TransportError;
use axum::http::StatusCode;
use huddle_protocol::{ChannelId, ErrorEnvelope, PeerId, ProtocolError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignalError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Channel {0} not found")]
    ChannelNotFound(ChannelId),

    #[error("Peer {peer_id} not found in channel {channel_id}")]
    PeerNotFound { channel_id: ChannelId, peer_id: PeerId },

    #[error("Peer {peer_id} already joined channel {channel_id}")]
    AlreadyJoined { channel_id: ChannelId, peer_id: PeerId },

    #[error("Peer {peer_id} cannot {action} while {state}")]
    InvalidState {
        peer_id: PeerId,
        action: &'static str,
        state: &'static str,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SignalError {
    pub fn status(&self) -> StatusCode {
        match self {
            SignalError::Protocol(_) => StatusCode::BAD_REQUEST,
            SignalError::ChannelNotFound(_) | SignalError::PeerNotFound { .. } => StatusCode::NOT_FOUND,
            SignalError::AlreadyJoined { .. } | SignalError::InvalidState { .. } => StatusCode::CONFLICT,
            SignalError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error frame sent back on the signaling connection
    pub fn to_envelope(&self) -> ErrorEnvelope {
        let status_text = match self {
            SignalError::Transport(e) => {
                tracing::error!("Media transport error: {}", e);
                "Media transport operation failed".to_string()
            }
            other => other.to_string(),
        };

        ErrorEnvelope::new(self.status().as_u16(), status_text)
    }
}

pub type Result<T> = std::result::Result<T, SignalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_errors_map_to_not_found() {
        let err = SignalError::PeerNotFound {
            channel_id: ChannelId(7),
            peer_id: PeerId(100),
        };
        let envelope = err.to_envelope();
        assert_eq!(envelope.status, 404);
        assert_eq!(envelope.status_text, "Peer 100 not found in channel 7");
    }

    #[test]
    fn test_transport_detail_is_not_leaked() {
        let err = SignalError::from(TransportError::RemoteDescription("sdp parse error at line 3".into()));
        let envelope = err.to_envelope();
        assert_eq!(envelope.status, 500);
        assert!(!envelope.status_text.contains("line 3"));
    }

    #[test]
    fn test_protocol_errors_are_bad_requests() {
        let err = SignalError::from(ProtocolError::InvalidSdpType("bogus".into()));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
