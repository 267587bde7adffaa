use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::{ChannelId, IceCandidate, PeerId, SessionDescription};

/// Raw frame exchanged over the signaling socket: `{"type": .., "data": {..}}`
///
/// A frame that does not decode into this shape is unrecoverable for the
/// connection. A frame that does, but whose `data` does not match its `type`,
/// is a recoverable protocol error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, deserialize_with = "object_or_null")]
    pub data: Map<String, Value>,
}

fn object_or_null<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Envelope {
    pub fn decode(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid request, SDP type is invalid: {0}")]
    InvalidSdpType(String),

    #[error("Invalid {kind} payload: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },
}

/// Payload of `joinChannel` and `disconnect`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRef {
    pub channel_id: ChannelId,
    pub socket_id: PeerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    pub channel_id: ChannelId,
    pub socket_id: PeerId,
    pub offer: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub channel_id: ChannelId,
    pub socket_id: PeerId,
    pub candidate: IceCandidate,
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Join a channel, creating it if needed
    JoinChannel(PeerRef),

    /// SDP offer to negotiate (or renegotiate) the peer session
    Offer(OfferPayload),

    /// Remote ICE candidate trickled by the client
    IceCandidate(CandidatePayload),

    /// Leave the channel
    Disconnect(PeerRef),
}

impl ClientMessage {
    pub const JOIN_CHANNEL: &'static str = "joinChannel";
    pub const OFFER: &'static str = "offer";
    pub const ICE_CANDIDATE: &'static str = "ice-candidate";
    pub const DISCONNECT: &'static str = "disconnect";

    /// Interpret an envelope.
    ///
    /// Returns `Ok(None)` for types this protocol version does not know, so that
    /// newer clients can talk to older servers.
    pub fn from_envelope(envelope: Envelope) -> Result<Option<Self>, ProtocolError> {
        let Envelope { kind, data } = envelope;
        let message = match kind.as_str() {
            Self::JOIN_CHANNEL => Self::JoinChannel(payload(Self::JOIN_CHANNEL, data)?),
            Self::OFFER => {
                check_sdp_type(&data)?;
                Self::Offer(payload(Self::OFFER, data)?)
            }
            Self::ICE_CANDIDATE => Self::IceCandidate(payload(Self::ICE_CANDIDATE, data)?),
            Self::DISCONNECT => Self::Disconnect(payload(Self::DISCONNECT, data)?),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

fn payload<T: DeserializeOwned>(kind: &'static str, data: Map<String, Value>) -> Result<T, ProtocolError> {
    serde_json::from_value(Value::Object(data)).map_err(|e| ProtocolError::InvalidPayload {
        kind,
        reason: e.to_string(),
    })
}

fn check_sdp_type(data: &Map<String, Value>) -> Result<(), ProtocolError> {
    let Some(sdp_type) = data
        .get("offer")
        .and_then(|offer| offer.get("type"))
        .and_then(Value::as_str)
    else {
        return Ok(());
    };

    match sdp_type {
        "offer" | "answer" | "pranswer" | "rollback" => Ok(()),
        other => Err(ProtocolError::InvalidSdpType(other.to_string())),
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    /// First frame on every connection, carrying the id the client must use
    #[serde(rename = "connection-success")]
    ConnectionSuccess {
        #[serde(rename = "socketId")]
        socket_id: PeerId,
    },

    /// The peer is now a member of the channel
    #[serde(rename = "joinedChannel")]
    JoinedChannel,

    /// Local description answering the client's offer
    #[serde(rename = "answer")]
    Answer { answer: SessionDescription },

    /// Local ICE candidate gathered by the server-side connection
    #[serde(rename = "ice-candidate")]
    IceCandidate { candidate: IceCandidate },
}

/// Error frame: `{"status": 404, "statusText": ".."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub status: u16,
    pub status_text: String,
}

impl ErrorEnvelope {
    pub fn new(status: u16, status_text: impl Into<String>) -> Self {
        Self {
            status,
            status_text: status_text.into(),
        }
    }

    /// Reply to a frame that is not a `{type, data}` object at all
    pub fn malformed_frame() -> Self {
        Self::new(400, "Invalid request, make sure data is an object")
    }
}
