//! Peer connection adapter
//!
//! Thin seam over the media-transport library. The session manager only talks
//! to these traits, so ICE, DTLS/SRTP and RTP parsing stay inside the library
//! and tests can drive the SFU with an in-memory transport.

use async_trait::async_trait;
use huddle_protocol::{IceCandidate, PeerId, SessionDescription};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::rtp::packet::Packet;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to create peer connection: {0}")]
    CreateConnection(String),

    #[error("Failed to create local track: {0}")]
    CreateTrack(String),

    #[error("Failed to add local track: {0}")]
    AddTrack(String),

    #[error("Failed to set remote description: {0}")]
    RemoteDescription(String),

    #[error("Failed to create answer: {0}")]
    CreateAnswer(String),

    #[error("Failed to set local description: {0}")]
    LocalDescription(String),

    #[error("Failed to add ICE candidate: {0}")]
    AddIceCandidate(String),

    #[error("Failed to write packet: {0}")]
    Write(String),

    #[error("Track ended: {0}")]
    TrackEnded(String),

    #[error("Failed to close peer connection: {0}")]
    Close(String),
}

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Connectivity state reported by a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Outbound track owned by the server. Written concurrently by one forwarder
/// per remote source, so implementations must accept concurrent writers.
#[async_trait]
pub trait LocalTrack: Send + Sync + 'static {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    async fn write_packet(&self, packet: &Packet) -> Result<(), TransportError>;
}

/// Inbound track received on a peer connection
#[async_trait]
pub trait RemoteTrack: Send + Sync + 'static {
    fn id(&self) -> String;

    fn kind(&self) -> MediaKind;

    /// Wait for the next packet. An error means the track has ended.
    async fn read_packet(&self) -> Result<Packet, TransportError>;
}

/// One peer connection.
///
/// Each call is individually thread-safe; sequences of calls are not atomic,
/// callers serialize negotiation themselves. Event subscriptions take a channel
/// sender; registering again replaces the previous subscriber.
#[async_trait]
pub trait PeerLink: Send + Sync + 'static {
    type Local: LocalTrack;
    type Remote: RemoteTrack;

    async fn add_local_track(&self, track: Arc<Self::Local>) -> Result<(), TransportError>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), TransportError>;

    async fn add_remote_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    fn on_ice_candidate(&self, sink: mpsc::UnboundedSender<IceCandidate>);

    fn on_remote_track(&self, sink: mpsc::UnboundedSender<Arc<Self::Remote>>);

    fn on_state_change(&self, sink: mpsc::UnboundedSender<LinkState>);

    /// Close the connection. Closing twice is not an error.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Factory for peer connections and local tracks
#[async_trait]
pub trait MediaTransport: Send + Sync + 'static {
    type Local: LocalTrack;
    type Remote: RemoteTrack;
    type Link: PeerLink<Local = Self::Local, Remote = Self::Remote>;

    async fn create_connection(&self) -> Result<Arc<Self::Link>, TransportError>;

    fn create_local_track(&self, peer_id: PeerId, kind: MediaKind) -> Result<Arc<Self::Local>, TransportError>;
}
