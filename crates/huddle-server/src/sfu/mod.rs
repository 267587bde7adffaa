//! SFU (Selective Forwarding Unit) for channel voice and video
//!
//! Each client sends its audio and video to the SFU, which forwards every RTP
//! packet unmodified to all other participants of the same channel.

mod channel;
mod forwarder;
mod peer;
mod rtc;
mod session;
mod transport;

pub use channel::{Channel, Snapshot};
pub use forwarder::{FanoutReport, FanoutStrategy, ForwardingEngine, FullMesh};
pub use peer::{NegotiationState, Peer};
pub use rtc::{WebRtcLink, WebRtcLocalTrack, WebRtcRemoteTrack, WebRtcTransport};
pub use session::SessionManager;
pub use transport::{LinkState, LocalTrack, MediaKind, MediaTransport, PeerLink, RemoteTrack, TransportError};
