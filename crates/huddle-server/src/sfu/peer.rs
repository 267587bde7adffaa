//! One participant's session within a channel

use super::transport::{LinkState, LocalTrack, MediaKind, MediaTransport, PeerLink, TransportError};
use crate::error::{Result, SignalError};
use crate::ws::Outbound;
use huddle_protocol::{ChannelId, IceCandidate, PeerId, SdpType, SessionDescription};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Negotiation state of a peer.
///
/// A peer that is not in any channel's map is unjoined; it has no `Peer` value
/// at all, so messages referencing it fail the lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// In the channel, no remote description applied yet
    Joined,
    /// Remote description set, local tracks attached, answer sent
    Negotiated,
    /// ICE connected, media flowing
    Active,
    /// Removed from its channel; resources released
    Closed,
}

impl NegotiationState {
    pub fn name(self) -> &'static str {
        match self {
            NegotiationState::Joined => "joined",
            NegotiationState::Negotiated => "negotiated",
            NegotiationState::Active => "active",
            NegotiationState::Closed => "closed",
        }
    }

    /// State after an answer has been produced for an offer
    pub fn answered(self) -> Option<Self> {
        match self {
            NegotiationState::Joined | NegotiationState::Negotiated => Some(NegotiationState::Negotiated),
            NegotiationState::Active => Some(NegotiationState::Active),
            NegotiationState::Closed => None,
        }
    }

    /// State after the connection reports ICE connectivity
    pub fn connected(self) -> Self {
        match self {
            NegotiationState::Negotiated => NegotiationState::Active,
            other => other,
        }
    }
}

struct Negotiation {
    state: NegotiationState,
    tracks_attached: bool,
}

/// Receivers for the events a peer connection emits
pub(crate) struct PeerEvents<T: MediaTransport> {
    pub candidates: mpsc::UnboundedReceiver<IceCandidate>,
    pub tracks: mpsc::UnboundedReceiver<Arc<T::Remote>>,
    pub states: mpsc::UnboundedReceiver<LinkState>,
}

pub struct Peer<T: MediaTransport> {
    id: PeerId,
    channel_id: ChannelId,
    /// Never replaced; renegotiation mutates descriptions, not identity
    link: Arc<T::Link>,
    audio: Arc<T::Local>,
    video: Arc<T::Local>,
    outbound: Outbound,
    /// Serializes offer handling, candidate addition and teardown
    negotiation: Mutex<Negotiation>,
    /// Fired when the peer leaves; stops its event loop and forwarders
    done: CancellationToken,
    tasks: TaskTracker,
}

impl<T: MediaTransport> Peer<T> {
    /// Create the peer's local tracks and peer connection
    pub(crate) async fn open(
        transport: &T,
        channel_id: ChannelId,
        peer_id: PeerId,
        outbound: Outbound,
    ) -> std::result::Result<Self, TransportError> {
        let audio = transport.create_local_track(peer_id, MediaKind::Audio)?;
        let video = transport.create_local_track(peer_id, MediaKind::Video)?;
        let link = transport.create_connection().await?;

        Ok(Self {
            id: peer_id,
            channel_id,
            link,
            audio,
            video,
            outbound,
            negotiation: Mutex::new(Negotiation {
                state: NegotiationState::Joined,
                tracks_attached: false,
            }),
            done: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn link(&self) -> &Arc<T::Link> {
        &self.link
    }

    pub fn audio_track(&self) -> &Arc<T::Local> {
        &self.audio
    }

    pub fn video_track(&self) -> &Arc<T::Local> {
        &self.video
    }

    /// Local track receiving forwarded media of the given kind
    pub fn local_track(&self, kind: MediaKind) -> &Arc<T::Local> {
        match kind {
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
        }
    }

    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    pub async fn state(&self) -> NegotiationState {
        self.negotiation.lock().await.state
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    pub(crate) fn done(&self) -> &CancellationToken {
        &self.done
    }

    /// Number of background tasks (event loop, forwarders) still running
    pub fn running_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Resolves once the peer is closed and all of its tasks have exited
    pub async fn stopped(&self) {
        self.tasks.wait().await;
    }

    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    /// Route the connection's events into channels read by the peer's event loop
    pub(crate) fn subscribe(&self) -> PeerEvents<T> {
        let (candidate_tx, candidates) = mpsc::unbounded_channel();
        let (track_tx, tracks) = mpsc::unbounded_channel();
        let (state_tx, states) = mpsc::unbounded_channel();

        self.link.on_ice_candidate(candidate_tx);
        self.link.on_remote_track(track_tx);
        self.link.on_state_change(state_tx);

        PeerEvents {
            candidates,
            tracks,
            states,
        }
    }

    /// Apply a remote description and answer it.
    ///
    /// Local tracks are attached on the first successful negotiation only. On
    /// failure the state is left as it was.
    pub async fn negotiate(&self, offer: SessionDescription) -> Result<SessionDescription> {
        let mut negotiation = self.negotiation.lock().await;
        let Some(next) = negotiation.state.answered() else {
            return Err(SignalError::InvalidState {
                peer_id: self.id,
                action: "negotiate",
                state: negotiation.state.name(),
            });
        };

        if offer.sdp_type != SdpType::Offer {
            tracing::debug!("Peer {} sent a {} description as offer", self.id, offer.sdp_type);
        }

        self.link.set_remote_description(offer).await?;

        if !negotiation.tracks_attached {
            self.link.add_local_track(Arc::clone(&self.audio)).await?;
            self.link.add_local_track(Arc::clone(&self.video)).await?;
            negotiation.tracks_attached = true;
            tracing::debug!(
                "Attached tracks {} and {} to peer {}",
                self.audio.id(),
                self.video.id(),
                self.id
            );
        }

        let answer = self.link.create_answer().await?;
        self.link.set_local_description(answer.clone()).await?;

        negotiation.state = next;
        Ok(answer)
    }

    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let negotiation = self.negotiation.lock().await;
        if negotiation.state == NegotiationState::Closed {
            return Err(SignalError::InvalidState {
                peer_id: self.id,
                action: "add ICE candidate",
                state: negotiation.state.name(),
            });
        }

        self.link.add_remote_ice_candidate(candidate).await?;
        Ok(())
    }

    pub(crate) async fn mark_connected(&self) {
        let mut negotiation = self.negotiation.lock().await;
        let next = negotiation.state.connected();
        if next != negotiation.state {
            tracing::info!("Peer {} in channel {} is now {}", self.id, self.channel_id, next.name());
            negotiation.state = next;
        }
    }

    /// Release the peer: stop its tasks and close its connection. Idempotent.
    pub(crate) async fn close(&self) {
        let mut negotiation = self.negotiation.lock().await;
        if negotiation.state == NegotiationState::Closed {
            return;
        }
        negotiation.state = NegotiationState::Closed;

        self.done.cancel();
        self.tasks.close();

        if let Err(e) = self.link.close().await {
            tracing::warn!("Error closing peer connection of {}: {}", self.id, e);
        }
    }
}
