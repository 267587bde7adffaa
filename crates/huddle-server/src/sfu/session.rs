//! SFU Session Manager
//!
//! Owns the channel registry and drives each peer through join, offer,
//! candidate exchange and teardown.
//!
//! Lock order is registry, then channel, then peer negotiation. The membership
//! index is never held while another lock is acquired.

use super::channel::{Channel, Rejected};
use super::forwarder::{FanoutStrategy, ForwardingEngine, FullMesh};
use super::peer::{Peer, PeerEvents};
use super::transport::{LinkState, MediaTransport, RemoteTrack};
use crate::error::{Result, SignalError};
use crate::ws::Outbound;
use huddle_protocol::{ChannelId, IceCandidate, PeerId, ServerMessage, SessionDescription};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};

/// Identifiers an event handler needs to find its peer again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PeerContext {
    channel_id: ChannelId,
    peer_id: PeerId,
}

/// Global SFU session manager
pub struct SessionManager<T: MediaTransport> {
    transport: T,
    /// Channels with at least one member
    channels: RwLock<HashMap<ChannelId, Arc<Channel<T>>>>,
    /// Which channel each joined peer belongs to
    memberships: Mutex<HashMap<PeerId, ChannelId>>,
    engine: ForwardingEngine<T>,
}

impl<T: MediaTransport> SessionManager<T> {
    pub fn new(transport: T) -> Self {
        Self::with_strategy(transport, Arc::new(FullMesh))
    }

    pub fn with_strategy(transport: T, strategy: Arc<dyn FanoutStrategy<T>>) -> Self {
        Self {
            transport,
            channels: RwLock::new(HashMap::new()),
            memberships: Mutex::new(HashMap::new()),
            engine: ForwardingEngine::new(strategy),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Add a peer to a channel, creating the channel if needed.
    ///
    /// The peer gets fresh local tracks and its own connection. Events from
    /// that connection are handled by a task that lives as long as the peer.
    pub async fn join(self: &Arc<Self>, channel_id: ChannelId, peer_id: PeerId, outbound: Outbound) -> Result<()> {
        {
            let mut memberships = self.memberships.lock().await;
            if let Some(existing) = memberships.get(&peer_id) {
                return Err(SignalError::AlreadyJoined {
                    channel_id: *existing,
                    peer_id,
                });
            }
            memberships.insert(peer_id, channel_id);
        }

        let peer = match Peer::open(&self.transport, channel_id, peer_id, outbound).await {
            Ok(peer) => Arc::new(peer),
            Err(e) => {
                self.release_membership(peer_id, channel_id).await;
                return Err(e.into());
            }
        };
        let events = peer.subscribe();

        loop {
            let channel = self.get_or_create_channel(channel_id).await;
            match channel.insert(Arc::clone(&peer)).await {
                Ok(()) => break,
                Err(Rejected::Retired) => continue,
                Err(Rejected::Duplicate) => {
                    peer.close().await;
                    self.release_membership(peer_id, channel_id).await;
                    return Err(SignalError::AlreadyJoined { channel_id, peer_id });
                }
            }
        }

        let ctx = PeerContext { channel_id, peer_id };
        peer.spawn(run_peer_events(Arc::downgrade(self), Arc::clone(&peer), ctx, events));

        tracing::info!("Peer {} joined channel {}", peer_id, channel_id);
        Ok(())
    }

    /// Apply a client offer and return the answer
    pub async fn offer(
        &self,
        channel_id: ChannelId,
        peer_id: PeerId,
        offer: SessionDescription,
    ) -> Result<SessionDescription> {
        let peer = self.find_peer(channel_id, peer_id).await?;
        let answer = peer.negotiate(offer).await?;
        tracing::info!("Answered offer from peer {} in channel {}", peer_id, channel_id);
        Ok(answer)
    }

    pub async fn add_ice_candidate(&self, channel_id: ChannelId, peer_id: PeerId, candidate: IceCandidate) -> Result<()> {
        let channel = self.find_channel(channel_id).await?;
        tracing::debug!("Adding ICE candidate for peer {}: {}", peer_id, candidate.candidate);
        channel.add_ice_candidate(peer_id, candidate).await
    }

    /// Remove a peer from its channel and release its connection and tasks
    pub async fn disconnect(&self, channel_id: ChannelId, peer_id: PeerId) -> Result<()> {
        let channel = self.find_channel(channel_id).await?;
        let (peer, now_empty) = channel
            .remove(peer_id)
            .await
            .ok_or(SignalError::PeerNotFound { channel_id, peer_id })?;

        self.release_membership(peer_id, channel_id).await;
        peer.close().await;

        if now_empty {
            self.retire_channel(&channel).await;
        }

        tracing::info!("Peer {} left channel {}", peer_id, channel_id);
        Ok(())
    }

    pub async fn channel(&self, channel_id: ChannelId) -> Option<Arc<Channel<T>>> {
        self.channels.read().await.get(&channel_id).cloned()
    }

    pub async fn peer(&self, channel_id: ChannelId, peer_id: PeerId) -> Option<Arc<Peer<T>>> {
        self.find_peer(channel_id, peer_id).await.ok()
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Close every peer in every channel
    pub async fn shutdown(&self) {
        let channels: Vec<_> = self.channels.write().await.drain().map(|(_, c)| c).collect();

        let mut closed = 0;
        for channel in channels {
            for peer in channel.drain().await {
                peer.close().await;
                closed += 1;
            }
        }
        self.memberships.lock().await.clear();

        tracing::info!("Session manager shut down, closed {} peers", closed);
    }

    async fn get_or_create_channel(&self, channel_id: ChannelId) -> Arc<Channel<T>> {
        let mut channels = self.channels.write().await;

        if let Some(channel) = channels.get(&channel_id) {
            return channel.clone();
        }

        let channel = Arc::new(Channel::new(channel_id));
        channels.insert(channel_id, channel.clone());
        tracing::info!("Created channel {}", channel_id);

        channel
    }

    async fn find_channel(&self, channel_id: ChannelId) -> Result<Arc<Channel<T>>> {
        self.channel(channel_id)
            .await
            .ok_or(SignalError::ChannelNotFound(channel_id))
    }

    async fn find_peer(&self, channel_id: ChannelId, peer_id: PeerId) -> Result<Arc<Peer<T>>> {
        self.find_channel(channel_id)
            .await?
            .peer(peer_id)
            .await
            .ok_or(SignalError::PeerNotFound { channel_id, peer_id })
    }

    async fn release_membership(&self, peer_id: PeerId, channel_id: ChannelId) {
        let mut memberships = self.memberships.lock().await;
        if memberships.get(&peer_id) == Some(&channel_id) {
            memberships.remove(&peer_id);
        }
    }

    /// Drop an empty channel from the registry
    async fn retire_channel(&self, channel: &Arc<Channel<T>>) {
        let mut channels = self.channels.write().await;
        let registered = channels
            .get(&channel.id())
            .is_some_and(|current| Arc::ptr_eq(current, channel));

        if registered && channel.retire_if_empty().await {
            channels.remove(&channel.id());
            tracing::info!("Removed empty channel {}", channel.id());
        }
    }

    async fn start_forwarding(&self, ctx: PeerContext, track: Arc<T::Remote>) {
        let Some(channel) = self.channel(ctx.channel_id).await else {
            tracing::debug!("Channel {} gone, not forwarding track {}", ctx.channel_id, track.id());
            return;
        };
        // The source being a member also guarantees the channel is not empty
        let Some(source) = channel.peer(ctx.peer_id).await else {
            tracing::debug!("Peer {} left, not forwarding track {}", ctx.peer_id, track.id());
            return;
        };

        self.engine.start(&source, channel, track);
    }

    async fn on_link_state(&self, ctx: PeerContext, peer: &Peer<T>, state: LinkState) {
        match state {
            LinkState::Connected => peer.mark_connected().await,
            LinkState::Failed => {
                tracing::warn!("Connection of peer {} in channel {} failed", ctx.peer_id, ctx.channel_id);
                if let Err(e) = self.disconnect(ctx.channel_id, ctx.peer_id).await {
                    tracing::debug!("Cleanup after connection failure: {}", e);
                }
            }
            other => tracing::debug!("Peer {} connection state: {:?}", ctx.peer_id, other),
        }
    }
}

/// Per-peer event loop: relays local ICE candidates to the client, hands remote
/// tracks to the forwarding engine and follows connectivity changes.
async fn run_peer_events<T: MediaTransport>(
    manager: Weak<SessionManager<T>>,
    peer: Arc<Peer<T>>,
    ctx: PeerContext,
    mut events: PeerEvents<T>,
) {
    let done = peer.done().clone();

    loop {
        tokio::select! {
            biased;
            _ = done.cancelled() => break,
            Some(candidate) = events.candidates.recv() => {
                tracing::debug!("Sending ICE candidate to peer {}", ctx.peer_id);
                peer.outbound().send(&ServerMessage::IceCandidate { candidate });
            }
            Some(track) = events.tracks.recv() => {
                let Some(manager) = manager.upgrade() else { break };
                tracing::info!("Peer {} published {} track {}", ctx.peer_id, track.kind(), track.id());
                manager.start_forwarding(ctx, track).await;
            }
            Some(state) = events.states.recv() => {
                let Some(manager) = manager.upgrade() else { break };
                manager.on_link_state(ctx, &peer, state).await;
            }
            else => break,
        }
    }

    tracing::debug!("Event loop of peer {} stopped", ctx.peer_id);
}
