//! A channel groups the peers whose media is forwarded to each other.

use super::peer::Peer;
use super::transport::MediaTransport;
use crate::error::{Result, SignalError};
use huddle_protocol::{ChannelId, IceCandidate, PeerId};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;

/// Members of a channel as seen by forwarders at one instant
pub type Snapshot<T> = Arc<[Arc<Peer<T>>]>;

/// Why a peer could not be added to a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rejected {
    /// A peer with the same id is already a member
    Duplicate,
    /// The channel emptied and was removed from the registry
    Retired,
}

struct Members<T: MediaTransport> {
    peers: HashMap<PeerId, Arc<Peer<T>>>,
    retired: bool,
}

pub struct Channel<T: MediaTransport> {
    id: ChannelId,
    members: Mutex<Members<T>>,
    /// Fan-out view of `members`, replaced on every change. Never held across
    /// an await, so forwarders do not wait on joins, leaves or negotiation.
    published: RwLock<Snapshot<T>>,
}

impl<T: MediaTransport> Channel<T> {
    pub fn new(id: ChannelId) -> Self {
        Self {
            id,
            members: Mutex::new(Members {
                peers: HashMap::new(),
                retired: false,
            }),
            published: RwLock::new(Arc::from(Vec::new())),
        }
    }

    /// Publish the current member set; called with the members lock held
    fn publish(&self, members: &Members<T>) {
        let snapshot: Snapshot<T> = members.peers.values().cloned().collect::<Vec<_>>().into();
        *self.published.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub(crate) async fn insert(&self, peer: Arc<Peer<T>>) -> std::result::Result<(), Rejected> {
        let mut members = self.members.lock().await;
        if members.retired {
            return Err(Rejected::Retired);
        }
        if members.peers.contains_key(&peer.id()) {
            return Err(Rejected::Duplicate);
        }

        members.peers.insert(peer.id(), peer);
        self.publish(&members);
        Ok(())
    }

    /// Remove a peer, returning it and whether the channel is now empty
    pub(crate) async fn remove(&self, peer_id: PeerId) -> Option<(Arc<Peer<T>>, bool)> {
        let mut members = self.members.lock().await;
        let peer = members.peers.remove(&peer_id)?;
        self.publish(&members);
        Some((peer, members.peers.is_empty()))
    }

    /// Mark the channel retired if it has no members. Retired channels refuse
    /// new peers so a concurrent join re-resolves the channel from the registry.
    pub(crate) async fn retire_if_empty(&self) -> bool {
        let mut members = self.members.lock().await;
        if members.peers.is_empty() {
            members.retired = true;
        }
        members.retired
    }

    /// Retire the channel and hand back every member
    pub(crate) async fn drain(&self) -> Vec<Arc<Peer<T>>> {
        let mut members = self.members.lock().await;
        members.retired = true;
        let drained = members.peers.drain().map(|(_, peer)| peer).collect();
        self.publish(&members);
        drained
    }

    pub async fn peer(&self, peer_id: PeerId) -> Option<Arc<Peer<T>>> {
        self.members.lock().await.peers.get(&peer_id).cloned()
    }

    /// Add a remote candidate to a member.
    ///
    /// Membership is resolved under the channel lock; the candidate itself is
    /// applied after releasing it, serialized by the peer's negotiation lock.
    /// A peer removed in between is closed and rejects the candidate.
    pub(crate) async fn add_ice_candidate(&self, peer_id: PeerId, candidate: IceCandidate) -> Result<()> {
        let peer = self.peer(peer_id).await.ok_or(SignalError::PeerNotFound {
            channel_id: self.id,
            peer_id,
        })?;
        peer.add_remote_candidate(candidate).await
    }

    /// Current member list, as of the last join or leave
    pub fn snapshot(&self) -> Snapshot<T> {
        Arc::clone(&self.published.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub async fn peer_ids(&self) -> Vec<PeerId> {
        self.members.lock().await.peers.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.members.lock().await.peers.len()
    }
}
