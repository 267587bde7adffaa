//! Media forwarding
//!
//! One forwarder runs per inbound track. It reads packets from the source and
//! hands each one, together with a snapshot of the channel's members, to the
//! fan-out strategy. Packets are never modified.

use super::channel::Channel;
use super::peer::Peer;
use super::transport::{LocalTrack, MediaKind, MediaTransport, RemoteTrack};
use async_trait::async_trait;
use huddle_protocol::PeerId;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use webrtc::rtp::packet::Packet;

/// Outcome of fanning one packet out
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Decides which members receive a packet from a source peer
#[async_trait]
pub trait FanoutStrategy<T: MediaTransport>: Send + Sync + 'static {
    async fn fan_out(&self, source: PeerId, kind: MediaKind, packet: &Packet, members: &[Arc<Peer<T>>]) -> FanoutReport;
}

/// Every packet goes to every other member's track of the same kind.
///
/// Cost is one write per member per packet, so a channel's total work grows
/// with the square of its size.
#[derive(Debug, Default, Clone, Copy)]
pub struct FullMesh;

#[async_trait]
impl<T: MediaTransport> FanoutStrategy<T> for FullMesh {
    async fn fan_out(&self, source: PeerId, kind: MediaKind, packet: &Packet, members: &[Arc<Peer<T>>]) -> FanoutReport {
        let mut report = FanoutReport::default();

        for member in members {
            if member.id() == source || member.is_closed() {
                continue;
            }

            let track = member.local_track(kind);
            match track.write_packet(packet).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    // One stalled destination must not stop the rest
                    report.failed += 1;
                    tracing::warn!("Failed to forward {} from {} to {}: {}", kind, source, member.id(), e);
                }
            }
        }

        report
    }
}

/// Starts forwarders on behalf of the session manager
pub struct ForwardingEngine<T: MediaTransport> {
    strategy: Arc<dyn FanoutStrategy<T>>,
}

impl<T: MediaTransport> ForwardingEngine<T> {
    pub fn new(strategy: Arc<dyn FanoutStrategy<T>>) -> Self {
        Self { strategy }
    }

    /// Spawn a forwarder for `track` tracked by its source peer, so the peer's
    /// done-signal stops it.
    pub fn start(&self, source: &Peer<T>, channel: Arc<Channel<T>>, track: Arc<T::Remote>) {
        let forwarder = Forwarder {
            source: source.id(),
            track,
            channel,
            strategy: Arc::clone(&self.strategy),
        };
        let done = source.done().clone();
        source.spawn(forwarder.run(done));
    }
}

struct Forwarder<T: MediaTransport> {
    source: PeerId,
    track: Arc<T::Remote>,
    channel: Arc<Channel<T>>,
    strategy: Arc<dyn FanoutStrategy<T>>,
}

impl<T: MediaTransport> Forwarder<T> {
    async fn run(self, done: CancellationToken) {
        let kind = self.track.kind();
        let track_id = self.track.id();
        tracing::info!(
            "Starting {} forwarding for track {} from peer {} in channel {}",
            kind,
            track_id,
            self.source,
            self.channel.id()
        );

        let mut packets = 0u64;
        let mut failures = 0u64;

        loop {
            let packet = tokio::select! {
                biased;
                _ = done.cancelled() => {
                    tracing::debug!("Forwarder for track {} cancelled", track_id);
                    break;
                }
                result = self.track.read_packet() => match result {
                    Ok(packet) => packet,
                    Err(e) => {
                        tracing::info!("Source track {} from peer {} ended: {}", track_id, self.source, e);
                        break;
                    }
                },
            };

            packets += 1;
            let members = self.channel.snapshot();
            let report = self.strategy.fan_out(self.source, kind, &packet, &members).await;
            failures += report.failed as u64;

            if packets == 1 || packets % 1000 == 0 {
                tracing::debug!(
                    "Track {}: forwarded packet {} ({} bytes) to {} peers",
                    track_id,
                    packets,
                    packet.payload.len(),
                    report.delivered
                );
            }
        }

        tracing::info!(
            "Stopped forwarding track {} from peer {} after {} packets ({} failed writes)",
            track_id,
            self.source,
            packets,
            failures
        );
    }
}
