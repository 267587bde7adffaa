//! Media forwarding over the in-memory transport
//!
//! Run with: cargo test -p huddle-server --test forwarding_tests

mod common;

use async_trait::async_trait;
use common::{join, packet, wait_until, FakeTransport, Manager};
use huddle_protocol::{ChannelId, IceCandidate, PeerId, SessionDescription};
use huddle_server::sfu::{FanoutReport, FanoutStrategy, FullMesh, MediaKind, Peer, SessionManager};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use webrtc::rtp::packet::Packet;

const CHANNEL: ChannelId = ChannelId(7);

async fn peer(manager: &Manager, id: u64) -> Arc<Peer<FakeTransport>> {
    manager.peer(CHANNEL, PeerId(id)).await.expect("peer joined")
}

async fn wait_for_writes(peer: &Arc<Peer<FakeTransport>>, kind: MediaKind, count: usize) {
    let peer = Arc::clone(peer);
    wait_until(move || {
        let peer = Arc::clone(&peer);
        async move { peer.local_track(kind).written().len() >= count }
    })
    .await;
}

#[tokio::test]
async fn test_packet_reaches_every_other_peer_but_not_its_source() {
    let manager = common::manager();
    for id in [1, 2, 3] {
        join(&manager, 7, id).await;
    }
    let (a, b, c) = (peer(&manager, 1).await, peer(&manager, 2).await, peer(&manager, 3).await);

    let feed = a.link().publish(MediaKind::Audio);
    feed.send(packet(1)).unwrap();
    feed.send(packet(2)).unwrap();

    wait_for_writes(&b, MediaKind::Audio, 2).await;
    wait_for_writes(&c, MediaKind::Audio, 2).await;

    assert_eq!(b.audio_track().written(), vec![1, 2]);
    assert_eq!(c.audio_track().written(), vec![1, 2]);
    assert!(a.audio_track().written().is_empty());
    assert!(b.video_track().written().is_empty());
}

#[tokio::test]
async fn test_video_is_forwarded_to_video_tracks() {
    let manager = common::manager();
    join(&manager, 7, 1).await;
    join(&manager, 7, 2).await;
    let (a, b) = (peer(&manager, 1).await, peer(&manager, 2).await);

    let feed = b.link().publish(MediaKind::Video);
    feed.send(packet(40)).unwrap();

    wait_for_writes(&a, MediaKind::Video, 1).await;
    assert_eq!(a.video_track().written(), vec![40]);
    assert!(a.audio_track().written().is_empty());
}

#[tokio::test]
async fn test_failed_destination_does_not_stop_the_others() {
    let manager = common::manager();
    for id in [1, 2, 3] {
        join(&manager, 7, id).await;
    }
    let (a, b, c) = (peer(&manager, 1).await, peer(&manager, 2).await, peer(&manager, 3).await);
    b.audio_track().fail_writes.store(true, Ordering::SeqCst);

    let feed = a.link().publish(MediaKind::Audio);
    for seq in 1..=3 {
        feed.send(packet(seq)).unwrap();
    }

    wait_for_writes(&c, MediaKind::Audio, 3).await;
    assert_eq!(c.audio_track().written(), vec![1, 2, 3]);
    assert!(b.audio_track().written().is_empty());

    // The reader loop survived the failures
    b.audio_track().fail_writes.store(false, Ordering::SeqCst);
    feed.send(packet(4)).unwrap();
    wait_for_writes(&b, MediaKind::Audio, 1).await;
    assert_eq!(b.audio_track().written(), vec![4]);
}

#[tokio::test]
async fn test_late_joiner_receives_existing_streams() {
    let manager = common::manager();
    join(&manager, 7, 1).await;
    let a = peer(&manager, 1).await;
    let feed = a.link().publish(MediaKind::Audio);

    join(&manager, 7, 2).await;
    let b = peer(&manager, 2).await;
    feed.send(packet(9)).unwrap();

    wait_for_writes(&b, MediaKind::Audio, 1).await;
    assert_eq!(b.audio_track().written(), vec![9]);
}

#[tokio::test]
async fn test_departed_peer_is_dropped_from_fan_out() {
    let manager = common::manager();
    for id in [1, 2, 3] {
        join(&manager, 7, id).await;
    }
    let (a, b, c) = (peer(&manager, 1).await, peer(&manager, 2).await, peer(&manager, 3).await);

    let feed = a.link().publish(MediaKind::Audio);
    feed.send(packet(1)).unwrap();
    wait_for_writes(&b, MediaKind::Audio, 1).await;
    wait_for_writes(&c, MediaKind::Audio, 1).await;

    manager.disconnect(CHANNEL, PeerId(2)).await.unwrap();
    feed.send(packet(2)).unwrap();

    wait_for_writes(&c, MediaKind::Audio, 2).await;
    assert_eq!(b.audio_track().written(), vec![1]);
}

#[tokio::test]
async fn test_disconnect_stops_forwarders_promptly() {
    let manager = common::manager();
    join(&manager, 7, 1).await;
    join(&manager, 7, 2).await;
    let (a, b) = (peer(&manager, 1).await, peer(&manager, 2).await);

    // Keep the feeds open so the reads would block forever without cancellation
    let _audio = a.link().publish(MediaKind::Audio);
    let video = a.link().publish(MediaKind::Video);
    video.send(packet(1)).unwrap();
    wait_for_writes(&b, MediaKind::Video, 1).await;

    manager.disconnect(CHANNEL, PeerId(1)).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), a.stopped())
        .await
        .expect("forwarders should stop on disconnect");
    assert_eq!(a.running_tasks(), 0);
}

struct CountingStrategy {
    packets: AtomicUsize,
}

#[async_trait]
impl FanoutStrategy<FakeTransport> for CountingStrategy {
    async fn fan_out(
        &self,
        source: PeerId,
        kind: MediaKind,
        packet: &Packet,
        members: &[Arc<Peer<FakeTransport>>],
    ) -> FanoutReport {
        self.packets.fetch_add(1, Ordering::SeqCst);
        FullMesh.fan_out(source, kind, packet, members).await
    }
}

#[tokio::test]
async fn test_fan_out_strategy_is_pluggable() {
    let strategy = Arc::new(CountingStrategy {
        packets: AtomicUsize::new(0),
    });
    let manager: Manager = Arc::new(SessionManager::with_strategy(
        FakeTransport::default(),
        Arc::clone(&strategy) as Arc<dyn FanoutStrategy<FakeTransport>>,
    ));
    join(&manager, 7, 1).await;
    join(&manager, 7, 2).await;
    let (a, b) = (peer(&manager, 1).await, peer(&manager, 2).await);

    let feed = a.link().publish(MediaKind::Audio);
    feed.send(packet(5)).unwrap();

    wait_for_writes(&b, MediaKind::Audio, 1).await;
    assert_eq!(strategy.packets.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_slow_negotiation_does_not_stall_channel_media() {
    let manager = common::manager();
    for id in [1, 2, 3] {
        join(&manager, 7, id).await;
    }
    let (a, b, c) = (peer(&manager, 1).await, peer(&manager, 2).await, peer(&manager, 3).await);
    c.link().remote_description_delay_ms.store(3000, Ordering::SeqCst);

    let negotiating = Arc::clone(&manager);
    let offer = tokio::spawn(async move {
        negotiating
            .offer(CHANNEL, PeerId(3), SessionDescription::offer("v=0 slow offer"))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A trickled candidate queues behind the offer on C's negotiation lock
    let trickling = Arc::clone(&manager);
    let candidate = tokio::spawn(async move {
        trickling
            .add_ice_candidate(
                CHANNEL,
                PeerId(3),
                IceCandidate {
                    candidate: "candidate:1 1 udp 2130706431 192.0.2.3 5000 typ host".into(),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                    username_fragment: None,
                },
            )
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let feed = a.link().publish(MediaKind::Audio);
    feed.send(packet(1)).unwrap();

    let started = tokio::time::Instant::now();
    while b.audio_track().written().is_empty() {
        assert!(
            started.elapsed() < Duration::from_millis(1000),
            "forwarding from A to B waited on C's negotiation"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Membership changes are not blocked either
    tokio::time::timeout(Duration::from_millis(1000), join(&manager, 7, 4))
        .await
        .expect("join waited on C's negotiation");

    offer.await.unwrap().unwrap();
    candidate.await.unwrap().unwrap();
    assert_eq!(c.link().remote_candidates.lock().unwrap().len(), 1);
}
