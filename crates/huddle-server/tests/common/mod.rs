//! In-memory media transport for driving the session manager without sockets

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use huddle_protocol::{ChannelId, IceCandidate, PeerId, SessionDescription};
use huddle_server::sfu::{
    LinkState, LocalTrack, MediaKind, MediaTransport, PeerLink, RemoteTrack, SessionManager, TransportError,
};
use huddle_server::ws::Outbound;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;

pub type Manager = Arc<SessionManager<FakeTransport>>;

#[derive(Default)]
pub struct FakeTransport {
    pub fail_connections: AtomicBool,
    pub connections_created: AtomicUsize,
}

#[async_trait]
impl MediaTransport for FakeTransport {
    type Local = FakeLocalTrack;
    type Remote = FakeRemoteTrack;
    type Link = FakeLink;

    async fn create_connection(&self) -> Result<Arc<FakeLink>, TransportError> {
        if self.fail_connections.load(Ordering::SeqCst) {
            return Err(TransportError::CreateConnection("simulated failure".into()));
        }
        self.connections_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeLink::default()))
    }

    fn create_local_track(&self, peer_id: PeerId, kind: MediaKind) -> Result<Arc<FakeLocalTrack>, TransportError> {
        Ok(Arc::new(FakeLocalTrack {
            id: format!("{peer_id}-{kind}"),
            kind,
            written: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
        }))
    }
}

pub struct FakeLocalTrack {
    id: String,
    kind: MediaKind,
    /// Sequence numbers of packets written
    written: Mutex<Vec<u16>>,
    pub fail_writes: AtomicBool,
}

impl FakeLocalTrack {
    pub fn written(&self) -> Vec<u16> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl LocalTrack for FakeLocalTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn write_packet(&self, packet: &Packet) -> Result<(), TransportError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Write("simulated write failure".into()));
        }
        self.written.lock().unwrap().push(packet.header.sequence_number);
        Ok(())
    }
}

pub struct FakeRemoteTrack {
    id: String,
    kind: MediaKind,
    packets: tokio::sync::Mutex<mpsc::UnboundedReceiver<Packet>>,
}

#[async_trait]
impl RemoteTrack for FakeRemoteTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn read_packet(&self) -> Result<Packet, TransportError> {
        self.packets
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| TransportError::TrackEnded(self.id.clone()))
    }
}

#[derive(Default)]
pub struct FakeLink {
    pub remote_description: Mutex<Option<SessionDescription>>,
    pub local_description: Mutex<Option<SessionDescription>>,
    pub attached_tracks: Mutex<Vec<String>>,
    pub remote_candidates: Mutex<Vec<IceCandidate>>,
    pub fail_remote_description: AtomicBool,
    /// Time `set_remote_description` takes, in milliseconds
    pub remote_description_delay_ms: AtomicU64,
    pub closed: AtomicBool,
    ice_sink: Mutex<Option<mpsc::UnboundedSender<IceCandidate>>>,
    track_sink: Mutex<Option<mpsc::UnboundedSender<Arc<FakeRemoteTrack>>>>,
    state_sink: Mutex<Option<mpsc::UnboundedSender<LinkState>>>,
}

impl FakeLink {
    /// Simulate the client publishing a track; returns the packet feed
    pub fn publish(&self, kind: MediaKind) -> mpsc::UnboundedSender<Packet> {
        let (tx, rx) = mpsc::unbounded_channel();
        let track = Arc::new(FakeRemoteTrack {
            id: format!("client-{kind}"),
            kind,
            packets: tokio::sync::Mutex::new(rx),
        });
        if let Some(sink) = self.track_sink.lock().unwrap().as_ref() {
            sink.send(track).unwrap();
        }
        tx
    }

    pub fn gather_candidate(&self, candidate: &str) {
        if let Some(sink) = self.ice_sink.lock().unwrap().as_ref() {
            sink.send(IceCandidate {
                candidate: candidate.to_string(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            })
            .unwrap();
        }
    }

    pub fn change_state(&self, state: LinkState) {
        if let Some(sink) = self.state_sink.lock().unwrap().as_ref() {
            sink.send(state).unwrap();
        }
    }

    pub fn attached(&self) -> Vec<String> {
        self.attached_tracks.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerLink for FakeLink {
    type Local = FakeLocalTrack;
    type Remote = FakeRemoteTrack;

    async fn add_local_track(&self, track: Arc<FakeLocalTrack>) -> Result<(), TransportError> {
        self.attached_tracks.lock().unwrap().push(track.id().to_string());
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), TransportError> {
        let delay = self.remote_description_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_remote_description.load(Ordering::SeqCst) {
            return Err(TransportError::RemoteDescription("simulated failure".into()));
        }
        *self.remote_description.lock().unwrap() = Some(description);
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let tracks = self.attached_tracks.lock().unwrap().join(" ");
        Ok(SessionDescription::answer(format!("v=0 tracks: {tracks}")))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), TransportError> {
        *self.local_description.lock().unwrap() = Some(description);
        Ok(())
    }

    async fn add_remote_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.remote_candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    fn on_ice_candidate(&self, sink: mpsc::UnboundedSender<IceCandidate>) {
        *self.ice_sink.lock().unwrap() = Some(sink);
    }

    fn on_remote_track(&self, sink: mpsc::UnboundedSender<Arc<FakeRemoteTrack>>) {
        *self.track_sink.lock().unwrap() = Some(sink);
    }

    fn on_state_change(&self, sink: mpsc::UnboundedSender<LinkState>) {
        *self.state_sink.lock().unwrap() = Some(sink);
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the sinks ends the peer's event streams
        self.ice_sink.lock().unwrap().take();
        self.track_sink.lock().unwrap().take();
        self.state_sink.lock().unwrap().take();
        Ok(())
    }
}

pub fn manager() -> Manager {
    Arc::new(SessionManager::new(FakeTransport::default()))
}

/// Outbound handle plus the frames queued on it
pub fn connection(peer_id: PeerId) -> (Outbound, mpsc::UnboundedReceiver<String>) {
    Outbound::channel(peer_id)
}

pub async fn join(manager: &Manager, channel: i64, peer: u64) -> mpsc::UnboundedReceiver<String> {
    let (outbound, rx) = connection(PeerId(peer));
    manager
        .join(ChannelId(channel), PeerId(peer), outbound)
        .await
        .expect("join should succeed");
    rx
}

pub fn packet(sequence_number: u16) -> Packet {
    Packet {
        header: Header {
            version: 2,
            payload_type: 111,
            sequence_number,
            ..Default::default()
        },
        payload: Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]),
    }
}

/// Poll `condition` until it holds, failing the test after two seconds
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
