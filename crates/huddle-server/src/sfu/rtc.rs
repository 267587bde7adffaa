//! webrtc-rs implementation of the peer connection adapter

use super::transport::{
    LinkState, LocalTrack, MediaKind, MediaTransport, PeerLink, RemoteTrack, TransportError,
};
use crate::state::Config;
use anyhow::Result;
use async_trait::async_trait;
use huddle_protocol::{IceCandidate, PeerId, SdpType, SessionDescription};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::api::API;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

const OPUS_PAYLOAD_TYPE: u8 = 111;
const VP8_PAYLOAD_TYPE: u8 = 96;

/// How long a freshly announced remote track may report an unattached receiver
const RECEIVER_READY_RETRIES: u32 = 50;

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_owned(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
        rtcp_feedback: vec![],
    }
}

fn vp8_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_VP8.to_owned(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

fn video_feedback() -> Vec<RTCPFeedback> {
    [("goog-remb", ""), ("ccm", "fir"), ("nack", ""), ("nack", "pli")]
        .into_iter()
        .map(|(typ, parameter)| RTCPFeedback {
            typ: typ.to_owned(),
            parameter: parameter.to_owned(),
        })
        .collect()
}

/// Media transport backed by webrtc-rs
pub struct WebRtcTransport {
    /// WebRTC API (shared for all connections)
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcTransport {
    pub fn new(config: &Config) -> Result<Self> {
        let mut media_engine = MediaEngine::default();

        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: opus_capability(),
                payload_type: OPUS_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;

        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    rtcp_feedback: video_feedback(),
                    ..vp8_capability()
                },
                payload_type: VP8_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let mut setting_engine = SettingEngine::default();
        if !config.public_ips.is_empty() {
            setting_engine.set_nat_1to1_ips(config.public_ips.clone(), RTCIceCandidateType::Host);
        }
        if config.udp_port_min != 0 || config.udp_port_max != 0 {
            let ports = EphemeralUDP::new(config.udp_port_min, config.udp_port_max)?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(ports));
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let mut ice_servers = vec![];

        for stun_url in &config.stun_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }

        for turn in &config.turn_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        Ok(Self {
            api: Arc::new(api),
            ice_servers,
        })
    }
}

#[async_trait]
impl MediaTransport for WebRtcTransport {
    type Local = WebRtcLocalTrack;
    type Remote = WebRtcRemoteTrack;
    type Link = WebRtcLink;

    async fn create_connection(&self) -> Result<Arc<WebRtcLink>, TransportError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = self
            .api
            .new_peer_connection(config)
            .await
            .map_err(|e| TransportError::CreateConnection(e.to_string()))?;

        Ok(Arc::new(WebRtcLink { pc: Arc::new(pc) }))
    }

    fn create_local_track(&self, peer_id: PeerId, kind: MediaKind) -> Result<Arc<WebRtcLocalTrack>, TransportError> {
        let capability = match kind {
            MediaKind::Audio => opus_capability(),
            MediaKind::Video => vp8_capability(),
        };
        let id = format!("{peer_id}-{kind}");

        let track = TrackLocalStaticRTP::new(capability, id.clone(), format!("huddle-{peer_id}"));

        Ok(Arc::new(WebRtcLocalTrack {
            id,
            kind,
            track: Arc::new(track),
        }))
    }
}

pub struct WebRtcLocalTrack {
    id: String,
    kind: MediaKind,
    track: Arc<TrackLocalStaticRTP>,
}

#[async_trait]
impl LocalTrack for WebRtcLocalTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn write_packet(&self, packet: &Packet) -> Result<(), TransportError> {
        self.track
            .write_rtp(packet)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Write(e.to_string()))
    }
}

pub struct WebRtcRemoteTrack {
    track: Arc<TrackRemote>,
}

#[async_trait]
impl RemoteTrack for WebRtcRemoteTrack {
    fn id(&self) -> String {
        self.track.id()
    }

    fn kind(&self) -> MediaKind {
        match self.track.kind() {
            RTPCodecType::Audio => MediaKind::Audio,
            _ => MediaKind::Video,
        }
    }

    async fn read_packet(&self) -> Result<Packet, TransportError> {
        let mut retries = 0;
        loop {
            match self.track.read_rtp().await {
                Ok((packet, _attributes)) => return Ok(packet),
                // The receiver may not be attached yet right after on_track fires
                Err(e) if e.to_string().contains("RTPReceiver must not be nil") && retries < RECEIVER_READY_RETRIES => {
                    retries += 1;
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => return Err(TransportError::TrackEnded(e.to_string())),
            }
        }
    }
}

pub struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, webrtc::Error> {
    match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpType::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            rollback.sdp = description.sdp;
            Ok(rollback)
        }
    }
}

fn from_rtc_description(description: RTCSessionDescription) -> SessionDescription {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        _ => SdpType::Answer,
    };
    SessionDescription {
        sdp_type,
        sdp: description.sdp,
    }
}

#[async_trait]
impl PeerLink for WebRtcLink {
    type Local = WebRtcLocalTrack;
    type Remote = WebRtcRemoteTrack;

    async fn add_local_track(&self, track: Arc<WebRtcLocalTrack>) -> Result<(), TransportError> {
        let rtp_sender = self
            .pc
            .add_track(Arc::clone(&track.track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| TransportError::AddTrack(e.to_string()))?;

        // Interceptors (NACK, reports) only run while RTCP is being read
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtp_sender.read(&mut buf).await.is_ok() {}
        });

        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), TransportError> {
        let description =
            to_rtc_description(description).map_err(|e| TransportError::RemoteDescription(e.to_string()))?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| TransportError::RemoteDescription(e.to_string()))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.pc
            .create_answer(None)
            .await
            .map(from_rtc_description)
            .map_err(|e| TransportError::CreateAnswer(e.to_string()))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), TransportError> {
        let description =
            to_rtc_description(description).map_err(|e| TransportError::LocalDescription(e.to_string()))?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|e| TransportError::LocalDescription(e.to_string()))
    }

    async fn add_remote_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::AddIceCandidate(e.to_string()))
    }

    fn on_ice_candidate(&self, sink: mpsc::UnboundedSender<IceCandidate>) {
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let sink = sink.clone();
            Box::pin(async move {
                // None marks the end of gathering
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = sink.send(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        });
                    }
                    Err(e) => tracing::error!("Failed to serialize ICE candidate: {}", e),
                }
            })
        }));
    }

    fn on_remote_track(&self, sink: mpsc::UnboundedSender<Arc<WebRtcRemoteTrack>>) {
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let sink = sink.clone();
            Box::pin(async move {
                let _ = sink.send(Arc::new(WebRtcRemoteTrack { track }));
            })
        }));
    }

    fn on_state_change(&self, sink: mpsc::UnboundedSender<LinkState>) {
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let sink = sink.clone();
                Box::pin(async move {
                    let state = match state {
                        RTCPeerConnectionState::Connected => LinkState::Connected,
                        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
                        RTCPeerConnectionState::Failed => LinkState::Failed,
                        RTCPeerConnectionState::Closed => LinkState::Closed,
                        _ => LinkState::Connecting,
                    };
                    let _ = sink.send(state);
                })
            }));
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc
            .close()
            .await
            .map_err(|e| TransportError::Close(e.to_string()))
    }
}
