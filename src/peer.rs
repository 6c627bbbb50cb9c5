//! webrtc-rs peer connection used as the media transport.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::MarshalSize;

use crate::audio::{self, AudioConfig, MediaPacket, StreamParams};
use crate::config::Config;
use crate::controller::{CallEvent, TransportFactory};
use crate::negotiator::MediaTransport;

const OPUS_PAYLOAD_TYPE: u8 = 111;
const OPUS_FMTP: &str = "minptime=10;useinbandfec=1;stereo=1";

/// Packets buffered between the track reader and the playback thread.
const PACKET_QUEUE: usize = 100;

pub struct PeerTransport {
    pc: Arc<RTCPeerConnection>,
}

/// Opens one [`PeerTransport`] per call with the configured ICE servers and playback device.
pub struct PeerFactory {
    config: Config,
}

impl PeerFactory {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportFactory for PeerFactory {
    type Transport = PeerTransport;

    async fn create(&self, events: mpsc::UnboundedSender<CallEvent>) -> Result<PeerTransport> {
        PeerTransport::new(&self.config, events).await
    }
}

impl PeerTransport {
    /// Build a peer connection that receives one Opus audio track.
    ///
    /// Incoming tracks get their own playback thread; local candidates and stream
    /// outcomes are reported on `events`.
    pub async fn new(config: &Config, events: mpsc::UnboundedSender<CallEvent>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_owned(),
                        clock_rate: 48000,
                        channels: 2,
                        sdp_fmtp_line: OPUS_FMTP.to_owned(),
                        rtcp_feedback: vec![],
                    },
                    payload_type: OPUS_PAYLOAD_TYPE,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .context("Failed to register Opus codec")?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .context("Failed to register interceptors")?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let mut ice_servers = vec![];
        if config.use_stun {
            log::info!("Use STUN server at {}", config.stun_server);
            ice_servers.push(RTCIceServer {
                urls: vec![config.stun_server.to_string()],
                ..Default::default()
            });
        } else {
            log::info!("No STUN server");
        }

        log::info!("Create PeerConnection");
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .context("Failed to create peer connection")?,
        );

        // Allow us to receive 1 audio track
        pc.add_transceiver_from_kind(
            RTPCodecType::Audio,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await
        .context("Failed to add audio transceiver")?;

        let transport = Self { pc };
        transport.setup_event_handlers(AudioConfig::from_config(config), events);
        Ok(transport)
    }

    fn setup_event_handlers(&self, audio: AudioConfig, events: mpsc::UnboundedSender<CallEvent>) {
        let track_events = events.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let audio = audio.clone();
                let events = track_events.clone();
                Box::pin(async move {
                    start_stream(track, audio, events);
                })
            },
        ));

        self.pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    log::info!("local ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        log::debug!("local candidate: {}", init.candidate);
                        let _ = events.send(CallEvent::LocalCandidate(init));
                    }
                    Err(e) => log::warn!("failed to serialize local candidate: {}", e),
                }
            })
        }));

        self.pc.on_ice_connection_state_change(Box::new(|state: RTCIceConnectionState| {
            log::info!("Connection State has changed {}", state);
            Box::pin(async {})
        }));

        self.pc.on_signaling_state_change(Box::new(|state: RTCSignalingState| {
            log::info!("Signaling State has changed {}", state);
            Box::pin(async {})
        }));
    }
}

fn start_stream(
    track: Arc<TrackRemote>,
    audio: AudioConfig,
    events: mpsc::UnboundedSender<CallEvent>,
) {
    let codec = track.codec();
    log::info!(
        "Track ssrc={} payload_type={} mime={} clock_rate={} channels={} fmtp={}",
        track.ssrc(),
        track.payload_type(),
        codec.capability.mime_type,
        codec.capability.clock_rate,
        codec.capability.channels,
        codec.capability.sdp_fmtp_line,
    );

    if track.kind() != RTPCodecType::Audio {
        log::warn!("ignoring non-audio track {}", track.ssrc());
        return;
    }

    let params = StreamParams {
        ssrc: track.ssrc(),
        sample_rate: codec.capability.clock_rate,
        channels: usize::from(codec.capability.channels),
    };
    let (tx, rx) = mpsc::channel(PACKET_QUEUE);
    let ssrc = params.ssrc;
    let spawned = audio::spawn_stream(params, audio, rx, move |result| {
        let _ = events.send(CallEvent::StreamEnded { ssrc, result });
    });
    if let Err(e) = spawned {
        log::error!("failed to start playback thread for ssrc {}: {}", ssrc, e);
        return;
    }

    tokio::spawn(forward_packets(track, tx));
}

// 读取 RTP 包并转发给播放线程，轨道结束或播放线程退出时停止
async fn forward_packets(track: Arc<TrackRemote>, tx: mpsc::Sender<MediaPacket>) {
    let ssrc = track.ssrc();
    loop {
        match track.read_rtp().await {
            Ok((packet, _attributes)) => {
                if tx.send(media_packet(&packet)).await.is_err() {
                    log::info!("playback for ssrc {} stopped, releasing track", ssrc);
                    break;
                }
            }
            Err(e) => {
                log::info!("track {} ended: {}", ssrc, e);
                break;
            }
        }
    }
}

fn media_packet(packet: &Packet) -> MediaPacket {
    MediaPacket {
        sequence_number: packet.header.sequence_number,
        padding: packet.header.padding,
        extension: packet.header.extension,
        marker: packet.header.marker,
        payload_offset: packet.header.marshal_size(),
        payload: packet.payload.clone(),
    }
}

#[async_trait]
impl MediaTransport for PeerTransport {
    async fn create_offer(&self) -> Result<RTCSessionDescription> {
        Ok(self.pc.create_offer(None).await?)
    }

    async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<()> {
        Ok(self.pc.set_local_description(desc).await?)
    }

    async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<()> {
        Ok(self.pc.set_remote_description(desc).await?)
    }

    async fn add_remote_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        Ok(self.pc.add_ice_candidate(candidate).await?)
    }

    async fn close(&self) -> Result<()> {
        Ok(self.pc.close().await?)
    }
}
