//! `webrtc` crate backed peer connection.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use super::error::NegotiationError;
use super::media::{FrameSource, LocalMedia, TrackKind};
use super::peer::{
    EventSink, IceCandidate, NegotiationEvent, PeerConnection, PeerConnectionFactory, SdpKind,
    SessionDescription,
};

/// Public STUN servers used for candidate discovery by default.
pub const DEFAULT_STUN_SERVERS: [&str; 5] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

fn rtc_err(e: webrtc::Error) -> NegotiationError {
    NegotiationError::PeerConnection(e.to_string())
}

pub struct RtcPeerConnectionFactory {
    api: API,
    config: RTCConfiguration,
}

impl RtcPeerConnectionFactory {
    pub fn new(ice_servers: &[String]) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(rtc_err)?;

        let registry =
            register_default_interceptors(Registry::new(), &mut media_engine).map_err(rtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        Ok(Self { api, config })
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerConnectionFactory {
    type Connection = RtcPeerConnection;

    async fn create(&self) -> Result<RtcPeerConnection, NegotiationError> {
        let pc = self
            .api
            .new_peer_connection(self.config.clone())
            .await
            .map_err(rtc_err)?;

        Ok(RtcPeerConnection {
            pc: Arc::new(pc),
            tracks: Mutex::new(Vec::new()),
            pumps: Mutex::new(Vec::new()),
        })
    }
}

pub struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    tracks: Mutex<Vec<Arc<TrackLocalStaticSample>>>,
    /// One sample writer task per fed track
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl RtcPeerConnection {
    /// Tracks attached so far.
    pub async fn local_tracks(&self) -> Vec<Arc<TrackLocalStaticSample>> {
        self.tracks.lock().await.clone()
    }

    async fn local_track(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.tracks
            .lock()
            .await
            .iter()
            .find(|track| track.id() == track_id)
            .cloned()
    }
}

/// Write frames into `track` until the feed ends or the track refuses them.
async fn pump_frames(track: Arc<TrackLocalStaticSample>, mut frames: Box<dyn FrameSource>) {
    let mut written = 0u64;
    while let Some(frame) = frames.next_frame().await {
        let sample = Sample {
            data: frame.data,
            duration: frame.duration,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            warn!("Track {} stopped after {} samples: {}", track.id(), written, e);
            return;
        }
        written += 1;
    }
    debug!("Frame feed for track {} ended after {} samples", track.id(), written);
}

fn to_description(desc: &RTCSessionDescription) -> Result<SessionDescription, NegotiationError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(NegotiationError::PeerConnection(
                "unspecified sdp type".to_string(),
            ));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp.clone(),
    })
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn add_local_tracks(&self, media: &LocalMedia) -> Result<(), NegotiationError> {
        info!(
            "Attaching stream {} (audio: {}, video: {})",
            media.stream_id,
            media.has(TrackKind::Audio),
            media.has(TrackKind::Video)
        );
        for track in &media.tracks {
            let mime_type = match track.kind {
                TrackKind::Audio => MIME_TYPE_OPUS,
                TrackKind::Video => MIME_TYPE_VP8,
            };
            let local = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_owned(),
                    ..Default::default()
                },
                track.id.clone(),
                media.stream_id.clone(),
            ));

            self.pc
                .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(rtc_err)?;
            self.tracks.lock().await.push(local);
        }
        Ok(())
    }

    async fn send_frames(
        &self,
        track_id: &str,
        frames: Box<dyn FrameSource>,
    ) -> Result<(), NegotiationError> {
        let track = self.local_track(track_id).await.ok_or_else(|| {
            NegotiationError::PeerConnection(format!("no local track {}", track_id))
        })?;
        let pump = tokio::spawn(pump_frames(track, frames));
        self.pumps.lock().await.push(pump);
        Ok(())
    }

    fn register_handlers(&self, events: EventSink) {
        let tx = events.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let _ = tx.send(NegotiationEvent::RemoteTrack {
                    track_id: track.id(),
                });
                Box::pin(async {})
            },
        ));

        let tx = events.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        let _ = tx.send(NegotiationEvent::LocalCandidate(IceCandidate {
                            label: init.sdp_mline_index,
                            candidate: init.candidate,
                        }));
                    }
                    Err(e) => warn!("Unusable local candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        let tx = events;
        self.pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            info!("Peer connection state: {}", s);
            if s == RTCPeerConnectionState::Failed {
                let _ = tx.send(NegotiationEvent::PeerConnectionFailed("ice failed".to_string()));
            }
            Box::pin(async {})
        }));
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self.pc.create_offer(None).await.map_err(rtc_err)?;
        let desc = to_description(&offer)?;
        self.pc.set_local_description(offer).await.map_err(rtc_err)?;
        Ok(desc)
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.pc.create_answer(None).await.map_err(rtc_err)?;
        let desc = to_description(&answer)?;
        self.pc.set_local_description(answer).await.map_err(rtc_err)?;
        Ok(desc)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        let remote = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
            SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
            SdpKind::Rollback => {
                return Err(NegotiationError::PeerConnection(
                    "rollback is not supported".to_string(),
                ));
            }
        }
        .map_err(rtc_err)?;

        self.pc.set_remote_description(remote).await.map_err(rtc_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        debug!("Adding remote candidate {}", candidate.candidate);
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mline_index: candidate.label,
                ..Default::default()
            })
            .await
            .map_err(rtc_err)
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        for pump in self.pumps.lock().await.drain(..) {
            pump.abort();
        }
        self.pc.close().await.map_err(rtc_err)
    }
}
