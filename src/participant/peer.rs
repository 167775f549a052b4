use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::signaling::ServerMessage;

use super::error::NegotiationError;
use super::media::{FrameSource, LocalMedia};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description in the browser's JSON shape: `{"type", "sdp"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// One ICE candidate; `label` is the m-line index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub label: Option<u16>,
    pub candidate: String,
}

/// Everything the orchestrator reacts to, relayed messages and
/// peer-connection callbacks alike, delivered through one queue.
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationEvent {
    Signal(ServerMessage),
    LocalCandidate(IceCandidate),
    RemoteTrack { track_id: String },
    PeerConnectionFailed(String),
    SignalingClosed,
}

pub type EventSink = mpsc::UnboundedSender<NegotiationEvent>;

/// Handle to one end of a direct media session.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_local_tracks(&self, media: &LocalMedia) -> Result<(), NegotiationError>;

    /// Keep writing `frames` into the attached local track `track_id` until
    /// the feed ends or the connection closes.
    async fn send_frames(
        &self,
        track_id: &str,
        frames: Box<dyn FrameSource>,
    ) -> Result<(), NegotiationError>;

    /// Route remote-track, local-candidate and failure callbacks into `events`.
    fn register_handlers(&self, events: EventSink);

    /// Create an offer and install it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Create an answer and install it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    async fn close(&self) -> Result<(), NegotiationError>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    type Connection: PeerConnection + 'static;

    async fn create(&self) -> Result<Self::Connection, NegotiationError>;
}
