//! Participant side: drives one WebRTC offer/answer/ICE exchange through the
//! relay

mod client;
mod error;
mod media;
mod orchestrator;
mod peer;
mod rtc;
mod session;

pub use client::{Call, ParticipantConfig, SignalingClient, run_call};
pub use error::NegotiationError;
pub use media::{
    DeviceInventory, FrameSource, LocalMedia, LocalTrack, MediaConstraints, MediaFrame,
    MediaSource, PlaceholderFrames, TrackKind, VideoConstraints,
};
pub use orchestrator::NegotiationOrchestrator;
pub use peer::{
    EventSink, IceCandidate, NegotiationEvent, PeerConnection, PeerConnectionFactory, SdpKind,
    SessionDescription,
};
pub use rtc::{DEFAULT_STUN_SERVERS, RtcPeerConnection, RtcPeerConnectionFactory};
pub use session::{ConnectionSession, FailureReason, NegotiationState, Role};
