use thiserror::Error;

use super::session::{NegotiationState, Role};

/// Participant-side negotiation errors
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("please type a room id")]
    EmptyRoomId,

    #[error("the room is full, please try another one")]
    RoomFull,

    #[error("could not get user media: {0}")]
    MediaAcquisitionDenied(String),

    #[error("role already assigned: {0}")]
    RoleAlreadyAssigned(Role),

    #[error("invalid state transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: NegotiationState,
        to: NegotiationState,
    },

    #[error("peer left the room")]
    PeerGone,

    #[error("another peer joined during negotiation")]
    UnexpectedPeer,

    #[error("negotiation stalled in {0:?}")]
    NegotiationStalled(NegotiationState),

    #[error("peer connection error: {0}")]
    PeerConnection(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("signaling channel closed")]
    SignalingClosed,
}
