use serde::{Deserialize, Serialize};

use super::types::RoomId;

/// SDP envelope as sent by a participant. The relay forwards only `sdp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdpEnvelope {
    /// Echo of the message kind (`webrtc_offer` / `webrtc_answer`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Session description object, opaque to the relay.
    pub sdp: serde_json::Value,
    #[serde(rename = "roomId")]
    pub room_id: RoomId,
}

/// Typed view of an ICE candidate envelope for participants. The relay
/// carries it as an opaque JSON object and never decodes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidateEnvelope {
    #[serde(rename = "roomId")]
    pub room_id: RoomId,
    /// m-line index of the candidate
    #[serde(default)]
    pub label: Option<u16>,
    pub candidate: String,
}

/// `roomId` of an opaque ICE payload, when it carries a string one.
pub(crate) fn claimed_room(payload: &serde_json::Value) -> Option<RoomId> {
    payload.get("roomId")?.as_str().map(RoomId::from)
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientMessage {
    /// Ask for membership in a room
    #[serde(rename = "join")]
    Join(RoomId),

    /// Joiner tells the Creator to start offering
    #[serde(rename = "start_call")]
    StartCall(RoomId),

    #[serde(rename = "webrtc_offer")]
    WebrtcOffer(SdpEnvelope),

    #[serde(rename = "webrtc_answer")]
    WebrtcAnswer(SdpEnvelope),

    /// Candidate envelope, forwarded byte for byte in meaning
    #[serde(rename = "webrtc_ice_candidate")]
    WebrtcIceCandidate(serde_json::Value),

    /// Leave the current room without closing the socket
    #[serde(rename = "leave")]
    Leave,
}

impl ClientMessage {
    /// Wire name of the message kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Join(_) => "join",
            ClientMessage::StartCall(_) => "start_call",
            ClientMessage::WebrtcOffer(_) => "webrtc_offer",
            ClientMessage::WebrtcAnswer(_) => "webrtc_answer",
            ClientMessage::WebrtcIceCandidate(_) => "webrtc_ice_candidate",
            ClientMessage::Leave => "leave",
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerMessage {
    /// Sender is now the Creator of a new room
    #[serde(rename = "room_created")]
    RoomCreated(RoomId),

    /// Sender is now the Joiner of an existing room
    #[serde(rename = "room_joined")]
    RoomJoined(RoomId),

    /// Join rejected, room at capacity
    #[serde(rename = "full_room")]
    FullRoom,

    /// A peer arrived in the recipient's room
    #[serde(rename = "user_joined")]
    UserJoined(RoomId),

    /// The other member left or disconnected
    #[serde(rename = "peer_left")]
    PeerLeft(RoomId),

    #[serde(rename = "start_call")]
    StartCall,

    /// Bare session description, envelope stripped
    #[serde(rename = "webrtc_offer")]
    WebrtcOffer(serde_json::Value),

    /// Bare session description, envelope stripped
    #[serde(rename = "webrtc_answer")]
    WebrtcAnswer(serde_json::Value),

    /// Candidate envelope exactly as the sender wrote it
    #[serde(rename = "webrtc_ice_candidate")]
    WebrtcIceCandidate(serde_json::Value),

    /// Error response
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    /// Wire name of the message kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::RoomCreated(_) => "room_created",
            ServerMessage::RoomJoined(_) => "room_joined",
            ServerMessage::FullRoom => "full_room",
            ServerMessage::UserJoined(_) => "user_joined",
            ServerMessage::PeerLeft(_) => "peer_left",
            ServerMessage::StartCall => "start_call",
            ServerMessage::WebrtcOffer(_) => "webrtc_offer",
            ServerMessage::WebrtcAnswer(_) => "webrtc_answer",
            ServerMessage::WebrtcIceCandidate(_) => "webrtc_ice_candidate",
            ServerMessage::Error { .. } => "error",
        }
    }
}
