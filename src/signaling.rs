//! WebSocket relay that pairs two participants per room and forwards their
//! offer/answer/ICE messages

mod messages;
mod registry;
mod router;
mod server;
mod types;

pub use messages::{ClientMessage, IceCandidateEnvelope, SdpEnvelope, ServerMessage};
pub use registry::RoomRegistryHandle;
pub use router::{SignalingRouter, relayed_form};
pub use server::{DEFAULT_SIGNALING_PORT, SignalingServer, port_from_env};
pub use types::{
    ConnectionId, Delivery, JoinOutcome, OutboundMessage, ROOM_CAPACITY, RoomId, SignalingError,
};
