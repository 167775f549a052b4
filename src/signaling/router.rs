use tracing::{debug, warn};

use super::messages::{ClientMessage, ServerMessage, claimed_room};
use super::registry::RoomRegistryHandle;
use super::types::{ConnectionId, Delivery, OutboundMessage, RoomId, SignalingError};

/// Forwards participant messages to the other member of the sender's room.
///
/// Offers and answers lose their envelope on the way (only `sdp` is
/// forwarded). ICE candidate payloads travel as opaque JSON, unknown fields
/// and all; only their `roomId` is read, for logging.
#[derive(Clone)]
pub struct SignalingRouter {
    registry: RoomRegistryHandle,
}

impl SignalingRouter {
    pub fn new(registry: RoomRegistryHandle) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &RoomRegistryHandle {
        &self.registry
    }

    /// Relay a peer-to-peer message from `sender`. Returns `None` for
    /// messages that are not relayed (`join`, `leave`).
    pub async fn route(
        &self,
        sender: &ConnectionId,
        msg: ClientMessage,
    ) -> Option<Result<Delivery, SignalingError>> {
        let kind = msg.kind();
        let (claimed_room, relayed) = relayed_form(msg)?;

        let result = self.relay(sender, &relayed).await;
        match &result {
            Ok(delivery) => {
                if claimed_room.as_ref() != Some(&delivery.room_id) {
                    debug!(
                        "{} from {} names room {:?} but sender is in {}",
                        kind, sender, claimed_room, delivery.room_id
                    );
                }
            }
            Err(e) => warn!("Dropping {} from {}: {}", kind, sender, e),
        }
        Some(result)
    }

    /// Encode once and hand the frame to the registry for fan-out.
    pub async fn relay(
        &self,
        sender: &ConnectionId,
        message: &ServerMessage,
    ) -> Result<Delivery, SignalingError> {
        let json = serde_json::to_string(message)
            .map_err(|e| SignalingError::Internal(format!("encode {}: {}", message.kind(), e)))?;
        self.registry.relay(sender, OutboundMessage::from(json)).await
    }
}

/// The message the other member receives for a relayable client message,
/// paired with the room id the sender claimed, if any.
pub fn relayed_form(msg: ClientMessage) -> Option<(Option<RoomId>, ServerMessage)> {
    match msg {
        ClientMessage::StartCall(room_id) => Some((Some(room_id), ServerMessage::StartCall)),
        ClientMessage::WebrtcOffer(env) => {
            Some((Some(env.room_id), ServerMessage::WebrtcOffer(env.sdp)))
        }
        ClientMessage::WebrtcAnswer(env) => {
            Some((Some(env.room_id), ServerMessage::WebrtcAnswer(env.sdp)))
        }
        ClientMessage::WebrtcIceCandidate(payload) => Some((
            claimed_room(&payload),
            ServerMessage::WebrtcIceCandidate(payload),
        )),
        ClientMessage::Join(_) | ClientMessage::Leave => None,
    }
}
