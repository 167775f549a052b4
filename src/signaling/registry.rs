use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::messages::ServerMessage;
use super::types::{
    ConnectionId, Delivery, JoinOutcome, Member, OutboundMessage, Room, RoomId, SignalingError,
};

/// Commands sent to the room registry actor
pub(crate) enum RoomCommand {
    Join {
        room_id: RoomId,
        conn_id: ConnectionId,
        conn_tx: mpsc::UnboundedSender<OutboundMessage>,
        reply: oneshot::Sender<Result<JoinOutcome, SignalingError>>,
    },
    Leave {
        conn_id: ConnectionId,
        reply: oneshot::Sender<Option<RoomId>>,
    },
    Relay {
        sender: ConnectionId,
        message: OutboundMessage,
        reply: oneshot::Sender<Result<Delivery, SignalingError>>,
    },
    Members {
        room_id: RoomId,
        reply: oneshot::Sender<Vec<ConnectionId>>,
    },
}

fn encode(msg: &ServerMessage) -> Option<OutboundMessage> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(OutboundMessage::from(json)),
        Err(e) => {
            warn!("Failed to encode {}: {}", msg.kind(), e);
            None
        }
    }
}

/// Owns every room. Commands run one at a time, so `join`/`leave` on a room
/// never interleave and the capacity check cannot race.
///
/// The exclusion is registry-wide rather than per room: commands for
/// unrelated rooms also queue behind each other. Each command is a couple
/// of map operations, so that queue stays short.
pub(crate) async fn room_registry_actor(mut rx: mpsc::Receiver<RoomCommand>) {
    let mut rooms: HashMap<RoomId, Room> = HashMap::new();
    let mut conn_rooms: HashMap<ConnectionId, RoomId> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            RoomCommand::Join {
                room_id,
                conn_id,
                conn_tx,
                reply,
            } => {
                let result = if room_id.is_empty() {
                    Err(SignalingError::EmptyRoomId)
                } else if let Some(current) = conn_rooms.get(&conn_id) {
                    Err(SignalingError::AlreadyInRoom(conn_id, current.clone()))
                } else {
                    let member = Member {
                        id: conn_id,
                        tx: conn_tx,
                    };
                    match rooms.get_mut(&room_id) {
                        None => {
                            rooms.insert(room_id.clone(), Room::new(member));
                            conn_rooms.insert(conn_id, room_id.clone());
                            info!("Room {} created by {}", room_id, conn_id);
                            Ok(JoinOutcome::Created)
                        }
                        Some(room) if room.is_full() => {
                            info!("Room {} is full, rejecting {}", room_id, conn_id);
                            Ok(JoinOutcome::Full)
                        }
                        Some(room) => {
                            if let Some(msg) = encode(&ServerMessage::UserJoined(room_id.clone())) {
                                for existing in &room.members {
                                    let _ = existing.tx.send(msg.clone());
                                }
                            }
                            room.members.push(member);
                            conn_rooms.insert(conn_id, room_id.clone());
                            info!("{} joined room {}", conn_id, room_id);
                            Ok(JoinOutcome::Joined)
                        }
                    }
                };

                let _ = reply.send(result);
            }

            RoomCommand::Leave { conn_id, reply } => {
                let left = conn_rooms.remove(&conn_id);
                if let Some(room_id) = left.as_ref() {
                    if let Some(room) = rooms.get_mut(room_id) {
                        room.remove(&conn_id);

                        if room.members.is_empty() {
                            rooms.remove(room_id);
                            info!("Room {} removed (empty)", room_id);
                        } else if let Some(msg) = encode(&ServerMessage::PeerLeft(room_id.clone())) {
                            for remaining in &room.members {
                                let _ = remaining.tx.send(msg.clone());
                            }
                        }
                    }
                    info!("{} left room {}", conn_id, room_id);
                }
                let _ = reply.send(left);
            }

            RoomCommand::Relay {
                sender,
                message,
                reply,
            } => {
                let result = match conn_rooms.get(&sender).and_then(|id| rooms.get(id).map(|r| (id, r))) {
                    Some((room_id, room)) => {
                        let mut recipients = 0;
                        for other in room.others(&sender) {
                            if other.tx.send(message.clone()).is_ok() {
                                recipients += 1;
                            }
                        }
                        debug!("Relayed from {} to {} peer(s) in {}", sender, recipients, room_id);
                        Ok(Delivery {
                            room_id: room_id.clone(),
                            recipients,
                        })
                    }
                    None => Err(SignalingError::InvalidSender(sender)),
                };
                let _ = reply.send(result);
            }

            RoomCommand::Members { room_id, reply } => {
                let members = rooms
                    .get(&room_id)
                    .map(|room| room.members.iter().map(|m| m.id).collect())
                    .unwrap_or_default();
                let _ = reply.send(members);
            }
        }
    }
}

/// Handle to communicate with the room registry actor
#[derive(Clone)]
pub struct RoomRegistryHandle {
    pub(crate) tx: mpsc::Sender<RoomCommand>,
}

impl RoomRegistryHandle {
    /// Spawn the registry actor on the current runtime.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel::<RoomCommand>(1024);
        tokio::spawn(room_registry_actor(rx));
        Self { tx }
    }

    async fn request<T>(
        &self,
        cmd: RoomCommand,
        reply_rx: oneshot::Receiver<T>,
    ) -> Result<T, SignalingError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| SignalingError::Internal("actor channel closed".to_string()))?;
        reply_rx
            .await
            .map_err(|_| SignalingError::Internal("actor channel closed".to_string()))
    }

    /// Ask for membership in `room_id`. On `Joined` the existing member is sent
    /// `user_joined`.
    pub async fn join(
        &self,
        room_id: RoomId,
        conn_id: ConnectionId,
        conn_tx: mpsc::UnboundedSender<OutboundMessage>,
    ) -> Result<JoinOutcome, SignalingError> {
        let (reply, reply_rx) = oneshot::channel();
        self.request(
            RoomCommand::Join {
                room_id,
                conn_id,
                conn_tx,
                reply,
            },
            reply_rx,
        )
        .await?
    }

    /// Leave whichever room the connection is in. Returns that room, if any.
    pub async fn leave(&self, conn_id: &ConnectionId) -> Option<RoomId> {
        let (reply, reply_rx) = oneshot::channel();
        self.request(
            RoomCommand::Leave {
                conn_id: *conn_id,
                reply,
            },
            reply_rx,
        )
        .await
        .ok()
        .flatten()
    }

    /// Forward an already encoded message to every other member of the
    /// sender's room.
    pub async fn relay(
        &self,
        sender: &ConnectionId,
        message: OutboundMessage,
    ) -> Result<Delivery, SignalingError> {
        let (reply, reply_rx) = oneshot::channel();
        self.request(
            RoomCommand::Relay {
                sender: *sender,
                message,
                reply,
            },
            reply_rx,
        )
        .await?
    }

    /// Current members of a room in arrival order; empty if it does not exist.
    pub async fn members(&self, room_id: &RoomId) -> Vec<ConnectionId> {
        let (reply, reply_rx) = oneshot::channel();
        self.request(
            RoomCommand::Members {
                room_id: room_id.clone(),
                reply,
            },
            reply_rx,
        )
        .await
        .unwrap_or_default()
    }
}
