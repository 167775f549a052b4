use std::fmt;
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Utf8Bytes;

/// Signaling server errors
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("room id must not be empty")]
    EmptyRoomId,

    #[error("connection {0} is already in room {1}")]
    AlreadyInRoom(ConnectionId, RoomId),

    #[error("connection {0} is not in any room")]
    InvalidSender(ConnectionId),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Maximum number of members a room can hold.
pub const ROOM_CAPACITY: usize = 2;

const CONNECTION_ID_PREFIX: &[u8] = b"conn_";
const CONNECTION_ID_LEN: usize = 21;
const HEX_CHARS: &[u8] = b"0123456789abcdef";

/// Opaque room identifier chosen by the participants.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(Arc<str>);

impl RoomId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl Serialize for RoomId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RoomId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(RoomId::from(s))
    }
}

/// Connection ID: 21-byte fixed array ("conn_" + 16 hex)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    bytes: [u8; CONNECTION_ID_LEN],
    len: u8,
}

impl ConnectionId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; CONNECTION_ID_LEN];
        let prefix_len = CONNECTION_ID_PREFIX.len();
        bytes[..prefix_len].copy_from_slice(CONNECTION_ID_PREFIX);

        let mut rng = rand::rng();
        let value: u64 = rng.random();

        for i in 0..16 {
            let nibble = ((value >> (60 - i * 4)) & 0xF) as usize;
            bytes[prefix_len + i] = HEX_CHARS[nibble];
        }
        Self {
            bytes,
            len: CONNECTION_ID_LEN as u8,
        }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        let mut bytes = [0u8; CONNECTION_ID_LEN];
        let src = s.as_bytes();
        let len = src.len().min(CONNECTION_ID_LEN);
        bytes[..len].copy_from_slice(&src[..len]);
        Self {
            bytes,
            len: len as u8,
        }
    }
}

/// Result of asking the registry for membership in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The room did not exist; the caller is its first member (Creator).
    Created,
    /// The room had one member; the caller is the second (Joiner).
    Joined,
    /// The room already holds two members; the caller was not added.
    Full,
}

/// Where a relayed message ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub room_id: RoomId,
    pub recipients: usize,
}

/// Wrapper for outbound WebSocket messages using tungstenite's Utf8Bytes.
#[derive(Debug, Clone)]
pub struct OutboundMessage(Utf8Bytes);

impl OutboundMessage {
    /// Create a new outbound message from any string type
    pub fn new(s: impl Into<Utf8Bytes>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Get the inner Utf8Bytes for tungstenite Message::Text
    pub fn into_inner(self) -> Utf8Bytes {
        self.0
    }
}

impl From<String> for OutboundMessage {
    fn from(s: String) -> Self {
        Self(Utf8Bytes::from(s))
    }
}

#[derive(Debug)]
pub(crate) struct Member {
    pub id: ConnectionId,
    /// Channel for outbound messages to this member.
    /// Uses OutboundMessage (Utf8Bytes) for cheap broadcast cloning.
    pub tx: mpsc::UnboundedSender<OutboundMessage>,
}

/// Capacity-2 rendezvous point; members are kept in arrival order.
#[derive(Debug)]
pub(crate) struct Room {
    pub members: Vec<Member>,
}

impl Room {
    pub fn new(first: Member) -> Self {
        let mut members = Vec::with_capacity(ROOM_CAPACITY);
        members.push(first);
        Self { members }
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= ROOM_CAPACITY
    }

    pub fn remove(&mut self, id: &ConnectionId) {
        self.members.retain(|m| m.id != *id);
    }

    pub fn others(&self, id: &ConnectionId) -> impl Iterator<Item = &Member> {
        let id = *id;
        self.members.iter().filter(move |m| m.id != id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str) -> Member {
        let (tx, _rx) = mpsc::unbounded_channel();
        Member {
            id: ConnectionId::from(id),
            tx,
        }
    }

    #[test]
    fn connection_id_generate_has_correct_format() {
        let id = ConnectionId::generate();
        assert!(id.as_str().starts_with("conn_"));
        assert_eq!(id.as_str().len(), 21);
        assert!(id.as_str()[5..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn connection_ids_differ() {
        assert_ne!(ConnectionId::generate(), ConnectionId::generate());
    }

    #[test]
    fn connection_id_from_str() {
        let id = ConnectionId::from("conn_a");
        assert_eq!(id.as_str(), "conn_a");
        assert_eq!(format!("{}", id), "conn_a");
    }

    #[test]
    fn room_id_keeps_arbitrary_text() {
        let id = RoomId::from("a rather long room name with spaces");
        assert_eq!(id.as_str(), "a rather long room name with spaces");
        assert!(!id.is_empty());
        assert!(RoomId::from("").is_empty());
    }

    #[test]
    fn room_id_serializes_as_bare_string() {
        let id = RoomId::from("r1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"r1\"");
        let back: RoomId = serde_json::from_str("\"r1\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn room_reports_full_at_capacity() {
        let mut room = Room::new(member("conn_a"));
        assert!(!room.is_full());
        room.members.push(member("conn_b"));
        assert!(room.is_full());
    }

    #[test]
    fn room_others_excludes_self() {
        let mut room = Room::new(member("conn_a"));
        room.members.push(member("conn_b"));
        let others: Vec<_> = room.others(&ConnectionId::from("conn_a")).map(|m| m.id).collect();
        assert_eq!(others, vec![ConnectionId::from("conn_b")]);
    }

    #[test]
    fn room_remove_keeps_order_of_rest() {
        let mut room = Room::new(member("conn_a"));
        room.members.push(member("conn_b"));
        room.remove(&ConnectionId::from("conn_a"));
        assert_eq!(room.members.len(), 1);
        assert_eq!(room.members[0].id, ConnectionId::from("conn_b"));
    }
}
