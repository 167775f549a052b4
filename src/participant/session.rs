use std::fmt;

use crate::signaling::{ConnectionId, RoomId};

use super::error::NegotiationError;
use super::media::LocalMedia;
use super::peer::IceCandidate;

/// Fixed negotiation role, decided by arrival order in the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// First member; the only side that ever creates an offer.
    Creator,
    /// Second member; the only side that ever creates an answer.
    Joiner,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Creator => f.write_str("creator"),
            Role::Joiner => f.write_str("joiner"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    MediaAcquisitionDenied,
    PeerGone,
    UnexpectedPeer,
    PeerConnection,
    Stalled,
    SignalingClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    RoleAssigned,
    LocalMediaReady,
    PeerConnectionCreated,
    OfferSent,
    OfferReceived,
    AnswerSent,
    AnswerReceived,
    Connected,
    Failed(FailureReason),
}

impl NegotiationState {
    /// States between creating the peer connection and seeing remote media.
    pub fn is_negotiating(self) -> bool {
        matches!(
            self,
            NegotiationState::PeerConnectionCreated
                | NegotiationState::OfferSent
                | NegotiationState::OfferReceived
                | NegotiationState::AnswerSent
                | NegotiationState::AnswerReceived
        )
    }

    pub fn is_failed(self) -> bool {
        matches!(self, NegotiationState::Failed(_))
    }

    pub fn can_transition_to(self, next: NegotiationState) -> bool {
        use NegotiationState::*;

        match (self, next) {
            (Failed(_), _) => false,
            (_, Failed(_)) => true,
            (Idle, RoleAssigned) => true,
            (RoleAssigned, LocalMediaReady) => true,
            (LocalMediaReady, PeerConnectionCreated) => true,
            (PeerConnectionCreated, OfferSent | OfferReceived) => true,
            (OfferReceived, AnswerSent) => true,
            (OfferSent, AnswerReceived) => true,
            (from, Connected) => from.is_negotiating(),
            _ => false,
        }
    }
}

/// Everything one participant knows about its call. Owned by the
/// orchestrator; the relay never sees it.
pub struct ConnectionSession<P> {
    connection_id: ConnectionId,
    room_id: Option<RoomId>,
    role: Option<Role>,
    state: NegotiationState,
    pending_candidates: Vec<IceCandidate>,
    remote_description_applied: bool,
    local_media: Option<LocalMedia>,
    peer_connection: Option<P>,
}

impl<P> ConnectionSession<P> {
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            room_id: None,
            role: None,
            state: NegotiationState::Idle,
            pending_candidates: Vec::new(),
            remote_description_applied: false,
            local_media: None,
            peer_connection: None,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        self.room_id.as_ref()
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Record the room outcome. A role is assigned exactly once.
    pub fn assign_role(&mut self, role: Role, room_id: RoomId) -> Result<(), NegotiationError> {
        if let Some(existing) = self.role {
            return Err(NegotiationError::RoleAlreadyAssigned(existing));
        }
        self.transition(NegotiationState::RoleAssigned)?;
        self.role = Some(role);
        self.room_id = Some(room_id);
        Ok(())
    }

    pub fn transition(&mut self, next: NegotiationState) -> Result<(), NegotiationError> {
        if !self.state.can_transition_to(next) {
            return Err(NegotiationError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Move to `Failed` unless already there.
    pub fn fail(&mut self, reason: FailureReason) {
        if !self.state.is_failed() {
            self.state = NegotiationState::Failed(reason);
        }
    }

    pub fn local_media(&self) -> Option<&LocalMedia> {
        self.local_media.as_ref()
    }

    pub fn set_local_media(&mut self, media: LocalMedia) {
        self.local_media = Some(media);
    }

    pub fn peer_connection(&self) -> Option<&P> {
        self.peer_connection.as_ref()
    }

    pub fn attach_peer_connection(&mut self, peer_connection: P) {
        self.peer_connection = Some(peer_connection);
    }

    pub fn remote_description_applied(&self) -> bool {
        self.remote_description_applied
    }

    pub fn mark_remote_description_applied(&mut self) {
        self.remote_description_applied = true;
    }

    pub fn pending_candidates(&self) -> &[IceCandidate] {
        &self.pending_candidates
    }

    pub fn queue_candidate(&mut self, candidate: IceCandidate) {
        self.pending_candidates.push(candidate);
    }

    /// Drain queued candidates in arrival order.
    pub fn take_pending_candidates(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.pending_candidates)
    }
}
