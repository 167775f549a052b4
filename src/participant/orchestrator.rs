use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::signaling::{
    ClientMessage, ConnectionId, IceCandidateEnvelope, RoomId, SdpEnvelope, ServerMessage,
};

use super::error::NegotiationError;
use super::media::{MediaConstraints, MediaSource};
use super::peer::{
    EventSink, IceCandidate, NegotiationEvent, PeerConnection, PeerConnectionFactory,
    SessionDescription,
};
use super::session::{ConnectionSession, FailureReason, NegotiationState, Role};

/// Drives one participant from "no connection" to "media flowing".
///
/// Every input arrives as a [`NegotiationEvent`] and is handled to completion
/// before the next, so peer-connection mutations happen in a single order.
/// Events that arrive while media acquisition or offer/answer creation is
/// suspended wait in the queue.
pub struct NegotiationOrchestrator<F: PeerConnectionFactory, M: MediaSource> {
    session: ConnectionSession<F::Connection>,
    factory: F,
    media: M,
    constraints: MediaConstraints,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    events: EventSink,
    states: watch::Sender<NegotiationState>,
}

impl<F: PeerConnectionFactory, M: MediaSource> NegotiationOrchestrator<F, M> {
    pub fn new(
        factory: F,
        media: M,
        constraints: MediaConstraints,
        outbound: mpsc::UnboundedSender<ClientMessage>,
        events: EventSink,
    ) -> Self {
        let session = ConnectionSession::new(ConnectionId::generate());
        let (states, _) = watch::channel(session.state());
        Self {
            session,
            factory,
            media,
            constraints,
            outbound,
            events,
            states,
        }
    }

    /// Follow state changes made by [`run`](Self::run).
    pub fn subscribe(&self) -> watch::Receiver<NegotiationState> {
        self.states.subscribe()
    }

    pub fn session(&self) -> &ConnectionSession<F::Connection> {
        &self.session
    }

    pub fn state(&self) -> NegotiationState {
        self.session.state()
    }

    /// Ask the relay for membership in `room_id`.
    pub fn join(&mut self, room_id: RoomId) -> Result<(), NegotiationError> {
        if room_id.is_empty() {
            return Err(NegotiationError::EmptyRoomId);
        }
        info!("{} joining room {}", self.session.connection_id(), room_id);
        self.send(ClientMessage::Join(room_id))
    }

    /// Process events until the call fails, the queue closes, or signaling
    /// goes away. With `stall_timeout` set, spending that long in one
    /// negotiating state fails the session.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<NegotiationEvent>,
        stall_timeout: Option<Duration>,
    ) -> Result<ConnectionSession<F::Connection>, NegotiationError> {
        let mut last_state = self.session.state();
        let mut deadline: Option<Instant> = None;

        loop {
            let stalled = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = stalled => {
                    let err = NegotiationError::NegotiationStalled(last_state);
                    let err = self.abort(FailureReason::Stalled, err).await;
                    self.states.send_replace(self.session.state());
                    return Err(err);
                }

                event = events.recv() => {
                    let Some(event) = event else { break };
                    let closing = event == NegotiationEvent::SignalingClosed;

                    let handled = self.handle(event).await;
                    let state = self.session.state();
                    if state != last_state {
                        self.states.send_replace(state);
                    }
                    handled?;
                    if closing {
                        break;
                    }

                    if state != last_state {
                        debug!("{:?} -> {:?}", last_state, state);
                        last_state = state;
                        deadline = match stall_timeout {
                            Some(timeout) if state.is_negotiating() => Some(Instant::now() + timeout),
                            _ => None,
                        };
                    }
                }
            }
        }

        Ok(self.session)
    }

    pub async fn handle(&mut self, event: NegotiationEvent) -> Result<(), NegotiationError> {
        if self.session.state().is_failed() {
            debug!("Session failed, ignoring {:?}", event);
            return Ok(());
        }

        match event {
            NegotiationEvent::Signal(msg) => self.on_signal(msg).await,

            NegotiationEvent::LocalCandidate(candidate) => {
                let Some(room_id) = self.session.room_id().cloned() else {
                    return Ok(());
                };
                let envelope = serde_json::to_value(IceCandidateEnvelope {
                    room_id,
                    label: candidate.label,
                    candidate: candidate.candidate,
                })?;
                self.send(ClientMessage::WebrtcIceCandidate(envelope))
            }

            NegotiationEvent::RemoteTrack { track_id } => {
                let state = self.session.state();
                if state.is_negotiating() {
                    self.session.transition(NegotiationState::Connected)?;
                    info!("Remote track {} received, call connected", track_id);
                } else {
                    debug!("Remote track {} in {:?}", track_id, state);
                }
                Ok(())
            }

            NegotiationEvent::PeerConnectionFailed(reason) => {
                let err = NegotiationError::PeerConnection(reason);
                Err(self.abort(FailureReason::PeerConnection, err).await)
            }

            NegotiationEvent::SignalingClosed => {
                if self.session.state() == NegotiationState::Connected {
                    info!("Signaling closed, media continues peer to peer");
                    Ok(())
                } else {
                    let err = NegotiationError::SignalingClosed;
                    Err(self.abort(FailureReason::SignalingClosed, err).await)
                }
            }
        }
    }

    async fn on_signal(&mut self, msg: ServerMessage) -> Result<(), NegotiationError> {
        let state = self.session.state();
        let role = self.session.role();

        match msg {
            ServerMessage::RoomCreated(room_id) => self.on_room_outcome(Role::Creator, room_id).await,
            ServerMessage::RoomJoined(room_id) => self.on_room_outcome(Role::Joiner, room_id).await,

            ServerMessage::FullRoom => {
                if state == NegotiationState::Idle {
                    return Err(NegotiationError::RoomFull);
                }
                warn!("full_room received in {:?}", state);
                Ok(())
            }

            ServerMessage::UserJoined(room_id) => {
                if state.is_negotiating() || state == NegotiationState::Connected {
                    return Err(self.abort(FailureReason::UnexpectedPeer, NegotiationError::UnexpectedPeer).await);
                }
                info!("Peer arrived in room {}", room_id);
                Ok(())
            }

            ServerMessage::PeerLeft(room_id) => {
                if role.is_none() {
                    return Ok(());
                }
                info!("Peer left room {}", room_id);
                Err(self.abort(FailureReason::PeerGone, NegotiationError::PeerGone).await)
            }

            ServerMessage::StartCall => match (role, state) {
                (Some(Role::Creator), NegotiationState::LocalMediaReady) => {
                    match self.start_offer().await {
                        Ok(()) => Ok(()),
                        Err(e) => Err(self.abort(FailureReason::PeerConnection, e).await),
                    }
                }
                _ => {
                    warn!("Ignoring start_call as {:?} in {:?}", role, state);
                    Ok(())
                }
            },

            ServerMessage::WebrtcOffer(sdp) => match (role, state) {
                (Some(Role::Joiner), NegotiationState::LocalMediaReady) => {
                    match self.answer_offer(sdp).await {
                        Ok(()) => Ok(()),
                        Err(e) => Err(self.abort(FailureReason::PeerConnection, e).await),
                    }
                }
                _ => {
                    warn!("Ignoring webrtc_offer as {:?} in {:?}", role, state);
                    Ok(())
                }
            },

            ServerMessage::WebrtcAnswer(sdp) => match (role, state) {
                (Some(Role::Creator), NegotiationState::OfferSent) => {
                    match self.accept_answer(sdp).await {
                        Ok(()) => Ok(()),
                        Err(e) => Err(self.abort(FailureReason::PeerConnection, e).await),
                    }
                }
                _ => {
                    warn!("Ignoring webrtc_answer as {:?} in {:?}", role, state);
                    Ok(())
                }
            },

            ServerMessage::WebrtcIceCandidate(payload) => {
                match serde_json::from_value::<IceCandidateEnvelope>(payload) {
                    Ok(env) => {
                        self.on_remote_candidate(IceCandidate {
                            label: env.label,
                            candidate: env.candidate,
                        })
                        .await
                    }
                    Err(e) => warn!("Ignoring unreadable ICE candidate: {}", e),
                }
                Ok(())
            }

            ServerMessage::Error { message } => {
                warn!("Relay reported: {}", message);
                Ok(())
            }
        }
    }

    async fn on_room_outcome(&mut self, role: Role, room_id: RoomId) -> Result<(), NegotiationError> {
        if let Some(existing) = self.session.role() {
            warn!("Already {} in {:?}, ignoring {} outcome", existing, self.session.room_id(), role);
            return Ok(());
        }

        self.session.assign_role(role, room_id.clone())?;
        info!("Assigned {} in room {}", role, room_id);

        match self.media.acquire(&self.constraints).await {
            Ok(media) => {
                self.session.set_local_media(media);
                self.session.transition(NegotiationState::LocalMediaReady)?;
            }
            Err(e) => return Err(self.abort(FailureReason::MediaAcquisitionDenied, e).await),
        }

        if role == Role::Joiner {
            if let Err(e) = self.send(ClientMessage::StartCall(room_id)) {
                return Err(self.abort(FailureReason::SignalingClosed, e).await);
            }
        }
        Ok(())
    }

    /// Create the peer connection, attach and feed local tracks, then hook up
    /// callbacks.
    async fn open_peer_connection(&mut self) -> Result<(), NegotiationError> {
        let pc = self.factory.create().await?;
        self.session.attach_peer_connection(pc);

        let pc = self.peer()?;
        if let Some(media) = self.session.local_media() {
            pc.add_local_tracks(media).await?;
            for track in &media.tracks {
                match self.media.frames(track) {
                    Some(frames) => pc.send_frames(&track.id, frames).await?,
                    None => debug!("No frame feed for track {}", track.id),
                }
            }
        }
        pc.register_handlers(self.events.clone());
        self.session.transition(NegotiationState::PeerConnectionCreated)
    }

    async fn start_offer(&mut self) -> Result<(), NegotiationError> {
        self.open_peer_connection().await?;
        let offer = self.peer()?.create_offer().await?;
        self.send_description(offer)?;
        self.session.transition(NegotiationState::OfferSent)
    }

    async fn answer_offer(&mut self, sdp: serde_json::Value) -> Result<(), NegotiationError> {
        let offer: SessionDescription = serde_json::from_value(sdp)?;
        self.open_peer_connection().await?;
        self.apply_remote_description(offer).await?;
        self.session.transition(NegotiationState::OfferReceived)?;

        let answer = self.peer()?.create_answer().await?;
        self.send_description(answer)?;
        self.session.transition(NegotiationState::AnswerSent)
    }

    async fn accept_answer(&mut self, sdp: serde_json::Value) -> Result<(), NegotiationError> {
        let answer: SessionDescription = serde_json::from_value(sdp)?;
        self.apply_remote_description(answer).await?;
        self.session.transition(NegotiationState::AnswerReceived)
    }

    /// Set the remote description, then flush candidates that arrived before it.
    async fn apply_remote_description(&mut self, desc: SessionDescription) -> Result<(), NegotiationError> {
        self.peer()?.set_remote_description(desc).await?;
        self.session.mark_remote_description_applied();

        let pending = self.session.take_pending_candidates();
        if !pending.is_empty() {
            debug!("Applying {} queued candidate(s)", pending.len());
        }
        for candidate in pending {
            self.add_candidate(candidate).await;
        }
        Ok(())
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.session.remote_description_applied() {
            self.add_candidate(candidate).await;
        } else {
            debug!("Queueing candidate until the remote description is set");
            self.session.queue_candidate(candidate);
        }
    }

    async fn add_candidate(&self, candidate: IceCandidate) {
        let Some(pc) = self.session.peer_connection() else {
            return;
        };
        if let Err(e) = pc.add_ice_candidate(candidate).await {
            warn!("Failed to add ICE candidate: {}", e);
        }
    }

    fn peer(&self) -> Result<&F::Connection, NegotiationError> {
        self.session
            .peer_connection()
            .ok_or_else(|| NegotiationError::PeerConnection("no peer connection".to_string()))
    }

    fn send_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        let room_id = self
            .session
            .room_id()
            .cloned()
            .ok_or_else(|| NegotiationError::Signaling("not in a room".to_string()))?;

        let msg = match self.session.role() {
            Some(Role::Creator) => ClientMessage::WebrtcOffer(SdpEnvelope {
                kind: "webrtc_offer".to_string(),
                sdp: serde_json::to_value(&desc)?,
                room_id,
            }),
            _ => ClientMessage::WebrtcAnswer(SdpEnvelope {
                kind: "webrtc_answer".to_string(),
                sdp: serde_json::to_value(&desc)?,
                room_id,
            }),
        };
        self.send(msg)
    }

    fn send(&self, msg: ClientMessage) -> Result<(), NegotiationError> {
        self.outbound
            .send(msg)
            .map_err(|_| NegotiationError::SignalingClosed)
    }

    /// Mark the session failed and release the peer connection.
    async fn abort(&mut self, reason: FailureReason, err: NegotiationError) -> NegotiationError {
        warn!("Negotiation failed ({:?}): {}", reason, err);
        self.session.fail(reason);
        if let Some(pc) = self.session.peer_connection() {
            if let Err(e) = pc.close().await {
                debug!("Closing peer connection: {}", e);
            }
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::participant::media::{
        FrameSource, LocalMedia, LocalTrack, PlaceholderFrames, TrackKind,
    };
    use crate::participant::peer::SdpKind;

    #[derive(Debug, Clone, PartialEq)]
    enum Op {
        AddTracks(usize),
        SendFrames(String),
        RegisterHandlers,
        CreateOffer,
        CreateAnswer,
        SetRemote(SdpKind),
        AddCandidate(String),
        Close,
    }

    type Log = Arc<Mutex<Vec<Op>>>;

    struct FakePeer {
        log: Log,
        reject_remote: bool,
    }

    #[async_trait]
    impl PeerConnection for FakePeer {
        async fn add_local_tracks(&self, media: &LocalMedia) -> Result<(), NegotiationError> {
            self.log.lock().unwrap().push(Op::AddTracks(media.tracks.len()));
            Ok(())
        }

        async fn send_frames(
            &self,
            track_id: &str,
            _frames: Box<dyn FrameSource>,
        ) -> Result<(), NegotiationError> {
            self.log.lock().unwrap().push(Op::SendFrames(track_id.to_string()));
            Ok(())
        }

        fn register_handlers(&self, _events: EventSink) {
            self.log.lock().unwrap().push(Op::RegisterHandlers);
        }

        async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
            self.log.lock().unwrap().push(Op::CreateOffer);
            Ok(SessionDescription {
                kind: SdpKind::Offer,
                sdp: "fake-offer".to_string(),
            })
        }

        async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
            self.log.lock().unwrap().push(Op::CreateAnswer);
            Ok(SessionDescription {
                kind: SdpKind::Answer,
                sdp: "fake-answer".to_string(),
            })
        }

        async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
            if self.reject_remote {
                return Err(NegotiationError::PeerConnection("rejected".to_string()));
            }
            self.log.lock().unwrap().push(Op::SetRemote(desc.kind));
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
            self.log.lock().unwrap().push(Op::AddCandidate(candidate.candidate));
            Ok(())
        }

        async fn close(&self) -> Result<(), NegotiationError> {
            self.log.lock().unwrap().push(Op::Close);
            Ok(())
        }
    }

    struct FakeFactory {
        log: Log,
        reject_remote: bool,
    }

    #[async_trait]
    impl PeerConnectionFactory for FakeFactory {
        type Connection = FakePeer;

        async fn create(&self) -> Result<FakePeer, NegotiationError> {
            Ok(FakePeer {
                log: self.log.clone(),
                reject_remote: self.reject_remote,
            })
        }
    }

    struct FakeMedia {
        deny: bool,
        feeds: bool,
    }

    #[async_trait]
    impl MediaSource for FakeMedia {
        async fn acquire(&self, _constraints: &MediaConstraints) -> Result<LocalMedia, NegotiationError> {
            if self.deny {
                return Err(NegotiationError::MediaAcquisitionDenied("permission denied".to_string()));
            }
            Ok(LocalMedia {
                stream_id: "local".to_string(),
                tracks: vec![
                    LocalTrack {
                        id: "a".to_string(),
                        kind: TrackKind::Audio,
                    },
                    LocalTrack {
                        id: "v".to_string(),
                        kind: TrackKind::Video,
                    },
                ],
            })
        }

        fn frames(&self, track: &LocalTrack) -> Option<Box<dyn FrameSource>> {
            self.feeds
                .then(|| Box::new(PlaceholderFrames::for_kind(track.kind)) as Box<dyn FrameSource>)
        }
    }

    struct Harness {
        orch: NegotiationOrchestrator<FakeFactory, FakeMedia>,
        outbound: mpsc::UnboundedReceiver<ClientMessage>,
        events_tx: EventSink,
        events_rx: mpsc::UnboundedReceiver<NegotiationEvent>,
        log: Log,
    }

    impl Harness {
        fn new(deny_media: bool, reject_remote: bool) -> Self {
            let log: Log = Arc::new(Mutex::new(Vec::new()));
            let (out_tx, outbound) = mpsc::unbounded_channel();
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let orch = NegotiationOrchestrator::new(
                FakeFactory {
                    log: log.clone(),
                    reject_remote,
                },
                FakeMedia {
                    deny: deny_media,
                    feeds: false,
                },
                MediaConstraints::default(),
                out_tx,
                events_tx.clone(),
            );
            Self {
                orch,
                outbound,
                events_tx,
                events_rx,
                log,
            }
        }

        fn ok() -> Self {
            Self::new(false, false)
        }

        async fn signal(&mut self, msg: ServerMessage) -> Result<(), NegotiationError> {
            self.orch.handle(NegotiationEvent::Signal(msg)).await
        }

        fn sent(&mut self) -> Vec<ClientMessage> {
            let mut out = Vec::new();
            while let Ok(msg) = self.outbound.try_recv() {
                out.push(msg);
            }
            out
        }

        fn ops(&self) -> Vec<Op> {
            self.log.lock().unwrap().clone()
        }
    }

    fn r1() -> RoomId {
        RoomId::from("r1")
    }

    fn remote_candidate(text: &str) -> ServerMessage {
        ServerMessage::WebrtcIceCandidate(json!({"roomId": "r1", "label": 0, "candidate": text}))
    }

    async fn creator_in_offer_sent(h: &mut Harness) {
        h.signal(ServerMessage::RoomCreated(r1())).await.unwrap();
        h.signal(ServerMessage::UserJoined(r1())).await.unwrap();
        h.signal(ServerMessage::StartCall).await.unwrap();
        assert_eq!(h.orch.state(), NegotiationState::OfferSent);
    }

    async fn joiner_in_answer_sent(h: &mut Harness) {
        h.signal(ServerMessage::RoomJoined(r1())).await.unwrap();
        h.signal(ServerMessage::WebrtcOffer(json!({"type": "offer", "sdp": "remote-offer"})))
            .await
            .unwrap();
        assert_eq!(h.orch.state(), NegotiationState::AnswerSent);
    }

    #[test]
    fn join_sends_join_request() {
        let mut h = Harness::ok();
        h.orch.join(r1()).unwrap();
        assert_eq!(h.sent(), vec![ClientMessage::Join(r1())]);
        assert_eq!(h.orch.state(), NegotiationState::Idle);
    }

    #[test]
    fn join_rejects_empty_room_id() {
        let mut h = Harness::ok();
        assert!(matches!(h.orch.join(RoomId::from("")), Err(NegotiationError::EmptyRoomId)));
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn creator_waits_for_start_call_after_media() {
        let mut h = Harness::ok();
        h.signal(ServerMessage::RoomCreated(r1())).await.unwrap();

        assert_eq!(h.orch.session().role(), Some(Role::Creator));
        assert_eq!(h.orch.state(), NegotiationState::LocalMediaReady);
        assert!(h.sent().is_empty());
        assert!(h.ops().is_empty());
    }

    #[tokio::test]
    async fn creator_offers_on_start_call() {
        let mut h = Harness::ok();
        creator_in_offer_sent(&mut h).await;

        assert_eq!(h.ops(), vec![Op::AddTracks(2), Op::RegisterHandlers, Op::CreateOffer]);
        assert_eq!(
            h.sent(),
            vec![ClientMessage::WebrtcOffer(SdpEnvelope {
                kind: "webrtc_offer".to_string(),
                sdp: json!({"type": "offer", "sdp": "fake-offer"}),
                room_id: r1(),
            })]
        );
    }

    #[tokio::test]
    async fn creator_applies_answer_then_connects() {
        let mut h = Harness::ok();
        creator_in_offer_sent(&mut h).await;

        h.signal(ServerMessage::WebrtcAnswer(json!({"type": "answer", "sdp": "remote-answer"})))
            .await
            .unwrap();
        assert_eq!(h.orch.state(), NegotiationState::AnswerReceived);
        assert!(h.orch.session().remote_description_applied());
        assert_eq!(h.ops().last(), Some(&Op::SetRemote(SdpKind::Answer)));

        h.orch
            .handle(NegotiationEvent::RemoteTrack {
                track_id: "remote-video".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(h.orch.state(), NegotiationState::Connected);
    }

    #[tokio::test]
    async fn joiner_sends_start_call_once_media_ready() {
        let mut h = Harness::ok();
        h.signal(ServerMessage::RoomJoined(r1())).await.unwrap();

        assert_eq!(h.orch.session().role(), Some(Role::Joiner));
        assert_eq!(h.orch.state(), NegotiationState::LocalMediaReady);
        assert_eq!(h.sent(), vec![ClientMessage::StartCall(r1())]);
    }

    #[tokio::test]
    async fn joiner_answers_offer() {
        let mut h = Harness::ok();
        joiner_in_answer_sent(&mut h).await;

        assert_eq!(
            h.ops(),
            vec![
                Op::AddTracks(2),
                Op::RegisterHandlers,
                Op::SetRemote(SdpKind::Offer),
                Op::CreateAnswer,
            ]
        );
        let sent = h.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[1],
            ClientMessage::WebrtcAnswer(SdpEnvelope {
                kind: "webrtc_answer".to_string(),
                sdp: json!({"type": "answer", "sdp": "fake-answer"}),
                room_id: r1(),
            })
        );
    }

    #[tokio::test]
    async fn media_denied_fails_before_start_call() {
        let mut h = Harness::new(true, false);
        let err = h.signal(ServerMessage::RoomJoined(r1())).await.unwrap_err();

        assert!(matches!(err, NegotiationError::MediaAcquisitionDenied(_)));
        assert_eq!(
            h.orch.state(),
            NegotiationState::Failed(FailureReason::MediaAcquisitionDenied)
        );
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn full_room_never_enters_state_machine() {
        let mut h = Harness::ok();
        let err = h.signal(ServerMessage::FullRoom).await.unwrap_err();

        assert!(matches!(err, NegotiationError::RoomFull));
        assert_eq!(h.orch.state(), NegotiationState::Idle);
        assert_eq!(h.orch.session().role(), None);
    }

    #[tokio::test]
    async fn early_candidates_are_queued_then_flushed_in_order() {
        let mut h = Harness::ok();
        h.signal(ServerMessage::RoomJoined(r1())).await.unwrap();
        h.signal(remote_candidate("c1")).await.unwrap();
        h.signal(remote_candidate("c2")).await.unwrap();

        assert_eq!(h.orch.session().pending_candidates().len(), 2);
        assert!(h.ops().is_empty());

        h.signal(ServerMessage::WebrtcOffer(json!({"type": "offer", "sdp": "remote-offer"})))
            .await
            .unwrap();

        assert_eq!(
            h.ops(),
            vec![
                Op::AddTracks(2),
                Op::RegisterHandlers,
                Op::SetRemote(SdpKind::Offer),
                Op::AddCandidate("c1".to_string()),
                Op::AddCandidate("c2".to_string()),
                Op::CreateAnswer,
            ]
        );
        assert!(h.orch.session().pending_candidates().is_empty());
    }

    #[tokio::test]
    async fn creator_queues_candidates_until_answer() {
        let mut h = Harness::ok();
        creator_in_offer_sent(&mut h).await;
        h.signal(remote_candidate("c1")).await.unwrap();
        assert_eq!(h.orch.session().pending_candidates().len(), 1);

        h.signal(ServerMessage::WebrtcAnswer(json!({"type": "answer", "sdp": "remote-answer"})))
            .await
            .unwrap();
        let ops = h.ops();
        assert_eq!(
            &ops[ops.len() - 2..],
            &[Op::SetRemote(SdpKind::Answer), Op::AddCandidate("c1".to_string())]
        );
    }

    #[tokio::test]
    async fn late_candidates_are_applied_immediately() {
        let mut h = Harness::ok();
        joiner_in_answer_sent(&mut h).await;
        h.signal(remote_candidate("c3")).await.unwrap();

        assert_eq!(h.ops().last(), Some(&Op::AddCandidate("c3".to_string())));
        assert!(h.orch.session().pending_candidates().is_empty());
    }

    #[tokio::test]
    async fn local_candidates_are_sent_with_room_id() {
        let mut h = Harness::ok();
        creator_in_offer_sent(&mut h).await;
        h.sent();

        h.orch
            .handle(NegotiationEvent::LocalCandidate(IceCandidate {
                label: Some(1),
                candidate: "candidate:local".to_string(),
            }))
            .await
            .unwrap();
        assert_eq!(
            h.sent(),
            vec![ClientMessage::WebrtcIceCandidate(json!({
                "roomId": "r1",
                "label": 1,
                "candidate": "candidate:local"
            }))]
        );
    }

    #[tokio::test]
    async fn unreadable_remote_candidate_is_skipped() {
        let mut h = Harness::ok();
        joiner_in_answer_sent(&mut h).await;

        h.signal(ServerMessage::WebrtcIceCandidate(json!({"roomId": "r1", "label": 0})))
            .await
            .unwrap();
        h.signal(ServerMessage::WebrtcIceCandidate(json!({
            "roomId": "r1",
            "candidate": "c4",
            "sdpMid": "0"
        })))
        .await
        .unwrap();

        assert_eq!(h.orch.state(), NegotiationState::AnswerSent);
        assert_eq!(h.ops().last(), Some(&Op::AddCandidate("c4".to_string())));
    }

    #[tokio::test]
    async fn granted_tracks_are_fed_before_handlers_are_registered() {
        let mut h = Harness::ok();
        h.orch.media.feeds = true;
        creator_in_offer_sent(&mut h).await;

        assert_eq!(
            h.ops(),
            vec![
                Op::AddTracks(2),
                Op::SendFrames("a".to_string()),
                Op::SendFrames("v".to_string()),
                Op::RegisterHandlers,
                Op::CreateOffer,
            ]
        );
    }

    #[tokio::test]
    async fn subscribers_see_state_changes_from_run() {
        let h = Harness::ok();
        let mut states = h.orch.subscribe();
        let tx = h.events_tx.clone();
        let run = tokio::spawn(h.orch.run(h.events_rx, None));

        tx.send(NegotiationEvent::Signal(ServerMessage::RoomCreated(r1()))).unwrap();
        tx.send(NegotiationEvent::Signal(ServerMessage::StartCall)).unwrap();
        tx.send(NegotiationEvent::Signal(ServerMessage::WebrtcAnswer(
            json!({"type": "answer", "sdp": "a"}),
        )))
        .unwrap();
        tx.send(NegotiationEvent::RemoteTrack {
            track_id: "t".to_string(),
        })
        .unwrap();

        states
            .wait_for(|state| *state == NegotiationState::Connected)
            .await
            .unwrap();

        tx.send(NegotiationEvent::Signal(ServerMessage::PeerLeft(r1()))).unwrap();
        assert!(matches!(run.await.unwrap(), Err(NegotiationError::PeerGone)));
        assert_eq!(
            *states.borrow(),
            NegotiationState::Failed(FailureReason::PeerGone)
        );
    }

    #[tokio::test]
    async fn roles_never_change() {
        let mut h = Harness::ok();
        h.signal(ServerMessage::RoomCreated(r1())).await.unwrap();
        h.signal(ServerMessage::RoomJoined(RoomId::from("r2"))).await.unwrap();

        assert_eq!(h.orch.session().role(), Some(Role::Creator));
        assert_eq!(h.orch.session().room_id(), Some(&r1()));
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn creator_ignores_offers_and_joiner_ignores_start_call() {
        let mut h = Harness::ok();
        h.signal(ServerMessage::RoomCreated(r1())).await.unwrap();
        h.signal(ServerMessage::WebrtcOffer(json!({"type": "offer", "sdp": "x"})))
            .await
            .unwrap();
        assert_eq!(h.orch.state(), NegotiationState::LocalMediaReady);

        let mut j = Harness::ok();
        j.signal(ServerMessage::RoomJoined(r1())).await.unwrap();
        j.signal(ServerMessage::StartCall).await.unwrap();
        j.signal(ServerMessage::WebrtcAnswer(json!({"type": "answer", "sdp": "x"})))
            .await
            .unwrap();
        assert_eq!(j.orch.state(), NegotiationState::LocalMediaReady);
        assert!(j.ops().is_empty());
    }

    #[tokio::test]
    async fn peer_left_is_terminal() {
        let mut h = Harness::ok();
        creator_in_offer_sent(&mut h).await;
        h.orch
            .handle(NegotiationEvent::RemoteTrack {
                track_id: "t".to_string(),
            })
            .await
            .unwrap();

        let err = h.signal(ServerMessage::PeerLeft(r1())).await.unwrap_err();
        assert!(matches!(err, NegotiationError::PeerGone));
        assert_eq!(h.orch.state(), NegotiationState::Failed(FailureReason::PeerGone));
        assert_eq!(h.ops().last(), Some(&Op::Close));

        // nothing after failure moves the session
        h.signal(ServerMessage::StartCall).await.unwrap();
        assert_eq!(h.orch.state(), NegotiationState::Failed(FailureReason::PeerGone));
    }

    #[tokio::test]
    async fn new_peer_during_negotiation_is_terminal() {
        let mut h = Harness::ok();
        joiner_in_answer_sent(&mut h).await;

        let err = h.signal(ServerMessage::UserJoined(r1())).await.unwrap_err();
        assert!(matches!(err, NegotiationError::UnexpectedPeer));
        assert_eq!(h.orch.state(), NegotiationState::Failed(FailureReason::UnexpectedPeer));
    }

    #[tokio::test]
    async fn rejected_description_is_terminal() {
        let mut h = Harness::new(false, true);
        h.signal(ServerMessage::RoomJoined(r1())).await.unwrap();
        let err = h
            .signal(ServerMessage::WebrtcOffer(json!({"type": "offer", "sdp": "bad"})))
            .await
            .unwrap_err();

        assert!(matches!(err, NegotiationError::PeerConnection(_)));
        assert_eq!(h.orch.state(), NegotiationState::Failed(FailureReason::PeerConnection));
    }

    #[tokio::test]
    async fn malformed_offer_is_terminal() {
        let mut h = Harness::ok();
        h.signal(ServerMessage::RoomJoined(r1())).await.unwrap();
        let err = h
            .signal(ServerMessage::WebrtcOffer(json!({"sdp": 42})))
            .await
            .unwrap_err();

        assert!(matches!(err, NegotiationError::InvalidPayload(_)));
        assert_eq!(h.orch.state(), NegotiationState::Failed(FailureReason::PeerConnection));
    }

    #[tokio::test]
    async fn peer_connection_failure_is_terminal() {
        let mut h = Harness::ok();
        creator_in_offer_sent(&mut h).await;

        let err = h
            .orch
            .handle(NegotiationEvent::PeerConnectionFailed("ice failed".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::PeerConnection(_)));
        assert_eq!(h.orch.state(), NegotiationState::Failed(FailureReason::PeerConnection));
    }

    #[tokio::test]
    async fn run_ends_cleanly_when_signaling_closes_after_connect() {
        let h = Harness::ok();
        let tx = h.events_tx.clone();
        let (orch, events_rx) = (h.orch, h.events_rx);

        for event in [
            NegotiationEvent::Signal(ServerMessage::RoomCreated(r1())),
            NegotiationEvent::Signal(ServerMessage::StartCall),
            NegotiationEvent::Signal(ServerMessage::WebrtcAnswer(json!({"type": "answer", "sdp": "a"}))),
            NegotiationEvent::RemoteTrack {
                track_id: "t".to_string(),
            },
            NegotiationEvent::SignalingClosed,
        ] {
            tx.send(event).unwrap();
        }

        let session = orch.run(events_rx, Some(Duration::from_secs(30))).await.unwrap();
        assert_eq!(session.state(), NegotiationState::Connected);
    }

    #[tokio::test]
    async fn run_fails_when_signaling_closes_mid_negotiation() {
        let h = Harness::ok();
        let tx = h.events_tx.clone();
        tx.send(NegotiationEvent::Signal(ServerMessage::RoomJoined(r1()))).unwrap();
        tx.send(NegotiationEvent::SignalingClosed).unwrap();

        let result = h.orch.run(h.events_rx, None).await;
        assert!(matches!(result, Err(NegotiationError::SignalingClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn run_reports_stalled_negotiation() {
        let h = Harness::ok();
        let tx = h.events_tx.clone();
        tx.send(NegotiationEvent::Signal(ServerMessage::RoomCreated(r1()))).unwrap();
        tx.send(NegotiationEvent::Signal(ServerMessage::StartCall)).unwrap();

        let result = h.orch.run(h.events_rx, Some(Duration::from_secs(5))).await;
        assert!(matches!(
            result,
            Err(NegotiationError::NegotiationStalled(NegotiationState::OfferSent))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_for_a_peer_is_not_a_stall() {
        let h = Harness::ok();
        let tx = h.events_tx.clone();
        tx.send(NegotiationEvent::Signal(ServerMessage::RoomCreated(r1()))).unwrap();

        let run = tokio::spawn(h.orch.run(h.events_rx, Some(Duration::from_secs(5))));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!run.is_finished());

        tx.send(NegotiationEvent::SignalingClosed).unwrap();
        let result = run.await.unwrap();
        assert!(matches!(result, Err(NegotiationError::SignalingClosed)));
    }
}
