use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::signaling::{ClientMessage, RoomId, ServerMessage};

use super::error::NegotiationError;
use super::media::{MediaConstraints, MediaSource};
use super::orchestrator::NegotiationOrchestrator;
use super::peer::{EventSink, NegotiationEvent, PeerConnectionFactory};
use super::rtc::DEFAULT_STUN_SERVERS;
use super::session::NegotiationState;

const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ParticipantConfig {
    pub ice_servers: Vec<String>,
    pub constraints: MediaConstraints,
    /// `None` waits forever in a negotiating state.
    pub negotiation_timeout: Option<Duration>,
}

impl Default for ParticipantConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            constraints: MediaConstraints::default(),
            negotiation_timeout: Some(DEFAULT_NEGOTIATION_TIMEOUT),
        }
    }
}

/// WebSocket link to the relay. Outbound messages go through `sender()`,
/// inbound frames become [`NegotiationEvent::Signal`].
pub struct SignalingClient {
    tx: mpsc::UnboundedSender<ClientMessage>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl SignalingClient {
    pub async fn connect(url: &str, events: EventSink) -> Result<Self, NegotiationError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| NegotiationError::Signaling(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();
        info!("Connected to relay at {}", url);

        let (tx, mut outgoing_rx) = mpsc::unbounded_channel::<ClientMessage>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to encode {}: {}", msg.kind(), e);
                        continue;
                    }
                };
                debug!("Sending {}", msg.kind());
                if write.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(signal) => {
                            debug!("Received {}", signal.kind());
                            if events.send(NegotiationEvent::Signal(signal)).is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!("Unreadable frame from relay: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
            let _ = events.send(NegotiationEvent::SignalingClosed);
        });

        Ok(Self { tx, writer, reader })
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<ClientMessage> {
        self.tx.clone()
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
    }
}

/// A room join in flight: the relay link plus the orchestrator negotiating
/// over it.
pub struct Call<F: PeerConnectionFactory, M: MediaSource> {
    client: SignalingClient,
    orchestrator: NegotiationOrchestrator<F, M>,
    events: mpsc::UnboundedReceiver<NegotiationEvent>,
    negotiation_timeout: Option<Duration>,
}

impl<F: PeerConnectionFactory, M: MediaSource> Call<F, M> {
    /// Connect to the relay and ask to join `room_id`.
    pub async fn join(
        url: &str,
        room_id: RoomId,
        factory: F,
        media: M,
        config: ParticipantConfig,
    ) -> Result<Self, NegotiationError> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let client = SignalingClient::connect(url, events_tx.clone()).await?;

        let mut orchestrator = NegotiationOrchestrator::new(
            factory,
            media,
            config.constraints,
            client.sender(),
            events_tx,
        );
        orchestrator.join(room_id)?;

        Ok(Self {
            client,
            orchestrator,
            events,
            negotiation_timeout: config.negotiation_timeout,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<NegotiationState> {
        self.orchestrator.subscribe()
    }

    /// Negotiate until the call ends. Returns the final state when signaling
    /// closes after the call connected.
    pub async fn run(self) -> Result<NegotiationState, NegotiationError> {
        let Call {
            client,
            orchestrator,
            events,
            negotiation_timeout,
        } = self;

        let result = orchestrator.run(events, negotiation_timeout).await;
        drop(client);
        Ok(result?.state())
    }
}

/// Connect to the relay, join `room_id` and negotiate until the call ends.
pub async fn run_call<F, M>(
    url: &str,
    room_id: RoomId,
    factory: F,
    media: M,
    config: ParticipantConfig,
) -> Result<NegotiationState, NegotiationError>
where
    F: PeerConnectionFactory,
    M: MediaSource,
{
    Call::join(url, room_id, factory, media, config)
        .await?
        .run()
        .await
}
