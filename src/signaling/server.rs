use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tracing::{debug, error, info, warn};

use super::messages::{ClientMessage, ServerMessage};
use super::registry::RoomRegistryHandle;
use super::router::SignalingRouter;
use super::types::{ConnectionId, JoinOutcome, OutboundMessage};

pub const DEFAULT_SIGNALING_PORT: u16 = 3892;
const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Listen port, taken from `PORT` when set to a valid number.
pub fn port_from_env() -> u16 {
    std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_SIGNALING_PORT)
}

pub struct SignalingServer {
    router: SignalingRouter,
}

impl Default for SignalingServer {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalingServer {
    pub fn new() -> Self {
        Self {
            router: SignalingRouter::new(RoomRegistryHandle::spawn()),
        }
    }

    pub fn registry(&self) -> &RoomRegistryHandle {
        self.router.registry()
    }

    pub async fn run(&self, addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("Signaling server listening on {}", addr);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            let router = self.router.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, router).await {
                    error!("Connection error from {}: {}", addr, e);
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    router: SignalingRouter,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let conn_id = ConnectionId::generate();
    info!("WebSocket connection {} from {}", conn_id, addr);

    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundMessage>();
    let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<Message>();

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    let mut waiting_for_pong = false;
    let mut pong_deadline: Option<tokio::time::Instant> = None;

    let send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(msg) = rx.recv() => {
                    let ws_msg = Message::Text(msg.into_inner());
                    if ws_tx.send(ws_msg).await.is_err() {
                        break;
                    }
                }
                Some(ctrl_msg) = ctrl_rx.recv() => {
                    if ws_tx.send(ctrl_msg).await.is_err() {
                        break;
                    }
                }
                else => break,
            }
        }
    });

    loop {
        let pong_timeout = async {
            match pong_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = ping_interval.tick() => {
                if waiting_for_pong {
                    warn!("No Pong received, disconnecting {}", conn_id);
                    break;
                }
                if ctrl_tx.send(Message::Ping(Bytes::new())).is_err() {
                    break;
                }
                waiting_for_pong = true;
                pong_deadline = Some(tokio::time::Instant::now() + PONG_TIMEOUT);
                debug!("Ping sent to {}", conn_id);
            }

            _ = pong_timeout => {
                warn!("Pong timeout, disconnecting {}", conn_id);
                break;
            }

            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                };

                match msg {
                    Message::Text(text) => {
                        if let Err(e) = handle_text_message(&text, &tx, &router, conn_id).await {
                            warn!("Message handling error: {}", e);
                        }
                    }
                    Message::Pong(_) => {
                        waiting_for_pong = false;
                        pong_deadline = None;
                        debug!("Pong received from {}", conn_id);
                    }
                    Message::Close(_) => {
                        info!("Close received from {}", conn_id);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    router.registry().leave(&conn_id).await;

    send_task.abort();
    info!("WebSocket disconnected: {} ({})", conn_id, addr);

    Ok(())
}

fn send(
    tx: &mpsc::UnboundedSender<OutboundMessage>,
    msg: &ServerMessage,
) -> Result<(), serde_json::Error> {
    let _ = tx.send(OutboundMessage::from(serde_json::to_string(msg)?));
    Ok(())
}

async fn handle_text_message(
    text: &str,
    tx: &mpsc::UnboundedSender<OutboundMessage>,
    router: &SignalingRouter,
    conn_id: ConnectionId,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            let err = ServerMessage::Error {
                message: format!("Invalid message: {}", e),
            };
            send(tx, &err)?;
            return Ok(());
        }
    };

    match client_msg {
        ClientMessage::Join(room_id) => {
            match router.registry().join(room_id.clone(), conn_id, tx.clone()).await {
                Ok(outcome) => {
                    let response = match outcome {
                        JoinOutcome::Created => ServerMessage::RoomCreated(room_id),
                        JoinOutcome::Joined => ServerMessage::RoomJoined(room_id),
                        JoinOutcome::Full => ServerMessage::FullRoom,
                    };
                    send(tx, &response)?;
                }
                Err(e) => {
                    let err = ServerMessage::Error {
                        message: e.to_string(),
                    };
                    send(tx, &err)?;
                }
            }
        }

        ClientMessage::Leave => {
            router.registry().leave(&conn_id).await;
        }

        other => {
            // InvalidSender is reported by the router and otherwise ignored
            let _ = router.route(&conn_id, other).await;
        }
    }

    Ok(())
}
