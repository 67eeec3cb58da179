use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::SignalingError;
use crate::types::{PeerId, RoomId};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Room-scoped messages exchanged with the relay. Offer and answer payloads
/// are opaque session-description blobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// relay -> client, first frame on a new connection
    Welcome { peer_id: PeerId },
    Join { room_id: RoomId },
    Leave { room_id: RoomId },
    /// Participants already in the room when we joined
    Roster { peers: Vec<PeerId> },
    /// A newcomer addressed us with its offer
    Arrival { sender_id: PeerId, offer: String },
    Offer {
        target_id: PeerId,
        sender_id: PeerId,
        offer: String,
    },
    Answer { target_id: PeerId, answer: String },
    AnswerDelivery { sender_id: PeerId, answer: String },
    Departure { peer_id: PeerId },
    /// Advisory only; media keeps flowing without it
    StreamUpdated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<PeerId>,
    },
    Error { message: String },
}

impl SignalingMessage {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Welcome { .. } => "welcome",
            SignalingMessage::Join { .. } => "join",
            SignalingMessage::Leave { .. } => "leave",
            SignalingMessage::Roster { .. } => "roster",
            SignalingMessage::Arrival { .. } => "arrival",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::AnswerDelivery { .. } => "answer-delivery",
            SignalingMessage::Departure { .. } => "departure",
            SignalingMessage::StreamUpdated { .. } => "stream-updated",
            SignalingMessage::Error { .. } => "error",
        }
    }

    /// Messages that only make sense once the local side has joined
    #[must_use]
    pub fn needs_ready_room(&self) -> bool {
        matches!(
            self,
            SignalingMessage::Roster { .. }
                | SignalingMessage::Arrival { .. }
                | SignalingMessage::AnswerDelivery { .. }
                | SignalingMessage::Departure { .. }
                | SignalingMessage::StreamUpdated { .. }
        )
    }
}

/// Outbound half of the relay. Inbound messages arrive on the receiver handed
/// out alongside the client.
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Session id the relay assigned to this connection
    fn local_id(&self) -> PeerId;

    async fn send(&self, msg: SignalingMessage) -> Result<(), SignalingError>;
}

pub struct WsRelayClient {
    local_id: PeerId,
    tx: mpsc::Sender<String>,
}

impl WsRelayClient {
    pub async fn connect(
        url: &str,
        capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<SignalingMessage>), SignalingError> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<String>(capacity);

        // Frames that beat the welcome are held here; nobody reads the
        // inbound receiver until connect returns.
        let mut early = Vec::new();
        let local_id = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            while let Some(frame) = read.next().await {
                let Some(msg) = decode_frame(frame?) else {
                    continue;
                };
                match msg {
                    SignalingMessage::Welcome { peer_id } => return Ok(peer_id),
                    other => early.push(other),
                }
            }
            Err(SignalingError::Handshake(
                "relay closed before welcome".to_string(),
            ))
        })
        .await
        .map_err(|_| SignalingError::Handshake("timed out waiting for welcome".to_string()))??;

        info!(peer = %local_id, url, early = early.len(), "connected to relay");

        // Handle outgoing messages
        tokio::spawn(async move {
            while let Some(json) = outgoing_rx.recv().await {
                if let Err(e) = write.send(Message::Text(json)).await {
                    warn!("relay write failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Handle incoming messages
        tokio::spawn(async move {
            for msg in early {
                if inbound_tx.send(msg).await.is_err() {
                    return;
                }
            }
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Close(_)) => break,
                    Ok(frame) => {
                        if let Some(msg) = decode_frame(frame) {
                            if inbound_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("relay read failed: {}", e);
                        break;
                    }
                }
            }
            debug!("relay reader finished");
        });

        Ok((
            Self {
                local_id,
                tx: outgoing_tx,
            },
            inbound_rx,
        ))
    }
}

fn decode_frame(frame: Message) -> Option<SignalingMessage> {
    let Message::Text(text) = frame else {
        return None;
    };
    match serde_json::from_str::<SignalingMessage>(&text) {
        Ok(msg) => Some(msg),
        Err(e) => {
            warn!("dropping undecodable relay frame: {}", e);
            None
        }
    }
}

#[async_trait]
impl RelayClient for WsRelayClient {
    fn local_id(&self) -> PeerId {
        self.local_id.clone()
    }

    async fn send(&self, msg: SignalingMessage) -> Result<(), SignalingError> {
        let json = serde_json::to_string(&msg)?;
        self.tx
            .send(json)
            .await
            .map_err(|_| SignalingError::ChannelClosed)
    }
}
