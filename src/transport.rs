//! Point-to-point media transport behind a [`PeerConnection`](crate::connection::PeerConnection).
//!
//! Signaling is non-trickle: offers and answers are only handed out once ICE
//! gathering has finished, so every description already carries all local
//! candidates and a pairing needs exactly one offer/answer round trip.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::error::NegotiationError;
use crate::media::StreamHandle;
use crate::types::PeerId;

/// What a transport reports about itself
#[derive(Clone)]
pub enum TransportEvent {
    /// Media session is up
    Established,
    Failed(String),
    Closed,
    RemoteTrack(Arc<TrackRemote>),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::Established => write!(f, "Established"),
            TransportEvent::Failed(reason) => write!(f, "Failed({reason})"),
            TransportEvent::Closed => write!(f, "Closed"),
            TransportEvent::RemoteTrack(track) => write!(f, "RemoteTrack({})", track.id()),
        }
    }
}

/// Transport event tagged with the connection it belongs to
#[derive(Debug)]
pub struct TransportNotice {
    pub remote: PeerId,
    pub conn_id: u64,
    pub event: TransportEvent,
}

/// Where a transport sends its events. Callbacks may fire on any runtime
/// thread; the sink only enqueues.
#[derive(Clone)]
pub struct TransportEventSink {
    remote: PeerId,
    conn_id: u64,
    tx: mpsc::UnboundedSender<TransportNotice>,
}

impl TransportEventSink {
    pub fn new(remote: PeerId, conn_id: u64, tx: mpsc::UnboundedSender<TransportNotice>) -> Self {
        Self {
            remote,
            conn_id,
            tx,
        }
    }

    #[must_use]
    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    #[must_use]
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(TransportNotice {
            remote: self.remote.clone(),
            conn_id: self.conn_id,
            event,
        });
    }
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Add the stream's tracks as outbound media
    async fn attach(&self, stream: &StreamHandle) -> Result<(), NegotiationError>;

    /// Complete local offer including all gathered candidates
    async fn create_offer(&self) -> Result<String, NegotiationError>;

    async fn apply_offer(&self, offer: &str) -> Result<(), NegotiationError>;

    /// Complete local answer including all gathered candidates
    async fn create_answer(&self) -> Result<String, NegotiationError>;

    async fn apply_answer(&self, answer: &str) -> Result<(), NegotiationError>;

    /// Swap outbound tracks in place, no renegotiation
    async fn replace_outbound(&self, stream: &StreamHandle) -> Result<(), NegotiationError>;

    /// Stop sending local media without closing
    async fn detach(&self) -> Result<(), NegotiationError>;

    async fn close(&self) -> Result<(), NegotiationError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        events: TransportEventSink,
    ) -> Result<Arc<dyn MediaTransport>, NegotiationError>;
}

/// webrtc-rs transports
pub struct RtcTransportFactory {
    ice_servers: Vec<String>,
}

impl RtcTransportFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        events: TransportEventSink,
    ) -> Result<Arc<dyn MediaTransport>, NegotiationError> {
        let transport = RtcTransport::new(&self.ice_servers, events).await?;
        Ok(Arc::new(transport))
    }
}

pub struct RtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    senders: Mutex<Vec<(RTPCodecType, Arc<RTCRtpSender>)>>,
}

impl RtcTransport {
    pub async fn new(
        ice_servers: &[String],
        events: TransportEventSink,
    ) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(config).await?);

        let sink = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let sink = sink.clone();
                Box::pin(async move {
                    debug!(peer = %sink.remote(), "peer connection state has changed: {}", s);
                    match s {
                        RTCPeerConnectionState::Connected => sink.emit(TransportEvent::Established),
                        RTCPeerConnectionState::Failed => {
                            sink.emit(TransportEvent::Failed("connectivity lost".to_string()))
                        }
                        RTCPeerConnectionState::Closed => sink.emit(TransportEvent::Closed),
                        _ => {}
                    }
                })
            },
        ));

        let sink = events;
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _: Arc<RTCRtpReceiver>,
                  _: Arc<RTCRtpTransceiver>| {
                let sink = sink.clone();
                Box::pin(async move {
                    sink.emit(TransportEvent::RemoteTrack(track));
                })
            },
        ));

        Ok(Self {
            peer_connection,
            senders: Mutex::new(Vec::new()),
        })
    }

    /// Set the local description and hold it back until gathering is done
    async fn finish_local(&self, desc: RTCSessionDescription) -> Result<String, NegotiationError> {
        let mut gathered = self.peer_connection.gathering_complete_promise().await;
        self.peer_connection.set_local_description(desc).await?;
        let _ = gathered.recv().await;

        let local = self.peer_connection.local_description().await.ok_or_else(|| {
            NegotiationError::Transport("no local description after gathering".to_string())
        })?;
        Ok(serde_json::to_string(&local)?)
    }

    async fn apply_remote(&self, blob: &str) -> Result<(), NegotiationError> {
        let desc: RTCSessionDescription = serde_json::from_str(blob)?;
        self.peer_connection.set_remote_description(desc).await?;
        Ok(())
    }
}

#[async_trait]
impl MediaTransport for RtcTransport {
    async fn attach(&self, stream: &StreamHandle) -> Result<(), NegotiationError> {
        let mut senders = self.senders.lock().await;
        for (kind, track) in stream.tracks() {
            let sender = self.peer_connection.add_track(track).await?;
            senders.push((kind, sender));
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, NegotiationError> {
        let offer = self.peer_connection.create_offer(None).await?;
        self.finish_local(offer).await
    }

    async fn apply_offer(&self, offer: &str) -> Result<(), NegotiationError> {
        self.apply_remote(offer).await
    }

    async fn create_answer(&self) -> Result<String, NegotiationError> {
        let answer = self.peer_connection.create_answer(None).await?;
        self.finish_local(answer).await
    }

    async fn apply_answer(&self, answer: &str) -> Result<(), NegotiationError> {
        self.apply_remote(answer).await
    }

    async fn replace_outbound(&self, stream: &StreamHandle) -> Result<(), NegotiationError> {
        let tracks = stream.tracks();
        let senders = self.senders.lock().await;
        for (kind, sender) in senders.iter() {
            let track = tracks
                .iter()
                .find(|(k, _)| k == kind)
                .map(|(_, track)| Arc::clone(track));
            sender.replace_track(track).await?;
        }
        for (kind, _) in &tracks {
            if !senders.iter().any(|(k, _)| k == kind) {
                warn!("no {} sender negotiated, new track not sent", kind);
            }
        }
        Ok(())
    }

    async fn detach(&self) -> Result<(), NegotiationError> {
        for (_, sender) in self.senders.lock().await.iter() {
            sender.replace_track(None).await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.peer_connection.close().await?;
        Ok(())
    }
}
