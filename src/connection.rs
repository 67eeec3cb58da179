use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use webrtc::track::track_remote::TrackRemote;

use crate::error::NegotiationError;
use crate::media::StreamHandle;
use crate::transport::{MediaTransport, TransportEvent};
use crate::types::PeerId;

/// Which side of the handshake this connection plays. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationState {
    Created,
    OfferSent,
    OfferReceived,
    AnswerSent,
    AnswerReceived,
    Connected,
    Closed,
    Failed,
}

impl NegotiationState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Closed | NegotiationState::Failed)
    }

    #[must_use]
    pub fn can_transition_to(self, next: NegotiationState) -> bool {
        use NegotiationState::*;
        match (self, next) {
            (Closed | Failed, _) => false,
            (_, Closed | Failed) => true,
            (Created, OfferSent | OfferReceived) => true,
            (OfferSent, AnswerReceived) => true,
            (OfferReceived, AnswerSent) => true,
            (AnswerSent | AnswerReceived, Connected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationState::Created => write!(f, "Created"),
            NegotiationState::OfferSent => write!(f, "OfferSent"),
            NegotiationState::OfferReceived => write!(f, "OfferReceived"),
            NegotiationState::AnswerSent => write!(f, "AnswerSent"),
            NegotiationState::AnswerReceived => write!(f, "AnswerReceived"),
            NegotiationState::Connected => write!(f, "Connected"),
            NegotiationState::Closed => write!(f, "Closed"),
            NegotiationState::Failed => write!(f, "Failed"),
        }
    }
}

/// Transitions the coordinator is told about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    Connected,
    Failed,
    Closed,
}

struct Inner {
    state: NegotiationState,
    // Transport came up before the handshake finished on our side
    transport_up: bool,
    outbound_stream: Option<String>,
    remote_tracks: Vec<Arc<TrackRemote>>,
}

/// One point-to-point media link to a remote participant.
///
/// State lives behind a lock because transport callbacks can land on any
/// runtime thread. The connection never touches the roster; it reports
/// [`PeerEvent`]s and the coordinator acts on them.
pub struct PeerConnection {
    remote_id: PeerId,
    role: Role,
    conn_id: u64,
    created_at: Instant,
    transport: Arc<dyn MediaTransport>,
    inner: Mutex<Inner>,
}

impl PeerConnection {
    pub fn new(remote_id: PeerId, role: Role, conn_id: u64, transport: Arc<dyn MediaTransport>) -> Self {
        Self {
            remote_id,
            role,
            conn_id,
            created_at: Instant::now(),
            transport,
            inner: Mutex::new(Inner {
                state: NegotiationState::Created,
                transport_up: false,
                outbound_stream: None,
                remote_tracks: Vec::new(),
            }),
        }
    }

    pub fn remote_id(&self) -> &PeerId {
        &self.remote_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Generation tag distinguishing this connection from earlier ones to the
    /// same remote id
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn state(&self) -> NegotiationState {
        self.inner.lock().state
    }

    pub fn outbound_stream_id(&self) -> Option<String> {
        self.inner.lock().outbound_stream.clone()
    }

    pub fn remote_tracks(&self) -> Vec<Arc<TrackRemote>> {
        self.inner.lock().remote_tracks.clone()
    }

    /// Still negotiating after `timeout`
    pub fn is_stalled(&self, timeout: Duration, now: Instant) -> bool {
        let state = self.state();
        state != NegotiationState::Connected
            && !state.is_terminal()
            && now.saturating_duration_since(self.created_at) >= timeout
    }

    fn require(
        &self,
        action: &'static str,
        role: Role,
        state: NegotiationState,
    ) -> Result<(), NegotiationError> {
        let current = self.state();
        if self.role != role || current != state {
            return Err(NegotiationError::InvalidTransition {
                state: current,
                action,
            });
        }
        Ok(())
    }

    fn advance(&self, action: &'static str, next: NegotiationState) -> Result<(), NegotiationError> {
        let mut inner = self.inner.lock();
        if !inner.state.can_transition_to(next) {
            return Err(NegotiationError::InvalidTransition {
                state: inner.state,
                action,
            });
        }
        debug!(peer = %self.remote_id, "negotiation {} -> {}", inner.state, next);
        inner.state = next;

        // Transport may have reported the session before we got here
        if matches!(next, NegotiationState::AnswerSent | NegotiationState::AnswerReceived)
            && inner.transport_up
        {
            debug!(peer = %self.remote_id, "negotiation {} -> Connected", next);
            inner.state = NegotiationState::Connected;
        }
        Ok(())
    }

    fn fail_on<T>(&self, result: Result<T, NegotiationError>) -> Result<T, NegotiationError> {
        if result.is_err() {
            let mut inner = self.inner.lock();
            if !inner.state.is_terminal() {
                inner.state = NegotiationState::Failed;
            }
        }
        result
    }

    /// Attach the local stream's tracks as outbound media
    pub async fn attach_stream(&self, stream: &StreamHandle) -> Result<(), NegotiationError> {
        let current = self.state();
        if current != NegotiationState::Created {
            return Err(NegotiationError::InvalidTransition {
                state: current,
                action: "attach stream",
            });
        }
        self.fail_on(self.transport.attach(stream).await)?;
        self.inner.lock().outbound_stream = Some(stream.id().to_owned());
        Ok(())
    }

    /// Initiator: produce the complete offer and move to `OfferSent`
    pub async fn create_offer(&self) -> Result<String, NegotiationError> {
        self.require("create offer", Role::Initiator, NegotiationState::Created)?;
        let offer = self.fail_on(self.transport.create_offer().await)?;
        self.advance("send offer", NegotiationState::OfferSent)?;
        Ok(offer)
    }

    /// Responder: apply the remote offer and produce the complete answer
    pub async fn accept_offer(&self, offer: &str) -> Result<String, NegotiationError> {
        self.require("accept offer", Role::Responder, NegotiationState::Created)?;
        self.fail_on(self.transport.apply_offer(offer).await)?;
        self.advance("receive offer", NegotiationState::OfferReceived)?;
        let answer = self.fail_on(self.transport.create_answer().await)?;
        self.advance("send answer", NegotiationState::AnswerSent)?;
        Ok(answer)
    }

    /// Initiator: apply the remote answer
    pub async fn accept_answer(&self, answer: &str) -> Result<(), NegotiationError> {
        self.require("accept answer", Role::Initiator, NegotiationState::OfferSent)?;
        self.fail_on(self.transport.apply_answer(answer).await)?;
        self.advance("receive answer", NegotiationState::AnswerReceived)
    }

    /// Fold a transport report into the state machine
    pub fn handle_transport_event(&self, event: &TransportEvent) -> Option<PeerEvent> {
        let mut inner = self.inner.lock();
        match event {
            TransportEvent::Established => match inner.state {
                NegotiationState::AnswerSent | NegotiationState::AnswerReceived => {
                    debug!(peer = %self.remote_id, "negotiation {} -> Connected", inner.state);
                    inner.state = NegotiationState::Connected;
                    Some(PeerEvent::Connected)
                }
                NegotiationState::Created
                | NegotiationState::OfferSent
                | NegotiationState::OfferReceived => {
                    inner.transport_up = true;
                    None
                }
                _ => None,
            },
            TransportEvent::Failed(reason) => {
                if inner.state.is_terminal() {
                    return None;
                }
                warn!(peer = %self.remote_id, "transport failed in {}: {}", inner.state, reason);
                inner.state = NegotiationState::Failed;
                Some(PeerEvent::Failed)
            }
            TransportEvent::Closed => {
                if inner.state.is_terminal() {
                    return None;
                }
                inner.state = NegotiationState::Closed;
                Some(PeerEvent::Closed)
            }
            TransportEvent::RemoteTrack(track) => {
                inner.remote_tracks.push(Arc::clone(track));
                None
            }
        }
    }

    /// Swap the outgoing tracks on a live connection. No renegotiation, no
    /// state change.
    pub async fn replace_outbound(&self, stream: &StreamHandle) -> Result<(), NegotiationError> {
        let current = self.state();
        if current != NegotiationState::Connected {
            return Err(NegotiationError::InvalidTransition {
                state: current,
                action: "replace outbound track",
            });
        }
        self.transport.replace_outbound(stream).await?;
        self.inner.lock().outbound_stream = Some(stream.id().to_owned());
        Ok(())
    }

    /// Explicit teardown. Pending negotiations go straight to `Closed`.
    pub async fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if !inner.state.is_terminal() {
                debug!(peer = %self.remote_id, "negotiation {} -> Closed", inner.state);
                inner.state = NegotiationState::Closed;
            }
            inner.outbound_stream = None;
        }
        if let Err(e) = self.transport.detach().await {
            debug!(peer = %self.remote_id, "detach on close: {}", e);
        }
        if let Err(e) = self.transport.close().await {
            warn!(peer = %self.remote_id, "transport close failed: {}", e);
        }
    }

    /// Mark failed and release the transport
    pub async fn fail(&self) {
        {
            let mut inner = self.inner.lock();
            if !inner.state.is_terminal() {
                inner.state = NegotiationState::Failed;
            }
        }
        if let Err(e) = self.transport.close().await {
            debug!(peer = %self.remote_id, "transport close after failure: {}", e);
        }
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("remote_id", &self.remote_id)
            .field("role", &self.role)
            .field("conn_id", &self.conn_id)
            .field("state", &self.state())
            .finish()
    }
}
