//! Full-mesh signaling for one room.
//!
//! The coordinator is a single actor task. It owns the roster, the local
//! media manager and the queue of room messages that arrived while there
//! was no joined room or no local stream; nothing else mutates them. Offer/answer generation runs in
//! tasks on a `JoinSet` whose results are tagged with the connection
//! generation, so results for connections that were removed in the
//! meantime are simply discarded.

use futures::FutureExt;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::connection::{NegotiationState, PeerConnection, PeerEvent, Role};
use crate::error::{MeshError, NegotiationError, Result};
use crate::media::{DeviceList, LocalMediaManager};
use crate::room::monitor::{RemoteMediaEvent, RoomMonitor, RosterSnapshot};
use crate::room::roster::PeerRoster;
use crate::signaling::{RelayClient, SignalingMessage};
use crate::transport::{TransportEvent, TransportEventSink, TransportFactory, TransportNotice};
use crate::types::{PeerId, RoomId};

const COMMAND_CAPACITY: usize = 32;

enum Step {
    OfferReady(std::result::Result<String, NegotiationError>),
    AnswerReady(std::result::Result<String, NegotiationError>),
    AnswerApplied(std::result::Result<(), NegotiationError>),
    Panicked,
}

/// Result of a spawned negotiation step
struct Outcome {
    remote: PeerId,
    conn_id: u64,
    step: Step,
}

pub enum MeshCommand {
    Join {
        room: RoomId,
        reply: oneshot::Sender<Result<()>>,
    },
    ListDevices {
        reply: oneshot::Sender<Result<DeviceList>>,
    },
    SwitchVideo {
        device_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    SwitchAudioInput {
        device_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    SetAudioOutput {
        device_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Leave {
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

pub struct SignalingCoordinator {
    config: MeshConfig,
    relay: Arc<dyn RelayClient>,
    inbound: mpsc::Receiver<SignalingMessage>,
    media: LocalMediaManager,
    factory: Arc<dyn TransportFactory>,
    monitor: Arc<RoomMonitor>,

    room: Option<RoomId>,
    roster: PeerRoster,
    ready: bool,
    pending: VecDeque<SignalingMessage>,
    // Stream id the roster's connected peers were last moved to
    propagated_stream: Option<String>,

    next_conn_id: u64,
    negotiations: JoinSet<Outcome>,
    transport_tx: mpsc::UnboundedSender<TransportNotice>,
    transport_rx: mpsc::UnboundedReceiver<TransportNotice>,
}

impl SignalingCoordinator {
    pub fn new(
        config: MeshConfig,
        relay: Arc<dyn RelayClient>,
        inbound: mpsc::Receiver<SignalingMessage>,
        media: LocalMediaManager,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let monitor = Arc::new(RoomMonitor::new(config.event_capacity));
        Self {
            config,
            relay,
            inbound,
            media,
            factory,
            monitor,
            room: None,
            roster: PeerRoster::new(),
            ready: false,
            pending: VecDeque::new(),
            propagated_stream: None,
            next_conn_id: 0,
            negotiations: JoinSet::new(),
            transport_tx,
            transport_rx,
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.relay.local_id()
    }

    pub fn room(&self) -> Option<&RoomId> {
        self.room.as_ref()
    }

    pub fn roster(&self) -> &PeerRoster {
        &self.roster
    }

    pub fn media(&self) -> &LocalMediaManager {
        &self.media
    }

    pub fn monitor(&self) -> Arc<RoomMonitor> {
        Arc::clone(&self.monitor)
    }

    /// Local stream acquired and join sent
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Messages held back until the join completes
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Move the coordinator onto its own task
    pub fn spawn(self) -> (MeshHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let handle = MeshHandle {
            commands: tx,
            monitor: self.monitor(),
        };
        (handle, tokio::spawn(self.run(rx)))
    }

    pub async fn run(mut self, mut commands: mpsc::Receiver<MeshCommand>) {
        let mut reap = tokio::time::interval(self.config.reap_interval());
        reap.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.inbound.recv() => match msg {
                    Some(msg) => self.handle_relay_message(msg).await,
                    None => {
                        warn!("relay connection closed");
                        break;
                    }
                },
                Some(joined) = self.negotiations.join_next(), if !self.negotiations.is_empty() => {
                    self.handle_joined(joined).await
                }
                Some(notice) = self.transport_rx.recv() => self.handle_transport_notice(notice).await,
                cmd = commands.recv() => match cmd {
                    Some(MeshCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                _ = reap.tick() => self.reap_stalled().await,
            }
        }

        if self.room.is_some() {
            if let Err(e) = self.leave().await {
                warn!("leave on shutdown failed: {}", e);
            }
        }
        debug!("coordinator stopped");
    }

    async fn handle_command(&mut self, cmd: MeshCommand) {
        match cmd {
            MeshCommand::Join { room, reply } => {
                let _ = reply.send(self.join(room).await);
            }
            MeshCommand::ListDevices { reply } => {
                let _ = reply.send(self.media.list_devices().await.map_err(MeshError::from));
            }
            MeshCommand::SwitchVideo { device_id, reply } => {
                let _ = reply.send(self.switch_video_device(&device_id).await);
            }
            MeshCommand::SwitchAudioInput { device_id, reply } => {
                let _ = reply.send(self.switch_audio_input(&device_id).await);
            }
            MeshCommand::SetAudioOutput { device_id, reply } => {
                let _ = reply.send(self.set_audio_output(&device_id).await);
            }
            MeshCommand::Leave { reply } => {
                let _ = reply.send(self.leave().await);
            }
            MeshCommand::Shutdown => {}
        }
    }

    /// Acquire local media if needed, then ask the relay to join `room`.
    ///
    /// Media failure is the one error surfaced to the user; the coordinator
    /// stays idle so another device can be tried.
    pub async fn join(&mut self, room: RoomId) -> Result<()> {
        if self.room.is_some() {
            return Err(MeshError::AlreadyJoined);
        }

        let stream = match self.media.current() {
            Some(stream) => stream,
            None => {
                let selection = self.media.selection();
                if selection.video_input.is_none() && selection.audio_input.is_none() {
                    if let Err(e) = self.media.list_devices().await {
                        warn!("device enumeration failed, trying platform defaults: {}", e);
                    }
                }
                self.media
                    .acquire_selected()
                    .await
                    .map_err(MeshError::JoinFailed)?
            }
        };

        self.relay
            .send(SignalingMessage::Join { room_id: room.clone() })
            .await?;

        info!(room = %room, peer = %self.local_id(), stream = %stream.id(), "joined room");
        self.room = Some(room);
        self.ready = true;
        self.propagated_stream = Some(stream.id().to_owned());
        self.publish_roster();
        self.drain_pending().await;
        Ok(())
    }

    /// Tear down every connection, release capture hardware and tell the relay.
    pub async fn leave(&mut self) -> Result<()> {
        let Some(room) = self.room.take() else {
            return Err(MeshError::NotJoined);
        };
        self.ready = false;
        self.pending.clear();
        self.negotiations.abort_all();

        // Close detaches the local stream before the hardware goes away
        for peer in self.roster.drain() {
            peer.close().await;
            self.monitor.publish_media(RemoteMediaEvent::Removed {
                remote: peer.remote_id().clone(),
            });
        }
        self.media.release();
        self.propagated_stream = None;

        if let Err(e) = self
            .relay
            .send(SignalingMessage::Leave { room_id: room.clone() })
            .await
        {
            warn!(room = %room, "failed to notify relay of leave: {}", e);
        }
        info!(room = %room, "left room");
        self.publish_roster();
        Ok(())
    }

    /// Joined and holding a local stream to attach to new connections
    fn accepts_room_traffic(&self) -> bool {
        self.ready && self.media.current().is_some()
    }

    /// Entry point for everything the relay delivers
    pub async fn handle_relay_message(&mut self, msg: SignalingMessage) {
        if msg.needs_ready_room() && !self.accepts_room_traffic() {
            debug!(kind = msg.kind(), "queueing message until a local stream is joined");
            self.pending.push_back(msg);
            return;
        }
        self.dispatch(msg).await;
    }

    async fn drain_pending(&mut self) {
        while self.accepts_room_traffic() {
            let Some(msg) = self.pending.pop_front() else {
                break;
            };
            self.dispatch(msg).await;
        }
    }

    async fn dispatch(&mut self, msg: SignalingMessage) {
        let result = match msg {
            SignalingMessage::Roster { peers } => {
                self.on_roster(peers).await;
                Ok(())
            }
            SignalingMessage::Arrival { sender_id, offer } => self.on_arrival(sender_id, offer).await,
            SignalingMessage::AnswerDelivery { sender_id, answer } => {
                self.on_answer_delivery(sender_id, answer)
            }
            SignalingMessage::Departure { peer_id } => {
                self.on_departure(&peer_id).await;
                Ok(())
            }
            SignalingMessage::StreamUpdated { sender_id } => {
                debug!(peer = ?sender_id, "remote stream updated");
                self.monitor
                    .publish_media(RemoteMediaEvent::Refreshed { remote: sender_id });
                Ok(())
            }
            SignalingMessage::Error { message } => {
                warn!("relay error: {}", message);
                Ok(())
            }
            SignalingMessage::Welcome { peer_id } => {
                debug!(peer = %peer_id, "ignoring repeated welcome");
                Ok(())
            }
            other => {
                warn!(kind = other.kind(), "unexpected client-bound message");
                Ok(())
            }
        };

        if let Err(e) = result {
            Self::report(&e);
        }
        self.publish_roster();
    }

    fn report(err: &MeshError) {
        match err {
            MeshError::StaleMessage { .. } => debug!("dropping message: {}", err),
            MeshError::DuplicateJoin(_) => info!("ignoring arrival: {}", err),
            _ => warn!("{}", err),
        }
    }

    async fn on_roster(&mut self, peers: Vec<PeerId>) {
        let local = self.local_id();
        info!(count = peers.len(), "received room roster");
        for remote in peers {
            if remote == local {
                continue;
            }
            if self.roster.contains(&remote) {
                Self::report(&MeshError::DuplicateJoin(remote));
                continue;
            }
            match self.create_peer(remote.clone(), Role::Initiator).await {
                Ok(peer) => self.spawn_offer(peer),
                Err(e) => warn!(peer = %remote, "could not create initiator connection: {}", e),
            }
        }
    }

    async fn on_arrival(&mut self, sender: PeerId, offer: String) -> Result<()> {
        if sender == self.local_id() {
            debug!("ignoring our own arrival");
            return Ok(());
        }
        if self.roster.contains(&sender) {
            return Err(MeshError::DuplicateJoin(sender));
        }
        let peer = self.create_peer(sender, Role::Responder).await?;
        self.spawn_answer(peer, offer);
        Ok(())
    }

    fn on_answer_delivery(&mut self, sender: PeerId, answer: String) -> Result<()> {
        let Some(peer) = self.roster.get(&sender).cloned() else {
            return Err(MeshError::StaleMessage {
                kind: "answer-delivery",
                peer: sender,
            });
        };
        if peer.role() != Role::Initiator || peer.state() != NegotiationState::OfferSent {
            return Err(MeshError::StaleMessage {
                kind: "answer-delivery",
                peer: sender,
            });
        }

        let step = {
            let peer = Arc::clone(&peer);
            async move { Step::AnswerApplied(peer.accept_answer(&answer).await) }
        };
        self.spawn_step(&peer, step);
        Ok(())
    }

    async fn on_departure(&mut self, remote: &PeerId) {
        match self.roster.remove(remote) {
            Some(peer) => {
                info!(peer = %remote, state = %peer.state(), "participant left");
                peer.close().await;
                self.monitor.publish_media(RemoteMediaEvent::Removed {
                    remote: remote.clone(),
                });
            }
            None => debug!(peer = %remote, "departure for unknown participant"),
        }
    }

    /// New connection with the most recent local stream attached
    async fn create_peer(&mut self, remote: PeerId, role: Role) -> Result<Arc<PeerConnection>> {
        let stream = self.media.current().ok_or(MeshError::NotJoined)?;

        self.next_conn_id += 1;
        let conn_id = self.next_conn_id;
        let sink = TransportEventSink::new(remote.clone(), conn_id, self.transport_tx.clone());
        let transport = self.factory.create(sink).await?;

        let peer = Arc::new(PeerConnection::new(remote.clone(), role, conn_id, transport));
        if let Err(e) = peer.attach_stream(&stream).await {
            peer.fail().await;
            return Err(e.into());
        }
        self.roster.insert(Arc::clone(&peer))?;
        info!(peer = %remote, ?role, conn_id, "peer connection created");
        Ok(peer)
    }

    /// Run one negotiation step off the actor. A panic inside the step comes
    /// back as [`Step::Panicked`] so the peer is failed instead of left
    /// hanging.
    fn spawn_step<F>(&mut self, peer: &Arc<PeerConnection>, step: F)
    where
        F: Future<Output = Step> + Send + 'static,
    {
        let remote = peer.remote_id().clone();
        let conn_id = peer.conn_id();
        self.negotiations.spawn(async move {
            let step = AssertUnwindSafe(step)
                .catch_unwind()
                .await
                .unwrap_or(Step::Panicked);
            Outcome {
                remote,
                conn_id,
                step,
            }
        });
    }

    fn spawn_offer(&mut self, peer: Arc<PeerConnection>) {
        let step = {
            let peer = Arc::clone(&peer);
            async move { Step::OfferReady(peer.create_offer().await) }
        };
        self.spawn_step(&peer, step);
    }

    fn spawn_answer(&mut self, peer: Arc<PeerConnection>, offer: String) {
        let step = {
            let peer = Arc::clone(&peer);
            async move { Step::AnswerReady(peer.accept_offer(&offer).await) }
        };
        self.spawn_step(&peer, step);
    }

    async fn handle_joined(&mut self, joined: std::result::Result<Outcome, tokio::task::JoinError>) {
        match joined {
            Ok(outcome) => self.handle_outcome(outcome).await,
            // Steps catch their own panics; only cancellation lands here
            Err(e) => debug!("negotiation task ended early: {}", e),
        }
    }

    async fn handle_outcome(&mut self, outcome: Outcome) {
        let Outcome {
            remote,
            conn_id,
            step,
        } = outcome;
        let Some(peer) = self.roster.get_current(&remote, conn_id).cloned() else {
            debug!(peer = %remote, conn_id, "discarding negotiation result for removed connection");
            return;
        };

        match step {
            Step::OfferReady(Ok(offer)) => {
                let msg = SignalingMessage::Offer {
                    target_id: remote.clone(),
                    sender_id: self.local_id(),
                    offer,
                };
                if let Err(e) = self.relay.send(msg).await {
                    warn!(peer = %remote, "failed to send offer: {}", e);
                } else {
                    debug!(peer = %remote, "offer sent");
                }
            }
            Step::AnswerReady(Ok(answer)) => {
                let msg = SignalingMessage::Answer {
                    target_id: remote.clone(),
                    answer,
                };
                if let Err(e) = self.relay.send(msg).await {
                    warn!(peer = %remote, "failed to send answer: {}", e);
                } else {
                    debug!(peer = %remote, "answer sent");
                }
            }
            Step::AnswerApplied(Ok(())) => {
                debug!(peer = %remote, "answer applied");
            }
            Step::OfferReady(Err(e)) | Step::AnswerReady(Err(e)) | Step::AnswerApplied(Err(e)) => {
                self.fail_peer(&peer, &e).await;
                self.publish_roster();
                return;
            }
            Step::Panicked => {
                let err = NegotiationError::Transport("negotiation task panicked".to_string());
                self.fail_peer(&peer, &err).await;
                self.publish_roster();
                return;
            }
        }

        // The transport may have come up while the handshake was in flight
        if peer.state() == NegotiationState::Connected {
            self.on_connected(&peer).await;
        }
        self.publish_roster();
    }

    async fn handle_transport_notice(&mut self, notice: TransportNotice) {
        let TransportNotice {
            remote,
            conn_id,
            event,
        } = notice;
        let Some(peer) = self.roster.get_current(&remote, conn_id).cloned() else {
            debug!(peer = %remote, conn_id, ?event, "transport event for removed connection");
            return;
        };

        if let TransportEvent::RemoteTrack(track) = &event {
            debug!(peer = %remote, "remote track received");
            self.monitor.publish_media(RemoteMediaEvent::TrackAdded {
                remote: remote.clone(),
                track: Arc::clone(track),
            });
        }

        match peer.handle_transport_event(&event) {
            Some(PeerEvent::Connected) => self.on_connected(&peer).await,
            Some(PeerEvent::Failed) => {
                let reason = match event {
                    TransportEvent::Failed(reason) => reason,
                    _ => "transport failure".to_string(),
                };
                self.fail_peer(&peer, &NegotiationError::Transport(reason)).await;
            }
            Some(PeerEvent::Closed) => {
                info!(peer = %remote, "connection closed by transport");
                self.roster.remove_current(&remote, conn_id);
                peer.close().await;
                self.monitor
                    .publish_media(RemoteMediaEvent::Removed { remote });
            }
            None => {}
        }
        self.publish_roster();
    }

    async fn on_connected(&mut self, peer: &Arc<PeerConnection>) {
        info!(peer = %peer.remote_id(), "peer connected");

        // A device switch may have happened while this peer was negotiating
        let Some(current) = self.media.current() else {
            return;
        };
        if peer.outbound_stream_id().as_deref() != Some(current.id()) {
            if let Err(e) = peer.replace_outbound(&current).await {
                warn!(peer = %peer.remote_id(), "deferred track replacement failed: {}", e);
            }
        }
    }

    /// Isolate a failed peer: out of the roster, transport released
    async fn fail_peer(&mut self, peer: &Arc<PeerConnection>, err: &NegotiationError) {
        warn!(peer = %peer.remote_id(), state = %peer.state(), "negotiation failed: {}", err);
        self.roster.remove_current(peer.remote_id(), peer.conn_id());
        peer.fail().await;
        self.monitor.publish_media(RemoteMediaEvent::Removed {
            remote: peer.remote_id().clone(),
        });
    }

    /// Fail every connection that has been negotiating for too long
    pub async fn reap_stalled(&mut self) {
        let stalled = self
            .roster
            .stalled(self.config.negotiation_timeout(), Instant::now());
        if stalled.is_empty() {
            return;
        }
        for peer in stalled {
            self.fail_peer(&peer, &NegotiationError::Timeout).await;
        }
        self.publish_roster();
    }

    pub async fn switch_video_device(&mut self, device_id: &str) -> Result<()> {
        let result = self.media.switch_video_device(device_id).await;
        self.propagate_stream().await;
        result.map(|_| ()).map_err(MeshError::from)
    }

    pub async fn switch_audio_input(&mut self, device_id: &str) -> Result<()> {
        let result = self.media.switch_audio_input(device_id).await;
        self.propagate_stream().await;
        result.map(|_| ()).map_err(MeshError::from)
    }

    /// Non-fatal either way; failures are already logged by the manager
    pub async fn set_audio_output(&mut self, device_id: &str) -> Result<()> {
        self.media
            .set_audio_output(device_id)
            .await
            .map_err(MeshError::from)
    }

    /// Move every connected peer onto the current local stream, then let
    /// through room traffic that queued up while no stream was held.
    async fn propagate_stream(&mut self) {
        let Some(current) = self.media.current() else {
            return;
        };

        if self.propagated_stream.as_deref() != Some(current.id()) {
            let connected = self.roster.connected();
            info!(stream = %current.id(), peers = connected.len(), "switching outbound tracks");
            for peer in connected {
                if let Err(e) = peer.replace_outbound(&current).await {
                    warn!(peer = %peer.remote_id(), "track replacement failed: {}", e);
                }
            }
            self.propagated_stream = Some(current.id().to_owned());

            if self.ready {
                let msg = SignalingMessage::StreamUpdated {
                    sender_id: Some(self.local_id()),
                };
                if let Err(e) = self.relay.send(msg).await {
                    debug!("stream-updated notice not sent: {}", e);
                }
            }
        }

        self.drain_pending().await;
    }

    /// Handle every queued transport event and wait out every negotiation
    /// task. Drives the coordinator without [`run`](Self::run).
    #[doc(hidden)]
    pub async fn settle(&mut self) {
        loop {
            let mut progressed = false;
            while let Ok(notice) = self.transport_rx.try_recv() {
                progressed = true;
                self.handle_transport_notice(notice).await;
            }
            if let Some(joined) = self.negotiations.join_next().await {
                self.handle_joined(joined).await;
                continue;
            }
            if !progressed {
                break;
            }
        }
    }

    fn publish_roster(&self) {
        self.monitor.publish_roster(RosterSnapshot {
            room: self.room.clone(),
            peers: self.roster.snapshot(),
        });
    }
}

/// Cloneable front door to a spawned coordinator
#[derive(Clone)]
pub struct MeshHandle {
    commands: mpsc::Sender<MeshCommand>,
    monitor: Arc<RoomMonitor>,
}

impl MeshHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> MeshCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| MeshError::Stopped)?;
        rx.await.map_err(|_| MeshError::Stopped)?
    }

    pub async fn join(&self, room: RoomId) -> Result<()> {
        self.request(|reply| MeshCommand::Join { room, reply }).await
    }

    pub async fn list_devices(&self) -> Result<DeviceList> {
        self.request(|reply| MeshCommand::ListDevices { reply }).await
    }

    pub async fn switch_video(&self, device_id: impl Into<String>) -> Result<()> {
        let device_id = device_id.into();
        self.request(|reply| MeshCommand::SwitchVideo { device_id, reply })
            .await
    }

    pub async fn switch_audio_input(&self, device_id: impl Into<String>) -> Result<()> {
        let device_id = device_id.into();
        self.request(|reply| MeshCommand::SwitchAudioInput { device_id, reply })
            .await
    }

    pub async fn set_audio_output(&self, device_id: impl Into<String>) -> Result<()> {
        let device_id = device_id.into();
        self.request(|reply| MeshCommand::SetAudioOutput { device_id, reply })
            .await
    }

    pub async fn leave(&self) -> Result<()> {
        self.request(|reply| MeshCommand::Leave { reply }).await
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(MeshCommand::Shutdown).await;
    }

    pub fn roster(&self) -> RosterSnapshot {
        self.monitor.roster()
    }

    pub fn subscribe_roster(&self) -> tokio::sync::watch::Receiver<RosterSnapshot> {
        self.monitor.subscribe_roster()
    }

    pub fn subscribe_remote_media(&self) -> tokio::sync::broadcast::Receiver<RemoteMediaEvent> {
        self.monitor.subscribe_media()
    }
}
