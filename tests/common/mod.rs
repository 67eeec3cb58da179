#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use mesh_call::error::{MediaAccessKind, SignalingError};
use mesh_call::media::{
    capture_track, CaptureConstraints, CaptureGuard, DeviceInfo, DeviceKind, LocalStream,
    MediaDevices,
};
use mesh_call::transport::{MediaTransport, TransportEvent, TransportEventSink, TransportFactory};
use mesh_call::{
    LocalMediaManager, MediaError, MeshConfig, NegotiationError, PeerId, RelayClient, RoomId,
    SignalingCoordinator, SignalingMessage, StreamHandle,
};

pub const LOCAL_ID: &str = "L";
pub const ROOM: &str = "abc123";

/// Records everything the coordinator sends
pub struct FakeRelay {
    id: PeerId,
    sent: Mutex<Vec<SignalingMessage>>,
}

impl FakeRelay {
    pub fn new(id: &str) -> Self {
        Self {
            id: PeerId::from(id),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    /// Targets of every offer sent, in send order
    pub fn offer_targets(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|msg| match msg {
                SignalingMessage::Offer { target_id, .. } => Some(target_id.to_string()),
                _ => None,
            })
            .collect()
    }

    pub fn answer_targets(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|msg| match msg {
                SignalingMessage::Answer { target_id, .. } => Some(target_id.to_string()),
                _ => None,
            })
            .collect()
    }

    pub fn count_kind(&self, kind: &str) -> usize {
        self.sent.lock().iter().filter(|m| m.kind() == kind).count()
    }
}

#[async_trait]
impl RelayClient for FakeRelay {
    fn local_id(&self) -> PeerId {
        self.id.clone()
    }

    async fn send(&self, msg: SignalingMessage) -> Result<(), SignalingError> {
        self.sent.lock().push(msg);
        Ok(())
    }
}

struct CountingGuard(Arc<AtomicUsize>);

impl CaptureGuard for CountingGuard {
    fn stop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Two cameras, one microphone, one speaker. Camera "cam-busy" is always
/// in use elsewhere.
#[derive(Default)]
pub struct FakeDevices {
    pub fail_open: AtomicBool,
    pub opened: AtomicUsize,
    pub stopped: Arc<AtomicUsize>,
}

impl FakeDevices {
    pub fn live_streams(&self) -> usize {
        self.opened.load(Ordering::SeqCst) - self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn enumerate(&self) -> Result<Vec<DeviceInfo>, MediaError> {
        let device = |id: &str, kind| DeviceInfo {
            id: id.to_string(),
            label: id.to_uppercase(),
            kind,
        };
        Ok(vec![
            device("cam0", DeviceKind::VideoInput),
            device("cam1", DeviceKind::VideoInput),
            device("cam-busy", DeviceKind::VideoInput),
            device("mic0", DeviceKind::AudioInput),
            device("spk0", DeviceKind::AudioOutput),
        ])
    }

    async fn open(&self, constraints: &CaptureConstraints) -> Result<LocalStream, MediaError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(MediaError::access(
                MediaAccessKind::PermissionDenied,
                "user dismissed the prompt",
            ));
        }
        if constraints.video_device_id.as_deref() == Some("cam-busy") {
            return Err(MediaError::access(MediaAccessKind::DeviceBusy, "cam-busy"));
        }

        let n = self.opened.fetch_add(1, Ordering::SeqCst);
        let id = format!("stream-{n}");
        Ok(LocalStream::new(
            id.clone(),
            constraints
                .video_device_id
                .as_ref()
                .map(|_| capture_track(RTPCodecType::Video, &id)),
            constraints
                .audio_device_id
                .as_ref()
                .map(|_| capture_track(RTPCodecType::Audio, &id)),
            Box::new(CountingGuard(Arc::clone(&self.stopped))),
        ))
    }

    async fn route_output(&self, device_id: &str) -> Result<(), MediaError> {
        if device_id == "spk0" {
            Ok(())
        } else {
            Err(MediaError::OutputRouting(format!("{device_id} unavailable")))
        }
    }
}

/// Transport that answers instantly and counts what it was asked to do
#[derive(Default)]
pub struct FakeTransport {
    pub fail: bool,
    pub panic: bool,
    pub offers: AtomicUsize,
    pub answers: AtomicUsize,
    pub applied_answers: AtomicUsize,
    pub replaced: AtomicUsize,
    pub detached: AtomicUsize,
    pub closed: AtomicUsize,
    pub outbound: Mutex<Option<String>>,
}

impl FakeTransport {
    fn check(&self) -> Result<(), NegotiationError> {
        if self.panic {
            panic!("transport bug");
        }
        if self.fail {
            return Err(NegotiationError::Transport("ice failed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    async fn attach(&self, stream: &StreamHandle) -> Result<(), NegotiationError> {
        *self.outbound.lock() = Some(stream.id().to_string());
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, NegotiationError> {
        self.check()?;
        self.offers.fetch_add(1, Ordering::SeqCst);
        Ok("offer-sdp".to_string())
    }

    async fn apply_offer(&self, _offer: &str) -> Result<(), NegotiationError> {
        self.check()
    }

    async fn create_answer(&self) -> Result<String, NegotiationError> {
        self.check()?;
        self.answers.fetch_add(1, Ordering::SeqCst);
        Ok("answer-sdp".to_string())
    }

    async fn apply_answer(&self, _answer: &str) -> Result<(), NegotiationError> {
        self.check()?;
        self.applied_answers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn replace_outbound(&self, stream: &StreamHandle) -> Result<(), NegotiationError> {
        self.replaced.fetch_add(1, Ordering::SeqCst);
        *self.outbound.lock() = Some(stream.id().to_string());
        Ok(())
    }

    async fn detach(&self) -> Result<(), NegotiationError> {
        self.detached.fetch_add(1, Ordering::SeqCst);
        *self.outbound.lock() = None;
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out [`FakeTransport`]s and keeps their event sinks so tests can
/// play the transport's side.
#[derive(Default)]
pub struct FakeFactory {
    transports: Mutex<HashMap<PeerId, Arc<FakeTransport>>>,
    sinks: Mutex<HashMap<PeerId, TransportEventSink>>,
    failing: Mutex<HashSet<PeerId>>,
    panicking: Mutex<HashSet<PeerId>>,
    pub created: AtomicUsize,
}

impl FakeFactory {
    pub fn fail_for(&self, remote: &str) {
        self.failing.lock().insert(PeerId::from(remote));
    }

    /// Negotiation calls on `remote`'s transport will panic
    pub fn panic_for(&self, remote: &str) {
        self.panicking.lock().insert(PeerId::from(remote));
    }

    /// Most recent transport created for `remote`
    pub fn transport(&self, remote: &str) -> Arc<FakeTransport> {
        self.transports
            .lock()
            .get(&PeerId::from(remote))
            .cloned()
            .unwrap_or_else(|| panic!("no transport for {remote}"))
    }

    pub fn emit(&self, remote: &str, event: TransportEvent) {
        let sink = self
            .sinks
            .lock()
            .get(&PeerId::from(remote))
            .cloned()
            .unwrap_or_else(|| panic!("no sink for {remote}"));
        sink.emit(event);
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create(
        &self,
        events: TransportEventSink,
    ) -> Result<Arc<dyn MediaTransport>, NegotiationError> {
        let remote = events.remote().clone();
        let transport = Arc::new(FakeTransport {
            fail: self.failing.lock().contains(&remote),
            panic: self.panicking.lock().contains(&remote),
            ..FakeTransport::default()
        });
        self.created.fetch_add(1, Ordering::SeqCst);
        self.transports
            .lock()
            .insert(remote.clone(), Arc::clone(&transport));
        self.sinks.lock().insert(remote, events);
        Ok(transport)
    }
}

/// Coordinator wired to fakes, driven directly from the test task
pub struct Harness {
    pub coordinator: SignalingCoordinator,
    pub relay: Arc<FakeRelay>,
    pub devices: Arc<FakeDevices>,
    pub factory: Arc<FakeFactory>,
    pub inbound: mpsc::Sender<SignalingMessage>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(MeshConfig::default())
    }

    pub fn with_config(config: MeshConfig) -> Self {
        let relay = Arc::new(FakeRelay::new(LOCAL_ID));
        let devices = Arc::new(FakeDevices::default());
        let factory = Arc::new(FakeFactory::default());
        let (inbound_tx, inbound_rx) = mpsc::channel(16);

        let media = LocalMediaManager::new(devices.clone());
        let coordinator =
            SignalingCoordinator::new(config, relay.clone(), inbound_rx, media, factory.clone());
        Self {
            coordinator,
            relay,
            devices,
            factory,
            inbound: inbound_tx,
        }
    }

    /// Joined to [`ROOM`] with the join message already cleared
    pub async fn joined() -> Self {
        let mut harness = Self::new();
        harness
            .coordinator
            .join(RoomId::from(ROOM))
            .await
            .expect("join");
        harness.relay.clear();
        harness
    }

    pub async fn deliver(&mut self, msg: SignalingMessage) {
        self.coordinator.handle_relay_message(msg).await;
        self.coordinator.settle().await;
    }

    pub async fn emit(&mut self, remote: &str, event: TransportEvent) {
        self.factory.emit(remote, event);
        self.coordinator.settle().await;
    }

    pub fn state_of(&self, remote: &str) -> Option<mesh_call::NegotiationState> {
        self.coordinator
            .roster()
            .get(&PeerId::from(remote))
            .map(|peer| peer.state())
    }
}

pub fn roster(ids: &[&str]) -> SignalingMessage {
    SignalingMessage::Roster {
        peers: ids.iter().map(|id| PeerId::from(*id)).collect(),
    }
}

pub fn arrival(id: &str) -> SignalingMessage {
    SignalingMessage::Arrival {
        sender_id: PeerId::from(id),
        offer: format!("offer-from-{id}"),
    }
}

pub fn answer_delivery(id: &str) -> SignalingMessage {
    SignalingMessage::AnswerDelivery {
        sender_id: PeerId::from(id),
        answer: format!("answer-from-{id}"),
    }
}

pub fn departure(id: &str) -> SignalingMessage {
    SignalingMessage::Departure {
        peer_id: PeerId::from(id),
    }
}
