//! Local capture devices and the active outbound stream.
//!
//! The manager is the only owner of capture hardware. Peer connections get a
//! [`StreamHandle`], which carries the outbound tracks but never the capture
//! itself, so dropping a handle cannot keep a camera or microphone open.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MIME_TYPE_PCMU, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    VideoInput,
    AudioInput,
    AudioOutput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub label: String,
    pub kind: DeviceKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceList {
    pub video_inputs: Vec<DeviceInfo>,
    pub audio_inputs: Vec<DeviceInfo>,
    pub audio_outputs: Vec<DeviceInfo>,
}

impl DeviceList {
    pub fn from_devices(devices: impl IntoIterator<Item = DeviceInfo>) -> Self {
        let mut list = Self::default();
        for device in devices {
            match device.kind {
                DeviceKind::VideoInput => list.video_inputs.push(device),
                DeviceKind::AudioInput => list.audio_inputs.push(device),
                DeviceKind::AudioOutput => list.audio_outputs.push(device),
            }
        }
        list
    }
}

/// Currently selected device per kind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSelection {
    pub video_input: Option<String>,
    pub audio_input: Option<String>,
    pub audio_output: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub video_device_id: Option<String>,
    pub audio_device_id: Option<String>,
}

/// Holds capture hardware open until stopped
pub trait CaptureGuard: Send {
    fn stop(&mut self);
}

/// Outbound track for a capture source
pub fn capture_track(kind: RTPCodecType, stream_id: &str) -> Arc<TrackLocalStaticSample> {
    // Audio is sent as PCMU, see `audio::PcmuPacketizer`
    let (capability, track_id) = match kind {
        RTPCodecType::Video => (
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            "video",
        ),
        _ => (
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                clock_rate: 8000,
                channels: 1,
                ..Default::default()
            },
            "audio",
        ),
    };
    Arc::new(TrackLocalStaticSample::new(
        capability,
        track_id.to_owned(),
        stream_id.to_owned(),
    ))
}

/// Non-owning view of the active capture stream
#[derive(Clone)]
pub struct StreamHandle {
    id: String,
    video: Option<Arc<TrackLocalStaticSample>>,
    audio: Option<Arc<TrackLocalStaticSample>>,
}

impl StreamHandle {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    #[must_use]
    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    /// Outbound tracks keyed by media kind
    #[must_use]
    pub fn tracks(&self) -> Vec<(RTPCodecType, Arc<dyn TrackLocal + Send + Sync>)> {
        let mut tracks: Vec<(RTPCodecType, Arc<dyn TrackLocal + Send + Sync>)> = Vec::new();
        if let Some(video) = &self.video {
            tracks.push((RTPCodecType::Video, Arc::clone(video) as Arc<dyn TrackLocal + Send + Sync>));
        }
        if let Some(audio) = &self.audio {
            tracks.push((RTPCodecType::Audio, Arc::clone(audio) as Arc<dyn TrackLocal + Send + Sync>));
        }
        tracks
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id)
            .field("video", &self.video.is_some())
            .field("audio", &self.audio.is_some())
            .finish()
    }
}

/// Capture stream owned by [`LocalMediaManager`]
pub struct LocalStream {
    handle: StreamHandle,
    guard: Box<dyn CaptureGuard>,
}

impl LocalStream {
    pub fn new(
        id: impl Into<String>,
        video: Option<Arc<TrackLocalStaticSample>>,
        audio: Option<Arc<TrackLocalStaticSample>>,
        guard: Box<dyn CaptureGuard>,
    ) -> Self {
        Self {
            handle: StreamHandle {
                id: id.into(),
                video,
                audio,
            },
            guard,
        }
    }

    #[must_use]
    pub fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }

    fn stop(mut self) {
        debug!(stream = %self.handle.id, "stopping capture tracks");
        self.guard.stop();
    }
}

/// Platform capture API
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn enumerate(&self) -> Result<Vec<DeviceInfo>, MediaError>;

    async fn open(&self, constraints: &CaptureConstraints) -> Result<LocalStream, MediaError>;

    async fn route_output(&self, device_id: &str) -> Result<(), MediaError>;
}

pub struct LocalMediaManager {
    devices: Arc<dyn MediaDevices>,
    selection: DeviceSelection,
    active: Option<LocalStream>,
}

impl LocalMediaManager {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            selection: DeviceSelection::default(),
            active: None,
        }
    }

    #[must_use]
    pub fn selection(&self) -> &DeviceSelection {
        &self.selection
    }

    #[must_use]
    pub fn current(&self) -> Option<StreamHandle> {
        self.active.as_ref().map(LocalStream::handle)
    }

    /// Enumerate devices. The first device of each kind becomes the selection
    /// when nothing has been picked yet.
    pub async fn list_devices(&mut self) -> Result<DeviceList, MediaError> {
        let list = DeviceList::from_devices(self.devices.enumerate().await?);

        fn first(slot: &mut Option<String>, devices: &[DeviceInfo]) {
            if slot.is_none() {
                *slot = devices.first().map(|d| d.id.clone());
            }
        }
        first(&mut self.selection.video_input, &list.video_inputs);
        first(&mut self.selection.audio_input, &list.audio_inputs);
        first(&mut self.selection.audio_output, &list.audio_outputs);

        debug!(
            video = list.video_inputs.len(),
            audio_in = list.audio_inputs.len(),
            audio_out = list.audio_outputs.len(),
            "enumerated devices"
        );
        Ok(list)
    }

    /// Open a capture stream for the given devices, releasing the previous one
    /// first.
    pub async fn acquire(
        &mut self,
        video_device_id: Option<&str>,
        audio_device_id: Option<&str>,
    ) -> Result<StreamHandle, MediaError> {
        self.release();

        let constraints = CaptureConstraints {
            video_device_id: video_device_id.map(str::to_owned),
            audio_device_id: audio_device_id.map(str::to_owned),
        };
        let stream = self.devices.open(&constraints).await?;
        let handle = stream.handle();
        info!(
            stream = %handle.id(),
            video = ?constraints.video_device_id,
            audio = ?constraints.audio_device_id,
            "acquired local stream"
        );

        self.selection.video_input = constraints.video_device_id;
        self.selection.audio_input = constraints.audio_device_id;
        self.active = Some(stream);
        Ok(handle)
    }

    pub async fn acquire_selected(&mut self) -> Result<StreamHandle, MediaError> {
        let video = self.selection.video_input.clone();
        let audio = self.selection.audio_input.clone();
        self.acquire(video.as_deref(), audio.as_deref()).await
    }

    pub async fn switch_video_device(&mut self, device_id: &str) -> Result<StreamHandle, MediaError> {
        let audio = self.selection.audio_input.clone();
        self.switch(Some(device_id), audio.as_deref()).await
    }

    pub async fn switch_audio_input(&mut self, device_id: &str) -> Result<StreamHandle, MediaError> {
        let video = self.selection.video_input.clone();
        self.switch(video.as_deref(), Some(device_id)).await
    }

    /// Best effort; unsupported platforms only log.
    pub async fn set_audio_output(&mut self, device_id: &str) -> Result<(), MediaError> {
        match self.devices.route_output(device_id).await {
            Ok(()) => {
                self.selection.audio_output = Some(device_id.to_owned());
                Ok(())
            }
            Err(e) => {
                warn!(device = device_id, "audio output routing failed: {}", e);
                Err(e)
            }
        }
    }

    /// Stop the active stream, if any
    pub fn release(&mut self) {
        if let Some(stream) = self.active.take() {
            stream.stop();
        }
    }

    async fn switch(
        &mut self,
        video: Option<&str>,
        audio: Option<&str>,
    ) -> Result<StreamHandle, MediaError> {
        let previous = self.selection.clone();
        match self.acquire(video, audio).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                warn!("device switch failed, restoring previous devices: {}", e);
                if let Err(restore) = self
                    .acquire(
                        previous.video_input.as_deref(),
                        previous.audio_input.as_deref(),
                    )
                    .await
                {
                    warn!("restoring previous devices failed: {}", restore);
                }
                Err(e)
            }
        }
    }
}

impl Drop for LocalMediaManager {
    fn drop(&mut self) {
        self.release();
    }
}
