//! cpal-backed capture devices.
//!
//! Only audio is handled here; cpal has no camera support, so video devices
//! enumerate empty and requesting one fails with `DeviceNotFound`.
//!
//! Microphone input is sent as G.711 μ-law (PCMU): mixed down to mono,
//! resampled to 8 kHz and written to the track in 20 ms frames.

use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};
use webrtc::media::Sample as MediaSample;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::{MediaAccessKind, MediaError};
use crate::media::{
    capture_track, CaptureConstraints, CaptureGuard, DeviceInfo, DeviceKind, LocalStream,
    MediaDevices,
};

const PCMU_RATE: u32 = 8000;
const PCMU_FRAME_SAMPLES: usize = 160;
const PCMU_FRAME_DURATION: Duration = Duration::from_millis(20);

/// G.711 μ-law encoding of one 16-bit linear sample
pub fn linear_to_ulaw(sample: i16) -> u8 {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32635;

    let mut magnitude = i32::from(sample);
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0
    };
    let biased = magnitude.min(CLIP) + BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && biased & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (biased >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

/// Turns interleaved capture buffers of any rate and channel count into
/// 20 ms PCMU payloads.
///
/// Resampling is sample-and-hold, which is enough for speech at 8 kHz.
#[derive(Debug)]
pub struct PcmuPacketizer {
    channels: usize,
    // Input frames per output sample
    step: f64,
    phase: f64,
    frame: Vec<u8>,
}

impl PcmuPacketizer {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            channels: usize::from(channels.max(1)),
            step: f64::from(sample_rate.max(1)) / f64::from(PCMU_RATE),
            phase: 0.0,
            frame: Vec::with_capacity(PCMU_FRAME_SAMPLES),
        }
    }

    /// Feed interleaved samples; returns every frame completed by them.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Bytes> {
        let mut frames = Vec::new();
        for input in samples.chunks(self.channels) {
            let mono = input.iter().sum::<f32>() / input.len() as f32;
            self.phase += 1.0;
            while self.phase >= self.step {
                self.phase -= self.step;
                let linear = (mono.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
                self.frame.push(linear_to_ulaw(linear));
                if self.frame.len() == PCMU_FRAME_SAMPLES {
                    let full = std::mem::replace(
                        &mut self.frame,
                        Vec::with_capacity(PCMU_FRAME_SAMPLES),
                    );
                    frames.push(Bytes::from(full));
                }
            }
        }
        frames
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDevices;

impl CpalDevices {
    pub fn new() -> Self {
        Self
    }
}

fn device_infos(
    devices: Result<impl Iterator<Item = cpal::Device>, cpal::DevicesError>,
    kind: DeviceKind,
) -> Result<Vec<DeviceInfo>, MediaError> {
    let devices = devices.map_err(|e| MediaError::DeviceEnumeration(e.to_string()))?;
    Ok(devices
        .filter_map(|device| device.name().ok())
        .map(|name| DeviceInfo {
            id: name.clone(),
            label: name,
            kind,
        })
        .collect())
}

fn find_input(host: &cpal::Host, device_id: Option<&str>) -> Result<cpal::Device, MediaError> {
    let found = match device_id {
        None => host.default_input_device(),
        Some(id) => host
            .input_devices()
            .map_err(|e| MediaError::access(MediaAccessKind::PermissionDenied, e.to_string()))?
            .find(|d| d.name().map(|n| n == id).unwrap_or(false)),
    };
    found.ok_or_else(|| {
        MediaError::access(
            MediaAccessKind::DeviceNotFound,
            format!("no input device {}", device_id.unwrap_or("(default)")),
        )
    })
}

fn build_error(err: cpal::BuildStreamError) -> MediaError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => {
            MediaError::access(MediaAccessKind::DeviceNotFound, err.to_string())
        }
        other => MediaError::access(MediaAccessKind::DeviceBusy, other.to_string()),
    }
}

#[async_trait]
impl MediaDevices for CpalDevices {
    async fn enumerate(&self) -> Result<Vec<DeviceInfo>, MediaError> {
        tokio::task::spawn_blocking(|| {
            let host = cpal::default_host();
            let mut devices = device_infos(host.input_devices(), DeviceKind::AudioInput)?;
            devices.extend(device_infos(host.output_devices(), DeviceKind::AudioOutput)?);
            Ok(devices)
        })
        .await
        .map_err(|e| MediaError::DeviceEnumeration(e.to_string()))?
    }

    async fn open(&self, constraints: &CaptureConstraints) -> Result<LocalStream, MediaError> {
        if let Some(video) = &constraints.video_device_id {
            return Err(MediaError::access(
                MediaAccessKind::DeviceNotFound,
                format!("no video capture backend for {video}"),
            ));
        }

        let stream_id = format!("local-{:08x}", rand::random::<u32>());
        let track = capture_track(RTPCodecType::Audio, &stream_id);
        let capture = AudioCapture::start(constraints.audio_device_id.clone(), track.clone()).await?;

        Ok(LocalStream::new(
            stream_id,
            None,
            Some(track),
            Box::new(capture),
        ))
    }

    async fn route_output(&self, device_id: &str) -> Result<(), MediaError> {
        let id = device_id.to_owned();
        let exists = tokio::task::spawn_blocking(move || {
            cpal::default_host()
                .output_devices()
                .map(|mut devices| devices.any(|d| d.name().map(|n| n == id).unwrap_or(false)))
                .unwrap_or(false)
        })
        .await
        .unwrap_or(false);

        if exists {
            debug!(device = device_id, "audio output routed");
            Ok(())
        } else {
            Err(MediaError::OutputRouting(format!(
                "output device {device_id} not available"
            )))
        }
    }
}

/// Microphone capture feeding an outbound track. The cpal stream lives on its
/// own thread because it is not `Send` on every platform.
pub struct AudioCapture {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl AudioCapture {
    pub async fn start(
        device_id: Option<String>,
        track: Arc<TrackLocalStaticSample>,
    ) -> Result<Self, MediaError> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), MediaError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::spawn(move || {
            let host = cpal::default_host();
            let stream = match Self::open_stream(&host, device_id.as_deref(), track) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            // Parked until stop() or the guard is dropped
            let _ = stop_rx.recv();
            drop(stream);
        });

        let ready = tokio::task::spawn_blocking(move || ready_rx.recv())
            .await
            .map_err(|e| MediaError::access(MediaAccessKind::DeviceBusy, e.to_string()))?
            .map_err(|_| {
                MediaError::access(MediaAccessKind::DeviceBusy, "capture thread exited")
            })?;
        ready?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    fn open_stream(
        host: &cpal::Host,
        device_id: Option<&str>,
        track: Arc<TrackLocalStaticSample>,
    ) -> Result<cpal::Stream, MediaError> {
        let device = find_input(host, device_id)?;
        let config = device.default_input_config().map_err(|e| match e {
            cpal::DefaultStreamConfigError::DeviceNotAvailable => {
                MediaError::access(MediaAccessKind::DeviceNotFound, e.to_string())
            }
            other => MediaError::access(MediaAccessKind::DeviceBusy, other.to_string()),
        })?;
        debug!("input config: {:?}", config);

        let stream = match config.sample_format() {
            SampleFormat::F32 => Self::build_input_stream::<f32>(&device, &config.into(), track),
            SampleFormat::I16 => Self::build_input_stream::<i16>(&device, &config.into(), track),
            SampleFormat::U16 => Self::build_input_stream::<u16>(&device, &config.into(), track),
            sample_format => {
                return Err(MediaError::access(
                    MediaAccessKind::DeviceBusy,
                    format!("unsupported sample format: {sample_format:?}"),
                ))
            }
        }
        .map_err(build_error)?;

        stream
            .play()
            .map_err(|e| MediaError::access(MediaAccessKind::DeviceBusy, e.to_string()))?;
        Ok(stream)
    }

    fn build_input_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        track: Arc<TrackLocalStaticSample>,
    ) -> Result<cpal::Stream, cpal::BuildStreamError>
    where
        T: SizedSample + Send + 'static,
        f32: FromSample<T>,
    {
        let mut packetizer = PcmuPacketizer::new(config.sample_rate.0, config.channels);
        let mut buffer = Vec::new();
        let err_fn = |err| warn!("input audio stream error: {}", err);

        device.build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                buffer.clear();
                buffer.extend(data.iter().map(|s| <f32 as Sample>::from_sample(*s)));
                for payload in packetizer.push(&buffer) {
                    let sample = MediaSample {
                        data: payload,
                        duration: PCMU_FRAME_DURATION,
                        ..Default::default()
                    };
                    if let Err(e) = futures::executor::block_on(track.write_sample(&sample)) {
                        debug!("failed to write audio sample: {}", e);
                    }
                }
            },
            err_fn,
            None,
        )
    }
}

impl CaptureGuard for AudioCapture {
    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("audio capture thread panicked");
            }
        }
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
