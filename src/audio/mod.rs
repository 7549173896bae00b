//! Local audio devices using cpal
//!
//! Captures the default microphone as 8 kHz mono frames for the audio channel and
//! plays the remote party's audio on the default output device. cpal streams are not
//! `Send`, so each one lives on a dedicated thread and reports startup through a
//! oneshot channel.

pub mod analyzer;
pub mod g711;
mod playback;
mod resampler;
mod types;

pub use analyzer::{AnalyzerSettings, VolumeAnalyzer};
pub use types::{AudioFrame, DeviceThreadHandle, LocalAudio, PlaybackSink};

use crate::error::MediaAccessError;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use resampler::FramePipeline;
use types::StopSignal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tracing::{error, info, warn};

/// Sample rate of the audio channel (G.711)
pub const RTC_SAMPLE_RATE: u32 = 8000;

/// 20 ms at 8 kHz
pub const FRAME_SAMPLES: usize = 160;

/// Frames buffered per subscriber before the slowest one starts skipping
const FRAME_BUFFER: usize = 64;

/// Source of local microphone and speaker access
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open_microphone(&self) -> Result<LocalAudio, MediaAccessError>;

    /// Start playing `remote` on the output device
    async fn open_speaker(
        &self,
        remote: broadcast::Receiver<AudioFrame>,
    ) -> Result<PlaybackSink, MediaAccessError>;
}

/// The host's default input and output devices
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDevices;

#[async_trait]
impl MediaDevices for CpalDevices {
    async fn open_microphone(&self) -> Result<LocalAudio, MediaAccessError> {
        let (frames_tx, _) = broadcast::channel(FRAME_BUFFER);
        let capture = start_capture(frames_tx.clone()).await?;
        Ok(LocalAudio::new(frames_tx, Some(capture)))
    }

    async fn open_speaker(
        &self,
        remote: broadcast::Receiver<AudioFrame>,
    ) -> Result<PlaybackSink, MediaAccessError> {
        playback::start_playback(remote).await
    }
}

/// Start microphone capture on a dedicated thread.
/// Resolves once the stream is playing, or with the reason it could not start.
async fn start_capture(
    frames_tx: broadcast::Sender<AudioFrame>,
) -> Result<DeviceThreadHandle, MediaAccessError> {
    let (ready_tx, ready_rx) = oneshot::channel();
    let mut handle = DeviceThreadHandle::spawn("capture", move |signal| {
        if let Err(e) = run_capture(&signal, frames_tx, ready_tx) {
            error!("Audio capture error: {}", e);
        }
    });

    match ready_rx.await {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(e)) => {
            handle.stop();
            Err(e)
        }
        Err(_) => {
            handle.stop();
            Err(MediaAccessError::StreamEnded)
        }
    }
}

/// Run audio capture on the current thread (blocking)
fn run_capture(
    signal: &StopSignal,
    frames_tx: broadcast::Sender<AudioFrame>,
    ready_tx: oneshot::Sender<Result<(), MediaAccessError>>,
) -> Result<(), MediaAccessError> {
    let stream = match build_input_stream(signal.running(), frames_tx) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e.clone()));
            return Err(e);
        }
    };

    if let Err(e) = stream.play() {
        let e = MediaAccessError::from(e);
        let _ = ready_tx.send(Err(e.clone()));
        return Err(e);
    }
    info!("Audio capture started");
    let _ = ready_tx.send(Ok(()));

    // Keep the stream alive until capture is stopped
    signal.wait();

    drop(stream);
    Ok(())
}

fn build_input_stream(
    running: &Arc<AtomicBool>,
    frames_tx: broadcast::Sender<AudioFrame>,
) -> Result<cpal::Stream, MediaAccessError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(MediaAccessError::NoDevice)?;

    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    info!("Using audio input device: {}", device_name);

    let supported = device.default_input_config()?;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let channels = config.channels as usize;
    info!(
        "Audio input config: {} channels, {} Hz, {:?}",
        channels, config.sample_rate.0, sample_format
    );

    let mut pipeline = FramePipeline::new(
        config.sample_rate.0,
        RTC_SAMPLE_RATE,
        channels,
        FRAME_SAMPLES,
    );
    let running_stream = Arc::clone(running);
    let running_err = Arc::clone(running);
    let err_callback = move |err: cpal::StreamError| {
        error!("Audio input stream error: {}", err);
        if matches!(err, cpal::StreamError::DeviceNotAvailable) {
            running_err.store(false, Ordering::SeqCst);
        }
    };

    // Nobody listening yet is fine; frames are simply dropped
    let stream = match sample_format {
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _| {
                if running_stream.load(Ordering::SeqCst) {
                    pipeline.push_i16(data, |frame| {
                        let _ = frames_tx.send(frame);
                    });
                }
            },
            err_callback,
            None,
        )?,
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _| {
                if running_stream.load(Ordering::SeqCst) {
                    pipeline.push_f32(data, |frame| {
                        let _ = frames_tx.send(frame);
                    });
                }
            },
            err_callback,
            None,
        )?,
        other => {
            warn!("Unsupported input sample format {:?}", other);
            return Err(MediaAccessError::Unsupported(format!("{:?}", other)));
        }
    };

    Ok(stream)
}
