//! Remote audio playback on the default output device

use super::resampler::FramePipeline;
use super::types::{AudioFrame, DeviceThreadHandle, PlaybackSink, StopSignal};
use super::RTC_SAMPLE_RATE;
use crate::error::MediaAccessError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

/// Samples handed to the device between feeder wakeups (10 ms at 48 kHz)
const OUTPUT_CHUNK: usize = 480;

/// Cap on queued output, in seconds, before old audio is discarded
const MAX_QUEUED_SECS: usize = 1;

type SampleQueue = Arc<Mutex<VecDeque<f32>>>;

pub(super) async fn start_playback(
    mut remote: broadcast::Receiver<AudioFrame>,
) -> Result<PlaybackSink, MediaAccessError> {
    let queue: SampleQueue = Arc::new(Mutex::new(VecDeque::new()));
    let queue_thread = Arc::clone(&queue);
    let (ready_tx, ready_rx) = oneshot::channel();

    let mut handle = DeviceThreadHandle::spawn("playback", move |signal| {
        if let Err(e) = run_playback(&signal, queue_thread, ready_tx) {
            error!("Audio playback error: {}", e);
        }
    });

    let device_rate = match ready_rx.await {
        Ok(Ok(rate)) => rate,
        Ok(Err(e)) => {
            handle.stop();
            return Err(e);
        }
        Err(_) => {
            handle.stop();
            return Err(MediaAccessError::StreamEnded);
        }
    };

    let feeder = tokio::spawn(async move {
        let mut pipeline = FramePipeline::new(RTC_SAMPLE_RATE, device_rate, 1, OUTPUT_CHUNK);
        let max_queued = device_rate as usize * MAX_QUEUED_SECS;
        loop {
            match remote.recv().await {
                Ok(frame) => {
                    let Ok(mut pending) = queue.lock() else {
                        break;
                    };
                    pipeline.push_i16(&frame.samples, |chunk| {
                        pending.extend(chunk.samples.iter().map(|&s| f32::from(s) / 32768.0));
                    });
                    let excess = pending.len().saturating_sub(max_queued);
                    if excess > 0 {
                        pending.drain(..excess);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Playback lagged, {} frames skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Remote audio stream ended");
    });

    Ok(PlaybackSink::new(Some(handle), Some(feeder)))
}

/// Run the output stream on the current thread (blocking)
fn run_playback(
    signal: &StopSignal,
    queue: SampleQueue,
    ready_tx: oneshot::Sender<Result<u32, MediaAccessError>>,
) -> Result<(), MediaAccessError> {
    let (stream, rate) = match build_output_stream(queue) {
        Ok(built) => built,
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
    info!("Audio playback started");
    let _ = ready_tx.send(Ok(rate));

    signal.wait();

    drop(stream);
    Ok(())
}

fn build_output_stream(queue: SampleQueue) -> Result<(cpal::Stream, u32), MediaAccessError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(MediaAccessError::NoDevice)?;

    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    info!("Using audio output device: {}", device_name);

    let supported = device.default_output_config()?;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let channels = config.channels as usize;
    let rate = config.sample_rate.0;

    let err_callback = |err: cpal::StreamError| error!("Audio output stream error: {}", err);

    let stream = match sample_format {
        SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _| fill(data, channels, &queue, |s| s),
            err_callback,
            None,
        )?,
        SampleFormat::I16 => device.build_output_stream(
            &config,
            move |data: &mut [i16], _| {
                fill(data, channels, &queue, |s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
            },
            err_callback,
            None,
        )?,
        other => {
            warn!("Unsupported output sample format {:?}", other);
            return Err(MediaAccessError::Unsupported(format!("{:?}", other)));
        }
    };

    Ok((stream, rate))
}

/// Copy queued mono samples to every output channel, padding with silence on underrun
fn fill<T: Copy>(data: &mut [T], channels: usize, queue: &SampleQueue, convert: impl Fn(f32) -> T) {
    let mut queue = queue.lock().ok();
    for frame in data.chunks_mut(channels.max(1)) {
        let sample = queue.as_mut().and_then(|q| q.pop_front()).unwrap_or(0.0);
        let value = convert(sample);
        for slot in frame.iter_mut() {
            *slot = value;
        }
    }
}
