//! Audio types and device error mapping

use crate::error::MediaAccessError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

/// Block of mono PCM audio
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// PCM 16-bit signed samples (mono)
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn duration(&self) -> std::time::Duration {
        let micros = self.samples.len() as u64 * 1_000_000 / u64::from(self.sample_rate.max(1));
        std::time::Duration::from_micros(micros)
    }
}

/// How often a parked device thread rechecks whether its stream ended on its own
const DEVICE_POLL: Duration = Duration::from_millis(250);

/// Handle for a device stream running on its own thread.
/// The stream stops when this handle is dropped.
pub struct DeviceThreadHandle {
    running: Arc<AtomicBool>,
    shutdown: Option<mpsc::Sender<()>>,
    thread_handle: Option<JoinHandle<()>>,
    label: &'static str,
}

/// Device thread's side of a [`DeviceThreadHandle`]
pub(crate) struct StopSignal {
    running: Arc<AtomicBool>,
    shutdown: mpsc::Receiver<()>,
}

impl StopSignal {
    /// Cleared by [`DeviceThreadHandle::stop`], or by stream callbacks when the device goes away
    pub(crate) fn running(&self) -> &Arc<AtomicBool> {
        &self.running
    }

    /// Park the thread until stop is requested or the stream flags itself as ended
    pub(crate) fn wait(&self) {
        while self.running.load(Ordering::SeqCst) {
            match self.shutdown.recv_timeout(DEVICE_POLL) {
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
    }
}

impl DeviceThreadHandle {
    /// Run `body` on a dedicated thread. `body` owns the device stream and
    /// returns once [`StopSignal::wait`] does.
    pub(crate) fn spawn<F>(label: &'static str, body: F) -> Self
    where
        F: FnOnce(StopSignal) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let signal = StopSignal {
            running: Arc::clone(&running),
            shutdown: shutdown_rx,
        };
        let running_thread = Arc::clone(&running);
        let thread_handle = thread::spawn(move || {
            body(signal);
            running_thread.store(false, Ordering::SeqCst);
        });

        Self {
            running,
            shutdown: Some(shutdown_tx),
            thread_handle: Some(thread_handle),
            label,
        }
    }

    /// Wake the device thread and wait for it to release the stream.
    /// The thread is parked on the shutdown channel, so the join only
    /// covers dropping the stream.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            info!("Audio {} stopped", self.label);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for DeviceThreadHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Live local audio source (the microphone), fanned out to any number of consumers
pub struct LocalAudio {
    frames: broadcast::Sender<AudioFrame>,
    capture: Option<DeviceThreadHandle>,
    stopped: bool,
}

impl LocalAudio {
    pub(crate) fn new(frames: broadcast::Sender<AudioFrame>, capture: Option<DeviceThreadHandle>) -> Self {
        Self {
            frames,
            capture,
            stopped: false,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AudioFrame> {
        self.frames.subscribe()
    }

    /// False once stopped, or when the device stream has ended on its own
    pub fn is_live(&self) -> bool {
        !self.stopped && self.capture.as_ref().map_or(true, DeviceThreadHandle::is_running)
    }

    /// Release the device. Safe to call more than once.
    pub fn stop(&mut self) {
        self.stopped = true;
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
    }
}

/// Output sink playing the remote party's audio
pub struct PlaybackSink {
    playback: Option<DeviceThreadHandle>,
    feeder: Option<tokio::task::JoinHandle<()>>,
}

impl PlaybackSink {
    pub(crate) fn new(
        playback: Option<DeviceThreadHandle>,
        feeder: Option<tokio::task::JoinHandle<()>>,
    ) -> Self {
        Self { playback, feeder }
    }

    /// Safe to call more than once
    pub fn stop(&mut self) {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
        if let Some(mut playback) = self.playback.take() {
            playback.stop();
        }
    }
}

impl Drop for PlaybackSink {
    fn drop(&mut self) {
        self.stop();
    }
}

fn classify_backend(description: &str) -> MediaAccessError {
    let lower = description.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not permitted") {
        MediaAccessError::PermissionDenied(description.to_string())
    } else {
        MediaAccessError::DeviceBusy(description.to_string())
    }
}

impl From<cpal::BuildStreamError> for MediaAccessError {
    fn from(e: cpal::BuildStreamError) -> Self {
        match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                MediaAccessError::DeviceBusy("device not available".to_string())
            }
            cpal::BuildStreamError::BackendSpecific { err } => classify_backend(&err.description),
            other => MediaAccessError::Unsupported(other.to_string()),
        }
    }
}

impl From<cpal::DefaultStreamConfigError> for MediaAccessError {
    fn from(e: cpal::DefaultStreamConfigError) -> Self {
        match e {
            cpal::DefaultStreamConfigError::DeviceNotAvailable => {
                MediaAccessError::DeviceBusy("device not available".to_string())
            }
            cpal::DefaultStreamConfigError::BackendSpecific { err } => {
                classify_backend(&err.description)
            }
            other => MediaAccessError::Unsupported(other.to_string()),
        }
    }
}

impl From<cpal::PlayStreamError> for MediaAccessError {
    fn from(e: cpal::PlayStreamError) -> Self {
        match e {
            cpal::PlayStreamError::DeviceNotAvailable => {
                MediaAccessError::DeviceBusy("device not available".to_string())
            }
            cpal::PlayStreamError::BackendSpecific { err } => classify_backend(&err.description),
            #[allow(unreachable_patterns)]
            other => MediaAccessError::Unsupported(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_errors_are_classified() {
        assert!(matches!(
            classify_backend("Microphone access denied by the user"),
            MediaAccessError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_backend("Device or resource busy"),
            MediaAccessError::DeviceBusy(_)
        ));
    }

    #[test]
    fn test_local_audio_stop_is_idempotent() {
        let (tx, _) = broadcast::channel(4);
        let mut local = LocalAudio::new(tx, None);
        assert!(local.is_live());
        local.stop();
        local.stop();
        assert!(!local.is_live());
    }

    #[test]
    fn test_stop_wakes_parked_device_thread() {
        let mut handle = DeviceThreadHandle::spawn("test", |signal| signal.wait());
        assert!(handle.is_running());

        let started = std::time::Instant::now();
        handle.stop();
        assert!(started.elapsed() < DEVICE_POLL);
        assert!(!handle.is_running());
        // Second stop has nothing left to join
        handle.stop();
    }

    #[test]
    fn test_stream_ended_by_device() {
        let (done_tx, done_rx) = mpsc::channel();
        let handle = DeviceThreadHandle::spawn("test", move |signal| {
            // What the stream error callback does when the device disappears
            signal.running().store(false, Ordering::SeqCst);
            signal.wait();
            let _ = done_tx.send(());
        });

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!handle.is_running());
        let mut local = LocalAudio::new(broadcast::channel(4).0, Some(handle));
        assert!(!local.is_live());
        local.stop();
    }

    #[test]
    fn test_frame_duration() {
        let frame = AudioFrame {
            samples: vec![0; 160],
            sample_rate: 8000,
        };
        assert_eq!(frame.duration(), std::time::Duration::from_millis(20));
    }
}
