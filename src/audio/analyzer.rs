//! Volume analyzer
//!
//! Attaches to an audio stream and keeps a normalized loudness level in 0.0..=1.0.
//! The level is the mean of byte-scaled frequency magnitudes over the analysis window:
//! Blackman-windowed FFT, magnitudes divided by the window length, exponential
//! smoothing across updates, then decibels mapped linearly from [-100, -30] dB onto
//! 0..=255 and clamped. Silence reads 0.

use super::types::AudioFrame;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

#[derive(Debug, Clone, Copy)]
pub struct AnalyzerSettings {
    pub fft_size: usize,
    /// Time constant in [0, 1); higher values react more slowly
    pub smoothing: f32,
}

impl AnalyzerSettings {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            fft_size: config.audio.analyzer_fft_size,
            smoothing: config.audio.analyzer_smoothing,
        }
    }
}

/// Spectrum state for one stream
pub(crate) struct Spectrum {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    samples: Vec<f32>,
    smoothed: Vec<f32>,
    smoothing: f32,
    scratch: Vec<Complex<f32>>,
}

impl Spectrum {
    pub(crate) fn new(settings: AnalyzerSettings) -> Self {
        let n = settings.fft_size;
        let fft = FftPlanner::new().plan_fft_forward(n);
        Self {
            fft,
            window: blackman(n),
            samples: vec![0.0; n],
            smoothed: vec![0.0; n / 2],
            smoothing: settings.smoothing,
            scratch: vec![Complex::new(0.0, 0.0); n],
        }
    }

    /// Slide new samples into the analysis window
    pub(crate) fn push(&mut self, pcm: &[i16]) {
        let n = self.samples.len();
        let incoming = &pcm[pcm.len().saturating_sub(n)..];
        self.samples.drain(..incoming.len());
        self.samples
            .extend(incoming.iter().map(|&s| f32::from(s) / 32768.0));
    }

    /// Recompute the spectrum and return the level
    pub(crate) fn update(&mut self) -> f32 {
        let n = self.samples.len();
        for ((slot, &sample), &w) in self.scratch.iter_mut().zip(&self.samples).zip(&self.window) {
            *slot = Complex::new(sample * w, 0.0);
        }
        self.fft.process(&mut self.scratch);

        let tau = self.smoothing;
        let mut total = 0.0f32;
        for (smoothed, bin) in self.smoothed.iter_mut().zip(&self.scratch) {
            let magnitude = bin.norm() / n as f32;
            *smoothed = tau * *smoothed + (1.0 - tau) * magnitude;
            total += byte_scale(*smoothed);
        }

        let mean = total / self.smoothed.len() as f32;
        (mean / 128.0).clamp(0.0, 1.0)
    }
}

fn blackman(n: usize) -> Vec<f32> {
    let (a0, a1, a2) = (0.42f32, 0.5f32, 0.08f32);
    (0..n)
        .map(|i| {
            let x = 2.0 * std::f32::consts::PI * i as f32 / n as f32;
            a0 - a1 * x.cos() + a2 * (2.0 * x).cos()
        })
        .collect()
}

fn byte_scale(magnitude: f32) -> f32 {
    if magnitude <= 0.0 {
        return 0.0;
    }
    let db = 20.0 * magnitude.log10();
    let scaled = 255.0 * (db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS);
    scaled.clamp(0.0, 255.0).floor()
}

/// A running analyzer. Releasing it stops the analysis task; the last level is kept.
pub struct VolumeAnalyzer {
    label: &'static str,
    level: Arc<AtomicU32>,
    task: Option<JoinHandle<()>>,
}

impl VolumeAnalyzer {
    /// Start analyzing the frames arriving on `frames`
    pub fn attach(
        label: &'static str,
        mut frames: broadcast::Receiver<AudioFrame>,
        settings: AnalyzerSettings,
    ) -> Self {
        let level = Arc::new(AtomicU32::new(0f32.to_bits()));
        let shared = Arc::clone(&level);

        let task = tokio::spawn(async move {
            let mut spectrum = Spectrum::new(settings);
            loop {
                match frames.recv().await {
                    Ok(frame) => {
                        spectrum.push(&frame.samples);
                        shared.store(spectrum.update().to_bits(), Ordering::Relaxed);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        trace!(analyzer = label, skipped, "Analyzer lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(analyzer = label, "Analyzer stream ended");
        });

        Self {
            label,
            level,
            task: Some(task),
        }
    }

    pub fn level(&self) -> f32 {
        f32::from_bits(self.level.load(Ordering::Relaxed))
    }

    /// Safe to call more than once
    pub fn release(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(analyzer = self.label, "Analyzer released");
        }
    }
}

impl Drop for VolumeAnalyzer {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings() -> AnalyzerSettings {
        AnalyzerSettings {
            fft_size: 256,
            smoothing: 0.8,
        }
    }

    /// Deterministic pseudo-noise at roughly half scale
    fn noise(len: usize, seed: &mut u32) -> Vec<i16> {
        (0..len)
            .map(|_| {
                *seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                ((*seed >> 16) as i16) / 2
            })
            .collect()
    }

    #[test]
    fn test_silence_reads_zero() {
        let mut spectrum = Spectrum::new(settings());
        for _ in 0..10 {
            spectrum.push(&[0; 160]);
            assert_eq!(spectrum.update(), 0.0);
        }
    }

    #[test]
    fn test_loud_signal_is_bounded() {
        let mut spectrum = Spectrum::new(settings());
        let mut seed = 7;
        let mut level = 0.0;
        for _ in 0..20 {
            spectrum.push(&noise(160, &mut seed));
            level = spectrum.update();
            assert!((0.0..=1.0).contains(&level));
        }
        assert!(level > 0.5, "level {}", level);
    }

    #[test]
    fn test_level_decays_after_signal_stops() {
        let mut spectrum = Spectrum::new(settings());
        let mut seed = 11;
        for _ in 0..20 {
            spectrum.push(&noise(160, &mut seed));
            spectrum.update();
        }
        let loud = spectrum.update();

        let mut quiet = loud;
        for _ in 0..200 {
            spectrum.push(&[0; 160]);
            quiet = spectrum.update();
        }
        assert!(quiet < loud);
    }

    #[test]
    fn test_byte_scale_range() {
        assert_eq!(byte_scale(0.0), 0.0);
        assert_eq!(byte_scale(1e-6), 0.0);
        assert_eq!(byte_scale(1.0), 255.0);
        // -65 dB sits halfway
        let mid = byte_scale(10f32.powf(-65.0 / 20.0));
        assert!((126.0..=128.0).contains(&mid));
    }

    #[tokio::test]
    async fn test_attach_and_release() {
        let (tx, rx) = broadcast::channel(16);
        let mut analyzer = VolumeAnalyzer::attach("test", rx, settings());
        assert_eq!(analyzer.level(), 0.0);

        let mut seed = 3;
        for _ in 0..5 {
            tx.send(AudioFrame {
                samples: noise(160, &mut seed),
                sample_rate: 8000,
            })
            .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let level = analyzer.level();
        assert!(level > 0.0);

        analyzer.release();

        let _ = tx.send(AudioFrame {
            samples: vec![0; 160],
            sample_rate: 8000,
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(analyzer.level(), level);
    }
}
