//! Sample conversion: downmix to mono, optional resampling, fixed-size framing

use super::types::AudioFrame;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::{error, info};

/// Converts device-native interleaved samples into fixed-size mono frames at a target rate
pub(crate) struct FramePipeline {
    channels: usize,
    resampler: Option<SincFixedIn<f32>>,
    input_chunk_size: usize,
    input_buffer: Vec<f32>,
    output_buffer: Vec<i16>,
    frame_samples: usize,
    target_rate: u32,
}

impl FramePipeline {
    pub(crate) fn new(source_rate: u32, target_rate: u32, channels: usize, frame_samples: usize) -> Self {
        let (resampler, input_chunk_size) = if source_rate != target_rate {
            create_resampler(source_rate, target_rate, frame_samples)
        } else {
            (None, frame_samples)
        };

        Self {
            channels: channels.max(1),
            resampler,
            input_chunk_size,
            input_buffer: Vec::with_capacity(input_chunk_size * 2),
            output_buffer: Vec::with_capacity(frame_samples * 2),
            frame_samples,
            target_rate,
        }
    }

    pub(crate) fn push_i16(&mut self, data: &[i16], emit: impl FnMut(AudioFrame)) {
        let mono = downmix(data, self.channels, |s| f32::from(s) / 32768.0);
        self.process(mono, emit);
    }

    pub(crate) fn push_f32(&mut self, data: &[f32], emit: impl FnMut(AudioFrame)) {
        let mono = downmix(data, self.channels, |s| s);
        self.process(mono, emit);
    }

    fn process(&mut self, mono: Vec<f32>, mut emit: impl FnMut(AudioFrame)) {
        match self.resampler.as_mut() {
            Some(resampler) => {
                self.input_buffer.extend(mono);
                while self.input_buffer.len() >= self.input_chunk_size {
                    let chunk: Vec<f32> = self.input_buffer.drain(..self.input_chunk_size).collect();
                    match resampler.process(&[chunk], None) {
                        Ok(resampled) => {
                            if let Some(channel) = resampled.first() {
                                self.output_buffer.extend(channel.iter().map(|&s| to_i16(s)));
                            }
                        }
                        Err(e) => error!("Resampling error: {}", e),
                    }
                }
            }
            None => self.output_buffer.extend(mono.into_iter().map(to_i16)),
        }

        while self.output_buffer.len() >= self.frame_samples {
            let samples: Vec<i16> = self.output_buffer.drain(..self.frame_samples).collect();
            emit(AudioFrame {
                samples,
                sample_rate: self.target_rate,
            });
        }
    }
}

fn create_resampler(
    source_rate: u32,
    target_rate: u32,
    frame_samples: usize,
) -> (Option<SincFixedIn<f32>>, usize) {
    info!("Creating resampler: {} Hz -> {} Hz", source_rate, target_rate);
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    // Input chunk that yields one output frame per call
    let input_frames =
        (frame_samples as f64 * source_rate as f64 / target_rate as f64).ceil() as usize;
    match SincFixedIn::<f32>::new(
        target_rate as f64 / source_rate as f64,
        2.0,
        params,
        input_frames,
        1,
    ) {
        Ok(resampler) => (Some(resampler), input_frames),
        Err(e) => {
            error!("Failed to create resampler: {}", e);
            (None, frame_samples)
        }
    }
}

fn downmix<T: Copy>(data: &[T], channels: usize, to_f32: impl Fn(T) -> f32) -> Vec<f32> {
    if channels > 1 {
        data.chunks(channels)
            .map(|frame| frame.iter().map(|&s| to_f32(s)).sum::<f32>() / frame.len() as f32)
            .collect()
    } else {
        data.iter().map(|&s| to_f32(s)).collect()
    }
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_framing_and_downmix() {
        let mut pipeline = FramePipeline::new(8000, 8000, 2, 160);
        let mut frames = Vec::new();

        // 250 stereo samples: left 1000, right 3000
        let data: Vec<i16> = (0..250).flat_map(|_| [1000i16, 3000]).collect();
        pipeline.push_i16(&data, |f| frames.push(f));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples.len(), 160);
        assert_eq!(frames[0].sample_rate, 8000);
        assert!((i32::from(frames[0].samples[0]) - 2000).abs() <= 1);

        // Remaining 90 samples complete a frame with the next push
        pipeline.push_i16(&data[..140], |f| frames.push(f));
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_resampled_frames() {
        let mut pipeline = FramePipeline::new(48000, 8000, 1, 160);
        let mut frames = Vec::new();
        let data = vec![0.25f32; 9600];
        pipeline.push_f32(&data, |f| frames.push(f));

        assert!(frames.len() >= 8, "only {} frames", frames.len());
        assert!(frames.iter().all(|f| f.samples.len() == 160 && f.sample_rate == 8000));
    }
}
