//! Deterministic normalization to the canonical sample buffer.
//!
//! Resampling is plain linear interpolation computed in `f64`. Given the same
//! input it always yields the same output, which keeps fingerprints and
//! cached results stable.

use crate::audio::buffer::AudioBuffer;
use crate::defaults::{CANONICAL_CHANNELS, CANONICAL_SAMPLE_RATE};
use crate::error::Result;

/// Convert to the rate and channel layout the separation models expect.
pub fn normalize(buffer: AudioBuffer) -> Result<AudioBuffer> {
    let mapped = map_channels(buffer, CANONICAL_CHANNELS)?;
    resample(mapped, CANONICAL_SAMPLE_RATE)
}

/// Change the channel count.
///
/// Mono is duplicated, stereo to mono averages both sides, and anything wider
/// than stereo keeps its first two channels.
pub fn map_channels(buffer: AudioBuffer, to_channels: u16) -> Result<AudioBuffer> {
    let from = buffer.channels();
    if from == to_channels {
        return Ok(buffer);
    }
    let rate = buffer.sample_rate();
    let width = from as usize;

    let samples: Vec<f32> = match (from, to_channels) {
        (1, n) => buffer
            .samples()
            .iter()
            .flat_map(|&s| std::iter::repeat_n(s, n as usize))
            .collect(),
        (_, 1) => buffer
            .samples()
            .chunks_exact(width)
            .map(|frame| (frame.iter().map(|&s| s as f64).sum::<f64>() / width as f64) as f32)
            .collect(),
        (_, n) => buffer
            .samples()
            .chunks_exact(width)
            .flat_map(|frame| (0..n as usize).map(move |c| frame.get(c).copied().unwrap_or(0.0)))
            .collect(),
    };

    AudioBuffer::new(samples, rate, to_channels)
}

/// Resample every channel to `to_rate`.
pub fn resample(buffer: AudioBuffer, to_rate: u32) -> Result<AudioBuffer> {
    if buffer.sample_rate() == to_rate {
        return Ok(buffer);
    }
    if buffer.is_empty() {
        return Ok(AudioBuffer::empty(to_rate, buffer.channels()));
    }

    let from_rate = buffer.sample_rate();
    let channels: Vec<Vec<f32>> = buffer
        .split_channels()
        .iter()
        .map(|c| resample_channel(c, from_rate, to_rate))
        .collect();
    AudioBuffer::from_channels(&channels, to_rate)
}

/// Simple linear interpolation resampling.
fn resample_channel(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as u64 * to_rate as u64).div_ceil(from_rate as u64) as usize;

    (0..output_len)
        .map(|i| {
            let source_pos = i as f64 * ratio;
            let source_idx = (source_pos.floor() as usize).min(samples.len() - 1);
            let fraction = source_pos - source_idx as f64;

            if source_idx + 1 >= samples.len() {
                samples[source_idx]
            } else {
                let left = samples[source_idx] as f64;
                let right = samples[source_idx + 1] as f64;
                (left + (right - left) * fraction) as f32
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono(samples: Vec<f32>, rate: u32) -> AudioBuffer {
        AudioBuffer::new(samples, rate, 1).unwrap()
    }

    #[test]
    fn test_resample_same_rate_is_identity() {
        let input = mono(vec![0.1, 0.2, 0.3], 44_100);
        let output = resample(input.clone(), 44_100).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn test_resample_upsample_length() {
        let input = mono(vec![0.0; 16_000], 16_000);
        let output = resample(input, 44_100).unwrap();
        assert_eq!(output.frames(), 44_100);
        assert_eq!(output.sample_rate(), 44_100);
    }

    #[test]
    fn test_resample_downsample_length() {
        let input = mono(vec![0.0; 48_000], 48_000);
        let output = resample(input, 44_100).unwrap();
        assert_eq!(output.frames(), 44_100);
    }

    #[test]
    fn test_resample_interpolates_linearly() {
        let input = mono(vec![0.0, 1.0], 1);
        let output = resample(input, 2).unwrap();
        assert_eq!(output.samples(), &[0.0, 0.5, 1.0, 1.0]);
    }

    #[test]
    fn test_resample_is_deterministic() {
        let samples: Vec<f32> = (0..2_000).map(|i| (i as f32 * 0.01).sin()).collect();
        let a = resample(mono(samples.clone(), 22_050), 44_100).unwrap();
        let b = resample(mono(samples, 22_050), 44_100).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_resample_empty_keeps_channels() {
        let output = resample(AudioBuffer::empty(8_000, 2), 44_100).unwrap();
        assert!(output.is_empty());
        assert_eq!(output.channels(), 2);
        assert_eq!(output.sample_rate(), 44_100);
    }

    #[test]
    fn test_mono_to_stereo_duplicates() {
        let output = map_channels(mono(vec![0.25, -0.5], 8_000), 2).unwrap();
        assert_eq!(output.samples(), &[0.25, 0.25, -0.5, -0.5]);
    }

    #[test]
    fn test_stereo_to_mono_averages() {
        let input = AudioBuffer::new(vec![1.0, 0.0, -1.0, -0.5], 8_000, 2).unwrap();
        let output = map_channels(input, 1).unwrap();
        assert_eq!(output.samples(), &[0.5, -0.75]);
    }

    #[test]
    fn test_surround_to_stereo_keeps_front_pair() {
        let input = AudioBuffer::new(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6], 8_000, 3).unwrap();
        let output = map_channels(input, 2).unwrap();
        assert_eq!(output.samples(), &[0.1, 0.2, 0.4, 0.5]);
    }

    #[test]
    fn test_normalize_produces_canonical_layout() {
        let output = normalize(mono(vec![0.0; 8_000], 8_000)).unwrap();
        assert_eq!(output.sample_rate(), CANONICAL_SAMPLE_RATE);
        assert_eq!(output.channels(), CANONICAL_CHANNELS);
        assert!((output.duration_secs() - 1.0).abs() < 1e-3);
    }
}
