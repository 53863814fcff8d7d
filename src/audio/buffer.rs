//! Interleaved floating-point sample buffer.

use crate::error::{Result, SeparationError};

/// Decoded audio: interleaved `f32` samples in `[-1.0, 1.0]`, a sample rate
/// and a channel count.
///
/// A buffer is never mutated after construction. Pipeline stages take it by
/// value and hand a new buffer to the next stage.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
}

impl AudioBuffer {
    /// Build a buffer from interleaved samples.
    ///
    /// Fails when the rate or channel count is zero, or when the sample count
    /// is not a whole number of frames.
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Result<Self> {
        if sample_rate == 0 {
            return Err(SeparationError::CorruptInput {
                message: "sample rate is zero".to_string(),
            });
        }
        if channels == 0 {
            return Err(SeparationError::CorruptInput {
                message: "channel count is zero".to_string(),
            });
        }
        if samples.len() % channels as usize != 0 {
            return Err(SeparationError::CorruptInput {
                message: format!(
                    "{} samples do not divide into {} channels",
                    samples.len(),
                    channels
                ),
            });
        }
        Ok(Self {
            samples,
            sample_rate,
            channels,
        })
    }

    /// A buffer with no frames.
    pub fn empty(sample_rate: u32, channels: u16) -> Self {
        Self {
            samples: Vec::new(),
            sample_rate: sample_rate.max(1),
            channels: channels.max(1),
        }
    }

    /// Interleave per-channel sample vectors into one buffer.
    ///
    /// All channels must have the same length.
    pub fn from_channels(channels: &[Vec<f32>], sample_rate: u32) -> Result<Self> {
        let Some(first) = channels.first() else {
            return Err(SeparationError::CorruptInput {
                message: "no channels".to_string(),
            });
        };
        let frames = first.len();
        if channels.iter().any(|c| c.len() != frames) {
            return Err(SeparationError::SeparationFailure {
                message: "channels have different lengths".to_string(),
            });
        }

        let mut samples = Vec::with_capacity(frames * channels.len());
        for frame in 0..frames {
            for channel in channels {
                samples.push(channel[frame]);
            }
        }
        Self::new(samples, sample_rate, channels.len() as u16)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// True when no sample is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        self.samples.iter().all(|s| s.is_finite())
    }

    /// Copy one channel out of the interleaved data.
    pub fn channel(&self, index: u16) -> Vec<f32> {
        if index >= self.channels {
            return Vec::new();
        }
        self.samples
            .iter()
            .skip(index as usize)
            .step_by(self.channels as usize)
            .copied()
            .collect()
    }

    /// De-interleave into one vector per channel.
    pub fn split_channels(&self) -> Vec<Vec<f32>> {
        (0..self.channels).map(|c| self.channel(c)).collect()
    }

    /// Consume the buffer and return the interleaved samples.
    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    /// Size of the sample data in bytes.
    pub fn byte_len(&self) -> usize {
        self.samples.len() * std::mem::size_of::<f32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_partial_frames() {
        let result = AudioBuffer::new(vec![0.0; 3], 44_100, 2);
        assert!(matches!(result, Err(SeparationError::CorruptInput { .. })));
    }

    #[test]
    fn test_new_rejects_zero_rate_and_channels() {
        assert!(AudioBuffer::new(vec![], 0, 2).is_err());
        assert!(AudioBuffer::new(vec![], 44_100, 0).is_err());
    }

    #[test]
    fn test_duration_and_frames() {
        let buffer = AudioBuffer::new(vec![0.0; 88_200], 44_100, 2).unwrap();
        assert_eq!(buffer.frames(), 44_100);
        assert!((buffer.duration_secs() - 1.0).abs() < 1e-9);
        assert_eq!(buffer.byte_len(), 88_200 * 4);
    }

    #[test]
    fn test_channel_split_and_interleave() {
        let buffer = AudioBuffer::new(vec![1.0, -1.0, 2.0, -2.0, 3.0, -3.0], 8_000, 2).unwrap();
        assert_eq!(buffer.channel(0), vec![1.0, 2.0, 3.0]);
        assert_eq!(buffer.channel(1), vec![-1.0, -2.0, -3.0]);
        assert!(buffer.channel(2).is_empty());

        let rebuilt = AudioBuffer::from_channels(&buffer.split_channels(), 8_000).unwrap();
        assert_eq!(rebuilt, buffer);
    }

    #[test]
    fn test_from_channels_rejects_ragged_input() {
        let result = AudioBuffer::from_channels(&[vec![0.0; 3], vec![0.0; 2]], 8_000);
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_buffer() {
        let buffer = AudioBuffer::empty(44_100, 2);
        assert!(buffer.is_empty());
        assert_eq!(buffer.frames(), 0);
        assert_eq!(buffer.duration_secs(), 0.0);
    }

    #[test]
    fn test_is_finite_detects_nan() {
        let buffer = AudioBuffer::new(vec![0.0, f32::NAN], 8_000, 1).unwrap();
        assert!(!buffer.is_finite());
    }
}
