//! Decoder/encoder adapter.
//!
//! Turns uploaded containers into a canonical [`AudioBuffer`] and stem buffers
//! back into bytes. Each [`AudioFormat`] has one explicit decode strategy:
//! WAV goes through hound, everything else through symphonia.

pub mod buffer;
pub mod compressed;
pub mod format;
pub mod resample;
pub mod wav;

pub use buffer::AudioBuffer;
pub use format::{AudioFormat, OutputFormat};
pub use resample::normalize;

use crate::error::{Result, SeparationError};

/// Decode a payload in its declared format.
///
/// An empty payload is `CorruptInput`. A well-formed container that holds no
/// frames decodes to an empty buffer.
pub fn decode(bytes: &[u8], format: AudioFormat) -> Result<AudioBuffer> {
    decode_inner(bytes, format, None)
}

/// Like [`decode`], failing with `InputTooLong` once the decoded audio passes
/// `max_duration_secs`. Memory stays bounded even when the container does not
/// record its length.
pub fn decode_bounded(bytes: &[u8], format: AudioFormat, max_duration_secs: u64) -> Result<AudioBuffer> {
    decode_inner(bytes, format, Some(max_duration_secs))
}

fn decode_inner(bytes: &[u8], format: AudioFormat, limit: Option<u64>) -> Result<AudioBuffer> {
    if bytes.is_empty() {
        return Err(SeparationError::CorruptInput {
            message: "payload is empty".to_string(),
        });
    }
    match format {
        AudioFormat::Wav => wav::decode_wav(bytes, limit),
        AudioFormat::Flac | AudioFormat::Mp3 | AudioFormat::Ogg | AudioFormat::M4a => {
            compressed::decode_compressed(bytes, format, limit)
        }
    }
}

/// Encode a buffer in the requested output format.
pub fn encode(buffer: &AudioBuffer, format: OutputFormat) -> Result<Vec<u8>> {
    match format {
        OutputFormat::Wav | OutputFormat::WavFloat => wav::encode_wav(buffer, format),
    }
}

/// Duration in seconds read from container headers, without decoding.
///
/// `None` when the container does not record its length (e.g. MP3 without a
/// Xing header). Callers must then check the decoded buffer instead.
pub fn probe_duration(bytes: &[u8], format: AudioFormat) -> Result<Option<f64>> {
    if bytes.is_empty() {
        return Err(SeparationError::CorruptInput {
            message: "payload is empty".to_string(),
        });
    }
    match format {
        AudioFormat::Wav => wav::probe_wav_duration(bytes).map(Some),
        _ => compressed::probe_compressed_duration(bytes, format),
    }
}

/// Decode and normalize in one step.
pub fn decode_canonical(bytes: &[u8], format: AudioFormat) -> Result<AudioBuffer> {
    let decoded = decode(bytes, format)?;
    normalize(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::{CANONICAL_CHANNELS, CANONICAL_SAMPLE_RATE};

    fn sine_wav(sample_rate: u32, channels: u16, seconds: f32) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        let frames = (sample_rate as f32 * seconds) as usize;
        for i in 0..frames {
            let t = i as f32 / sample_rate as f32;
            let s = ((t * 440.0 * std::f32::consts::TAU).sin() * 12_000.0) as i16;
            for _ in 0..channels {
                writer.write_sample(s).unwrap();
            }
        }
        writer.finalize().unwrap();
        cursor.into_inner()
    }

    #[test]
    fn test_empty_payload_is_corrupt_input() {
        for format in AudioFormat::ALL {
            assert!(matches!(
                decode(&[], format),
                Err(SeparationError::CorruptInput { .. })
            ));
        }
        assert!(probe_duration(&[], AudioFormat::Wav).is_err());
    }

    #[test]
    fn test_lossless_round_trip_reproduces_samples() {
        let bytes = sine_wav(44_100, 2, 0.25);
        let decoded = decode(&bytes, AudioFormat::Wav).unwrap();
        let reencoded = encode(&decoded, OutputFormat::Wav).unwrap();
        assert_eq!(decode(&reencoded, AudioFormat::Wav).unwrap(), decoded);
    }

    #[test]
    fn test_decode_canonical_reaches_model_layout() {
        let bytes = sine_wav(22_050, 1, 0.5);
        let buffer = decode_canonical(&bytes, AudioFormat::Wav).unwrap();
        assert_eq!(buffer.sample_rate(), CANONICAL_SAMPLE_RATE);
        assert_eq!(buffer.channels(), CANONICAL_CHANNELS);
        assert!((buffer.duration_secs() - 0.5).abs() < 0.001);
    }

    #[test]
    fn test_decode_canonical_is_deterministic() {
        let bytes = sine_wav(16_000, 1, 0.2);
        let a = decode_canonical(&bytes, AudioFormat::Wav).unwrap();
        let b = decode_canonical(&bytes, AudioFormat::Wav).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_decode_bounded_rejects_long_input() {
        let bytes = sine_wav(8_000, 1, 2.0);
        assert!(matches!(
            decode_bounded(&bytes, AudioFormat::Wav, 1),
            Err(SeparationError::InputTooLong { limit_secs: 1, .. })
        ));
        assert_eq!(
            decode_bounded(&bytes, AudioFormat::Wav, 2).unwrap().frames(),
            16_000
        );
    }

    #[test]
    fn test_probe_duration_for_wav() {
        let bytes = sine_wav(8_000, 1, 2.0);
        assert_eq!(probe_duration(&bytes, AudioFormat::Wav).unwrap(), Some(2.0));
    }

    #[test]
    fn test_mislabelled_payload_is_rejected() {
        let bytes = sine_wav(8_000, 1, 0.1);
        assert!(decode(b"definitely not audio", AudioFormat::Flac).is_err());
        assert!(decode(&bytes[..20], AudioFormat::Wav).is_err());
    }
}
