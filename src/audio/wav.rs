//! WAV decoding and encoding via hound.

use crate::audio::buffer::AudioBuffer;
use crate::audio::format::OutputFormat;
use crate::error::{Result, SeparationError};
use std::io::Cursor;

/// Decode a complete WAV payload into interleaved `f32` samples.
///
/// Integer PCM of any width hound supports is scaled by `2^(bits-1)`, so
/// 16-bit input maps `i` to `i / 32768`. The header length is checked against
/// `max_duration_secs` before any sample is read.
pub fn decode_wav(bytes: &[u8], max_duration_secs: Option<u64>) -> Result<AudioBuffer> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| map_hound_error(e, "Failed to parse WAV file"))?;

    let spec = reader.spec();
    if let Some(limit_secs) = max_duration_secs {
        let duration_secs = reader.duration() as f64 / spec.sample_rate.max(1) as f64;
        if duration_secs > limit_secs as f64 {
            return Err(SeparationError::InputTooLong {
                duration_secs,
                limit_secs,
            });
        }
    }
    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| map_hound_error(e, "Failed to read WAV samples"))?,
        hound::SampleFormat::Int => {
            let scale = int_scale(spec.bits_per_sample);
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| (v as f64 / scale) as f32))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| map_hound_error(e, "Failed to read WAV samples"))?
        }
    };

    AudioBuffer::new(samples, spec.sample_rate, spec.channels)
}

/// Encode a buffer as a WAV file in memory.
pub fn encode_wav(buffer: &AudioBuffer, format: OutputFormat) -> Result<Vec<u8>> {
    let spec = match format {
        OutputFormat::Wav => hound::WavSpec {
            channels: buffer.channels(),
            sample_rate: buffer.sample_rate(),
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        },
        OutputFormat::WavFloat => hound::WavSpec {
            channels: buffer.channels(),
            sample_rate: buffer.sample_rate(),
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        },
    };

    let mut cursor = Cursor::new(Vec::with_capacity(44 + buffer.byte_len()));
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| encode_error(&e))?;
        match format {
            OutputFormat::Wav => {
                for &sample in buffer.samples() {
                    writer
                        .write_sample(to_i16(sample))
                        .map_err(|e| encode_error(&e))?;
                }
            }
            OutputFormat::WavFloat => {
                for &sample in buffer.samples() {
                    writer.write_sample(sample).map_err(|e| encode_error(&e))?;
                }
            }
        }
        writer.finalize().map_err(|e| encode_error(&e))?;
    }
    Ok(cursor.into_inner())
}

/// Duration from the WAV header without decoding samples.
pub fn probe_wav_duration(bytes: &[u8]) -> Result<f64> {
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| map_hound_error(e, "Failed to parse WAV file"))?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return Err(SeparationError::CorruptInput {
            message: "WAV header declares a zero sample rate".to_string(),
        });
    }
    Ok(reader.duration() as f64 / spec.sample_rate as f64)
}

fn int_scale(bits: u16) -> f64 {
    (1u64 << (bits.clamp(1, 32) - 1)) as f64
}

fn to_i16(sample: f32) -> i16 {
    (sample as f64 * 32768.0).round().clamp(-32768.0, 32767.0) as i16
}

fn map_hound_error(error: hound::Error, context: &str) -> SeparationError {
    match error {
        hound::Error::Unsupported => SeparationError::UnsupportedFormat {
            message: format!("{}: unsupported WAV encoding", context),
        },
        other => SeparationError::CorruptInput {
            message: format!("{}: {}", context, other),
        },
    }
}

fn encode_error(error: &hound::Error) -> SeparationError {
    SeparationError::Other(format!("Failed to encode WAV: {}", error))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_wav_data(sample_rate: u32, channels: u16, samples: &[i16]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
        cursor.into_inner()
    }

    #[test]
    fn decode_16bit_mono_scales_to_unit_range() {
        let wav_data = make_wav_data(16000, 1, &[0, 16384, -32768, 32767]);
        let buffer = decode_wav(&wav_data, None).unwrap();

        assert_eq!(buffer.sample_rate(), 16000);
        assert_eq!(buffer.channels(), 1);
        assert_eq!(buffer.samples(), &[0.0, 0.5, -1.0, 32767.0 / 32768.0]);
    }

    #[test]
    fn decode_keeps_stereo_interleaving() {
        let wav_data = make_wav_data(44100, 2, &[100, -100, 200, -200]);
        let buffer = decode_wav(&wav_data, None).unwrap();

        assert_eq!(buffer.channels(), 2);
        assert_eq!(buffer.frames(), 2);
        assert!(buffer.samples()[1] < 0.0);
    }

    #[test]
    fn roundtrip_16bit_is_bit_exact() {
        let original: Vec<i16> = (0..2000).map(|i| ((i * 37) % 65536 - 32768) as i16).collect();
        let wav_data = make_wav_data(22050, 2, &original);

        let buffer = decode_wav(&wav_data, None).unwrap();
        let encoded = encode_wav(&buffer, OutputFormat::Wav).unwrap();

        let mut reader = hound::WavReader::new(Cursor::new(encoded)).unwrap();
        assert_eq!(reader.spec().sample_rate, 22050);
        assert_eq!(reader.spec().channels, 2);
        let decoded: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(decoded, original);
    }

    #[test]
    fn float_encoding_preserves_samples() {
        let buffer = AudioBuffer::new(vec![0.123, -0.456, 0.789, 1.5], 48000, 1).unwrap();
        let encoded = encode_wav(&buffer, OutputFormat::WavFloat).unwrap();
        let decoded = decode_wav(&encoded, None).unwrap();
        assert_eq!(decoded, buffer);
    }

    #[test]
    fn encode_clamps_out_of_range_samples() {
        let buffer = AudioBuffer::new(vec![2.0, -2.0], 8000, 1).unwrap();
        let encoded = encode_wav(&buffer, OutputFormat::Wav).unwrap();
        let mut reader = hound::WavReader::new(Cursor::new(encoded)).unwrap();
        let decoded: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(decoded, vec![i16::MAX, i16::MIN]);
    }

    #[test]
    fn header_only_wav_decodes_to_empty_buffer() {
        let wav_data = make_wav_data(44100, 1, &[]);
        let buffer = decode_wav(&wav_data, None).unwrap();
        assert!(buffer.is_empty());
    }

    #[test]
    fn probe_reads_duration_from_header() {
        let wav_data = make_wav_data(8000, 2, &vec![0i16; 8000 * 2 * 3]);
        let duration = probe_wav_duration(&wav_data).unwrap();
        assert!((duration - 3.0).abs() < 1e-9);
    }

    #[test]
    fn invalid_wav_data_returns_corrupt_input() {
        let invalid_data = vec![0u8, 1, 2, 3, 4, 5];
        match decode_wav(&invalid_data, None) {
            Err(SeparationError::CorruptInput { message }) => {
                assert!(message.contains("Failed to parse WAV file"));
            }
            other => panic!("Expected CorruptInput error, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_wav_missing_riff_header() {
        let bad_data = b"XXXX\x00\x00\x00\x00WAVEfmt ";
        assert!(decode_wav(bad_data, None).is_err(), "Should reject WAV without RIFF header");
    }

    #[test]
    fn test_truncated_wav_is_an_error() {
        let mut wav_data = make_wav_data(8000, 1, &[1, 2, 3, 4, 5, 6, 7, 8]);
        wav_data.truncate(30);
        assert!(decode_wav(&wav_data, None).is_err());
    }
}
