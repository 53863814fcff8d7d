//! Compressed container decoding (FLAC, MP3, OGG/Vorbis, M4A/AAC) via symphonia.

use crate::audio::buffer::AudioBuffer;
use crate::audio::format::AudioFormat;
use crate::error::{Result, SeparationError};
use std::io::Cursor;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Decode a whole compressed payload to interleaved `f32` samples.
///
/// With `max_duration_secs` set, decoding stops with `InputTooLong` as soon as
/// the decoded audio passes the limit, whatever the container claims.
pub fn decode_compressed(
    bytes: &[u8],
    format: AudioFormat,
    max_duration_secs: Option<u64>,
) -> Result<AudioBuffer> {
    let mut reader = open(bytes, format)?;

    let track = reader
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| SeparationError::CorruptInput {
            message: format!("no audio track found in {} payload", format),
        })?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate;
    let mut channels = track.codec_params.channels.map(|c| c.count() as u16);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| SeparationError::UnsupportedFormat {
            message: format!("no decoder for {} codec: {}", format, e),
        })?;

    let mut samples: Vec<f32> = Vec::new();
    let mut decoded_packets = 0usize;
    let mut failed_packets = 0usize;

    loop {
        let packet = match reader.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) if decoded_packets == 0 => {
                return Err(SeparationError::CorruptInput {
                    message: format!("failed to read {} packet: {}", format, e),
                });
            }
            Err(e) => {
                tracing::warn!(%format, error = %e, "stopping decode at unreadable packet");
                break;
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                failed_packets += 1;
                tracing::debug!(%format, error = e, "skipping undecodable packet");
                continue;
            }
            Err(e) => {
                return Err(SeparationError::CorruptInput {
                    message: format!("failed to decode {} payload: {}", format, e),
                });
            }
        };

        let spec = *decoded.spec();
        sample_rate = Some(spec.rate);
        channels = Some(spec.channels.count() as u16);

        let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buf.copy_interleaved_ref(decoded);
        samples.extend_from_slice(buf.samples());
        decoded_packets += 1;

        if let Some(limit_secs) = max_duration_secs {
            let frames = samples.len() / spec.channels.count().max(1);
            let duration_secs = frames as f64 / spec.rate.max(1) as f64;
            if duration_secs > limit_secs as f64 {
                return Err(SeparationError::InputTooLong {
                    duration_secs,
                    limit_secs,
                });
            }
        }
    }

    if decoded_packets == 0 && failed_packets > 0 {
        return Err(SeparationError::CorruptInput {
            message: format!("none of {} {} packets could be decoded", failed_packets, format),
        });
    }
    if failed_packets > 0 {
        tracing::warn!(%format, failed_packets, "some packets were skipped while decoding");
    }

    let sample_rate = sample_rate.ok_or_else(|| SeparationError::CorruptInput {
        message: format!("{} stream does not declare a sample rate", format),
    })?;
    AudioBuffer::new(samples, sample_rate, channels.unwrap_or(2))
}

/// Duration from container metadata, when the container records a frame count.
pub fn probe_compressed_duration(bytes: &[u8], format: AudioFormat) -> Result<Option<f64>> {
    let reader = open(bytes, format)?;
    let duration = reader
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .and_then(|t| match (t.codec_params.n_frames, t.codec_params.sample_rate) {
            (Some(frames), Some(rate)) if rate > 0 => Some(frames as f64 / rate as f64),
            _ => None,
        });
    Ok(duration)
}

fn open(bytes: &[u8], format: AudioFormat) -> Result<Box<dyn FormatReader>> {
    let source = Cursor::new(bytes.to_vec());
    let mss = MediaSourceStream::new(Box::new(source), Default::default());

    let mut hint = Hint::new();
    hint.with_extension(format.as_str());

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| SeparationError::CorruptInput {
            message: format!("payload is not a readable {} stream: {}", format, e),
        })?;
    Ok(probed.format)
}
