//! Closed sets of supported input containers and output encodings.

use crate::error::{Result, SeparationError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Input container/codec accepted by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Wav,
    Flac,
    Mp3,
    Ogg,
    M4a,
}

impl AudioFormat {
    pub const ALL: [AudioFormat; 5] = [
        AudioFormat::Wav,
        AudioFormat::Flac,
        AudioFormat::Mp3,
        AudioFormat::Ogg,
        AudioFormat::M4a,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Flac => "flac",
            Self::Mp3 => "mp3",
            Self::Ogg => "ogg",
            Self::M4a => "m4a",
        }
    }

    /// Parse a file extension, with or without the leading dot.
    pub fn from_extension(ext: &str) -> Result<Self> {
        let ext = ext.trim().trim_start_matches('.').to_ascii_lowercase();
        match ext.as_str() {
            "wav" | "wave" => Ok(Self::Wav),
            "flac" => Ok(Self::Flac),
            "mp3" => Ok(Self::Mp3),
            "ogg" | "oga" => Ok(Self::Ogg),
            "m4a" | "mp4" | "aac" => Ok(Self::M4a),
            "" => Err(SeparationError::UnsupportedFormat {
                message: "file has no extension".to_string(),
            }),
            other => Err(SeparationError::UnsupportedFormat {
                message: format!(
                    "'{}' is not supported (allowed: {})",
                    other,
                    crate::defaults::ALLOWED_EXTENSIONS.join(", ")
                ),
            }),
        }
    }

    /// Derive the format from an uploaded file name.
    pub fn from_filename(name: &str) -> Result<Self> {
        let ext = std::path::Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");
        Self::from_extension(ext)
    }

    /// Lossless containers round-trip through decode/encode.
    pub fn is_lossless(&self) -> bool {
        matches!(self, Self::Wav | Self::Flac)
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioFormat {
    type Err = SeparationError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_extension(s)
    }
}

/// Encoding used for stem outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OutputFormat {
    /// 16-bit PCM WAV
    #[default]
    #[serde(rename = "wav")]
    Wav,
    /// 32-bit float WAV
    #[serde(rename = "wav-f32")]
    WavFloat,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::WavFloat => "wav-f32",
        }
    }

    pub fn content_type(&self) -> &'static str {
        "audio/wav"
    }

    pub fn file_extension(&self) -> &'static str {
        "wav"
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = SeparationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "wav" | "wav16" | "wav-s16" => Ok(Self::Wav),
            "wav-f32" | "wav32f" | "wav-float" => Ok(Self::WavFloat),
            other => Err(SeparationError::UnsupportedFormat {
                message: format!("output format '{}' is not supported (use wav or wav-f32)", other),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_extension_is_case_insensitive() {
        assert_eq!(AudioFormat::from_extension("WAV").unwrap(), AudioFormat::Wav);
        assert_eq!(AudioFormat::from_extension(".flac").unwrap(), AudioFormat::Flac);
        assert_eq!(AudioFormat::from_extension("Mp3").unwrap(), AudioFormat::Mp3);
    }

    #[test]
    fn test_every_allowed_extension_parses() {
        for ext in crate::defaults::ALLOWED_EXTENSIONS {
            assert!(AudioFormat::from_extension(ext).is_ok(), "{ext} should parse");
        }
    }

    #[test]
    fn test_unknown_extension_is_unsupported() {
        let err = AudioFormat::from_extension("aiff").unwrap_err();
        assert!(matches!(err, SeparationError::UnsupportedFormat { .. }));
        assert!(err.to_string().contains("mp3, wav, flac, m4a, ogg"));
    }

    #[test]
    fn test_from_filename() {
        assert_eq!(AudioFormat::from_filename("song.final.ogg").unwrap(), AudioFormat::Ogg);
        assert!(AudioFormat::from_filename("noextension").is_err());
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!("wav".parse::<OutputFormat>().unwrap(), OutputFormat::Wav);
        assert_eq!("WAV-F32".parse::<OutputFormat>().unwrap(), OutputFormat::WavFloat);
        assert!(matches!(
            "mp3".parse::<OutputFormat>(),
            Err(SeparationError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn test_output_format_serde_names() {
        let json = serde_json::to_string(&OutputFormat::WavFloat).unwrap();
        assert_eq!(json, r#""wav-f32""#);
    }
}
