//! Content fingerprint: the cache key and the deduplication key.

use crate::audio::{AudioFormat, OutputFormat};
use crate::error::{Result, SeparationError};
use crate::stems::StemPreset;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

const DOMAIN_TAG: &[u8] = b"stemsplit.fingerprint.v1";

/// SHA-256 over the request inputs that determine the output bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Hash the raw upload together with everything that shapes the result.
    ///
    /// Each field is length-prefixed so distinct inputs cannot collide by
    /// shifting bytes between neighbouring fields.
    pub fn compute(
        input: &[u8],
        input_format: AudioFormat,
        preset: StemPreset,
        model_version: &str,
        output_format: OutputFormat,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(DOMAIN_TAG);
        for field in [
            input,
            input_format.as_str().as_bytes(),
            preset.id().as_bytes(),
            model_version.as_bytes(),
            output_format.as_str().as_bytes(),
        ] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field);
        }
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(12);
        hex
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl FromStr for Fingerprint {
    type Err = SeparationError;

    fn from_str(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut bytes).map_err(|e| {
            SeparationError::InvalidRequest {
                message: format!("'{}' is not a fingerprint: {}", s, e),
            }
        })?;
        Ok(Self(bytes))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        hex.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(input: &[u8], preset: StemPreset, version: &str) -> Fingerprint {
        Fingerprint::compute(input, AudioFormat::Wav, preset, version, OutputFormat::Wav)
    }

    #[test]
    fn test_same_inputs_same_fingerprint() {
        assert_eq!(
            fp(b"abc", StemPreset::Two, "v1"),
            fp(b"abc", StemPreset::Two, "v1")
        );
    }

    #[test]
    fn test_every_field_changes_the_fingerprint() {
        let base = fp(b"abc", StemPreset::Two, "v1");
        assert_ne!(base, fp(b"abd", StemPreset::Two, "v1"));
        assert_ne!(base, fp(b"abc", StemPreset::Four, "v1"));
        assert_ne!(base, fp(b"abc", StemPreset::Two, "v2"));
        assert_ne!(
            base,
            Fingerprint::compute(b"abc", AudioFormat::Flac, StemPreset::Two, "v1", OutputFormat::Wav)
        );
        assert_ne!(
            base,
            Fingerprint::compute(
                b"abc",
                AudioFormat::Wav,
                StemPreset::Two,
                "v1",
                OutputFormat::WavFloat
            )
        );
    }

    #[test]
    fn test_fields_are_not_ambiguous() {
        // Moving a byte from the payload into the model version must not collide.
        assert_ne!(
            fp(b"ab", StemPreset::Two, "cv1"),
            fp(b"abc", StemPreset::Two, "v1")
        );
    }

    #[test]
    fn test_hex_round_trip() {
        let original = fp(b"payload", StemPreset::Five, "v1");
        let hex = original.to_string();
        assert_eq!(hex.len(), 64);
        assert_eq!(hex.parse::<Fingerprint>().unwrap(), original);
        assert_eq!(original.short(), hex[..12]);
    }

    #[test]
    fn test_rejects_bad_hex() {
        assert!("zz".parse::<Fingerprint>().is_err());
        assert!("abcd".parse::<Fingerprint>().is_err());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let original = fp(b"x", StemPreset::Two, "v1");
        let json = serde_json::to_string(&original).unwrap();
        assert_eq!(json, format!("\"{}\"", original));
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, original);
    }
}
