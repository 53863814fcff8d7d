//! Stem vocabulary, requested stem sets and separation results.

use crate::audio::{self, AudioBuffer, OutputFormat};
use crate::error::{Result, SeparationError};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// One isolated component of a mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StemLabel {
    Vocals,
    Accompaniment,
    Drums,
    Bass,
    Piano,
    Other,
}

impl StemLabel {
    pub const ALL: [StemLabel; 6] = [
        StemLabel::Vocals,
        StemLabel::Accompaniment,
        StemLabel::Drums,
        StemLabel::Bass,
        StemLabel::Piano,
        StemLabel::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vocals => "vocals",
            Self::Accompaniment => "accompaniment",
            Self::Drums => "drums",
            Self::Bass => "bass",
            Self::Piano => "piano",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for StemLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StemLabel {
    type Err = SeparationError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|label| label.as_str() == wanted)
            .ok_or_else(|| SeparationError::InvalidRequest {
                message: format!("unknown stem '{}'", s.trim()),
            })
    }
}

/// A requested stem set. Only these three layouts are offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StemPreset {
    /// vocals, accompaniment
    #[default]
    #[serde(rename = "2stems")]
    Two,
    /// vocals, drums, bass, other
    #[serde(rename = "4stems")]
    Four,
    /// vocals, drums, bass, piano, other
    #[serde(rename = "5stems")]
    Five,
}

impl StemPreset {
    pub const ALL: [StemPreset; 3] = [StemPreset::Two, StemPreset::Four, StemPreset::Five];

    /// Output labels in the order stems are produced and stored.
    pub fn labels(&self) -> &'static [StemLabel] {
        match self {
            Self::Two => &[StemLabel::Vocals, StemLabel::Accompaniment],
            Self::Four => &[
                StemLabel::Vocals,
                StemLabel::Drums,
                StemLabel::Bass,
                StemLabel::Other,
            ],
            Self::Five => &[
                StemLabel::Vocals,
                StemLabel::Drums,
                StemLabel::Bass,
                StemLabel::Piano,
                StemLabel::Other,
            ],
        }
    }

    pub fn stem_count(&self) -> usize {
        self.labels().len()
    }

    pub fn contains(&self, label: StemLabel) -> bool {
        self.labels().contains(&label)
    }

    /// Stable identifier, e.g. `4stems`.
    pub fn id(&self) -> &'static str {
        match self {
            Self::Two => "2stems",
            Self::Four => "4stems",
            Self::Five => "5stems",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Two => "Vocals and accompaniment",
            Self::Four => "Vocals, drums, bass, and other",
            Self::Five => "Vocals, drums, bass, piano, and other",
        }
    }

    /// Match a set of labels against the presets, ignoring order.
    pub fn from_labels(labels: &[StemLabel]) -> Result<Self> {
        let wanted: BTreeSet<StemLabel> = labels.iter().copied().collect();
        Self::ALL
            .into_iter()
            .find(|preset| preset.labels().iter().copied().collect::<BTreeSet<_>>() == wanted)
            .ok_or_else(|| SeparationError::InvalidRequest {
                message: format!(
                    "stem set {{{}}} is not offered (choose 2, 4 or 5 stems)",
                    labels
                        .iter()
                        .map(|l| l.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            })
    }
}

impl fmt::Display for StemPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for StemPreset {
    type Err = SeparationError;

    /// Accepts `2`, `2stems`, `spleeter:2stems`, or a comma list of labels.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().to_ascii_lowercase();
        let bare = trimmed.strip_prefix("spleeter:").unwrap_or(&trimmed);
        match bare {
            "" | "2" | "2stems" => return Ok(Self::Two),
            "4" | "4stems" => return Ok(Self::Four),
            "5" | "5stems" => return Ok(Self::Five),
            _ => {}
        }
        if bare.chars().all(|c| c.is_ascii_digit()) {
            return Err(SeparationError::InvalidRequest {
                message: format!("stems must be 2, 4, or 5 (got {})", bare),
            });
        }
        let labels = bare
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(StemLabel::from_str)
            .collect::<Result<Vec<_>>>()?;
        Self::from_labels(&labels)
    }
}

/// Labelled stem buffers in preset order. Built once per job.
#[derive(Debug, Clone, PartialEq)]
pub struct StemSet {
    stems: Vec<(StemLabel, AudioBuffer)>,
}

impl StemSet {
    /// Pair buffers with a preset's labels. Every stem must share the same
    /// rate, channel count and length.
    pub fn new(preset: StemPreset, buffers: Vec<AudioBuffer>) -> Result<Self> {
        if buffers.len() != preset.stem_count() {
            return Err(SeparationError::SeparationFailure {
                message: format!(
                    "{} produced {} stems, expected {}",
                    preset,
                    buffers.len(),
                    preset.stem_count()
                ),
            });
        }
        if let Some(first) = buffers.first() {
            let consistent = buffers.iter().all(|b| {
                b.sample_rate() == first.sample_rate()
                    && b.channels() == first.channels()
                    && b.frames() == first.frames()
            });
            if !consistent {
                return Err(SeparationError::SeparationFailure {
                    message: "stems disagree on rate, channels or length".to_string(),
                });
            }
        }
        let stems = preset.labels().iter().copied().zip(buffers).collect();
        Ok(Self { stems })
    }

    /// Empty stems for a zero-length input.
    pub fn silent(preset: StemPreset, sample_rate: u32, channels: u16) -> Self {
        let stems = preset
            .labels()
            .iter()
            .map(|&label| (label, AudioBuffer::empty(sample_rate, channels)))
            .collect();
        Self { stems }
    }

    pub fn get(&self, label: StemLabel) -> Option<&AudioBuffer> {
        self.stems.iter().find(|(l, _)| *l == label).map(|(_, b)| b)
    }

    pub fn labels(&self) -> Vec<StemLabel> {
        self.stems.iter().map(|(l, _)| *l).collect()
    }

    pub fn len(&self) -> usize {
        self.stems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stems.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(StemLabel, AudioBuffer)> {
        self.stems.iter()
    }

    /// Encode every stem into `format`.
    pub fn encode(&self, format: OutputFormat) -> Result<EncodedStems> {
        let stems = self
            .stems
            .iter()
            .map(|(label, buffer)| {
                Ok(EncodedStem {
                    label: *label,
                    bytes: audio::encode(buffer, format)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(EncodedStems { format, stems })
    }
}

/// One encoded stem file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedStem {
    pub label: StemLabel,
    pub bytes: Vec<u8>,
}

/// Final byte payloads for a job, in preset order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedStems {
    pub format: OutputFormat,
    pub stems: Vec<EncodedStem>,
}

impl EncodedStems {
    pub fn get(&self, label: StemLabel) -> Option<&[u8]> {
        self.stems
            .iter()
            .find(|s| s.label == label)
            .map(|s| s.bytes.as_slice())
    }

    pub fn labels(&self) -> Vec<StemLabel> {
        self.stems.iter().map(|s| s.label).collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.stems.iter().map(|s| s.bytes.len() as u64).sum()
    }

    /// Gzipped tar with one `<dir>/<label>.<ext>` file per stem, in preset order.
    pub fn to_tar_gz(&self, dir: &str) -> Result<Vec<u8>> {
        let mtime = chrono::Utc::now().timestamp().max(0) as u64;
        let mut archive = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::fast()));
        for stem in &self.stems {
            let mut header = tar::Header::new_gnu();
            header.set_size(stem.bytes.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(mtime);
            let path = format!("{}/{}.{}", dir, stem.label, self.format.file_extension());
            archive.append_data(&mut header, path, stem.bytes.as_slice())?;
        }
        Ok(archive.into_inner()?.finish()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_parse_and_display() {
        assert_eq!("Vocals".parse::<StemLabel>().unwrap(), StemLabel::Vocals);
        assert_eq!(StemLabel::Accompaniment.to_string(), "accompaniment");
        assert!(matches!(
            "guitar".parse::<StemLabel>(),
            Err(SeparationError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn test_preset_parse_counts() {
        assert_eq!("2".parse::<StemPreset>().unwrap(), StemPreset::Two);
        assert_eq!("4stems".parse::<StemPreset>().unwrap(), StemPreset::Four);
        assert_eq!("spleeter:5stems".parse::<StemPreset>().unwrap(), StemPreset::Five);
        assert_eq!("".parse::<StemPreset>().unwrap(), StemPreset::Two);
    }

    #[test]
    fn test_tar_gz_holds_every_stem() {
        let stems = EncodedStems {
            format: OutputFormat::Wav,
            stems: vec![
                EncodedStem {
                    label: StemLabel::Vocals,
                    bytes: b"vocal bytes".to_vec(),
                },
                EncodedStem {
                    label: StemLabel::Accompaniment,
                    bytes: b"backing bytes".to_vec(),
                },
            ],
        };
        let archive = stems.to_tar_gz("song_separated").unwrap();

        let mut reader = tar::Archive::new(flate2::read::GzDecoder::new(archive.as_slice()));
        let mut files = Vec::new();
        for entry in reader.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            let mut bytes = Vec::new();
            std::io::Read::read_to_end(&mut entry, &mut bytes).unwrap();
            files.push((path, bytes));
        }
        assert_eq!(
            files,
            vec![
                ("song_separated/vocals.wav".to_string(), b"vocal bytes".to_vec()),
                ("song_separated/accompaniment.wav".to_string(), b"backing bytes".to_vec()),
            ]
        );
    }

    #[test]
    fn test_preset_rejects_other_counts() {
        let err = "3".parse::<StemPreset>().unwrap_err();
        assert!(err.to_string().contains("2, 4, or 5"));
    }

    #[test]
    fn test_preset_parse_label_list_ignores_order() {
        assert_eq!(
            "accompaniment, vocals".parse::<StemPreset>().unwrap(),
            StemPreset::Two
        );
        assert_eq!(
            "bass,drums,other,vocals".parse::<StemPreset>().unwrap(),
            StemPreset::Four
        );
    }

    #[test]
    fn test_preset_rejects_partial_label_list() {
        assert!("vocals,drums".parse::<StemPreset>().is_err());
    }

    #[test]
    fn test_preset_labels() {
        assert_eq!(StemPreset::Two.stem_count(), 2);
        assert_eq!(StemPreset::Four.stem_count(), 4);
        assert_eq!(StemPreset::Five.stem_count(), 5);
        assert!(StemPreset::Five.contains(StemLabel::Piano));
        assert!(!StemPreset::Four.contains(StemLabel::Piano));
    }

    #[test]
    fn test_stem_set_requires_matching_count() {
        let buffer = AudioBuffer::empty(44_100, 2);
        let result = StemSet::new(StemPreset::Four, vec![buffer.clone(), buffer]);
        assert!(matches!(result, Err(SeparationError::SeparationFailure { .. })));
    }

    #[test]
    fn test_stem_set_rejects_mismatched_lengths() {
        let a = AudioBuffer::new(vec![0.0; 4], 44_100, 2).unwrap();
        let b = AudioBuffer::new(vec![0.0; 6], 44_100, 2).unwrap();
        assert!(StemSet::new(StemPreset::Two, vec![a, b]).is_err());
    }

    #[test]
    fn test_stem_set_encode_keeps_order() {
        let a = AudioBuffer::new(vec![0.5; 4], 44_100, 2).unwrap();
        let set = StemSet::new(StemPreset::Two, vec![a.clone(), a]).unwrap();
        let encoded = set.encode(OutputFormat::Wav).unwrap();
        assert_eq!(
            encoded.labels(),
            vec![StemLabel::Vocals, StemLabel::Accompaniment]
        );
        assert!(encoded.get(StemLabel::Vocals).is_some());
        assert!(encoded.get(StemLabel::Drums).is_none());
        assert!(encoded.total_bytes() > 0);
    }

    #[test]
    fn test_silent_stem_set() {
        let set = StemSet::silent(StemPreset::Five, 44_100, 2);
        assert_eq!(set.len(), 5);
        assert!(set.iter().all(|(_, b)| b.is_empty()));
    }
}
