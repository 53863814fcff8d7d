//! On-disk entry layout and manifest.
//!
//! ```text
//! <root>/entries/<fingerprint>/manifest.json
//! <root>/entries/<fingerprint>/<label>.wav
//! ```
//!
//! The manifest's modification time doubles as the last-access time so that
//! LRU order survives restarts.

use crate::audio::OutputFormat;
use crate::error::{Result, SeparationError};
use crate::fingerprint::Fingerprint;
use crate::stems::{EncodedStem, EncodedStems, StemLabel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const MANIFEST_VERSION: u32 = 1;

/// One stem file recorded in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestStem {
    pub label: StemLabel,
    pub file: String,
    pub size: u64,
    /// Hex SHA-256 of the file contents
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub fingerprint: Fingerprint,
    pub format: OutputFormat,
    pub created_at: DateTime<Utc>,
    pub stems: Vec<ManifestStem>,
}

impl Manifest {
    pub fn for_stems(fingerprint: Fingerprint, stems: &EncodedStems) -> Self {
        let format = stems.format;
        let stems: Vec<ManifestStem> = stems
            .stems
            .iter()
            .map(|stem| ManifestStem {
                label: stem.label,
                file: stem_file_name(stem.label, format),
                size: stem.bytes.len() as u64,
                sha256: hex::encode(Sha256::digest(&stem.bytes)),
            })
            .collect();
        Self {
            version: MANIFEST_VERSION,
            fingerprint,
            format,
            created_at: Utc::now(),
            stems,
        }
    }

    /// Bytes of all stem files.
    pub fn payload_bytes(&self) -> u64 {
        self.stems.iter().map(|s| s.size).sum()
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| SeparationError::Other(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| SeparationError::CacheCorrupt {
            fingerprint: String::new(),
            message: format!("unreadable manifest: {}", e),
        })
    }
}

pub fn stem_file_name(label: StemLabel, format: OutputFormat) -> String {
    format!("{}.{}", label, format.file_extension())
}

/// A published entry: its directory plus validated manifest.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub dir: PathBuf,
    pub manifest: Manifest,
    pub last_access: SystemTime,
    /// Bytes on disk, manifest included
    pub size: u64,
}

impl CacheEntry {
    /// Read and check an entry directory.
    ///
    /// Fails with `CacheCorrupt` when the manifest is missing, unreadable,
    /// names another fingerprint, or a stem file is missing or the wrong size.
    pub fn load(fingerprint: Fingerprint, dir: &Path) -> Result<Self> {
        let corrupt = |message: String| SeparationError::CacheCorrupt {
            fingerprint: fingerprint.to_string(),
            message,
        };

        let manifest_path = dir.join(MANIFEST_FILE);
        let raw = fs::read(&manifest_path).map_err(|e| corrupt(format!("manifest: {}", e)))?;
        let manifest = Manifest::from_json(&raw).map_err(|e| corrupt(e.to_string()))?;
        if manifest.fingerprint != fingerprint {
            return Err(corrupt(format!(
                "manifest belongs to {}",
                manifest.fingerprint.short()
            )));
        }
        if manifest.version != MANIFEST_VERSION {
            return Err(corrupt(format!(
                "manifest version {} is not supported",
                manifest.version
            )));
        }

        for stem in &manifest.stems {
            let path = dir.join(&stem.file);
            let len = fs::metadata(&path)
                .map_err(|e| corrupt(format!("{}: {}", stem.file, e)))?
                .len();
            if len != stem.size {
                return Err(corrupt(format!(
                    "{} is {} bytes, manifest says {}",
                    stem.file, len, stem.size
                )));
            }
        }

        let last_access = fs::metadata(&manifest_path)
            .and_then(|m| m.modified())
            .unwrap_or_else(|_| SystemTime::now());

        Ok(Self {
            fingerprint,
            dir: dir.to_path_buf(),
            size: manifest.payload_bytes() + raw.len() as u64,
            manifest,
            last_access,
        })
    }

    pub fn labels(&self) -> Vec<StemLabel> {
        self.manifest.stems.iter().map(|s| s.label).collect()
    }

    pub fn format(&self) -> OutputFormat {
        self.manifest.format
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.manifest.created_at
    }

    pub fn stem_path(&self, label: StemLabel) -> Option<PathBuf> {
        self.manifest
            .stems
            .iter()
            .find(|s| s.label == label)
            .map(|s| self.dir.join(&s.file))
    }

    /// Read one stem and check it against the manifest digest.
    pub fn read_stem(&self, label: StemLabel) -> Result<Vec<u8>> {
        let stem = self
            .manifest
            .stems
            .iter()
            .find(|s| s.label == label)
            .ok_or_else(|| SeparationError::InvalidRequest {
                message: format!("result has no '{}' stem", label),
            })?;
        let bytes = fs::read(self.dir.join(&stem.file)).map_err(|e| {
            SeparationError::CacheCorrupt {
                fingerprint: self.fingerprint.to_string(),
                message: format!("{}: {}", stem.file, e),
            }
        })?;
        if hex::encode(Sha256::digest(&bytes)) != stem.sha256 {
            return Err(SeparationError::CacheCorrupt {
                fingerprint: self.fingerprint.to_string(),
                message: format!("{} does not match its digest", stem.file),
            });
        }
        Ok(bytes)
    }

    /// Read every stem in manifest order.
    pub fn read_all(&self) -> Result<EncodedStems> {
        let stems = self
            .manifest
            .stems
            .iter()
            .map(|s| {
                Ok(EncodedStem {
                    label: s.label,
                    bytes: self.read_stem(s.label)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(EncodedStems {
            format: self.manifest.format,
            stems,
        })
    }
}
