//! Stem preset catalog.
//!
//! The three stem layouts the service offers, with the names clients use to
//! request them.

use crate::stems::{StemLabel, StemPreset};
use serde::Serialize;

/// Metadata for one stem preset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresetInfo {
    /// Identifier (e.g., "2stems")
    pub name: &'static str,
    /// Number of output stems
    pub stems: usize,
    pub description: &'static str,
    /// Output labels in order
    pub labels: &'static [StemLabel],
    #[serde(skip)]
    pub preset: StemPreset,
}

/// Catalog of offered presets.
pub const PRESETS: &[PresetInfo] = &[
    PresetInfo {
        name: "2stems",
        stems: 2,
        description: "Vocals and accompaniment",
        labels: &[StemLabel::Vocals, StemLabel::Accompaniment],
        preset: StemPreset::Two,
    },
    PresetInfo {
        name: "4stems",
        stems: 4,
        description: "Vocals, drums, bass, and other",
        labels: &[
            StemLabel::Vocals,
            StemLabel::Drums,
            StemLabel::Bass,
            StemLabel::Other,
        ],
        preset: StemPreset::Four,
    },
    PresetInfo {
        name: "5stems",
        stems: 5,
        description: "Vocals, drums, bass, piano, and other",
        labels: &[
            StemLabel::Vocals,
            StemLabel::Drums,
            StemLabel::Bass,
            StemLabel::Piano,
            StemLabel::Other,
        ],
        preset: StemPreset::Five,
    },
];

/// Default preset when a request does not name one.
pub const DEFAULT_PRESET: &str = "2stems";

/// Look up a preset by its identifier.
pub fn get_preset(name: &str) -> Option<&'static PresetInfo> {
    PRESETS.iter().find(|p| p.name == name)
}

/// Catalog entry for a preset value.
pub fn preset_info(preset: StemPreset) -> &'static PresetInfo {
    match preset {
        StemPreset::Two => &PRESETS[0],
        StemPreset::Four => &PRESETS[1],
        StemPreset::Five => &PRESETS[2],
    }
}

/// List all preset identifiers.
pub fn list_presets() -> Vec<&'static str> {
    PRESETS.iter().map(|p| p.name).collect()
}
