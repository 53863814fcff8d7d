//! Pretrained Demucs-style separation through ONNX Runtime.
//!
//! Expects a model taking `input` shaped `[1, 2, N]` (stereo, 44.1 kHz) and
//! returning `[1, 4, 2, N]` in htdemucs stem order: drums, bass, other,
//! vocals. The 2-stem preset folds drums, bass and other into accompaniment.

use crate::audio::AudioBuffer;
use crate::engine::model::{CancelFlag, SeparationModel};
use crate::error::{Result, SeparationError};
use crate::stems::{StemLabel, StemPreset, StemSet};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::path::{Path, PathBuf};

#[cfg(feature = "onnx")]
use ort::session::{Session, builder::GraphOptimizationLevel};
#[cfg(feature = "onnx")]
use std::sync::Mutex;

/// htdemucs output order.
const HTDEMUCS_STEMS: [StemLabel; 4] = [
    StemLabel::Drums,
    StemLabel::Bass,
    StemLabel::Other,
    StemLabel::Vocals,
];

#[cfg(feature = "onnx")]
pub struct OnnxModel {
    // ort sessions need `&mut` to run; inference is serialized through this lock.
    session: Mutex<Session>,
    model_path: PathBuf,
    name: String,
    version: String,
}

#[cfg(feature = "onnx")]
impl std::fmt::Debug for OnnxModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxModel")
            .field("model_path", &self.model_path)
            .field("name", &self.name)
            .field("version", &self.version)
            .field("session", &"<Session>")
            .finish()
    }
}

#[cfg(not(feature = "onnx"))]
#[derive(Debug)]
pub struct OnnxModel {
    model_path: PathBuf,
    name: String,
    version: String,
}

#[cfg(feature = "onnx")]
impl OnnxModel {
    /// Load an ONNX model file. Slow; call once at startup.
    pub fn load(model_path: &Path) -> Result<Self> {
        let (name, version) = identify(model_path)?;

        tracing::info!(path = %model_path.display(), %version, "loading ONNX model");
        let session = Session::builder()
            .map_err(unavailable)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(unavailable)?
            .commit_from_file(model_path)
            .map_err(|e| SeparationError::ModelUnavailable {
                message: format!("Failed to load ONNX model {}: {}", model_path.display(), e),
            })?;

        Ok(Self {
            session: Mutex::new(session),
            model_path: model_path.to_path_buf(),
            name,
            version,
        })
    }

    fn infer(&self, audio: &AudioBuffer, cancel: &CancelFlag) -> Result<Vec<Vec<f32>>> {
        use ndarray::Array3;
        use ort::value::Tensor;

        let frames = audio.frames();
        let mut input = Array3::<f32>::zeros((1, 2, frames));
        for (i, frame) in audio.samples().chunks_exact(2).enumerate() {
            input[[0, 0, i]] = frame[0];
            input[[0, 1, i]] = frame[1];
        }
        let input_tensor =
            Tensor::from_array(input).map_err(|e| failure("create input tensor", e))?;

        cancel.check()?;
        let mut session = self.session.lock().map_err(|e| SeparationError::SeparationFailure {
            message: format!("Failed to acquire session lock: {}", e),
        })?;
        cancel.check()?;

        let outputs = session
            .run(ort::inputs!["input" => input_tensor])
            .map_err(|e| failure("run inference", e))?;
        let output = outputs
            .iter()
            .next()
            .ok_or_else(|| SeparationError::SeparationFailure {
                message: "model returned no output tensor".to_string(),
            })?
            .1;
        let (shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| failure("extract output", e))?;

        let shape: Vec<i64> = shape.iter().copied().collect();
        if shape.len() != 4 || shape[1] < 4 || shape[2] != 2 {
            return Err(SeparationError::SeparationFailure {
                message: format!("unexpected output shape {:?}, expected [1, 4, 2, N]", shape),
            });
        }
        let channels = shape[2] as usize;
        let samples = shape[3] as usize;
        let index = |stem: usize, channel: usize, sample: usize| -> usize {
            sample + samples * (channel + channels * stem)
        };

        // Interleave each stem, trimmed or padded to the input length.
        let stems = (0..HTDEMUCS_STEMS.len())
            .map(|stem| {
                let mut interleaved = Vec::with_capacity(frames * 2);
                for i in 0..frames {
                    for channel in 0..2 {
                        let value = if i < samples {
                            data[index(stem, channel, i)]
                        } else {
                            0.0
                        };
                        interleaved.push(value);
                    }
                }
                interleaved
            })
            .collect();
        Ok(stems)
    }
}

#[cfg(not(feature = "onnx"))]
impl OnnxModel {
    /// Stub: this build has no ONNX Runtime.
    pub fn load(model_path: &Path) -> Result<Self> {
        let (name, version) = identify(model_path)?;
        tracing::warn!(%name, %version, "ONNX backend requested but not compiled in");
        Err(SeparationError::ModelUnavailable {
            message: concat!(
                "ONNX feature not enabled. This binary was built without ONNX Runtime.\n",
                "To fix: cargo build --release --features onnx"
            )
            .to_string(),
        })
    }
}

impl OnnxModel {
    pub fn model_path(&self) -> &Path {
        &self.model_path
    }
}

#[cfg(feature = "onnx")]
impl SeparationModel for OnnxModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn supports(&self, preset: StemPreset) -> bool {
        preset_sources(preset).is_some()
    }

    fn separate(
        &self,
        audio: &AudioBuffer,
        preset: StemPreset,
        cancel: &CancelFlag,
    ) -> Result<StemSet> {
        let sources = preset_sources(preset).ok_or_else(|| SeparationError::InvalidRequest {
            message: format!("{} cannot produce {}", self.name, preset),
        })?;
        if audio.is_empty() {
            return Err(SeparationError::SeparationFailure {
                message: "zero-length input".to_string(),
            });
        }
        if audio.channels() != 2 {
            return Err(SeparationError::SeparationFailure {
                message: format!("expected stereo input, got {} channels", audio.channels()),
            });
        }

        let raw = self.infer(audio, cancel)?;
        let buffers = sources
            .iter()
            .map(|indices| {
                let mut mixed = vec![0.0f32; audio.samples().len()];
                for &stem in indices.iter() {
                    for (out, &value) in mixed.iter_mut().zip(&raw[stem]) {
                        *out += value;
                    }
                }
                AudioBuffer::new(mixed, audio.sample_rate(), 2)
            })
            .collect::<Result<Vec<_>>>()?;

        if buffers.iter().any(|b| !b.is_finite()) {
            return Err(SeparationError::SeparationFailure {
                message: "model produced NaN or infinite samples".to_string(),
            });
        }
        StemSet::new(preset, buffers)
    }
}

#[cfg(not(feature = "onnx"))]
impl SeparationModel for OnnxModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn supports(&self, _preset: StemPreset) -> bool {
        false
    }

    fn separate(
        &self,
        _audio: &AudioBuffer,
        _preset: StemPreset,
        _cancel: &CancelFlag,
    ) -> Result<StemSet> {
        Err(SeparationError::ModelUnavailable {
            message: "ONNX feature not enabled".to_string(),
        })
    }
}

/// For each label of `preset`, the htdemucs output indices summed into it.
pub fn preset_sources(preset: StemPreset) -> Option<Vec<Vec<usize>>> {
    let position = |label: StemLabel| HTDEMUCS_STEMS.iter().position(|&l| l == label);
    match preset {
        StemPreset::Two => Some(vec![
            vec![position(StemLabel::Vocals)?],
            vec![
                position(StemLabel::Drums)?,
                position(StemLabel::Bass)?,
                position(StemLabel::Other)?,
            ],
        ]),
        StemPreset::Four => preset
            .labels()
            .iter()
            .map(|&label| position(label).map(|i| vec![i]))
            .collect(),
        StemPreset::Five => None,
    }
}

/// Model name from the file stem, version from a digest of the weights.
///
/// Swapping the weights file changes every fingerprint computed with it.
fn identify(model_path: &Path) -> Result<(String, String)> {
    let mut file = File::open(model_path).map_err(|e| SeparationError::ModelUnavailable {
        message: format!("Model file {} not readable: {}", model_path.display(), e),
    })?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    let digest = hex::encode(hasher.finalize());

    let name = model_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("onnx")
        .to_string();
    let version = format!("{}-{}", name, &digest[..12]);
    Ok((name, version))
}

#[cfg(feature = "onnx")]
fn unavailable(e: impl std::fmt::Display) -> SeparationError {
    SeparationError::ModelUnavailable {
        message: e.to_string(),
    }
}

#[cfg(feature = "onnx")]
fn failure(step: &str, e: impl std::fmt::Display) -> SeparationError {
    SeparationError::SeparationFailure {
        message: format!("Failed to {}: {}", step, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_missing_model_file_is_unavailable() {
        let result = OnnxModel::load(Path::new("/nonexistent/htdemucs.onnx"));
        assert!(matches!(result, Err(SeparationError::ModelUnavailable { .. })));
    }

    #[test]
    fn test_identify_uses_stem_and_digest() {
        let mut file = tempfile::Builder::new()
            .suffix(".onnx")
            .tempfile()
            .unwrap();
        file.write_all(b"weights").unwrap();
        let (name, version) = identify(file.path()).unwrap();
        assert!(version.starts_with(&format!("{}-", name)));
        assert_eq!(version.len(), name.len() + 13);
    }

    #[test]
    fn test_version_changes_with_weights() {
        let mut a = NamedTempFile::new().unwrap();
        a.write_all(b"weights-a").unwrap();
        let mut b = NamedTempFile::new().unwrap();
        b.write_all(b"weights-b").unwrap();
        let (_, va) = identify(a.path()).unwrap();
        let (_, vb) = identify(b.path()).unwrap();
        assert_ne!(va[va.len() - 12..], vb[vb.len() - 12..]);
    }

    #[test]
    fn test_preset_sources_follow_htdemucs_order() {
        assert_eq!(
            preset_sources(StemPreset::Four).unwrap(),
            vec![vec![3], vec![0], vec![1], vec![2]]
        );
        assert_eq!(
            preset_sources(StemPreset::Two).unwrap(),
            vec![vec![3], vec![0, 1, 2]]
        );
        assert!(preset_sources(StemPreset::Five).is_none());
    }

    #[cfg(not(feature = "onnx"))]
    #[test]
    fn test_stub_refuses_to_load_real_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"weights").unwrap();
        let err = OnnxModel::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("ONNX feature not enabled"));
    }
}
