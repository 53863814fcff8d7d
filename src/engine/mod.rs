//! Separation engine.
//!
//! Owns the process-wide model instance. The model is loaded once, in the
//! background, and shared read-only by every worker until [`SeparationEngine::shutdown`]
//! releases it.

pub mod bandsplit;
pub mod catalog;
pub mod model;
pub mod onnx;

pub use bandsplit::BandSplitModel;
pub use model::{CancelFlag, MockModel, SeparationModel};
pub use onnx::OnnxModel;

use crate::audio::AudioBuffer;
use crate::config::{BackendKind, EngineConfig};
use crate::defaults::{CANONICAL_CHANNELS, CANONICAL_SAMPLE_RATE};
use crate::error::{Result, SeparationError};
use crate::stems::{StemPreset, StemSet};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::task::JoinHandle;

/// Lifecycle of the shared model.
enum ModelSlot {
    Loading,
    Ready(Arc<dyn SeparationModel>),
    Failed(String),
    Released,
}

/// Observable engine state, reported by the health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum EngineStatus {
    Loading,
    Ready { model: String, version: String },
    Failed(String),
    Released,
}

/// Predicted resources for one separation, used for admission control.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceEstimate {
    /// Peak bytes held by the canonical buffer, the stems and scratch space
    pub memory_bytes: u64,
    /// Rough CPU seconds
    pub cpu_secs: f64,
}

/// Cost of separating `duration_secs` of audio into `preset`.
///
/// Memory covers the canonical input, one buffer per stem, and one scratch
/// buffer, all as stereo `f32` at the canonical rate.
pub fn estimate_cost(duration_secs: f64, preset: StemPreset) -> ResourceEstimate {
    let duration = duration_secs.max(0.0);
    let frames = (duration * CANONICAL_SAMPLE_RATE as f64).ceil() as u64;
    let buffers = preset.stem_count() as u64 + 2;
    ResourceEstimate {
        memory_bytes: frames * CANONICAL_CHANNELS as u64 * 4 * buffers,
        cpu_secs: duration * preset.stem_count() as f64 * 0.05,
    }
}

/// Build the configured model. Blocking; may take seconds for ONNX.
pub fn load_model(config: &EngineConfig) -> Result<Arc<dyn SeparationModel>> {
    match config.backend {
        BackendKind::Bandsplit => Ok(Arc::new(BandSplitModel::new())),
        BackendKind::Onnx => {
            let path = config
                .model_path
                .as_ref()
                .ok_or_else(|| SeparationError::ModelUnavailable {
                    message: "engine.model_path is required for the onnx backend".to_string(),
                })?;
            Ok(Arc::new(OnnxModel::load(path)?))
        }
    }
}

pub struct SeparationEngine {
    slot: RwLock<ModelSlot>,
}

impl std::fmt::Debug for SeparationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeparationEngine")
            .field("status", &self.status())
            .finish()
    }
}

impl SeparationEngine {
    /// An engine whose model has not been loaded yet.
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(ModelSlot::Loading),
        }
    }

    /// An engine that is ready immediately.
    pub fn with_model(model: Arc<dyn SeparationModel>) -> Self {
        Self {
            slot: RwLock::new(ModelSlot::Ready(model)),
        }
    }

    /// Load the configured model on the blocking pool.
    pub fn load_in_background(self: &Arc<Self>, config: EngineConfig) -> JoinHandle<()> {
        self.load_with(move || load_model(&config))
    }

    /// Run `loader` on the blocking pool and install its result.
    pub fn load_with<F>(self: &Arc<Self>, loader: F) -> JoinHandle<()>
    where
        F: FnOnce() -> Result<Arc<dyn SeparationModel>> + Send + 'static,
    {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let started = Instant::now();
            let result = tokio::task::spawn_blocking(loader)
                .await
                .unwrap_or_else(|e| {
                    Err(SeparationError::ModelUnavailable {
                        message: format!("model loader panicked: {}", e),
                    })
                });
            match result {
                Ok(model) => {
                    tracing::info!(
                        model = model.name(),
                        version = model.version(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "separation model loaded"
                    );
                    engine.install(model);
                }
                Err(e) => {
                    tracing::error!(error = %e, "separation model failed to load");
                    engine.mark_failed(e.to_string());
                }
            }
        })
    }

    /// Make `model` the shared instance. Ignored after shutdown.
    pub fn install(&self, model: Arc<dyn SeparationModel>) {
        let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
        if !matches!(*slot, ModelSlot::Released) {
            *slot = ModelSlot::Ready(model);
        }
    }

    fn mark_failed(&self, message: String) {
        let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
        if !matches!(*slot, ModelSlot::Released) {
            *slot = ModelSlot::Failed(message);
        }
    }

    pub fn status(&self) -> EngineStatus {
        let slot = self.slot.read().unwrap_or_else(|e| e.into_inner());
        match &*slot {
            ModelSlot::Loading => EngineStatus::Loading,
            ModelSlot::Ready(model) => EngineStatus::Ready {
                model: model.name().to_string(),
                version: model.version().to_string(),
            },
            ModelSlot::Failed(message) => EngineStatus::Failed(message.clone()),
            ModelSlot::Released => EngineStatus::Released,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(
            *self.slot.read().unwrap_or_else(|e| e.into_inner()),
            ModelSlot::Ready(_)
        )
    }

    /// The loaded model, or `ModelUnavailable`.
    pub fn model(&self) -> Result<Arc<dyn SeparationModel>> {
        let slot = self.slot.read().unwrap_or_else(|e| e.into_inner());
        match &*slot {
            ModelSlot::Ready(model) => Ok(Arc::clone(model)),
            ModelSlot::Loading => Err(SeparationError::ModelUnavailable {
                message: "model is still loading".to_string(),
            }),
            ModelSlot::Failed(message) => Err(SeparationError::ModelUnavailable {
                message: message.clone(),
            }),
            ModelSlot::Released => Err(SeparationError::ModelUnavailable {
                message: "engine has been shut down".to_string(),
            }),
        }
    }

    /// Reject presets the loaded model cannot produce.
    pub fn check_preset(&self, preset: StemPreset) -> Result<()> {
        let model = self.model()?;
        if model.supports(preset) {
            Ok(())
        } else {
            Err(SeparationError::InvalidRequest {
                message: format!("model {} does not offer {}", model.name(), preset),
            })
        }
    }

    /// Separate a canonical buffer.
    ///
    /// Empty input is a `SeparationFailure`; callers that accept silent input
    /// must short-circuit before calling.
    pub fn separate(
        &self,
        audio: &AudioBuffer,
        preset: StemPreset,
        cancel: &CancelFlag,
    ) -> Result<StemSet> {
        let model = self.model()?;
        if audio.is_empty() {
            return Err(SeparationError::SeparationFailure {
                message: "zero-length input".to_string(),
            });
        }
        if !model.supports(preset) {
            return Err(SeparationError::InvalidRequest {
                message: format!("model {} does not offer {}", model.name(), preset),
            });
        }
        model.separate(audio, preset, cancel)
    }

    pub fn estimate_cost(&self, duration_secs: f64, preset: StemPreset) -> ResourceEstimate {
        estimate_cost(duration_secs, preset)
    }

    /// Release the model. Later calls fail with `ModelUnavailable`.
    pub fn shutdown(&self) {
        let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
        if let ModelSlot::Ready(model) = &*slot {
            tracing::info!(model = model.name(), "releasing separation model");
        }
        *slot = ModelSlot::Released;
    }
}

impl Default for SeparationEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn stereo(frames: usize) -> AudioBuffer {
        AudioBuffer::new(vec![0.25; frames * 2], CANONICAL_SAMPLE_RATE, 2).unwrap()
    }

    #[test]
    fn test_new_engine_is_loading() {
        let engine = SeparationEngine::new();
        assert!(!engine.is_ready());
        assert_eq!(engine.status(), EngineStatus::Loading);
        assert!(matches!(
            engine.separate(&stereo(4), StemPreset::Two, &CancelFlag::new()),
            Err(SeparationError::ModelUnavailable { .. })
        ));
    }

    #[test]
    fn test_ready_engine_separates() {
        let engine = SeparationEngine::with_model(Arc::new(BandSplitModel::new()));
        assert!(engine.is_ready());
        let stems = engine
            .separate(&stereo(1_000), StemPreset::Four, &CancelFlag::new())
            .unwrap();
        assert_eq!(stems.len(), 4);
    }

    #[test]
    fn test_empty_input_is_separation_failure() {
        let engine = SeparationEngine::with_model(Arc::new(MockModel::new("mock")));
        let result = engine.separate(
            &AudioBuffer::empty(CANONICAL_SAMPLE_RATE, 2),
            StemPreset::Two,
            &CancelFlag::new(),
        );
        assert!(matches!(result, Err(SeparationError::SeparationFailure { .. })));
    }

    #[test]
    fn test_shutdown_releases_model() {
        let engine = SeparationEngine::with_model(Arc::new(MockModel::new("mock")));
        engine.shutdown();
        assert_eq!(engine.status(), EngineStatus::Released);
        assert!(engine.model().is_err());

        engine.install(Arc::new(MockModel::new("late")));
        assert!(!engine.is_ready(), "install after shutdown must be ignored");
    }

    #[tokio::test]
    async fn test_background_load_becomes_ready() {
        let engine = Arc::new(SeparationEngine::new());
        let handle = engine.load_with(|| {
            std::thread::sleep(Duration::from_millis(50));
            Ok(Arc::new(MockModel::new("slow")) as Arc<dyn SeparationModel>)
        });
        assert!(!engine.is_ready());
        handle.await.unwrap();
        assert!(engine.is_ready());
        assert_eq!(
            engine.status(),
            EngineStatus::Ready {
                model: "slow".to_string(),
                version: "mock-1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_failed_load_is_reported() {
        let engine = Arc::new(SeparationEngine::new());
        engine
            .load_with(|| {
                Err(SeparationError::ModelUnavailable {
                    message: "weights missing".to_string(),
                })
            })
            .await
            .unwrap();
        assert!(matches!(engine.status(), EngineStatus::Failed(m) if m.contains("weights missing")));
    }

    #[test]
    fn test_load_model_requires_path_for_onnx() {
        let config = EngineConfig {
            backend: BackendKind::Onnx,
            model_path: None,
        };
        assert!(matches!(
            load_model(&config),
            Err(SeparationError::ModelUnavailable { .. })
        ));
    }

    #[test]
    fn test_load_model_bandsplit() {
        let model = load_model(&EngineConfig::default()).unwrap();
        assert_eq!(model.name(), BandSplitModel::NAME);
    }

    #[test]
    fn test_estimate_cost_scales_with_duration_and_stems() {
        let one = estimate_cost(1.0, StemPreset::Two);
        assert_eq!(one.memory_bytes, 44_100 * 2 * 4 * 4);
        let ten = estimate_cost(10.0, StemPreset::Two);
        assert_eq!(ten.memory_bytes, one.memory_bytes * 10);
        assert!(estimate_cost(1.0, StemPreset::Five).memory_bytes > one.memory_bytes);
        assert_eq!(estimate_cost(-3.0, StemPreset::Two).memory_bytes, 0);
    }
}
