use crate::audio::AudioBuffer;
use crate::error::{Result, SeparationError};
use crate::stems::{StemPreset, StemSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Trait for source-separation models.
///
/// This trait allows swapping implementations (band-split, ONNX, mock).
/// A model is loaded once and shared by every worker, so `separate` must be
/// callable from several threads at once.
pub trait SeparationModel: Send + Sync {
    /// Human-readable model name
    fn name(&self) -> &str;

    /// Version string folded into every fingerprint
    fn version(&self) -> &str;

    /// Whether this model can produce the given stem set
    fn supports(&self, preset: StemPreset) -> bool;

    /// Split a canonical buffer into the preset's stems.
    ///
    /// # Arguments
    /// * `audio` - Canonical buffer (44.1 kHz stereo), never empty
    /// * `preset` - Requested stem set
    /// * `cancel` - Checked between processing steps; abort with `Cancelled` once set
    fn separate(
        &self,
        audio: &AudioBuffer,
        preset: StemPreset,
        cancel: &CancelFlag,
    ) -> Result<StemSet>;
}

/// Implement SeparationModel for Arc<T> to allow sharing across workers.
impl<T: SeparationModel + ?Sized> SeparationModel for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn version(&self) -> &str {
        (**self).version()
    }

    fn supports(&self, preset: StemPreset) -> bool {
        (**self).supports(preset)
    }

    fn separate(
        &self,
        audio: &AudioBuffer,
        preset: StemPreset,
        cancel: &CancelFlag,
    ) -> Result<StemSet> {
        (**self).separate(audio, preset, cancel)
    }
}

/// Cooperative cancellation shared between a job's timeout and its worker.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once the flag is set.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SeparationError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Mock model for testing
///
/// Splits the input evenly across the requested stems, so the stems always
/// sum back to the input. Counts invocations.
#[derive(Debug, Clone)]
pub struct MockModel {
    name: String,
    version: String,
    delay: Option<Duration>,
    should_fail: bool,
    invocations: Arc<AtomicUsize>,
}

impl MockModel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: "mock-1".to_string(),
            delay: None,
            should_fail: false,
            invocations: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    /// Sleep this long inside `separate`, honouring cancellation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }

    /// Number of `separate` calls so far.
    pub fn invocation_count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Shared counter that stays readable after the model is boxed.
    pub fn invocation_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.invocations)
    }
}

impl SeparationModel for MockModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn supports(&self, _preset: StemPreset) -> bool {
        true
    }

    fn separate(
        &self,
        audio: &AudioBuffer,
        preset: StemPreset,
        cancel: &CancelFlag,
    ) -> Result<StemSet> {
        self.invocations.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            let deadline = Instant::now() + delay;
            while Instant::now() < deadline {
                cancel.check()?;
                std::thread::sleep(Duration::from_millis(5));
            }
        }
        cancel.check()?;

        if self.should_fail {
            return Err(SeparationError::SeparationFailure {
                message: "Mock separation failure".to_string(),
            });
        }

        let share = 1.0 / preset.stem_count() as f32;
        let stem: Vec<f32> = audio.samples().iter().map(|s| s * share).collect();
        let buffers = (0..preset.stem_count())
            .map(|_| AudioBuffer::new(stem.clone(), audio.sample_rate(), audio.channels()))
            .collect::<Result<Vec<_>>>()?;
        StemSet::new(preset, buffers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> AudioBuffer {
        AudioBuffer::new(vec![0.4, -0.4, 0.8, -0.8], 44_100, 2).unwrap()
    }

    #[test]
    fn test_mock_model_splits_evenly() {
        let model = MockModel::new("mock");
        let stems = model
            .separate(&input(), StemPreset::Four, &CancelFlag::new())
            .unwrap();

        assert_eq!(stems.len(), 4);
        for (_, buffer) in stems.iter() {
            assert_eq!(buffer.frames(), 2);
            assert!((buffer.samples()[0] - 0.1).abs() < 1e-6);
        }
        assert_eq!(model.invocation_count(), 1);
    }

    #[test]
    fn test_mock_model_failure() {
        let model = MockModel::new("mock").with_failure();
        let result = model.separate(&input(), StemPreset::Two, &CancelFlag::new());
        assert!(matches!(result, Err(SeparationError::SeparationFailure { .. })));
        assert_eq!(model.invocation_count(), 1);
    }

    #[test]
    fn test_mock_model_honours_cancellation() {
        let model = MockModel::new("mock").with_delay(Duration::from_secs(30));
        let cancel = CancelFlag::new();
        cancel.cancel();

        let started = Instant::now();
        let result = model.separate(&input(), StemPreset::Two, &cancel);
        assert!(matches!(result, Err(SeparationError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_counter_survives_boxing() {
        let model = MockModel::new("mock");
        let counter = model.invocation_counter();
        let boxed: Box<dyn SeparationModel> = Box::new(model);
        boxed
            .separate(&input(), StemPreset::Two, &CancelFlag::new())
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_arc_model_delegates() {
        let model = Arc::new(MockModel::new("shared").with_version("v9"));
        assert_eq!(model.name(), "shared");
        assert_eq!(SeparationModel::version(&model), "v9");
        assert!(model.supports(StemPreset::Five));
    }

    #[test]
    fn test_cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(flag.check().is_ok());
        clone.cancel();
        assert!(flag.is_cancelled());
        assert!(matches!(flag.check(), Err(SeparationError::Cancelled)));
    }
}
