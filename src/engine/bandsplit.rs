//! Built-in deterministic separator.
//!
//! A crossover bank of zero-phase Butterworth low-pass filters (one RBJ
//! biquad run forward then backward per crossover) splits each channel into
//! frequency bands. With `L_k` the signal low-passed at crossover `k`, band
//! `k` is `L_k - L_{k-1}` and the top band is `x - L_last`, so the bands
//! always sum to the input. Bands are then assigned to stem labels per preset.

use crate::audio::AudioBuffer;
use crate::engine::model::{CancelFlag, SeparationModel};
use crate::error::{Result, SeparationError};
use crate::stems::{StemLabel, StemPreset, StemSet};

/// Crossover frequencies and band ownership for one preset.
struct Layout {
    crossovers_hz: &'static [f64],
    /// For each label in preset order, the bands it owns.
    bands: &'static [(StemLabel, &'static [usize])],
}

const TWO_STEMS: Layout = Layout {
    crossovers_hz: &[250.0, 4_000.0],
    bands: &[
        (StemLabel::Vocals, &[1]),
        (StemLabel::Accompaniment, &[0, 2]),
    ],
};

const FOUR_STEMS: Layout = Layout {
    crossovers_hz: &[150.0, 300.0, 4_000.0],
    bands: &[
        (StemLabel::Vocals, &[2]),
        (StemLabel::Drums, &[3]),
        (StemLabel::Bass, &[0]),
        (StemLabel::Other, &[1]),
    ],
};

const FIVE_STEMS: Layout = Layout {
    crossovers_hz: &[150.0, 500.0, 4_000.0, 8_000.0],
    bands: &[
        (StemLabel::Vocals, &[2]),
        (StemLabel::Drums, &[4]),
        (StemLabel::Bass, &[0]),
        (StemLabel::Piano, &[1]),
        (StemLabel::Other, &[3]),
    ],
};

fn layout(preset: StemPreset) -> &'static Layout {
    match preset {
        StemPreset::Two => &TWO_STEMS,
        StemPreset::Four => &FOUR_STEMS,
        StemPreset::Five => &FIVE_STEMS,
    }
}

/// Band-split separation model. Stateless, so it is shared freely.
#[derive(Debug, Clone, Default)]
pub struct BandSplitModel;

impl BandSplitModel {
    pub const NAME: &'static str = "bandsplit";
    pub const VERSION: &'static str = "bandsplit-1";

    pub fn new() -> Self {
        Self
    }
}

impl SeparationModel for BandSplitModel {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn version(&self) -> &str {
        Self::VERSION
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
        if audio.is_empty() {
            return Err(SeparationError::SeparationFailure {
                message: "zero-length input".to_string(),
            });
        }
        if !audio.is_finite() {
            return Err(SeparationError::SeparationFailure {
                message: "input contains NaN or infinite samples".to_string(),
            });
        }

        let layout = layout(preset);
        let rate = audio.sample_rate() as f64;

        // stems[label_index][channel] = samples
        let mut stems: Vec<Vec<Vec<f32>>> = vec![Vec::new(); layout.bands.len()];
        for channel in audio.split_channels() {
            cancel.check()?;
            let split = split_channel(&channel, rate, layout, cancel)?;
            for (stem, samples) in stems.iter_mut().zip(split) {
                stem.push(samples);
            }
        }

        let buffers = stems
            .iter()
            .map(|channels| AudioBuffer::from_channels(channels, audio.sample_rate()))
            .collect::<Result<Vec<_>>>()?;
        if buffers.iter().any(|b| !b.is_finite()) {
            return Err(SeparationError::SeparationFailure {
                message: "filter bank produced non-finite output".to_string(),
            });
        }
        StemSet::new(preset, buffers)
    }
}

/// Run one channel through the crossover bank, returning one vector per label.
fn split_channel(
    samples: &[f32],
    rate: f64,
    layout: &Layout,
    cancel: &CancelFlag,
) -> Result<Vec<Vec<f32>>> {
    let band_count = layout.crossovers_hz.len() + 1;
    let owners: Vec<Option<usize>> = (0..band_count)
        .map(|band| layout.bands.iter().position(|(_, owned)| owned.contains(&band)))
        .collect();
    let mut outputs = vec![vec![0.0f32; samples.len()]; layout.bands.len()];

    let mut previous = vec![0.0f32; samples.len()];
    for (band, &hz) in layout.crossovers_hz.iter().enumerate() {
        cancel.check()?;
        let low = zero_phase_lowpass(samples, hz, rate);
        if let Some(owner) = owners[band] {
            accumulate(&mut outputs[owner], &low, &previous);
        }
        previous = low;
    }
    if let Some(owner) = owners[band_count - 1] {
        accumulate(&mut outputs[owner], samples, &previous);
    }
    Ok(outputs)
}

/// `output += upper - lower`, computed in f64.
fn accumulate(output: &mut [f32], upper: &[f32], lower: &[f32]) {
    for ((out, &hi), &lo) in output.iter_mut().zip(upper).zip(lower) {
        *out = (*out as f64 + (hi as f64 - lo as f64)) as f32;
    }
}

/// Forward-backward Butterworth low-pass: 4th-order magnitude, zero phase.
///
/// Zero phase keeps `x - lowpass(x)` a clean complementary high-pass.
fn zero_phase_lowpass(samples: &[f32], cutoff_hz: f64, sample_rate: f64) -> Vec<f32> {
    let mut forward = Biquad::lowpass(cutoff_hz, sample_rate);
    let mut filtered: Vec<f64> = samples
        .iter()
        .map(|&s| forward.process(s as f64))
        .collect();

    let mut backward = Biquad::lowpass(cutoff_hz, sample_rate);
    for value in filtered.iter_mut().rev() {
        *value = backward.process(*value);
    }
    filtered.into_iter().map(|v| v as f32).collect()
}

/// RBJ cookbook low-pass, transposed direct form II.
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    z1: f64,
    z2: f64,
}

impl Biquad {
    fn lowpass(cutoff_hz: f64, sample_rate: f64) -> Self {
        // Keep the pole pair inside the unit circle for low sample rates.
        let cutoff = cutoff_hz.min(sample_rate * 0.45);
        let q = std::f64::consts::FRAC_1_SQRT_2;
        let w0 = std::f64::consts::TAU * cutoff / sample_rate;
        let cos_w0 = w0.cos();
        let alpha = w0.sin() / (2.0 * q);
        let a0 = 1.0 + alpha;

        Self {
            b0: (1.0 - cos_w0) / 2.0 / a0,
            b1: (1.0 - cos_w0) / a0,
            b2: (1.0 - cos_w0) / 2.0 / a0,
            a1: -2.0 * cos_w0 / a0,
            a2: (1.0 - alpha) / a0,
            z1: 0.0,
            z2: 0.0,
        }
    }

    fn process(&mut self, x: f64) -> f64 {
        let y = self.b0 * x + self.z1;
        self.z1 = self.b1 * x - self.a1 * y + self.z2;
        self.z2 = self.b2 * x - self.a2 * y;
        y
    }
}
