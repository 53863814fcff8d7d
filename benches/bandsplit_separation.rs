use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::time::Duration;
use stemsplit::audio::{self, AudioBuffer, OutputFormat};
use stemsplit::engine::{BandSplitModel, CancelFlag, SeparationModel};
use stemsplit::stems::StemPreset;

const SAMPLE_RATE: u32 = 44_100;

/// Stereo mix of a bass tone, a mid tone and a little high-frequency content.
fn mix(seconds: f32) -> AudioBuffer {
    let frames = (SAMPLE_RATE as f32 * seconds) as usize;
    let mut samples = Vec::with_capacity(frames * 2);
    for i in 0..frames {
        let t = i as f32 / SAMPLE_RATE as f32;
        let s = 0.3 * (t * 60.0 * std::f32::consts::TAU).sin()
            + 0.3 * (t * 1_000.0 * std::f32::consts::TAU).sin()
            + 0.1 * (t * 9_000.0 * std::f32::consts::TAU).sin();
        samples.push(s);
        samples.push(s * 0.8);
    }
    AudioBuffer::new(samples, SAMPLE_RATE, 2).unwrap()
}

fn separation_benchmark(c: &mut Criterion) {
    let model = BandSplitModel::new();
    let input = mix(10.0);
    let cancel = CancelFlag::new();

    let mut group = c.benchmark_group("bandsplit_separate");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(20));
    group.throughput(Throughput::Elements(input.frames() as u64));

    for preset in StemPreset::ALL {
        group.bench_with_input(
            BenchmarkId::from_parameter(preset.id()),
            &preset,
            |b, &preset| {
                b.iter(|| {
                    model
                        .separate(black_box(&input), preset, &cancel)
                        .unwrap()
                })
            },
        );
    }
    group.finish();
}

fn encode_benchmark(c: &mut Criterion) {
    let input = mix(10.0);

    let mut group = c.benchmark_group("stem_encode");
    group.sample_size(20);
    for format in [OutputFormat::Wav, OutputFormat::WavFloat] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format.as_str()),
            &format,
            |b, &format| b.iter(|| audio::encode(black_box(&input), format).unwrap()),
        );
    }
    group.finish();
}

criterion_group!(benches, separation_benchmark, encode_benchmark);
criterion_main!(benches);
