use candle_core::{Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;
use ssa_core::{Batch, MemorySink, SsaConfig};
use ssa_model::SsaModel;

fn model(nclass: usize) -> SsaModel {
    let config = SsaConfig {
        input_dim: 8,
        c_dim: 2,
        s_dim: 2,
        nclass,
        hidden_dim: 64,
        ..SsaConfig::default()
    };
    SsaModel::new(config, &Device::Cpu).unwrap()
}

fn batch(rows: usize, nclass: usize) -> Batch {
    let x: Vec<f64> = (0..rows * 8).map(|i| ((i * 13) % 29) as f64 / 29.0 - 0.5).collect();
    let c = (0..rows).map(|i| (i % nclass) as u32).collect();
    Batch::new(Tensor::from_vec(x, (rows, 8), &Device::Cpu).unwrap(), c, None).unwrap()
}

fn bench_training_step(c: &mut Criterion) {
    for nclass in [2, 5] {
        let model = model(nclass);
        let batch = batch(128, nclass);
        let mut rng = StdRng::seed_from_u64(0);
        let mut sink = MemorySink::default();
        c.bench_function(&format!("training_step (128 rows, {nclass} domains)"), |b| {
            b.iter(|| {
                sink.clear();
                black_box(model.training_step(&batch, &mut rng, &mut sink).unwrap())
            })
        });
    }
}

fn bench_backward(c: &mut Criterion) {
    let model = model(5);
    let batch = batch(128, 5);
    let mut rng = StdRng::seed_from_u64(1);
    let mut sink = MemorySink::default();
    c.bench_function("training_step + backward (128 rows, 5 domains)", |b| {
        b.iter(|| {
            sink.clear();
            let outcome = model.training_step(&batch, &mut rng, &mut sink).unwrap();
            black_box(outcome.terms.loss.backward().unwrap())
        })
    });
}

criterion_group!(benches, bench_training_step, bench_backward);
criterion_main!(benches);
