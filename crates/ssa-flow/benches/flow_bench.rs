use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ssa_core::FlowOrder;
use ssa_flow::{FlowBank, FlowConfig};

fn config(order: FlowOrder) -> FlowConfig {
    FlowConfig {
        input_dim: 4,
        n_layers: 2,
        bound: 5.0,
        count_bins: 8,
        order,
    }
}

fn residuals(rows: usize) -> Tensor {
    let data: Vec<f64> = (0..rows * 4).map(|i| ((i * 37) % 97) as f64 / 10.0 - 4.8).collect();
    Tensor::from_vec(data, (rows, 4), &Device::Cpu).unwrap()
}

fn bench_flow_forward(c: &mut Criterion) {
    for order in [FlowOrder::Linear, FlowOrder::Quadratic] {
        let var_map = VarMap::new();
        let bank = FlowBank::new(&var_map, 1, config(order), &Device::Cpu).unwrap();
        let flow = bank.flow(0).unwrap();
        let x = residuals(256);
        c.bench_function(&format!("flow forward {order} (256×4)"), |b| {
            b.iter(|| black_box(flow.forward(&x).unwrap()))
        });
    }
}

fn bench_masked_route(c: &mut Criterion) {
    let var_map = VarMap::new();
    let bank = FlowBank::new(&var_map, 5, config(FlowOrder::Linear), &Device::Cpu).unwrap();
    let x = residuals(256);
    let labels: Vec<u32> = (0..256).map(|i| (i % 5) as u32).collect();
    c.bench_function("bank route masked (5 domains, 256 rows)", |b| {
        b.iter(|| black_box(bank.route(&x, &labels).unwrap()))
    });
}

fn bench_gathered_route(c: &mut Criterion) {
    let var_map = VarMap::new();
    let bank = FlowBank::new(&var_map, 5, config(FlowOrder::Linear), &Device::Cpu).unwrap();
    let x = residuals(64);
    let labels: Vec<u32> = (0..64).map(|i| (i % 5) as u32).collect();
    c.bench_function("bank route gathered (5 domains, 64 rows)", |b| {
        b.iter(|| black_box(bank.forward_gathered(&x, &labels).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_flow_forward,
    bench_masked_route,
    bench_gathered_route,
);
criterion_main!(benches);
