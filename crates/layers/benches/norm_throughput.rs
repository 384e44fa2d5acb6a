use candle_core::{DType, Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mha_layers::{
    dtypes::PrecisionPolicy,
    norm::{build_layer_norm, NormBackend, NormConfig},
};

fn bench_norm_backends(c: &mut Criterion) {
    let device = Device::Cpu;
    let batch = 8usize;
    let seq = 32usize;

    for dtype in [DType::F32, DType::BF16] {
        let mut group = c.benchmark_group(format!("inner_norm/{dtype:?}"));
        for hidden in [512usize, 1024, 2048] {
            let input = Tensor::randn(0f32, 1.0, (batch, seq, hidden), &device)
                .expect("input")
                .to_dtype(dtype)
                .expect("cast input");
            let policy = PrecisionPolicy::from_parameter_dtype(dtype);
            group.throughput(Throughput::Elements((batch * seq * hidden) as u64));

            for backend in [NormBackend::Portable, NormBackend::Fused] {
                let norm = build_layer_norm(backend, NormConfig::new(hidden, 1e-5), dtype, &device)
                    .expect("norm");
                group.bench_with_input(
                    BenchmarkId::new(format!("{backend:?}"), hidden),
                    &input,
                    |b, input| {
                        b.iter(|| {
                            let out = norm.forward(black_box(input), &policy).expect("forward");
                            black_box(out);
                        });
                    },
                );
            }
        }
        group.finish();
    }
}

criterion_group!(benches, bench_norm_backends);
criterion_main!(benches);
