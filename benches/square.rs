use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kiln::{compile, compile_with, square_fn, Backend, CompileOptions, Device, Generator, Traced};

fn softplus_like(x: &Traced) -> Traced {
    (x.exp() + 1.0).ln() * 0.5 + x.square()
}

fn bench_trace_and_lower(c: &mut Criterion) {
    c.bench_function("explain/square_fn", |b| {
        b.iter(|| black_box(compile(square_fn).explain().unwrap()))
    });
    c.bench_function("explain/softplus_like", |b| {
        b.iter(|| black_box(compile(softplus_like).explain().unwrap()))
    });
}

fn bench_cpu(c: &mut Criterion) {
    let mut group = c.benchmark_group("cpu");
    let fused = compile(softplus_like);
    let eager = compile_with(
        softplus_like,
        CompileOptions {
            backend: Backend::Eager,
            ..CompileOptions::default()
        },
    );
    for n in [16usize, 4096, 1 << 20] {
        let x = Generator::new(0).randn([n], Device::Cpu).unwrap();
        group.bench_with_input(BenchmarkId::new("fused", n), &x, |b, x| {
            b.iter(|| black_box(fused.call(&[x]).unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("eager", n), &x, |b, x| {
            b.iter(|| black_box(eager.call(&[x]).unwrap()))
        });
    }
    group.finish();
}

fn bench_gpu(c: &mut Criterion) {
    if let Err(e) = kiln::gpu::context(0) {
        eprintln!("skipping GPU benchmarks: {}", e);
        return;
    }
    let mut group = c.benchmark_group("gpu");
    let compiled = compile(square_fn);
    for n in [16usize, 1 << 20] {
        let x = Generator::new(0).randn([n], Device::Gpu(0)).unwrap();
        group.bench_with_input(BenchmarkId::new("square+readback", n), &x, |b, x| {
            b.iter(|| black_box(compiled.call(&[x]).unwrap().to_vec().unwrap()))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_trace_and_lower, bench_cpu, bench_gpu);
criterion_main!(benches);
