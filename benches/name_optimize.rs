use criterion::{black_box, criterion_group, criterion_main, Criterion};

use xswitch::app::name_optimizer::optimize_names;

fn names(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| match i % 10 {
            0 => format!("Backup {}", i),
            _ => format!("Node-{}.eu.vpn.example.net", i),
        })
        .collect()
}

fn bench_optimize(c: &mut Criterion) {
    let small = names(20);
    let large = names(500);
    c.bench_function("optimize_names_20", |b| {
        b.iter(|| black_box(optimize_names(black_box(&small), 0.7)));
    });
    c.bench_function("optimize_names_500", |b| {
        b.iter(|| black_box(optimize_names(black_box(&large), 0.7)));
    });
}

criterion_group!(benches, bench_optimize);
criterion_main!(benches);
