use criterion::{black_box, criterion_group, criterion_main, Criterion};
use stage_engine::orchestration::{classify, StageError};
use stage_engine::retry::{compute_delay, compute_delay_with, BackoffStrategy, FixedRandom, RetryConfig};

fn benchmark_compute_delay(c: &mut Criterion) {
    for strategy in [
        BackoffStrategy::Exponential,
        BackoffStrategy::Linear,
        BackoffStrategy::Fibonacci,
        BackoffStrategy::Decorrelated,
    ] {
        let config = RetryConfig::exponential(100, 10_000).with_strategy(strategy);
        c.bench_function(&format!("compute_delay_{}", strategy.as_str()), |b| {
            b.iter(|| {
                for attempt in 0..16 {
                    black_box(compute_delay(black_box(attempt), &config));
                }
            })
        });
    }
}

fn benchmark_compute_delay_fixed_random(c: &mut Criterion) {
    let config = RetryConfig::exponential(100, 10_000).with_strategy(BackoffStrategy::Decorrelated);
    c.bench_function("compute_delay_decorrelated_fixed_random", |b| {
        b.iter(|| {
            let mut rng = FixedRandom(0.5);
            for attempt in 0..16 {
                black_box(compute_delay_with(black_box(attempt), &config, &mut rng));
            }
        })
    });
}

fn benchmark_classify(c: &mut Criterion) {
    let errors = vec![
        StageError::http(503, "upstream unavailable"),
        StageError::network(Some("ECONNRESET"), "socket hang up"),
        StageError::fatal("schema mismatch"),
        StageError::failure("request timed out after 30s"),
        StageError::failure("invalid outline structure"),
    ];
    c.bench_function("classify_mixed_errors", |b| {
        b.iter(|| {
            for error in &errors {
                black_box(classify(black_box(error)));
            }
        })
    });
}

criterion_group!(
    benches,
    benchmark_compute_delay,
    benchmark_compute_delay_fixed_random,
    benchmark_classify
);
criterion_main!(benches);
