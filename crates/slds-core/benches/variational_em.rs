//! Criterion benchmarks for the variational EM hot paths in `slds-core`.
//!
//! Data is simulated from a fixed seed so runs are comparable across machines.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nalgebra::{DMatrix, DVector};
use slds_core::config::FitConfig;
use slds_core::inference::{
    variational_e_step, RegimeModel, SwitchingModel, VariationalPosterior,
};
use slds_core::{fit, simulate};

fn regime(dim: usize, a: f64, q: f64) -> RegimeModel {
    RegimeModel::new(
        DMatrix::identity(dim, dim) * a,
        DMatrix::identity(dim, dim) * q,
        DMatrix::identity(dim, dim),
        DMatrix::identity(dim, dim) * 0.05,
        DVector::zeros(dim),
        DMatrix::identity(dim, dim),
    )
    .expect("valid regime")
}

fn model(k: usize, dim: usize) -> SwitchingModel {
    let stay = 0.95;
    let leave = (1.0 - stay) / (k as f64 - 1.0).max(1.0);
    let transition = DMatrix::from_fn(k, k, |i, j| {
        if k == 1 {
            1.0
        } else if i == j {
            stay
        } else {
            leave
        }
    });
    let regimes = (0..k)
        .map(|i| regime(dim, 0.95 - 0.3 * i as f64, 0.01 * (1.0 + 10.0 * i as f64)))
        .collect();
    SwitchingModel::new(DVector::from_element(k, 1.0 / k as f64), transition, regimes)
        .expect("valid model")
}

fn bench_smoothing(c: &mut Criterion) {
    let mut group = c.benchmark_group("regime_smooth");
    for steps in [100usize, 1000] {
        let m = model(1, 2);
        let obs = simulate(&m, steps, 1).expect("simulate").observations;
        let weights = vec![0.5; steps];
        group.bench_with_input(BenchmarkId::new("weighted_rts", steps), &obs, |b, obs| {
            b.iter(|| {
                let post = m.regimes()[0]
                    .smooth(black_box(obs), black_box(&weights))
                    .expect("smooth");
                black_box(post.log_likelihood);
            })
        });
    }
    group.finish();
}

fn bench_e_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("variational_e_step");
    for (k, parallel) in [(2usize, false), (4, false), (4, true)] {
        let m = model(k, 2);
        let obs = simulate(&m, 500, 2).expect("simulate").observations;
        let config = FitConfig {
            parallel,
            ..FitConfig::default()
        };
        let label = format!("k{k}_{}", if parallel { "par" } else { "seq" });
        group.bench_function(BenchmarkId::new("t500", label), |b| {
            b.iter(|| {
                let mut posterior =
                    VariationalPosterior::initialize(&m, &obs, parallel).expect("init");
                let outcome =
                    variational_e_step(&m, &obs, &mut posterior, &config).expect("e-step");
                black_box(outcome.elbo);
            })
        });
    }
    group.finish();
}

fn bench_fit(c: &mut Criterion) {
    let m = model(2, 1);
    let obs = simulate(&m, 300, 3).expect("simulate").observations;
    let config = FitConfig {
        max_iter: 10,
        parallel: false,
        ..FitConfig::default()
    };
    c.bench_function("fit_k2_t300_10iter", |b| {
        b.iter(|| {
            let result = fit(black_box(m.clone()), &obs, &config).expect("fit");
            black_box(result.final_elbo());
        })
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(20);
    targets = bench_smoothing, bench_e_step, bench_fit
}
criterion_main!(benches);
