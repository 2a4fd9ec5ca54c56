use std::convert::Infallible;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use mcmc_engine::{
    diagnostics::{effective_sample_size, split_r_hat},
    sample, LogDensity, SamplerSettings, StepAssignment, StepMethodKind,
};

struct NormalLogp {
    dim: usize,
    mu: f64,
}

impl LogDensity for NormalLogp {
    type LogpError = Infallible;

    fn dim(&self) -> usize {
        self.dim
    }

    fn logp(&self, position: &[f64]) -> Result<f64, Infallible> {
        Ok(position
            .iter()
            .map(|&x| -0.5 * (x - self.mu) * (x - self.mu))
            .sum())
    }

    fn has_gradient(&self) -> bool {
        true
    }

    fn logp_and_gradient(&self, position: &[f64], gradient: &mut [f64]) -> Result<f64, Infallible> {
        let mut logp = 0f64;
        for (&x, grad) in position.iter().zip(gradient.iter_mut()) {
            let diff = x - self.mu;
            logp -= 0.5 * diff * diff;
            *grad = -diff;
        }
        Ok(logp)
    }
}

fn settings(method: StepMethodKind) -> SamplerSettings {
    SamplerSettings {
        draws: 100,
        tune: 100,
        chains: 1,
        cores: 1,
        random_seed: Some(42),
        step_method_override: vec![StepAssignment::new(method, ["x"])],
        ..Default::default()
    }
}

fn criterion_benchmark(c: &mut Criterion) {
    for dim in [10, 1000] {
        let target = NormalLogp { dim, mu: 3. };
        for method in [StepMethodKind::Nuts, StepMethodKind::Hmc, StepMethodKind::Metropolis] {
            let settings = settings(method);
            c.bench_function(&format!("sample {} normal {}", method, dim), |b| {
                b.iter(|| sample(black_box(&target), black_box(&settings)))
            });
        }
    }

    let target = NormalLogp { dim: 1, mu: 0. };
    let settings = SamplerSettings {
        draws: 1000,
        chains: 4,
        ..settings(StepMethodKind::Nuts)
    };
    c.bench_function("diagnostics 4x1000", |b| {
        b.iter_batched(
            || sample(&target, &settings).map(|ensemble| {
                ensemble
                    .traces
                    .iter()
                    .map(|trace| trace.values(0))
                    .collect::<Vec<_>>()
            }),
            |values| {
                if let Ok(values) = values {
                    let chains: Vec<&[f64]> = values.iter().map(|v| v.as_slice()).collect();
                    black_box(split_r_hat(&chains));
                    black_box(effective_sample_size(&chains));
                }
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
