use std::convert::Infallible;

use mcmc_engine::{
    sample, DiagnosticWarning, Ensemble, LogDensity, SamplerSettings, StepAssignment,
    StepMethodKind, Support, VariableInfo,
};
use pretty_assertions::assert_eq;
use rand::Rng;

/// Standard normal in one dimension, with starting points spread over
/// `(-init_range, init_range)`.
struct StandardNormal {
    init_range: f64,
}

impl LogDensity for StandardNormal {
    type LogpError = Infallible;

    fn dim(&self) -> usize {
        1
    }

    fn logp(&self, position: &[f64]) -> Result<f64, Infallible> {
        Ok(-0.5 * position[0] * position[0])
    }

    fn has_gradient(&self) -> bool {
        true
    }

    fn logp_and_gradient(&self, position: &[f64], gradient: &mut [f64]) -> Result<f64, Infallible> {
        gradient[0] = -position[0];
        self.logp(position)
    }

    fn init_position<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        position: &mut [f64],
    ) -> anyhow::Result<()> {
        position[0] = rng.random_range(-self.init_range..self.init_range);
        Ok(())
    }
}

/// Posterior of a success probability after `successes` out of `trials`
/// Bernoulli observations with a flat prior.
struct BernoulliPosterior {
    successes: f64,
    trials: f64,
}

impl LogDensity for BernoulliPosterior {
    type LogpError = Infallible;

    fn dim(&self) -> usize {
        1
    }

    fn logp(&self, position: &[f64]) -> Result<f64, Infallible> {
        let p = position[0];
        if p <= 0. || p >= 1. {
            return Ok(f64::NEG_INFINITY);
        }
        Ok(self.successes * p.ln() + (self.trials - self.successes) * (1. - p).ln())
    }

    fn init_position<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        position: &mut [f64],
    ) -> anyhow::Result<()> {
        position[0] = rng.random_range(0.05..0.95);
        Ok(())
    }

    fn variables(&self) -> Vec<VariableInfo> {
        vec![VariableInfo::scalar("p", 0, Support::BoundedContinuous)]
    }
}

/// Independent binary coordinates with the given probabilities of one.
struct IndependentBits {
    probs: Vec<f64>,
}

impl LogDensity for IndependentBits {
    type LogpError = Infallible;

    fn dim(&self) -> usize {
        self.probs.len()
    }

    fn logp(&self, position: &[f64]) -> Result<f64, Infallible> {
        Ok(position
            .iter()
            .zip(self.probs.iter())
            .map(|(&z, &p)| if z == 1. { p.ln() } else { (1. - p).ln() })
            .sum())
    }

    fn init_position<R: Rng + ?Sized>(
        &self,
        _rng: &mut R,
        position: &mut [f64],
    ) -> anyhow::Result<()> {
        position.fill(0.);
        Ok(())
    }

    fn variables(&self) -> Vec<VariableInfo> {
        vec![VariableInfo::new("z", 0, self.probs.len(), Support::Binary)]
    }
}

fn posterior_mean(ensemble: &Ensemble, coordinate: usize) -> f64 {
    let values: Vec<f64> = ensemble
        .completed_traces()
        .flat_map(|trace| trace.values(coordinate))
        .collect();
    values.iter().sum::<f64>() / values.len() as f64
}

#[test]
fn nuts_samples_standard_normal() {
    let settings = SamplerSettings {
        draws: 2000,
        tune: 1000,
        chains: 4,
        random_seed: Some(42),
        ..Default::default()
    };
    let ensemble = sample(&StandardNormal { init_range: 2. }, &settings).unwrap();
    assert!(ensemble.failures.is_empty());
    assert_eq!(ensemble.num_completed(), 4);
    assert_eq!(ensemble.blocks.len(), 1);
    assert_eq!(ensemble.blocks[0].method, StepMethodKind::Nuts);
    for trace in ensemble.traces.iter() {
        assert_eq!(trace.draws.len(), 2000);
        for draw in trace.draws.iter() {
            assert_eq!(draw.logp, -0.5 * draw.position[0] * draw.position[0]);
        }
    }

    let mean = posterior_mean(&ensemble, 0);
    assert!(mean.abs() < 0.05, "mean was {}", mean);

    let report = ensemble.diagnostics();
    let row = report.row("x").unwrap();
    assert!(row.r_hat < 1.01, "r_hat was {}", row.r_hat);
    assert!(row.ess > 1000., "ess was {}", row.ess);
    assert!((row.sd - 1.).abs() < 0.1);
    assert_eq!(report.total_divergences(), 0);
    assert_eq!(report.bfmi.len(), 4);
    assert!(report.bfmi.iter().all(|(_, bfmi)| *bfmi > 0.3));
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
}

#[test]
fn short_tuning_is_detected() {
    let settings = SamplerSettings {
        draws: 200,
        tune: 10,
        chains: 4,
        random_seed: Some(3),
        step_method_override: vec![StepAssignment::new(StepMethodKind::Metropolis, ["x"])],
        metropolis: mcmc_engine::MetropolisSettings {
            initial_scale: 0.05,
            ..Default::default()
        },
        ..Default::default()
    };
    let ensemble = sample(&StandardNormal { init_range: 20. }, &settings).unwrap();
    assert_eq!(ensemble.blocks[0].method, StepMethodKind::Metropolis);

    let report = ensemble.diagnostics();
    assert!(report.max_r_hat() > 1.01, "r_hat was {}", report.max_r_hat());
    assert!(report
        .warnings
        .iter()
        .any(|warning| matches!(warning, DiagnosticWarning::HighRHat { .. })));
}

#[test]
fn bernoulli_posterior_mean() {
    let target = BernoulliPosterior {
        successes: 700.,
        trials: 1000.,
    };
    let settings = SamplerSettings {
        draws: 5000,
        chains: 4,
        random_seed: Some(17),
        ..Default::default()
    };
    let ensemble = sample(&target, &settings).unwrap();
    assert_eq!(ensemble.blocks.len(), 1);
    assert_eq!(ensemble.blocks[0].method, StepMethodKind::Metropolis);
    assert_eq!(ensemble.blocks[0].variables, vec!["p".to_string()]);

    let mean = posterior_mean(&ensemble, 0);
    assert!((mean - 0.7).abs() < 0.03, "mean was {}", mean);
    for trace in ensemble.traces.iter() {
        assert!(trace.draws.iter().all(|draw| draw.logp.is_finite()));
    }
}

#[test]
fn binary_marginals() {
    let probs = vec![0.2, 0.5, 0.9];
    let settings = SamplerSettings {
        draws: 5000,
        tune: 100,
        chains: 2,
        random_seed: Some(5),
        ..Default::default()
    };
    let ensemble = sample(&IndependentBits { probs: probs.clone() }, &settings).unwrap();
    assert_eq!(ensemble.blocks[0].method, StepMethodKind::BinaryMetropolis);
    assert_eq!(ensemble.coordinate_names(), vec!["z[0]", "z[1]", "z[2]"]);
    for (coordinate, p) in probs.iter().enumerate() {
        let freq = posterior_mean(&ensemble, coordinate);
        assert!((freq - p).abs() < 0.03, "frequency of z[{}] was {}", coordinate, freq);
    }
}

#[test]
fn runs_are_reproducible() {
    let settings = SamplerSettings {
        draws: 100,
        tune: 100,
        chains: 3,
        random_seed: Some(99),
        ..Default::default()
    };
    let target = StandardNormal { init_range: 2. };
    let first = sample(&target, &settings).unwrap();
    let second = sample(&target, &settings).unwrap();
    assert_eq!(first.traces, second.traces);

    let sequential = sample(
        &target,
        &SamplerSettings {
            cores: 1,
            ..settings.clone()
        },
    )
    .unwrap();
    assert_eq!(first.traces, sequential.traces);
}

#[test]
fn ensembles_survive_ipc() {
    let settings = SamplerSettings {
        draws: 50,
        tune: 50,
        chains: 2,
        random_seed: Some(1),
        ..Default::default()
    };
    let ensemble = sample(&StandardNormal { init_range: 2. }, &settings).unwrap();
    let restored = Ensemble::from_ipc_bytes(&ensemble.to_ipc_bytes().unwrap()).unwrap();
    assert_eq!(restored.traces, ensemble.traces);
    assert_eq!(restored.variables, ensemble.variables);
    assert_eq!(restored.diagnostics(), ensemble.diagnostics());
}
