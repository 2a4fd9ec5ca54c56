//! Random walk Metropolis for continuous and integer valued blocks, and a
//! Metropolis variant that flips binary coordinates.

use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::{
    chain::ChainState,
    math::accept_probability,
    model::{eval_logp, BoxedLogpError, LogDensity},
    step_method::{StepMethodKind, StepStats},
};

/// Settings for random walk Metropolis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetropolisSettings {
    /// Standard deviation of the proposal before tuning.
    pub initial_scale: f64,
    /// Number of tuning draws between scale updates.
    pub tune_interval: u64,
}

impl Default for MetropolisSettings {
    fn default() -> Self {
        Self {
            initial_scale: 1.,
            tune_interval: 100,
        }
    }
}

/// The log acceptance ratio of a symmetric proposal.
///
/// Undefined ratios (both densities `-inf`) reject the candidate.
pub fn acceptance_log_ratio(current_logp: f64, candidate_logp: f64) -> f64 {
    let ratio = candidate_logp - current_logp;
    if ratio.is_nan() {
        f64::NEG_INFINITY
    } else {
        ratio
    }
}

/// Metropolis rule: accept iff `ln(u) < log_ratio` for `u ~ U(0, 1)`.
pub(crate) fn accept<R: Rng + ?Sized>(log_ratio: f64, rng: &mut R) -> bool {
    let u: f64 = rng.random();
    u.ln() < log_ratio
}

/// Factor applied to the proposal scale for an observed acceptance rate.
pub(crate) fn tune_factor(acceptance_rate: f64) -> f64 {
    if acceptance_rate < 0.001 {
        0.1
    } else if acceptance_rate < 0.05 {
        0.5
    } else if acceptance_rate < 0.2 {
        0.9
    } else if acceptance_rate > 0.95 {
        10.
    } else if acceptance_rate > 0.75 {
        2.
    } else if acceptance_rate > 0.5 {
        1.1
    } else {
        1.
    }
}

/// Adjusts the proposal scale from the acceptance rate of a trailing window.
#[derive(Debug, Clone)]
pub(crate) struct ScaleTuner {
    scale: f64,
    tune_interval: u64,
    accepted: u64,
    steps: u64,
    frozen: bool,
}

impl ScaleTuner {
    pub(crate) fn new(settings: MetropolisSettings) -> Self {
        ScaleTuner {
            scale: settings.initial_scale,
            tune_interval: settings.tune_interval.max(1),
            accepted: 0,
            steps: 0,
            frozen: false,
        }
    }

    pub(crate) fn scale(&self) -> f64 {
        self.scale
    }

    pub(crate) fn record(&mut self, accepted: bool) {
        if self.frozen {
            return;
        }
        self.steps += 1;
        if accepted {
            self.accepted += 1;
        }
        if self.steps == self.tune_interval {
            let rate = self.accepted as f64 / self.steps as f64;
            self.scale *= tune_factor(rate);
            self.steps = 0;
            self.accepted = 0;
        }
    }

    pub(crate) fn freeze(&mut self) {
        self.frozen = true;
    }
}

/// A candidate for the chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub position: Box<[f64]>,
    pub logp: f64,
    pub log_ratio: f64,
}

/// Random walk Metropolis on one block of coordinates.
#[derive(Debug, Clone)]
pub struct MetropolisStep {
    indices: Box<[usize]>,
    discrete: Box<[bool]>,
    tuner: ScaleTuner,
}

impl MetropolisStep {
    /// `discrete` marks the block coordinates that only take integer values.
    pub(crate) fn new(indices: &[usize], discrete: &[bool], settings: MetropolisSettings) -> Self {
        assert!(indices.len() == discrete.len());
        MetropolisStep {
            indices: indices.into(),
            discrete: discrete.into(),
            tuner: ScaleTuner::new(settings),
        }
    }

    pub(crate) fn propose<T: LogDensity + ?Sized, R: Rng + ?Sized>(
        &self,
        target: &T,
        state: &ChainState,
        rng: &mut R,
    ) -> Result<Proposal, BoxedLogpError> {
        let scale = self.tuner.scale();
        let mut position = state.position.clone();
        for (&i, &discrete) in self.indices.iter().zip(self.discrete.iter()) {
            let jump: f64 = rng.sample(StandardNormal);
            let value = position[i] + scale * jump;
            position[i] = if discrete { value.round() } else { value };
        }
        let logp = eval_logp(target, &position)?;
        Ok(Proposal {
            log_ratio: acceptance_log_ratio(state.logp, logp),
            position,
            logp,
        })
    }

    pub(crate) fn step<T: LogDensity + ?Sized, R: Rng + ?Sized>(
        &mut self,
        target: &T,
        state: &mut ChainState,
        rng: &mut R,
        tuning: bool,
    ) -> Result<StepStats, BoxedLogpError> {
        let scale = self.tuner.scale();
        let proposal = self.propose(target, state, rng)?;
        let accepted = accept(proposal.log_ratio, rng);
        if accepted {
            state.position = proposal.position;
            state.logp = proposal.logp;
        }
        if tuning {
            self.tuner.record(accepted);
        }
        Ok(StepStats::metropolis(
            StepMethodKind::Metropolis,
            accept_probability(proposal.log_ratio),
            accepted,
            scale,
        ))
    }

    pub(crate) fn finish_tuning(&mut self) {
        self.tuner.freeze();
    }

    #[cfg(test)]
    pub(crate) fn scale(&self) -> f64 {
        self.tuner.scale()
    }
}

/// Flips each coordinate of a binary block in turn.
#[derive(Debug, Clone)]
pub struct BinaryMetropolisStep {
    indices: Box<[usize]>,
}

impl BinaryMetropolisStep {
    pub(crate) fn new(indices: &[usize]) -> Self {
        BinaryMetropolisStep {
            indices: indices.into(),
        }
    }

    pub(crate) fn step<T: LogDensity + ?Sized, R: Rng + ?Sized>(
        &mut self,
        target: &T,
        state: &mut ChainState,
        rng: &mut R,
    ) -> Result<StepStats, BoxedLogpError> {
        let mut any_accepted = false;
        let mut accept_sum = 0.;
        for &i in self.indices.iter() {
            let current = state.position[i];
            state.position[i] = 1. - current;
            let logp = eval_logp(target, &state.position)?;
            let log_ratio = acceptance_log_ratio(state.logp, logp);
            accept_sum += accept_probability(log_ratio);
            if accept(log_ratio, rng) {
                state.logp = logp;
                any_accepted = true;
            } else {
                state.position[i] = current;
            }
        }
        let accept_prob = if self.indices.is_empty() {
            0.
        } else {
            accept_sum / self.indices.len() as f64
        };
        Ok(StepStats::metropolis(
            StepMethodKind::BinaryMetropolis,
            accept_prob,
            any_accepted,
            1.,
        ))
    }
}
