use serde::{Deserialize, Serialize};

use crate::{
    hamiltonian::{Collector, DivergenceInfo},
    math::accept_probability,
    state::State,
};

/// Settings for step size adaptation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DualAverageOptions {
    pub k: f64,
    pub t0: f64,
    pub gamma: f64,
    /// The step size where the initial step size search starts.
    pub initial_step: f64,
}

impl Default for DualAverageOptions {
    fn default() -> DualAverageOptions {
        DualAverageOptions {
            k: 0.75,
            t0: 10.,
            gamma: 0.05,
            initial_step: 0.1,
        }
    }
}

/// Nesterov dual averaging of the log step size.
#[derive(Debug, Clone)]
pub(crate) struct DualAverage {
    log_step: f64,
    log_step_adapted: f64,
    hbar: f64,
    mu: f64,
    count: u64,
    settings: DualAverageOptions,
}

impl DualAverage {
    pub(crate) fn new(settings: DualAverageOptions, initial_step: f64) -> DualAverage {
        DualAverage {
            log_step: initial_step.ln(),
            log_step_adapted: initial_step.ln(),
            hbar: 0.,
            mu: (10. * initial_step).ln(),
            count: 1,
            settings,
        }
    }

    pub(crate) fn advance(&mut self, accept_stat: f64, target: f64) {
        let w = 1. / (self.count as f64 + self.settings.t0);
        self.hbar = (1. - w) * self.hbar + w * (target - accept_stat);
        self.log_step = self.mu - self.hbar * (self.count as f64).sqrt() / self.settings.gamma;
        let mk = (self.count as f64).powf(-self.settings.k);
        self.log_step_adapted = mk * self.log_step + (1. - mk) * self.log_step_adapted;
        self.count += 1;
    }

    pub(crate) fn current_step_size(&self) -> f64 {
        self.log_step.exp()
    }

    pub(crate) fn current_step_size_adapted(&self) -> f64 {
        self.log_step_adapted.exp()
    }

    pub(crate) fn reset(&mut self, initial_step: f64) {
        self.log_step = initial_step.ln();
        self.log_step_adapted = initial_step.ln();
        self.hbar = 0f64;
        self.mu = (10. * initial_step).ln();
        self.count = 1;
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RunningMean {
    sum: f64,
    count: u64,
}

impl RunningMean {
    pub(crate) fn new() -> RunningMean {
        RunningMean { sum: 0., count: 0 }
    }

    pub(crate) fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    /// The mean of all values, zero if there are none.
    pub(crate) fn current(&self) -> f64 {
        if self.count == 0 {
            return 0.;
        }
        self.sum / self.count as f64
    }

    pub(crate) fn reset(&mut self) {
        self.sum = 0f64;
        self.count = 0;
    }
}

/// Mean acceptance probability of all leapfrog steps relative to the
/// start of the trajectory.
#[derive(Debug, Clone)]
pub(crate) struct AcceptanceRateCollector {
    initial_energy: f64,
    pub(crate) mean: RunningMean,
}

impl AcceptanceRateCollector {
    pub(crate) fn new() -> AcceptanceRateCollector {
        AcceptanceRateCollector {
            initial_energy: 0.,
            mean: RunningMean::new(),
        }
    }
}

impl Collector for AcceptanceRateCollector {
    fn register_leapfrog(
        &mut self,
        _start: &State,
        end: &State,
        divergence_info: Option<&DivergenceInfo>,
    ) {
        match divergence_info {
            Some(_) => self.mean.add(0.),
            None => self
                .mean
                .add(accept_probability(self.initial_energy - end.energy())),
        }
    }

    fn register_init(&mut self, state: &State) {
        self.initial_energy = state.energy();
        self.mean.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn dual_average_finds_target() {
        // Acceptance falls off smoothly with the step size.
        let accept = |step: f64| (-step * step).exp();
        let target = 0.8f64;
        let optimal = (-target.ln()).sqrt();

        let mut adapt = DualAverage::new(DualAverageOptions::default(), 1.);
        for _ in 0..2000 {
            let stat = accept(adapt.current_step_size());
            adapt.advance(stat, target);
        }
        assert_relative_eq!(adapt.current_step_size_adapted(), optimal, max_relative = 0.05);
    }

    #[test]
    fn reset_restarts_at_step() {
        let mut adapt = DualAverage::new(DualAverageOptions::default(), 1.);
        adapt.advance(0.1, 0.8);
        let first = adapt.current_step_size();
        assert!((first - 1.).abs() > 1e-3);
        // Repeated low acceptance pulls the step size down from mu.
        adapt.advance(0.1, 0.8);
        assert!(adapt.current_step_size() < first);
        adapt.reset(0.3);
        assert_relative_eq!(adapt.current_step_size(), 0.3);
        assert_relative_eq!(adapt.current_step_size_adapted(), 0.3);
    }

    #[test]
    fn running_mean() {
        let mut mean = RunningMean::new();
        assert_eq!(mean.current(), 0.);
        mean.add(1.);
        mean.add(2.);
        assert_eq!(mean.current(), 1.5);
        mean.reset();
        assert_eq!(mean.current(), 0.);
    }

    #[test]
    fn acceptance_rate_of_divergence_is_zero() {
        let mut collector = AcceptanceRateCollector::new();
        let mut start = State::new(1);
        start.potential_energy = 1.;
        collector.register_init(&start);

        let mut end = State::new(1);
        end.potential_energy = 1. + 2f64.ln();
        collector.register_leapfrog(&start, &end, None);
        let info = DivergenceInfo {
            energy_error: f64::INFINITY,
        };
        collector.register_leapfrog(&start, &end, Some(&info));
        assert_relative_eq!(collector.mean.current(), 0.25);
    }
}
