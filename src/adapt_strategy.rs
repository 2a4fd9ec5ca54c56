use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    hamiltonian::{Collector, CombinedCollector, Direction, EuclideanHamiltonian},
    mass_matrix::{DrawGradCollector, RunningVariance},
    model::{BoxedLogpError, LogDensity},
    state::State,
    stepsize::{AcceptanceRateCollector, DualAverage, DualAverageOptions},
};

const LOWER_LIMIT: f64 = 1e-20f64;
const UPPER_LIMIT: f64 = 1e20f64;

/// Settings for the diagonal mass matrix adaptation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MassMatrixSettings {
    /// Estimate the mass matrix during tuning. If false it stays at the identity.
    pub adapt: bool,
    /// Fraction of tuning that uses the shorter early switch frequency.
    pub early_window: f64,
    /// Fraction at the end of tuning where only the step size is adapted.
    pub step_size_window: f64,
    /// Switch to a new variance estimator every `window_switch_freq` draws.
    pub window_switch_freq: u64,
    pub early_window_switch_freq: u64,
}

impl Default for MassMatrixSettings {
    fn default() -> Self {
        Self {
            adapt: true,
            early_window: 0.3,
            step_size_window: 0.15,
            window_switch_freq: 80,
            early_window_switch_freq: 10,
        }
    }
}

pub(crate) type HamiltonianCollector =
    CombinedCollector<AcceptanceRateCollector, DrawGradCollector>;

pub(crate) fn new_collector(dim: usize) -> HamiltonianCollector {
    CombinedCollector {
        collector1: AcceptanceRateCollector::new(),
        collector2: DrawGradCollector::new(dim),
    }
}

/// Step size and mass matrix adaptation of a Hamiltonian step method.
#[derive(Debug, Clone)]
pub(crate) struct HamiltonianAdapt {
    settings: MassMatrixSettings,
    dual_average: DualAverageOptions,
    target_accept: f64,
    step_size_adapt: DualAverage,
    draw_var: RunningVariance,
    grad_var: RunningVariance,
    draw_var_bg: RunningVariance,
    grad_var_bg: RunningVariance,
    early_end: u64,
    final_window_start: u64,
    tuning: bool,
}

impl HamiltonianAdapt {
    pub(crate) fn new(
        settings: MassMatrixSettings,
        dual_average: DualAverageOptions,
        target_accept: f64,
        num_tune: u64,
        dim: usize,
    ) -> Self {
        let early_end = ((num_tune as f64) * settings.early_window).floor() as u64;
        let final_window_start =
            ((num_tune as f64) * (1. - settings.step_size_window)).floor() as u64;
        Self {
            settings,
            dual_average,
            target_accept,
            step_size_adapt: DualAverage::new(dual_average, dual_average.initial_step),
            draw_var: RunningVariance::new(dim),
            grad_var: RunningVariance::new(dim),
            draw_var_bg: RunningVariance::new(dim),
            grad_var_bg: RunningVariance::new(dim),
            early_end,
            final_window_start,
            tuning: true,
        }
    }

    /// Set the mass matrix from the initial gradient and search for a
    /// reasonable first step size.
    pub(crate) fn init<T: LogDensity + ?Sized, R: Rng + ?Sized>(
        &mut self,
        hamiltonian: &mut EuclideanHamiltonian,
        target: &T,
        state: &State,
        rng: &mut R,
    ) -> Result<(), BoxedLogpError> {
        if self.settings.adapt {
            hamiltonian
                .mass_matrix
                .update_diag_grad(&state.grad, (LOWER_LIMIT, UPPER_LIMIT));
        }
        let step_size = self.find_initial_step_size(hamiltonian, target, state, rng)?;
        hamiltonian.step_size = step_size;
        self.step_size_adapt = DualAverage::new(self.dual_average, step_size);
        trace!(step_size, "initial step size");
        Ok(())
    }

    fn find_initial_step_size<T: LogDensity + ?Sized, R: Rng + ?Sized>(
        &self,
        hamiltonian: &mut EuclideanHamiltonian,
        target: &T,
        state: &State,
        rng: &mut R,
    ) -> Result<f64, BoxedLogpError> {
        let initial_step = self.dual_average.initial_step;
        let mut state = state.clone();
        state.make_init_point();
        hamiltonian.randomize_momentum(&mut state, rng);

        let one_step_accept = |hamiltonian: &mut EuclideanHamiltonian| {
            let mut collector = AcceptanceRateCollector::new();
            collector.register_init(&state);
            hamiltonian
                .leapfrog(
                    target,
                    &state,
                    Direction::Forward,
                    state.energy(),
                    &mut collector,
                )
                .map(|_| collector.mean.current())
        };

        hamiltonian.step_size = initial_step;
        let accept_stat = one_step_accept(hamiltonian)?;
        let grow = accept_stat > self.target_accept;

        for _ in 0..100 {
            let accept_stat = one_step_accept(hamiltonian)?;
            if grow {
                if (accept_stat <= self.target_accept) | (hamiltonian.step_size > 1e5) {
                    return Ok(hamiltonian.step_size);
                }
                hamiltonian.step_size *= 2.;
            } else {
                if (accept_stat >= self.target_accept) | (hamiltonian.step_size < 1e-10) {
                    return Ok(hamiltonian.step_size);
                }
                hamiltonian.step_size /= 2.;
            }
        }
        Ok(initial_step)
    }

    /// Update step size and mass matrix after tuning draw number `draw`.
    pub(crate) fn adapt(
        &mut self,
        hamiltonian: &mut EuclideanHamiltonian,
        draw: u64,
        accept_stat: f64,
        collector: &DrawGradCollector,
    ) {
        if !self.tuning {
            return;
        }
        self.step_size_adapt.advance(accept_stat, self.target_accept);
        hamiltonian.step_size = self.step_size_adapt.current_step_size();

        if !self.settings.adapt || draw >= self.final_window_start {
            return;
        }

        if collector.is_good {
            self.draw_var.add_sample(&collector.draw);
            self.grad_var.add_sample(&collector.grad);
            self.draw_var_bg.add_sample(&collector.draw);
            self.grad_var_bg.add_sample(&collector.grad);
        }

        let switch_freq = if draw < self.early_end {
            self.settings.early_window_switch_freq
        } else {
            self.settings.window_switch_freq
        };

        if self.draw_var_bg.count() >= switch_freq.max(3) {
            hamiltonian.mass_matrix.update_diag_draw_grad(
                &self.draw_var.current(),
                &self.grad_var.current(),
                (LOWER_LIMIT, UPPER_LIMIT),
            );
            let dim = hamiltonian.dim();
            self.draw_var = std::mem::replace(&mut self.draw_var_bg, RunningVariance::new(dim));
            self.grad_var = std::mem::replace(&mut self.grad_var_bg, RunningVariance::new(dim));
            self.step_size_adapt.reset(hamiltonian.step_size);
            trace!(draw, step_size = hamiltonian.step_size, "mass matrix window switch");
        }
    }

    /// Freeze the step size at its averaged value.
    pub(crate) fn finish_tuning(&mut self, hamiltonian: &mut EuclideanHamiltonian) {
        if self.tuning {
            hamiltonian.step_size = self.step_size_adapt.current_step_size_adapted();
            self.tuning = false;
        }
    }

    #[cfg(test)]
    pub(crate) fn is_tuning(&self) -> bool {
        self.tuning
    }
}
