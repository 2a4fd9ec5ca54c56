use rand::Rng;

use crate::{
    adapt_strategy::{new_collector, HamiltonianAdapt, HamiltonianCollector},
    hamiltonian::{Collector, Direction, EuclideanHamiltonian, SampleInfo},
    math::accept_probability,
    metropolis::accept,
    model::{BoxedLogpError, LogDensity},
    nuts::{state_at, store_state, CachedState},
    step_method::{StepMethodKind, StepStats},
};

/// Hamiltonian Monte Carlo with a fixed integration time.
#[derive(Debug)]
pub struct HmcStep {
    hamiltonian: EuclideanHamiltonian,
    adapt: HamiltonianAdapt,
    collector: HamiltonianCollector,
    path_length: f64,
    max_steps: u64,
    cache: Option<CachedState>,
}

impl HmcStep {
    pub(crate) fn new(
        hamiltonian: EuclideanHamiltonian,
        adapt: HamiltonianAdapt,
        path_length: f64,
        max_steps: u64,
    ) -> Self {
        let dim = hamiltonian.dim();
        HmcStep {
            hamiltonian,
            adapt,
            collector: new_collector(dim),
            path_length,
            max_steps: max_steps.max(1),
            cache: None,
        }
    }

    /// Number of leapfrog steps for the current step size.
    pub(crate) fn n_leapfrog(&self) -> u64 {
        let steps = (self.path_length / self.hamiltonian.step_size).round();
        if steps.is_nan() {
            return 1;
        }
        (steps as u64).clamp(1, self.max_steps)
    }

    pub(crate) fn init<T: LogDensity + ?Sized, R: Rng + ?Sized>(
        &mut self,
        target: &T,
        position: &[f64],
        rng: &mut R,
    ) -> Result<(), BoxedLogpError> {
        let state = self.hamiltonian.init_state(target, position)?;
        self.adapt.init(&mut self.hamiltonian, target, &state, rng)?;
        store_state(&mut self.cache, position, state);
        Ok(())
    }

    pub(crate) fn step<T: LogDensity + ?Sized, R: Rng + ?Sized>(
        &mut self,
        target: &T,
        position: &mut [f64],
        rng: &mut R,
        draw_idx: u64,
        tuning: bool,
    ) -> Result<(f64, StepStats), BoxedLogpError> {
        let mut init = state_at(&mut self.hamiltonian, target, &mut self.cache, position)?;
        self.hamiltonian.randomize_momentum(&mut init, rng);
        init.make_init_point();
        self.collector.register_init(&init);
        let initial_energy = init.energy();
        let step_size = self.hamiltonian.step_size;

        let mut end = init.clone();
        let mut divergence_info = None;
        let mut n_steps = 0;
        for _ in 0..self.n_leapfrog() {
            let next = self.hamiltonian.leapfrog(
                target,
                &end,
                Direction::Forward,
                initial_energy,
                &mut self.collector,
            )?;
            n_steps += 1;
            match next {
                Ok(next) => end = next,
                Err(info) => {
                    divergence_info = Some(info);
                    break;
                }
            }
        }

        let (log_ratio, energy_error) = match &divergence_info {
            Some(info) => (f64::NEG_INFINITY, info.energy_error),
            None => (
                end.log_acceptance_probability(initial_energy),
                end.energy() - initial_energy,
            ),
        };
        let accept_prob = accept_probability(log_ratio);
        let accepted = accept(log_ratio, rng);
        let state = if accepted { end } else { init };

        let info = SampleInfo {
            depth: 0,
            divergence_info,
            reached_maxdepth: false,
            n_steps,
        };
        self.collector.register_draw(&state, &info);

        self.hamiltonian.write_full_position(&state, position);
        let logp = state.logp();
        let stats = StepStats {
            method: StepMethodKind::Hmc,
            accept_prob,
            accepted,
            diverging: info.divergence_info.is_some(),
            tree_depth: None,
            maxdepth_reached: false,
            energy: Some(state.energy()),
            energy_error: Some(energy_error),
            step_size,
            n_steps,
        };

        if tuning {
            self.adapt.adapt(
                &mut self.hamiltonian,
                draw_idx,
                accept_prob,
                &self.collector.collector2,
            );
        }
        store_state(&mut self.cache, position, state);
        Ok((logp, stats))
    }

    pub(crate) fn finish_tuning(&mut self) {
        self.adapt.finish_tuning(&mut self.hamiltonian);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapt_strategy::MassMatrixSettings, model::test_logps::NormalLogp,
        stepsize::DualAverageOptions,
    };
    use rand::{rngs::SmallRng, SeedableRng};

    fn hmc(dim: usize, step_size: f64, tune: u64) -> HmcStep {
        let indices: Vec<usize> = (0..dim).collect();
        let hamiltonian = EuclideanHamiltonian::new(&indices, dim, 1000., step_size);
        let adapt = HamiltonianAdapt::new(
            MassMatrixSettings::default(),
            DualAverageOptions::default(),
            0.8,
            tune,
            dim,
        );
        HmcStep::new(hamiltonian, adapt, 2., 1024)
    }

    #[test]
    fn number_of_steps_follows_path_length() {
        let mut step = hmc(1, 0.1, 0);
        assert_eq!(step.n_leapfrog(), 20);
        step.hamiltonian.step_size = 5.;
        assert_eq!(step.n_leapfrog(), 1);
        step.hamiltonian.step_size = 1e-9;
        assert_eq!(step.n_leapfrog(), 1024);
    }

    #[test]
    fn hmc_samples_normal() {
        let dim = 2;
        let target = NormalLogp::new(dim, -1.);
        let mut step = hmc(dim, 0.1, 200);
        let mut rng = SmallRng::seed_from_u64(4);
        let mut position = vec![0., 0.];
        step.init(&target, &position, &mut rng).unwrap();
        for draw_idx in 0..200 {
            step.step(&target, &mut position, &mut rng, draw_idx, true).unwrap();
        }
        step.finish_tuning();

        let n = 2000;
        let mut sum = 0.;
        for draw_idx in 0..n {
            let (logp, stats) = step
                .step(&target, &mut position, &mut rng, 200 + draw_idx, false)
                .unwrap();
            assert_eq!(logp, target.logp(&position).unwrap());
            assert!(stats.tree_depth.is_none());
            assert!(stats.n_steps >= 1);
            sum += position.iter().sum::<f64>();
        }
        let mean = sum / (n * dim as u64) as f64;
        assert!((mean + 1.).abs() < 0.15, "mean was {}", mean);
    }

    #[test]
    fn divergent_trajectories_are_rejected() {
        let target = NormalLogp::new(2, 0.);
        let mut step = hmc(2, 1e3, 0);
        let mut rng = SmallRng::seed_from_u64(4);
        let mut position = vec![1., 1.];
        let (_, stats) = step.step(&target, &mut position, &mut rng, 0, false).unwrap();
        assert!(stats.diverging);
        assert!(!stats.accepted);
        assert_eq!(stats.accept_prob, 0.);
        assert_eq!(position, vec![1., 1.]);
    }
}
