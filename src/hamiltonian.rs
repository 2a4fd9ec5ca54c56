use rand::{distr::Distribution, Rng};

use crate::{
    mass_matrix::DiagMassMatrix,
    math::{axpy, axpy_out},
    model::{eval_logp_and_gradient, BoxedLogpError, LogDensity},
    state::State,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Direction {
    Forward,
    Backward,
}

impl Distribution<Direction> for rand::distr::StandardUniform {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Direction {
        if rng.random::<bool>() {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }
}

/// Details about a leapfrog step that failed to conserve energy.
#[derive(Debug, Clone)]
pub(crate) struct DivergenceInfo {
    /// The difference between the energy at the initial location of the trajectory and
    /// the energy at the end of the diverging leapfrog step.
    pub(crate) energy_error: f64,
}

/// Information about a draw from a Hamiltonian trajectory.
#[derive(Debug, Clone)]
pub(crate) struct SampleInfo {
    /// The depth of the trajectory that this point was sampled from
    pub(crate) depth: u64,

    /// Set if a leapfrog step in the trajectory diverged.
    pub(crate) divergence_info: Option<DivergenceInfo>,

    /// Whether the trajectory was terminated because it reached
    /// the maximum tree depth.
    pub(crate) reached_maxdepth: bool,

    /// Number of leapfrog steps computed for this draw.
    pub(crate) n_steps: u64,
}

/// Callbacks for various events during a Hamiltonian sampling step.
///
/// Collectors can compute statistics like the mean acceptance rate
/// or collect data for mass matrix adaptation.
pub(crate) trait Collector {
    fn register_leapfrog(
        &mut self,
        _start: &State,
        _end: &State,
        _divergence_info: Option<&DivergenceInfo>,
    ) {
    }
    fn register_draw(&mut self, _state: &State, _info: &SampleInfo) {}
    fn register_init(&mut self, _state: &State) {}
}

#[derive(Debug, Clone)]
pub(crate) struct CombinedCollector<C1: Collector, C2: Collector> {
    pub(crate) collector1: C1,
    pub(crate) collector2: C2,
}

impl<C1: Collector, C2: Collector> Collector for CombinedCollector<C1, C2> {
    fn register_leapfrog(
        &mut self,
        start: &State,
        end: &State,
        divergence_info: Option<&DivergenceInfo>,
    ) {
        self.collector1
            .register_leapfrog(start, end, divergence_info);
        self.collector2
            .register_leapfrog(start, end, divergence_info);
    }

    fn register_draw(&mut self, state: &State, info: &SampleInfo) {
        self.collector1.register_draw(state, info);
        self.collector2.register_draw(state, info);
    }

    fn register_init(&mut self, state: &State) {
        self.collector1.register_init(state);
        self.collector2.register_init(state);
    }
}

impl Collector for () {}

/// Hamiltonian dynamics on one block of coordinates, with all other
/// coordinates of the target held fixed.
#[derive(Debug, Clone)]
pub(crate) struct EuclideanHamiltonian {
    indices: Box<[usize]>,
    pub(crate) mass_matrix: DiagMassMatrix,
    max_energy_error: f64,
    pub(crate) step_size: f64,
    full_position: Box<[f64]>,
    full_gradient: Box<[f64]>,
}

impl EuclideanHamiltonian {
    pub(crate) fn new(
        indices: &[usize],
        full_dim: usize,
        max_energy_error: f64,
        step_size: f64,
    ) -> Self {
        EuclideanHamiltonian {
            indices: indices.into(),
            mass_matrix: DiagMassMatrix::new(indices.len()),
            max_energy_error,
            step_size,
            full_position: vec![0f64; full_dim].into(),
            full_gradient: vec![0f64; full_dim].into(),
        }
    }

    pub(crate) fn dim(&self) -> usize {
        self.indices.len()
    }

    /// Set the coordinates outside of the block.
    pub(crate) fn set_context(&mut self, position: &[f64]) {
        self.full_position.copy_from_slice(position);
    }

    /// Write the block coordinates of `state` into a full parameter vector.
    pub(crate) fn write_full_position(&self, state: &State, out: &mut [f64]) {
        self.indices
            .iter()
            .zip(state.q.iter())
            .for_each(|(&i, &q)| out[i] = q);
    }

    fn update_potential_gradient<T: LogDensity + ?Sized>(
        &mut self,
        target: &T,
        state: &mut State,
    ) -> Result<(), BoxedLogpError> {
        self.indices
            .iter()
            .zip(state.q.iter())
            .for_each(|(&i, &q)| self.full_position[i] = q);
        let logp = eval_logp_and_gradient(target, &self.full_position, &mut self.full_gradient)?;
        self.indices
            .iter()
            .zip(state.grad.iter_mut())
            .for_each(|(&i, g)| *g = self.full_gradient[i]);
        state.potential_energy = -logp;
        Ok(())
    }

    /// Create a state at the block coordinates of `position`.
    ///
    /// The momentum is zero, it is set later with [`Self::randomize_momentum`].
    pub(crate) fn init_state<T: LogDensity + ?Sized>(
        &mut self,
        target: &T,
        position: &[f64],
    ) -> Result<State, BoxedLogpError> {
        self.set_context(position);
        let mut state = State::new(self.dim());
        self.indices
            .iter()
            .zip(state.q.iter_mut())
            .for_each(|(&i, q)| *q = position[i]);
        self.update_potential_gradient(target, &mut state)?;
        self.mass_matrix.update_velocity(&mut state);
        self.mass_matrix.update_kinetic_energy(&mut state);
        Ok(state)
    }

    pub(crate) fn randomize_momentum<R: Rng + ?Sized>(&self, state: &mut State, rng: &mut R) {
        self.mass_matrix.randomize_momentum(state, rng);
        self.mass_matrix.update_velocity(state);
        self.mass_matrix.update_kinetic_energy(state);
    }

    /// Perform one leapfrog step.
    ///
    /// Return either an unrecoverable error, a new state or a divergence.
    pub(crate) fn leapfrog<T: LogDensity + ?Sized, C: Collector>(
        &mut self,
        target: &T,
        start: &State,
        dir: Direction,
        initial_energy: f64,
        collector: &mut C,
    ) -> Result<Result<State, DivergenceInfo>, BoxedLogpError> {
        let sign = match dir {
            Direction::Forward => 1,
            Direction::Backward => -1,
        };
        let epsilon = (sign as f64) * self.step_size;

        let mut out = start.clone();
        axpy_out(&start.grad, &start.p, epsilon / 2., &mut out.p);
        self.mass_matrix.update_velocity(&mut out);
        axpy_out(&out.v, &start.q, epsilon, &mut out.q);

        self.update_potential_gradient(target, &mut out)?;

        axpy(&out.grad, &mut out.p, epsilon / 2.);
        self.mass_matrix.update_velocity(&mut out);
        self.mass_matrix.update_kinetic_energy(&mut out);
        out.idx_in_trajectory = start.idx_in_trajectory + sign;

        let energy_error = out.energy() - initial_energy;
        if (energy_error > self.max_energy_error) | !energy_error.is_finite() {
            let info = DivergenceInfo { energy_error };
            collector.register_leapfrog(start, &out, Some(&info));
            return Ok(Err(info));
        }

        collector.register_leapfrog(start, &out, None);
        Ok(Ok(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_logps::NormalLogp;
    use pretty_assertions::assert_eq;

    fn energy_error_after(step_size: f64, total_time: f64) -> f64 {
        let target = NormalLogp::new(1, 0.);
        let mut hamiltonian = EuclideanHamiltonian::new(&[0], 1, 1000., step_size);
        let mut state = hamiltonian.init_state(&target, &[1.]).unwrap();
        state.p[0] = 0.5;
        hamiltonian.mass_matrix.update_velocity(&mut state);
        hamiltonian.mass_matrix.update_kinetic_energy(&mut state);
        let initial_energy = state.energy();

        let n_steps = (total_time / step_size).round() as usize;
        let mut max_error = 0f64;
        for _ in 0..n_steps {
            state = hamiltonian
                .leapfrog(&target, &state, Direction::Forward, initial_energy, &mut ())
                .unwrap()
                .unwrap();
            max_error = max_error.max((state.energy() - initial_energy).abs());
        }
        max_error
    }

    #[test]
    fn energy_error_shrinks_quadratically() {
        let coarse = energy_error_after(0.1, 1.);
        let fine = energy_error_after(0.05, 1.);
        assert!(coarse < 1e-2);
        let ratio = coarse / fine;
        assert!((3.5..4.5).contains(&ratio), "ratio was {}", ratio);
    }

    #[test]
    fn leapfrog_is_reversible() {
        let target = NormalLogp::new(3, 1.);
        let mut hamiltonian = EuclideanHamiltonian::new(&[0, 1, 2], 3, 1000., 0.3);
        let mut state = hamiltonian.init_state(&target, &[0.5, -1., 2.]).unwrap();
        state.p.copy_from_slice(&[0.1, 0.2, -0.3]);
        hamiltonian.mass_matrix.update_velocity(&mut state);
        hamiltonian.mass_matrix.update_kinetic_energy(&mut state);
        let energy = state.energy();

        let forward = hamiltonian
            .leapfrog(&target, &state, Direction::Forward, energy, &mut ())
            .unwrap()
            .unwrap();
        assert_eq!(forward.idx_in_trajectory, 1);
        let back = hamiltonian
            .leapfrog(&target, &forward, Direction::Backward, energy, &mut ())
            .unwrap()
            .unwrap();
        assert_eq!(back.idx_in_trajectory, 0);
        for (a, b) in back.q.iter().zip(state.q.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn large_step_diverges() {
        let target = NormalLogp::new(2, 0.);
        let mut hamiltonian = EuclideanHamiltonian::new(&[0, 1], 2, 10., 100.);
        let mut state = hamiltonian.init_state(&target, &[1., 1.]).unwrap();
        state.p.copy_from_slice(&[1., 1.]);
        hamiltonian.mass_matrix.update_velocity(&mut state);
        hamiltonian.mass_matrix.update_kinetic_energy(&mut state);
        let energy = state.energy();

        let info = hamiltonian
            .leapfrog(&target, &state, Direction::Forward, energy, &mut ())
            .unwrap()
            .unwrap_err();
        assert!(info.energy_error > 10.);
    }

    #[test]
    fn block_keeps_other_coordinates_fixed() {
        let target = NormalLogp::new(3, 0.);
        let mut hamiltonian = EuclideanHamiltonian::new(&[1], 3, 1000., 0.1);
        let state = hamiltonian.init_state(&target, &[5., 2., 7.]).unwrap();
        assert_eq!(&*state.q, &[2.]);
        assert_eq!(&*state.grad, &[-2.]);
        // The potential includes the fixed coordinates.
        assert_eq!(state.potential_energy, (25. + 4. + 49.) / 2.);

        let mut full = [5., 0., 7.];
        hamiltonian.write_full_position(&state, &mut full);
        assert_eq!(full, [5., 2., 7.]);
    }
}
