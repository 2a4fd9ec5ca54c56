/// A point in phase space for one block of coordinates.
#[derive(Debug, Clone)]
pub(crate) struct State {
    /// Momentum
    pub(crate) p: Box<[f64]>,
    /// Position
    pub(crate) q: Box<[f64]>,
    /// Velocity, the mass matrix applied to the momentum
    pub(crate) v: Box<[f64]>,
    /// Gradient of the log density at `q`
    pub(crate) grad: Box<[f64]>,
    pub(crate) idx_in_trajectory: i64,
    pub(crate) kinetic_energy: f64,
    pub(crate) potential_energy: f64,
}

impl State {
    pub(crate) fn new(dim: usize) -> State {
        State {
            p: vec![0.; dim].into(),
            q: vec![0.; dim].into(),
            v: vec![0.; dim].into(),
            grad: vec![0.; dim].into(),
            idx_in_trajectory: 0,
            kinetic_energy: 0.,
            potential_energy: 0.,
        }
    }

    /// The total energy (potential + kinetic)
    pub(crate) fn energy(&self) -> f64 {
        self.potential_energy + self.kinetic_energy
    }

    pub(crate) fn logp(&self) -> f64 {
        -self.potential_energy
    }

    pub(crate) fn log_acceptance_probability(&self, initial_energy: f64) -> f64 {
        (initial_energy - self.energy()).min(0.)
    }

    /// Initialize the point to be the first in the trajectory.
    pub(crate) fn make_init_point(&mut self) {
        self.idx_in_trajectory = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn energy_of_new_state() {
        let mut state = State::new(3);
        assert!(state.p.len() == 3);
        state.potential_energy = 1.5;
        state.kinetic_energy = 0.5;
        assert_eq!(state.energy(), 2.);
        assert_eq!(state.logp(), -1.5);
        assert_eq!(state.log_acceptance_probability(3.), 0.);
        assert_eq!(state.log_acceptance_probability(1.), -1.);
    }
}
