use itertools::izip;
use rand::Rng;

use crate::{
    hamiltonian::{Collector, SampleInfo},
    math::{multiply, vector_dot},
    state::State,
};

/// A diagonal mass matrix, stored as the variance of the target
/// (the inverse of the mass).
#[derive(Debug, Clone)]
pub(crate) struct DiagMassMatrix {
    inv_stds: Box<[f64]>,
    pub(crate) variance: Box<[f64]>,
}

impl DiagMassMatrix {
    pub(crate) fn new(ndim: usize) -> Self {
        Self {
            inv_stds: vec![1f64; ndim].into(),
            variance: vec![1f64; ndim].into(),
        }
    }

    pub(crate) fn update_diag(&mut self, new_variance: impl Iterator<Item = f64>) {
        izip!(self.variance.iter_mut(), self.inv_stds.iter_mut(), new_variance).for_each(
            |(var, inv_std, x)| {
                debug_assert!(x.is_finite(), "Illegal value on mass matrix: {}", x);
                debug_assert!(x > 0f64, "Illegal value on mass matrix: {}", x);
                *var = x;
                *inv_std = (1. / x).sqrt();
            },
        );
    }

    /// Set the diagonal from the variances of draws and gradients.
    pub(crate) fn update_diag_draw_grad(
        &mut self,
        draw_var: &[f64],
        grad_var: &[f64],
        (lower, upper): (f64, f64),
    ) {
        self.update_diag(izip!(draw_var, grad_var).map(|(&draw, &grad)| {
            let val = (draw / grad).sqrt().clamp(lower, upper);
            if val.is_finite() {
                val
            } else {
                1f64
            }
        }));
    }

    /// Set the diagonal from a single gradient, used before any draws exist.
    pub(crate) fn update_diag_grad(&mut self, gradient: &[f64], (lower, upper): (f64, f64)) {
        self.update_diag(gradient.iter().map(|&grad| {
            if (grad == 0f64) | !grad.is_finite() {
                return 1f64;
            }
            grad.abs().recip().clamp(lower, upper)
        }));
    }

    pub(crate) fn update_velocity(&self, state: &mut State) {
        multiply(&self.variance, &state.p, &mut state.v);
    }

    pub(crate) fn update_kinetic_energy(&self, state: &mut State) {
        state.kinetic_energy = 0.5 * vector_dot(&state.p, &state.v);
    }

    pub(crate) fn randomize_momentum<R: Rng + ?Sized>(&self, state: &mut State, rng: &mut R) {
        let dist = rand_distr::StandardNormal;
        state
            .p
            .iter_mut()
            .zip(self.inv_stds.iter())
            .for_each(|(p, &s)| {
                let norm: f64 = rng.sample(dist);
                *p = s * norm;
            });
    }
}

/// Welford estimator of the per-coordinate variance.
#[derive(Debug, Clone)]
pub(crate) struct RunningVariance {
    mean: Box<[f64]>,
    m2: Box<[f64]>,
    count: u64,
}

impl RunningVariance {
    pub(crate) fn new(dim: usize) -> Self {
        Self {
            mean: vec![0f64; dim].into(),
            m2: vec![0f64; dim].into(),
            count: 0,
        }
    }

    pub(crate) fn add_sample(&mut self, value: &[f64]) {
        self.count += 1;
        let count = self.count as f64;
        izip!(value, self.mean.iter_mut(), self.m2.iter_mut()).for_each(|(&x, mean, m2)| {
            let delta = x - *mean;
            *mean += delta / count;
            *m2 += delta * (x - *mean);
        });
    }

    /// The sample variance of each coordinate.
    pub(crate) fn current(&self) -> Vec<f64> {
        let denom = (self.count.saturating_sub(1)).max(1) as f64;
        self.m2.iter().map(|m2| m2 / denom).collect()
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }
}

/// Remembers position and gradient of the last draw for mass matrix adaptation.
#[derive(Debug, Clone)]
pub(crate) struct DrawGradCollector {
    pub(crate) draw: Box<[f64]>,
    pub(crate) grad: Box<[f64]>,
    pub(crate) is_good: bool,
}

impl DrawGradCollector {
    pub(crate) fn new(dim: usize) -> Self {
        DrawGradCollector {
            draw: vec![0f64; dim].into(),
            grad: vec![0f64; dim].into(),
            is_good: true,
        }
    }
}

impl Collector for DrawGradCollector {
    fn register_draw(&mut self, state: &State, info: &SampleInfo) {
        self.draw.copy_from_slice(&state.q);
        self.grad.copy_from_slice(&state.grad);
        let idx = state.idx_in_trajectory;
        if info.divergence_info.is_some() {
            self.is_good = (idx <= -4) | (idx >= 4);
        } else {
            self.is_good = idx != 0;
        }
    }
}
