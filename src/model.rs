//! The interface between the sampler and a target density.
//!
//! A target provides the unnormalized log density of a fixed-dimensional
//! parameter vector in unconstrained space, optionally its gradient, a way to
//! draw starting points, and a description of how the vector splits into
//! named variables.

use std::ops::Range;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Errors that happen when we evaluate the logp and gradient function
pub trait LogpError: std::error::Error + Send + Sync + 'static {
    /// Unrecoverable errors during logp computation stop the chain,
    /// recoverable errors are treated like a log density of `-inf`.
    fn is_recoverable(&self) -> bool;
}

impl LogpError for std::convert::Infallible {
    fn is_recoverable(&self) -> bool {
        match *self {}
    }
}

pub(crate) type BoxedLogpError = Box<dyn std::error::Error + Send + Sync>;

/// The set of values a variable can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Support {
    /// Values in {0, 1}.
    Binary,
    /// Integer values.
    Discrete,
    /// Real values without bounds.
    Continuous,
    /// Real values where the density is `-inf` outside of some region.
    BoundedContinuous,
}

impl Support {
    pub fn is_continuous(&self) -> bool {
        matches!(self, Support::Continuous | Support::BoundedContinuous)
    }
}

/// A named, contiguous slice of the parameter vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableInfo {
    pub name: String,
    pub offset: usize,
    pub size: usize,
    pub support: Support,
}

impl VariableInfo {
    pub fn new(name: impl Into<String>, offset: usize, size: usize, support: Support) -> Self {
        Self {
            name: name.into(),
            offset,
            size,
            support,
        }
    }

    pub fn scalar(name: impl Into<String>, offset: usize, support: Support) -> Self {
        Self::new(name, offset, 1, support)
    }

    pub fn indices(&self) -> Range<usize> {
        self.offset..self.offset + self.size
    }

    /// Names of the individual coordinates, `name` for scalars and
    /// `name[i]` for vectors.
    pub fn coordinate_names(&self) -> Vec<String> {
        if self.size == 1 {
            vec![self.name.clone()]
        } else {
            (0..self.size)
                .map(|i| format!("{}[{}]", self.name, i))
                .collect()
        }
    }
}

/// An unnormalized log density on an unconstrained parameter vector.
///
/// The sampler calls the density from several chains at the same time, so
/// evaluation must not mutate shared state.
pub trait LogDensity: Send + Sync {
    type LogpError: LogpError;

    /// The number of parameters.
    fn dim(&self) -> usize;

    /// Evaluate the log density.
    ///
    /// Positions outside of the support should return `-inf` instead of an
    /// error. `NaN` is treated like `-inf`.
    fn logp(&self, position: &[f64]) -> Result<f64, Self::LogpError>;

    /// Whether [`LogDensity::logp_and_gradient`] computes a gradient.
    fn has_gradient(&self) -> bool {
        false
    }

    /// Evaluate the log density and write its gradient into `gradient`.
    ///
    /// The default implementation has no gradient and fills it with `NaN`,
    /// which makes every leapfrog step diverge.
    fn logp_and_gradient(
        &self,
        position: &[f64],
        gradient: &mut [f64],
    ) -> Result<f64, Self::LogpError> {
        gradient.fill(f64::NAN);
        self.logp(position)
    }

    /// Write a starting point for a chain into `position`.
    fn init_position<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        position: &mut [f64],
    ) -> anyhow::Result<()> {
        position
            .iter_mut()
            .for_each(|x| *x = rng.random_range(-2f64..2f64));
        Ok(())
    }

    /// The variables stored in the parameter vector.
    fn variables(&self) -> Vec<VariableInfo> {
        vec![VariableInfo::new("x", 0, self.dim(), Support::Continuous)]
    }
}

fn sanitize(logp: f64) -> f64 {
    if logp.is_nan() || logp == f64::INFINITY {
        f64::NEG_INFINITY
    } else {
        logp
    }
}

/// Evaluate the log density, mapping recoverable errors to `-inf`.
pub(crate) fn eval_logp<T: LogDensity + ?Sized>(
    target: &T,
    position: &[f64],
) -> Result<f64, BoxedLogpError> {
    match target.logp(position) {
        Ok(logp) => Ok(sanitize(logp)),
        Err(err) if err.is_recoverable() => Ok(f64::NEG_INFINITY),
        Err(err) => Err(Box::new(err)),
    }
}

/// Like [`eval_logp`], but also computes the gradient.
pub(crate) fn eval_logp_and_gradient<T: LogDensity + ?Sized>(
    target: &T,
    position: &[f64],
    gradient: &mut [f64],
) -> Result<f64, BoxedLogpError> {
    match target.logp_and_gradient(position, gradient) {
        Ok(logp) => Ok(sanitize(logp)),
        Err(err) if err.is_recoverable() => Ok(f64::NEG_INFINITY),
        Err(err) => Err(Box::new(err)),
    }
}
