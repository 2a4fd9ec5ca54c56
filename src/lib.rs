//! Sample from unnormalized probability densities with Markov chain Monte Carlo.
//!
//! A target implements [`LogDensity`]. Each variable of the target is
//! assigned to a step method (NUTS, HMC, random walk Metropolis or binary
//! Metropolis), either explicitly or by the [`CompetenceRegistry`]. Chains
//! run in parallel with independent random streams derived from one seed.
//!
//! ```
//! use mcmc_engine::{sample, LogDensity, SamplerSettings};
//! use std::convert::Infallible;
//!
//! struct Normal;
//!
//! impl LogDensity for Normal {
//!     type LogpError = Infallible;
//!
//!     fn dim(&self) -> usize {
//!         1
//!     }
//!
//!     fn logp(&self, x: &[f64]) -> Result<f64, Infallible> {
//!         Ok(-0.5 * x[0] * x[0])
//!     }
//!
//!     fn has_gradient(&self) -> bool {
//!         true
//!     }
//!
//!     fn logp_and_gradient(&self, x: &[f64], grad: &mut [f64]) -> Result<f64, Infallible> {
//!         grad[0] = -x[0];
//!         Ok(-0.5 * x[0] * x[0])
//!     }
//! }
//!
//! let settings = SamplerSettings {
//!     draws: 100,
//!     tune: 100,
//!     chains: 2,
//!     random_seed: Some(42),
//!     ..Default::default()
//! };
//! let ensemble = sample(&Normal, &settings)?;
//! let report = ensemble.diagnostics();
//! println!("{:?}", report.row("x"));
//! # Ok::<(), mcmc_engine::SamplerError>(())
//! ```

pub(crate) mod adapt_strategy;
mod chain;
mod competence;
pub mod diagnostics;
mod error;
pub(crate) mod hamiltonian;
pub(crate) mod hmc;
pub(crate) mod mass_matrix;
pub(crate) mod math;
mod metropolis;
mod model;
pub(crate) mod nuts;
mod sampler;
pub(crate) mod state;
mod step_method;
pub mod storage;
pub(crate) mod stepsize;

pub use adapt_strategy::MassMatrixSettings;
pub use chain::{
    CancelToken, ChainOutcome, ChainPhase, ChainRunner, ChainState, ChainStatus, Draw, Trace,
};
pub use competence::{
    BlockAssignment, Competence, CompetenceRegistry, StepAssignment, VariableDescriptor,
};
pub use diagnostics::{DiagnosticWarning, DiagnosticsReport, SummaryRow};
pub use error::{Result, SamplerError};
pub use metropolis::{acceptance_log_ratio, MetropolisSettings};
pub use model::{LogDensity, LogpError, Support, VariableInfo};
pub use sampler::{chain_rng, sample, sample_with_cancel, ChainFailure, Ensemble, SamplerSettings};
pub use step_method::{StepMethodKind, StepStats};
pub use stepsize::DualAverageOptions;
