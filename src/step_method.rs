use std::fmt::Display;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    chain::ChainState,
    hmc::HmcStep,
    metropolis::{BinaryMetropolisStep, MetropolisStep},
    model::{BoxedLogpError, LogDensity},
    nuts::NutsStep,
};

/// The available step methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepMethodKind {
    Nuts,
    Hmc,
    Metropolis,
    BinaryMetropolis,
}

impl StepMethodKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepMethodKind::Nuts => "nuts",
            StepMethodKind::Hmc => "hmc",
            StepMethodKind::Metropolis => "metropolis",
            StepMethodKind::BinaryMetropolis => "binary_metropolis",
        }
    }
}

impl Display for StepMethodKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Statistics of one step method for one draw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStats {
    pub method: StepMethodKind,
    /// Acceptance probability of the proposal. For NUTS this is the mean
    /// over all points of the trajectory.
    pub accept_prob: f64,
    pub accepted: bool,
    pub diverging: bool,
    /// Only set for NUTS.
    pub tree_depth: Option<u64>,
    pub maxdepth_reached: bool,
    /// Hamiltonian of the draw, only set for HMC and NUTS.
    pub energy: Option<f64>,
    pub energy_error: Option<f64>,
    /// Leapfrog step size, or the proposal scale of Metropolis.
    pub step_size: f64,
    /// Number of leapfrog steps.
    pub n_steps: u64,
}

impl StepStats {
    pub(crate) fn metropolis(
        method: StepMethodKind,
        accept_prob: f64,
        accepted: bool,
        scale: f64,
    ) -> Self {
        StepStats {
            method,
            accept_prob,
            accepted,
            diverging: false,
            tree_depth: None,
            maxdepth_reached: false,
            energy: None,
            energy_error: None,
            step_size: scale,
            n_steps: 0,
        }
    }
}

/// A step method that owns one block of coordinates.
///
/// Chosen once when a chain is built and never changed afterwards.
#[derive(Debug)]
pub enum StepMethod {
    Nuts(NutsStep),
    Hmc(HmcStep),
    Metropolis(MetropolisStep),
    BinaryMetropolis(BinaryMetropolisStep),
}

impl StepMethod {
    pub fn kind(&self) -> StepMethodKind {
        match self {
            StepMethod::Nuts(_) => StepMethodKind::Nuts,
            StepMethod::Hmc(_) => StepMethodKind::Hmc,
            StepMethod::Metropolis(_) => StepMethodKind::Metropolis,
            StepMethod::BinaryMetropolis(_) => StepMethodKind::BinaryMetropolis,
        }
    }

    /// Prepare adaptation at the initial point of the chain.
    pub(crate) fn init<T: LogDensity + ?Sized, R: Rng + ?Sized>(
        &mut self,
        target: &T,
        state: &ChainState,
        rng: &mut R,
    ) -> Result<(), BoxedLogpError> {
        match self {
            StepMethod::Nuts(nuts) => nuts.init(target, &state.position, rng),
            StepMethod::Hmc(hmc) => hmc.init(target, &state.position, rng),
            StepMethod::Metropolis(_) | StepMethod::BinaryMetropolis(_) => Ok(()),
        }
    }

    /// Update the block of this step method in `state`.
    pub(crate) fn step<T: LogDensity + ?Sized, R: Rng + ?Sized>(
        &mut self,
        target: &T,
        state: &mut ChainState,
        rng: &mut R,
        draw: u64,
        tuning: bool,
    ) -> Result<StepStats, BoxedLogpError> {
        match self {
            StepMethod::Nuts(nuts) => {
                let (logp, stats) = nuts.step(target, &mut state.position, rng, draw, tuning)?;
                state.logp = logp;
                Ok(stats)
            }
            StepMethod::Hmc(hmc) => {
                let (logp, stats) = hmc.step(target, &mut state.position, rng, draw, tuning)?;
                state.logp = logp;
                Ok(stats)
            }
            StepMethod::Metropolis(metropolis) => metropolis.step(target, state, rng, tuning),
            StepMethod::BinaryMetropolis(binary) => binary.step(target, state, rng),
        }
    }

    /// Freeze all adaptation.
    pub(crate) fn finish_tuning(&mut self) {
        match self {
            StepMethod::Nuts(nuts) => nuts.finish_tuning(),
            StepMethod::Hmc(hmc) => hmc.finish_tuning(),
            StepMethod::Metropolis(metropolis) => metropolis.finish_tuning(),
            StepMethod::BinaryMetropolis(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_match_serde() {
        for kind in [
            StepMethodKind::Nuts,
            StepMethodKind::Hmc,
            StepMethodKind::Metropolis,
            StepMethodKind::BinaryMetropolis,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind));
        }
    }
}
