use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    adapt_strategy::HamiltonianAdapt,
    competence::BlockAssignment,
    error::SamplerError,
    hamiltonian::EuclideanHamiltonian,
    hmc::HmcStep,
    metropolis::{BinaryMetropolisStep, MetropolisStep},
    model::{eval_logp, LogDensity, Support, VariableInfo},
    nuts::NutsStep,
    sampler::SamplerSettings,
    step_method::{StepMethod, StepMethodKind, StepStats},
};

/// The current point of a chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainState {
    pub position: Box<[f64]>,
    pub logp: f64,
}

impl ChainState {
    pub fn new(position: Box<[f64]>, logp: f64) -> Self {
        ChainState { position, logp }
    }
}

/// One element of a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draw {
    pub position: Box<[f64]>,
    pub logp: f64,
    /// Whether the draw was made while the step methods were adapting.
    pub tuning: bool,
    /// One entry per step method, in block order.
    pub stats: Vec<StepStats>,
}

impl Draw {
    pub fn diverging(&self) -> bool {
        self.stats.iter().any(|stat| stat.diverging)
    }

    pub fn maxdepth_reached(&self) -> bool {
        self.stats.iter().any(|stat| stat.maxdepth_reached)
    }

    /// The energy reported by the first Hamiltonian step method.
    pub fn energy(&self) -> Option<f64> {
        self.stats.iter().find_map(|stat| stat.energy)
    }

    pub fn tree_depth(&self) -> Option<u64> {
        self.stats.iter().find_map(|stat| stat.tree_depth)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Completed,
    Cancelled,
    Failed,
}

/// The draws of one chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    pub chain: u64,
    pub status: ChainStatus,
    pub draws: Vec<Draw>,
}

impl Trace {
    pub fn new(chain: u64) -> Self {
        Trace {
            chain,
            status: ChainStatus::Completed,
            draws: vec![],
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == ChainStatus::Completed
    }

    pub fn sampling_draws(&self) -> impl Iterator<Item = &Draw> {
        self.draws.iter().filter(|draw| !draw.tuning)
    }

    pub fn num_sampling_draws(&self) -> usize {
        self.sampling_draws().count()
    }

    /// Values of one coordinate over all sampling draws.
    pub fn values(&self, coordinate: usize) -> Vec<f64> {
        self.sampling_draws()
            .map(|draw| draw.position[coordinate])
            .collect()
    }

    pub fn energies(&self) -> Vec<f64> {
        self.sampling_draws().filter_map(Draw::energy).collect()
    }

    /// Indices of divergent transitions, counted within the sampling draws.
    pub fn divergent_draws(&self) -> Vec<usize> {
        self.sampling_draws()
            .enumerate()
            .filter(|(_, draw)| draw.diverging())
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn maxdepth_hits(&self) -> usize {
        self.sampling_draws()
            .filter(|draw| draw.maxdepth_reached())
            .count()
    }
}

/// The phases a chain passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainPhase {
    Initializing,
    Tuning,
    Sampling,
    Completed,
    Cancelled,
    Failed,
}

/// Cooperative cancellation shared between the caller and all chains.
///
/// Chains check the token between draws.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// The result of one chain. `error` is set if the chain failed.
#[derive(Debug)]
pub struct ChainOutcome {
    pub trace: Trace,
    pub error: Option<SamplerError>,
}

/// Drives one chain through initialization, tuning and sampling.
pub struct ChainRunner<'a, T: LogDensity + ?Sized> {
    chain: u64,
    target: &'a T,
    settings: &'a SamplerSettings,
    variables: &'a [VariableInfo],
    blocks: &'a [BlockAssignment],
    phase: ChainPhase,
}

impl<'a, T: LogDensity + ?Sized> ChainRunner<'a, T> {
    pub fn new(
        chain: u64,
        target: &'a T,
        settings: &'a SamplerSettings,
        variables: &'a [VariableInfo],
        blocks: &'a [BlockAssignment],
    ) -> Self {
        ChainRunner {
            chain,
            target,
            settings,
            variables,
            blocks,
            phase: ChainPhase::Initializing,
        }
    }

    pub fn phase(&self) -> ChainPhase {
        self.phase
    }

    fn set_phase(&mut self, phase: ChainPhase) {
        debug!(chain = self.chain, ?phase, "chain phase");
        self.phase = phase;
    }

    /// Find a starting point with finite log density.
    fn initialize<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<ChainState, SamplerError> {
        let chain = self.chain;
        let mut position: Box<[f64]> = vec![0f64; self.target.dim()].into();
        for attempt in 0..self.settings.init_attempts {
            self.target
                .init_position(rng, &mut position)
                .map_err(|err| SamplerError::InitPosition {
                    chain,
                    source: err.into(),
                })?;
            let logp = eval_logp(self.target, &position)
                .map_err(|source| SamplerError::LogpFailure { chain, source })?;
            if logp.is_finite() {
                return Ok(ChainState::new(position, logp));
            }
            debug!(chain, attempt, "initial point has non-finite log density");
        }
        Err(SamplerError::Initialization {
            chain,
            attempts: self.settings.init_attempts,
        })
    }

    fn is_discrete(&self, index: usize) -> bool {
        self.variables
            .iter()
            .find(|var| var.indices().contains(&index))
            .is_some_and(|var| matches!(var.support, Support::Discrete | Support::Binary))
    }

    fn build_step_method(&self, block: &BlockAssignment) -> StepMethod {
        let settings = self.settings;
        let dim = self.target.dim();
        let hamiltonian = || {
            EuclideanHamiltonian::new(
                &block.indices,
                dim,
                settings.max_energy_error,
                settings.dual_average.initial_step,
            )
        };
        let adapt = || {
            HamiltonianAdapt::new(
                settings.mass_matrix,
                settings.dual_average,
                settings.target_accept,
                settings.tune,
                block.indices.len(),
            )
        };
        match block.method {
            StepMethodKind::Nuts => {
                StepMethod::Nuts(NutsStep::new(hamiltonian(), adapt(), settings.max_tree_depth))
            }
            StepMethodKind::Hmc => StepMethod::Hmc(HmcStep::new(
                hamiltonian(),
                adapt(),
                settings.hmc_path_length,
                settings.hmc_max_steps,
            )),
            StepMethodKind::Metropolis => {
                let discrete: Vec<bool> =
                    block.indices.iter().map(|&i| self.is_discrete(i)).collect();
                StepMethod::Metropolis(MetropolisStep::new(
                    &block.indices,
                    &discrete,
                    settings.metropolis,
                ))
            }
            StepMethodKind::BinaryMetropolis => {
                StepMethod::BinaryMetropolis(BinaryMetropolisStep::new(&block.indices))
            }
        }
    }

    fn fail(&mut self, mut trace: Trace, error: SamplerError) -> ChainOutcome {
        warn!(chain = self.chain, phase = ?self.phase, %error, "chain failed");
        self.phase = ChainPhase::Failed;
        trace.status = ChainStatus::Failed;
        ChainOutcome {
            trace,
            error: Some(error),
        }
    }

    /// Run the chain to completion, until cancellation or until it fails.
    ///
    /// Failures keep the draws made so far.
    pub fn run<R: Rng + ?Sized>(&mut self, rng: &mut R, cancel: &CancelToken) -> ChainOutcome {
        let chain = self.chain;
        let mut trace = Trace::new(chain);
        self.set_phase(ChainPhase::Initializing);

        let mut state = match self.initialize(rng) {
            Ok(state) => state,
            Err(error) => return self.fail(trace, error),
        };

        let mut methods: Vec<StepMethod> = self
            .blocks
            .iter()
            .map(|block| self.build_step_method(block))
            .collect();
        debug!(
            chain,
            methods = ?methods.iter().map(StepMethod::kind).collect::<Vec<_>>(),
            "step methods"
        );
        for method in methods.iter_mut() {
            if let Err(source) = method.init(self.target, &state, rng) {
                return self.fail(trace, SamplerError::LogpFailure { chain, source });
            }
        }

        let tune = self.settings.tune;
        let total = tune + self.settings.draws;
        let keep_tuning = !self.settings.discard_tuned_samples;
        let kept = if keep_tuning { total } else { self.settings.draws };
        trace.draws.reserve(kept as usize);

        if tune > 0 {
            self.set_phase(ChainPhase::Tuning);
        } else {
            self.set_phase(ChainPhase::Sampling);
        }

        for draw in 0..total {
            if cancel.is_cancelled() {
                warn!(chain, draw, "chain cancelled");
                self.set_phase(ChainPhase::Cancelled);
                trace.status = ChainStatus::Cancelled;
                return ChainOutcome { trace, error: None };
            }
            if draw == tune && tune > 0 {
                methods.iter_mut().for_each(StepMethod::finish_tuning);
                self.set_phase(ChainPhase::Sampling);
            }

            let tuning = draw < tune;
            let mut stats = Vec::with_capacity(methods.len());
            for method in methods.iter_mut() {
                match method.step(self.target, &mut state, rng, draw, tuning) {
                    Ok(stat) => stats.push(stat),
                    Err(source) => {
                        return self.fail(trace, SamplerError::LogpFailure { chain, source });
                    }
                }
            }

            if !tuning || keep_tuning {
                trace.draws.push(Draw {
                    position: state.position.clone(),
                    logp: state.logp,
                    tuning,
                    stats,
                });
            }
        }

        self.set_phase(ChainPhase::Completed);
        debug!(
            chain,
            draws = trace.draws.len(),
            divergences = trace.divergent_draws().len(),
            "chain finished"
        );
        ChainOutcome { trace, error: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        competence::CompetenceRegistry,
        model::test_logps::{MixedLogp, NormalLogp},
    };
    use pretty_assertions::assert_eq;
    use crate::model::LogpError;
    use rand::{rngs::SmallRng, SeedableRng};
    use std::{convert::Infallible, sync::atomic::AtomicUsize};
    use thiserror::Error;

    fn settings(tune: u64, draws: u64) -> SamplerSettings {
        SamplerSettings {
            tune,
            draws,
            ..Default::default()
        }
    }

    fn run<T: LogDensity>(
        target: &T,
        settings: &SamplerSettings,
        cancel: &CancelToken,
    ) -> (ChainOutcome, ChainPhase) {
        let variables = target.variables();
        let blocks = CompetenceRegistry::default()
            .assign(target.dim(), &variables, target.has_gradient(), &[])
            .unwrap();
        let mut runner = ChainRunner::new(3, target, settings, &variables, &blocks);
        let mut rng = SmallRng::seed_from_u64(0);
        let outcome = runner.run(&mut rng, cancel);
        (outcome, runner.phase())
    }

    #[test]
    fn tuned_draws_are_discarded() {
        let target = NormalLogp::new(2, 0.);
        let (outcome, phase) = run(&target, &settings(50, 30), &CancelToken::new());
        assert!(outcome.error.is_none());
        assert_eq!(phase, ChainPhase::Completed);
        assert_eq!(outcome.trace.chain, 3);
        assert_eq!(outcome.trace.status, ChainStatus::Completed);
        assert_eq!(outcome.trace.draws.len(), 30);
        assert!(outcome.trace.draws.iter().all(|draw| !draw.tuning));
        for draw in outcome.trace.draws.iter() {
            assert_eq!(draw.logp, target.logp(&draw.position).unwrap());
            assert_eq!(draw.stats.len(), 1);
            assert_eq!(draw.stats[0].method, StepMethodKind::Nuts);
        }
    }

    #[test]
    fn tuned_draws_can_be_kept() {
        let target = NormalLogp::new(2, 0.);
        let settings = SamplerSettings {
            discard_tuned_samples: false,
            ..settings(20, 10)
        };
        let (outcome, _) = run(&target, &settings, &CancelToken::new());
        assert_eq!(outcome.trace.draws.len(), 30);
        assert_eq!(outcome.trace.draws.iter().filter(|d| d.tuning).count(), 20);
        assert_eq!(outcome.trace.num_sampling_draws(), 10);
        assert_eq!(outcome.trace.values(0).len(), 10);
    }

    #[test]
    fn cancelled_chain_returns_partial_trace() {
        let target = NormalLogp::new(2, 0.);
        let cancel = CancelToken::new();
        cancel.cancel();
        let (outcome, phase) = run(&target, &settings(10, 10), &cancel);
        assert!(outcome.error.is_none());
        assert_eq!(phase, ChainPhase::Cancelled);
        assert_eq!(outcome.trace.status, ChainStatus::Cancelled);
        assert!(!outcome.trace.is_complete());
        assert!(outcome.trace.draws.is_empty());
    }

    struct NowhereFinite;

    impl LogDensity for NowhereFinite {
        type LogpError = Infallible;

        fn dim(&self) -> usize {
            1
        }

        fn logp(&self, _position: &[f64]) -> Result<f64, Infallible> {
            Ok(f64::NEG_INFINITY)
        }
    }

    #[test]
    fn initialization_failure_names_chain() {
        let settings = SamplerSettings {
            init_attempts: 5,
            ..settings(10, 10)
        };
        let (outcome, phase) = run(&NowhereFinite, &settings, &CancelToken::new());
        assert_eq!(phase, ChainPhase::Failed);
        assert_eq!(outcome.trace.status, ChainStatus::Failed);
        match outcome.error {
            Some(SamplerError::Initialization { chain, attempts }) => {
                assert_eq!(chain, 3);
                assert_eq!(attempts, 5);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[derive(Debug, Error)]
    #[error("evaluation {0} failed")]
    struct Broken(usize);

    impl LogpError for Broken {
        fn is_recoverable(&self) -> bool {
            false
        }
    }

    /// A normal density whose evaluation number `fail_at` fails for good.
    struct BreaksAt {
        calls: AtomicUsize,
        fail_at: usize,
    }

    impl LogDensity for BreaksAt {
        type LogpError = Broken;

        fn dim(&self) -> usize {
            1
        }

        fn logp(&self, position: &[f64]) -> Result<f64, Broken> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == self.fail_at {
                return Err(Broken(call));
            }
            Ok(-0.5 * position[0] * position[0])
        }
    }

    #[test]
    fn failure_during_sampling_keeps_draws() {
        // One evaluation for the initial point and one per Metropolis draw.
        let target = BreaksAt {
            calls: AtomicUsize::new(0),
            fail_at: 30,
        };
        let (outcome, phase) = run(&target, &settings(10, 50), &CancelToken::new());
        assert_eq!(phase, ChainPhase::Failed);
        assert_eq!(outcome.trace.status, ChainStatus::Failed);
        assert_eq!(outcome.trace.draws.len(), 19);
        assert!(outcome
            .trace
            .draws
            .iter()
            .all(|draw| draw.stats[0].method == StepMethodKind::Metropolis));
        match outcome.error {
            Some(SamplerError::LogpFailure { chain, source }) => {
                assert_eq!(chain, 3);
                assert_eq!(source.to_string(), "evaluation 30 failed");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn mixed_target_uses_two_blocks() {
        let target = MixedLogp { p_one: 0.5 };
        let (outcome, _) = run(&target, &settings(100, 100), &CancelToken::new());
        assert!(outcome.error.is_none());
        for draw in outcome.trace.draws.iter() {
            let methods: Vec<_> = draw.stats.iter().map(|s| s.method).collect();
            assert_eq!(methods, vec![StepMethodKind::Nuts, StepMethodKind::BinaryMetropolis]);
            assert!(draw.position[1] == 0. || draw.position[1] == 1.);
            assert_eq!(draw.logp, target.logp(&draw.position).unwrap());
        }
    }
}
