use std::panic::{catch_unwind, AssertUnwindSafe};

use rand::{rngs::SmallRng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::{prelude::*, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    adapt_strategy::MassMatrixSettings,
    chain::{CancelToken, ChainOutcome, ChainRunner, ChainStatus, Trace},
    competence::{BlockAssignment, CompetenceRegistry, StepAssignment},
    diagnostics::{diagnose, DiagnosticsReport},
    error::{Result, SamplerError},
    metropolis::MetropolisSettings,
    model::{LogDensity, VariableInfo},
    stepsize::DualAverageOptions,
};

/// All settings of a sampling run.
///
/// Missing fields take their default values when deserialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerSettings {
    /// Number of draws after tuning, per chain.
    pub draws: u64,
    /// Number of tuning draws, per chain.
    pub tune: u64,
    pub chains: u64,
    /// Number of chains that run at the same time.
    pub cores: usize,
    /// Target acceptance rate of HMC and NUTS.
    pub target_accept: f64,
    /// Base seed of all chains. A random seed is drawn if this is not set.
    pub random_seed: Option<u64>,
    /// Step methods for specific variables. Remaining variables are
    /// assigned automatically.
    pub step_method_override: Vec<StepAssignment>,
    pub max_tree_depth: u64,
    pub discard_tuned_samples: bool,
    /// Energy error above which a trajectory counts as divergent.
    pub max_energy_error: f64,
    /// Number of attempts to find an initial point with finite density.
    pub init_attempts: usize,
    /// Integration time of HMC.
    pub hmc_path_length: f64,
    pub hmc_max_steps: u64,
    pub metropolis: MetropolisSettings,
    pub dual_average: DualAverageOptions,
    pub mass_matrix: MassMatrixSettings,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            draws: 1000,
            tune: 1000,
            chains: 4,
            cores: std::thread::available_parallelism()
                .map(|cores| cores.get())
                .unwrap_or(1),
            target_accept: 0.8,
            random_seed: None,
            step_method_override: vec![],
            max_tree_depth: 10,
            discard_tuned_samples: true,
            max_energy_error: 1000f64,
            init_attempts: 100,
            hmc_path_length: 2f64,
            hmc_max_steps: 1024,
            metropolis: MetropolisSettings::default(),
            dual_average: DualAverageOptions::default(),
            mass_matrix: MassMatrixSettings::default(),
        }
    }
}

impl SamplerSettings {
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: SamplerSettings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check the settings before any chain starts.
    pub fn validate(&self) -> Result<()> {
        fn invalid(message: &str) -> Result<()> {
            Err(SamplerError::InvalidSettings(message.to_string()))
        }
        fn positive(value: f64) -> bool {
            value.is_finite() && value > 0.
        }

        if self.chains == 0 {
            return Err(SamplerError::NoChains);
        }
        if self.cores == 0 {
            return invalid("cores must be at least 1");
        }
        if !(self.target_accept > 0. && self.target_accept < 1.) {
            return invalid("target_accept must be in (0, 1)");
        }
        if self.max_tree_depth == 0 {
            return invalid("max_tree_depth must be at least 1");
        }
        if self.max_tree_depth > 63 {
            return invalid("max_tree_depth must be at most 63");
        }
        if self.init_attempts == 0 {
            return invalid("init_attempts must be at least 1");
        }
        if !positive(self.max_energy_error) {
            return invalid("max_energy_error must be positive");
        }
        if !positive(self.hmc_path_length) {
            return invalid("hmc_path_length must be positive");
        }
        if !positive(self.metropolis.initial_scale) {
            return invalid("metropolis.initial_scale must be positive");
        }
        if !positive(self.dual_average.initial_step) {
            return invalid("dual_average.initial_step must be positive");
        }
        let window = |value: f64| (0. ..=1.).contains(&value);
        if !window(self.mass_matrix.early_window) || !window(self.mass_matrix.step_size_window) {
            return invalid("mass matrix windows must be fractions of the tuning phase");
        }
        Ok(())
    }
}

/// A chain that did not finish.
#[derive(Debug)]
pub struct ChainFailure {
    pub chain: u64,
    pub error: SamplerError,
}

/// The traces of all chains of one run.
#[derive(Debug)]
pub struct Ensemble {
    pub variables: Vec<VariableInfo>,
    pub blocks: Vec<BlockAssignment>,
    /// The base seed the chain streams were derived from.
    pub seed: u64,
    /// One trace per chain, ordered by chain index. Failed and cancelled
    /// chains keep their partial traces.
    pub traces: Vec<Trace>,
    pub failures: Vec<ChainFailure>,
}

impl Ensemble {
    pub fn coordinate_names(&self) -> Vec<String> {
        self.variables
            .iter()
            .flat_map(|var| var.coordinate_names())
            .collect()
    }

    pub fn completed_traces(&self) -> impl Iterator<Item = &Trace> {
        self.traces.iter().filter(|trace| trace.is_complete())
    }

    pub fn num_completed(&self) -> usize {
        self.completed_traces().count()
    }

    pub fn diagnostics(&self) -> DiagnosticsReport {
        diagnose(self)
    }
}

/// The random number generator of one chain.
///
/// All chains of a run share the base seed but use different streams.
pub fn chain_rng(seed: u64, chain: u64) -> SmallRng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(chain);
    SmallRng::from_rng(&mut rng)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn run_chain<T: LogDensity + ?Sized>(
    chain: u64,
    target: &T,
    settings: &SamplerSettings,
    variables: &[VariableInfo],
    blocks: &[BlockAssignment],
    seed: u64,
    cancel: &CancelToken,
) -> ChainOutcome {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let mut rng = chain_rng(seed, chain);
        ChainRunner::new(chain, target, settings, variables, blocks).run(&mut rng, cancel)
    }));
    match result {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(chain, %message, "chain panicked");
            let mut trace = Trace::new(chain);
            trace.status = ChainStatus::Failed;
            ChainOutcome {
                trace,
                error: Some(SamplerError::ChainPanicked { chain, message }),
            }
        }
    }
}

/// Draw from `target` with all chains of `settings`.
pub fn sample<T: LogDensity + ?Sized>(target: &T, settings: &SamplerSettings) -> Result<Ensemble> {
    sample_with_cancel(target, settings, &CancelToken::new())
}

/// Like [`sample`], but chains stop early once `cancel` is triggered.
///
/// Configuration errors are returned before any chain starts. Errors of
/// individual chains end up in [`Ensemble::failures`].
pub fn sample_with_cancel<T: LogDensity + ?Sized>(
    target: &T,
    settings: &SamplerSettings,
    cancel: &CancelToken,
) -> Result<Ensemble> {
    settings.validate()?;
    let variables = target.variables();
    let blocks = CompetenceRegistry::default().assign(
        target.dim(),
        &variables,
        target.has_gradient(),
        &settings.step_method_override,
    )?;
    let seed = settings.random_seed.unwrap_or_else(rand::random);

    info!(
        chains = settings.chains,
        cores = settings.cores,
        seed,
        dim = target.dim(),
        blocks = blocks.len(),
        "starting sampler"
    );

    let run = |chain: u64| run_chain(chain, target, settings, &variables, &blocks, seed, cancel);
    let outcomes: Vec<ChainOutcome> = if settings.cores == 1 {
        (0..settings.chains).map(run).collect()
    } else {
        let pool = ThreadPoolBuilder::new()
            .num_threads(settings.cores)
            .thread_name(|i| format!("mcmc-chain-{}", i))
            .build()?;
        pool.install(|| (0..settings.chains).into_par_iter().map(run).collect())
    };

    let mut traces = Vec::with_capacity(outcomes.len());
    let mut failures = vec![];
    for outcome in outcomes {
        if let Some(error) = outcome.error {
            failures.push(ChainFailure {
                chain: error.chain().unwrap_or(outcome.trace.chain),
                error,
            });
        }
        traces.push(outcome.trace);
    }
    if !failures.is_empty() {
        warn!(failed = failures.len(), "some chains failed");
    }

    Ok(Ensemble {
        variables,
        blocks,
        seed,
        traces,
        failures,
    })
}
