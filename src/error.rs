use thiserror::Error;

use crate::step_method::StepMethodKind;

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("At least one chain must be requested")]
    NoChains,
    #[error("Invalid sampler settings: {0}")]
    InvalidSettings(String),
    #[error("The variables cover {covered} coordinates, but the target has dimension {dim}")]
    DimensionMismatch { dim: usize, covered: usize },
    #[error("Invalid variable layout: {0}")]
    InvalidLayout(String),
    #[error("Unknown variable `{0}` in step method assignment")]
    UnknownVariable(String),
    #[error("Variable `{0}` is assigned to more than one step method")]
    DuplicateAssignment(String),
    #[error("Step method {method} can not sample variable `{variable}`")]
    IncompatibleStepMethod {
        method: StepMethodKind,
        variable: String,
    },
    #[error("Chain {chain}: no initial point with finite log density after {attempts} attempts")]
    Initialization { chain: u64, attempts: usize },
    #[error("Chain {chain}: could not generate an initial point")]
    InitPosition {
        chain: u64,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Chain {chain}: logp function returned unrecoverable error")]
    LogpFailure {
        chain: u64,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Chain {chain} panicked: {message}")]
    ChainPanicked { chain: u64, message: String },
    #[error("Chain {chain} failed: {message}")]
    ChainFailed { chain: u64, message: String },
    #[error("Could not start thread pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Could not read or write the trace")]
    Storage(#[from] arrow::error::ArrowError),
    #[error("Could not parse json")]
    Json(#[from] serde_json::Error),
    #[error("Invalid stored trace: {0}")]
    InvalidTrace(String),
}

pub type Result<T> = std::result::Result<T, SamplerError>;

impl SamplerError {
    /// The chain an error belongs to, if it is specific to one chain.
    pub fn chain(&self) -> Option<u64> {
        match self {
            SamplerError::Initialization { chain, .. }
            | SamplerError::InitPosition { chain, .. }
            | SamplerError::LogpFailure { chain, .. }
            | SamplerError::ChainPanicked { chain, .. }
            | SamplerError::ChainFailed { chain, .. } => Some(*chain),
            _ => None,
        }
    }
}
