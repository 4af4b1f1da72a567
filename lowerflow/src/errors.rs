//! Error types for lowerflow pipelines.
//!
//! Structural errors (unknown or duplicate stage names, mutation after a run)
//! are returned as `Err` immediately. Stage faults and tolerance failures are
//! recorded in the [`RunResult`](crate::pipeline::RunResult) instead, so a
//! sweep over many samples keeps collecting results.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for lowerflow operations.
#[derive(Debug, Error)]
pub enum LowerflowError {
    /// A mutation referenced a stage name that is not in the sequence.
    #[error("{0}")]
    UnknownStage(#[from] UnknownStageError),

    /// An insertion collided with an existing stage name.
    #[error("{0}")]
    DuplicateStageName(#[from] DuplicateStageNameError),

    /// A mutation or second run was attempted after `run()`.
    #[error("{0}")]
    PipelineAlreadyRun(#[from] PipelineAlreadyRunError),

    /// A stage transform faulted.
    #[error("{0}")]
    StageExecution(#[from] StageExecutionError),

    /// Numeric comparison failed.
    #[error("{0}")]
    ToleranceExceeded(#[from] ToleranceExceededError),

    /// A required stage's dependency is missing.
    #[error("{0}")]
    UnavailableDependency(#[from] UnavailableDependencyError),

    /// No profile with this name is registered.
    #[error("Unknown target profile: {0}")]
    UnknownProfile(String),

    /// No factory is registered for this stage kind.
    #[error("Unknown stage kind: {0}")]
    UnknownStageKind(String),

    /// Stage parameters could not be interpreted.
    #[error("Invalid parameters for stage '{stage}': {message}")]
    InvalidParams {
        /// The stage (or stage kind) the parameters belong to.
        stage: String,
        /// What was wrong with them.
        message: String,
    },

    /// A tensor was constructed or combined with inconsistent shapes.
    #[error("Tensor error: {0}")]
    Tensor(String),

    /// A sample label was inserted twice into one sample set.
    #[error("Duplicate sample label: {0}")]
    DuplicateSampleLabel(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LowerflowError {
    /// Creates an invalid-parameters error.
    #[must_use]
    pub fn invalid_params(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParams {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Returns true for errors caused by misuse of the pipeline API rather
    /// than by a stage.
    #[must_use]
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::UnknownStage(_)
                | Self::DuplicateStageName(_)
                | Self::PipelineAlreadyRun(_)
                | Self::UnknownProfile(_)
                | Self::UnknownStageKind(_)
                | Self::InvalidParams { .. }
        )
    }
}

/// Metadata about a structural error for better diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "LOWERFLOW-UNKNOWN-STAGE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when a mutation names a stage that does not exist.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown stage '{name}' (available: {})", available.join(", "))]
pub struct UnknownStageError {
    /// The stage name that was not found.
    pub name: String,
    /// The stage names present at the time of the lookup.
    pub available: Vec<String>,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl UnknownStageError {
    /// Creates a new unknown stage error.
    #[must_use]
    pub fn new(name: impl Into<String>, available: Vec<String>) -> Self {
        let name = name.into();
        let info = ContractErrorInfo::new(
            "LOWERFLOW-UNKNOWN-STAGE",
            format!("No stage named '{name}' in the sequence"),
        )
        .with_fix_hint("Check the stage name against the profile template.");
        Self {
            name,
            available,
            error_info: info,
        }
    }
}

/// Error raised when an inserted stage's name collides with an existing one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Duplicate stage name '{name}'")]
pub struct DuplicateStageNameError {
    /// The colliding name.
    pub name: String,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl DuplicateStageNameError {
    /// Creates a new duplicate stage name error.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let info = ContractErrorInfo::new(
            "LOWERFLOW-DUPLICATE-STAGE",
            format!("A stage named '{name}' already exists"),
        )
        .with_fix_hint("Give the inserted stage a unique name, e.g. 'check_count.after_export'.");
        Self {
            name,
            error_info: info,
        }
    }
}

/// Error raised when a pipeline is mutated or re-run after `run()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Pipeline for profile '{profile}' has already run; {attempted} is not allowed")]
pub struct PipelineAlreadyRunError {
    /// The pipeline's profile name.
    pub profile: String,
    /// The operation that was attempted.
    pub attempted: String,
}

impl PipelineAlreadyRunError {
    /// Creates a new already-run error.
    #[must_use]
    pub fn new(profile: impl Into<String>, attempted: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            attempted: attempted.into(),
        }
    }
}

/// A stage's transform faulted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Stage '{stage}' failed: {cause}")]
pub struct StageExecutionError {
    /// The failing stage.
    pub stage: String,
    /// The original cause, including its error chain.
    pub cause: String,
}

impl StageExecutionError {
    /// Creates a new stage execution error.
    #[must_use]
    pub fn new(stage: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            cause: cause.into(),
        }
    }
}

/// Numeric comparison exceeded the allowed tolerance.
///
/// `output` and `index` locate the worst violating element: the output
/// position and the flat (row-major) element index inside it.
#[derive(Debug, Clone, PartialEq, Error)]
#[error(
    "Output {output} element {index}: candidate {candidate} vs reference {reference} \
     (max abs error {max_abs_error:e}, allowed atol {atol:e} + rtol {rtol:e} * |reference|)"
)]
pub struct ToleranceExceededError {
    /// Index of the output tensor.
    pub output: usize,
    /// Flat element index inside that output.
    pub index: usize,
    /// Candidate value at the location.
    pub candidate: f64,
    /// Reference value at the location.
    pub reference: f64,
    /// Largest absolute deviation observed across all outputs.
    pub max_abs_error: f64,
    /// Largest relative deviation observed across all outputs.
    pub max_rel_error: f64,
    /// Effective absolute tolerance used.
    pub atol: f64,
    /// Relative tolerance used.
    pub rtol: f64,
}

/// A required stage could not run because its dependency is missing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Stage '{stage}' requires unavailable dependency '{dependency}'")]
pub struct UnavailableDependencyError {
    /// The stage that required the dependency.
    pub stage: String,
    /// The dependency key.
    pub dependency: String,
}

impl UnavailableDependencyError {
    /// Creates a new unavailable dependency error.
    #[must_use]
    pub fn new(stage: impl Into<String>, dependency: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            dependency: dependency.into(),
        }
    }
}

/// Failure signalled by a stage's `apply`.
#[derive(Debug, Error)]
pub enum StageFault {
    /// The stage compared outputs and they diverged.
    #[error(transparent)]
    Tolerance(#[from] ToleranceExceededError),

    /// Any other internal fault.
    #[error(transparent)]
    Fault(#[from] anyhow::Error),
}

impl StageFault {
    /// Creates a fault from a message.
    pub fn msg(message: impl std::fmt::Display + std::fmt::Debug + Send + Sync + 'static) -> Self {
        Self::Fault(anyhow::Error::msg(message))
    }
}

impl From<LowerflowError> for StageFault {
    fn from(err: LowerflowError) -> Self {
        match err {
            LowerflowError::ToleranceExceeded(err) => Self::Tolerance(err),
            other => Self::Fault(anyhow::Error::new(other)),
        }
    }
}

/// Result alias for lowerflow operations.
pub type Result<T, E = LowerflowError> = std::result::Result<T, E>;
