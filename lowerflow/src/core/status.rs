//! Stage kind, stage status and run status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of work a stage performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Captures the program into a graph.
    Export,
    /// Rewrites a graph into its quantized form.
    Quantize,
    /// Converts or partitions a graph for a backend.
    Lower,
    /// Produces the serialized program binary.
    Serialize,
    /// Runs the serialized program on a simulator or host.
    Execute,
    /// Compares executed outputs against the reference.
    Compare,
    /// Asserts a structural property of the artifact and passes it through.
    Check,
    /// Anything else grafted in by a caller.
    #[default]
    Custom,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Export => write!(f, "export"),
            Self::Quantize => write!(f, "quantize"),
            Self::Lower => write!(f, "lower"),
            Self::Serialize => write!(f, "serialize"),
            Self::Execute => write!(f, "execute"),
            Self::Compare => write!(f, "compare"),
            Self::Check => write!(f, "check"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

/// The outcome of a single stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage completed successfully.
    Passed,
    /// Stage was skipped because its dependency is unavailable.
    Skipped,
    /// Stage faulted or its comparison failed.
    Failed,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// The overall outcome of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every executed stage passed.
    Passed,
    /// A stage failed; later stages did not run.
    Failed,
    /// A required stage's dependency was unavailable.
    Skipped,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl RunStatus {
    /// Returns true if the run passed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Passed)
    }
}
