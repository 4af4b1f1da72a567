//! Run results.

use crate::core::{ComparisonReport, RunStatus, StageKind, StageStatus};
use crate::errors::{
    LowerflowError, StageExecutionError, ToleranceExceededError, UnavailableDependencyError,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of one stage within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage name.
    pub name: String,
    /// Stage kind.
    pub kind: StageKind,
    /// Stage status.
    pub status: StageStatus,
    /// When the stage started.
    pub started_at: DateTime<Utc>,
    /// When the stage ended.
    pub ended_at: DateTime<Utc>,
    /// Diagnostic payload: the produced artifact's summary, or why the stage
    /// was skipped.
    #[serde(default)]
    pub diagnostics: serde_json::Value,
    /// Error message if failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageRecord {
    /// Creates a passed record.
    #[must_use]
    pub fn passed(
        name: impl Into<String>,
        kind: StageKind,
        started_at: DateTime<Utc>,
        diagnostics: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            status: StageStatus::Passed,
            started_at,
            ended_at: Utc::now(),
            diagnostics,
            error: None,
        }
    }

    /// Creates a skipped record.
    #[must_use]
    pub fn skipped(name: impl Into<String>, kind: StageKind, dependency: &str, required: bool) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            kind,
            status: StageStatus::Skipped,
            started_at: now,
            ended_at: now,
            diagnostics: serde_json::json!({
                "unavailable_dependency": dependency,
                "required": required,
            }),
            error: None,
        }
    }

    /// Creates a failed record.
    #[must_use]
    pub fn failed(
        name: impl Into<String>,
        kind: StageKind,
        started_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            status: StageStatus::Failed,
            started_at,
            ended_at: Utc::now(),
            diagnostics: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }

    /// Returns the duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.ended_at - self.started_at).num_milliseconds()
    }
}

/// Why a run did not pass.
#[derive(Debug, Clone, PartialEq)]
pub enum RunFailure {
    /// A stage faulted.
    StageExecution(StageExecutionError),
    /// The comparison stage found diverging outputs.
    ToleranceExceeded {
        /// The comparing stage.
        stage: String,
        /// Where and by how much.
        error: ToleranceExceededError,
    },
    /// A required dependency was missing; the run was skipped.
    Unavailable(UnavailableDependencyError),
}

impl RunFailure {
    /// Returns the stage the run stopped at.
    #[must_use]
    pub fn stage(&self) -> &str {
        match self {
            Self::StageExecution(err) => &err.stage,
            Self::ToleranceExceeded { stage, .. } => stage,
            Self::Unavailable(err) => &err.stage,
        }
    }

    /// Converts the failure into the matching error.
    #[must_use]
    pub fn into_error(self) -> LowerflowError {
        match self {
            Self::StageExecution(err) => err.into(),
            Self::ToleranceExceeded { error, .. } => error.into(),
            Self::Unavailable(err) => err.into(),
        }
    }
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StageExecution(err) => write!(f, "{err}"),
            Self::ToleranceExceeded { stage, error } => write!(f, "Stage '{stage}': {error}"),
            Self::Unavailable(err) => write!(f, "{err}"),
        }
    }
}

/// The result of one pipeline run.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Unique run identifier.
    pub run_id: Uuid,
    /// Profile name.
    pub profile: String,
    /// Sample label, if any.
    pub label: Option<String>,
    /// Overall status.
    pub status: RunStatus,
    /// Stage records in execution order.
    pub stages: Vec<StageRecord>,
    /// Why the run did not pass.
    pub failure: Option<RunFailure>,
    /// Comparison report when outputs were compared.
    pub comparison: Option<ComparisonReport>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run ended.
    pub ended_at: DateTime<Utc>,
}

impl RunResult {
    /// Creates an in-progress (passing) result.
    #[must_use]
    pub fn new(run_id: Uuid, profile: impl Into<String>, label: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            profile: profile.into(),
            label,
            status: RunStatus::Passed,
            stages: Vec::new(),
            failure: None,
            comparison: None,
            started_at: now,
            ended_at: now,
        }
    }

    /// Appends a stage record.
    pub fn push(&mut self, record: StageRecord) {
        self.stages.push(record);
    }

    /// Finishes the run with `failure`. Unavailable dependencies skip the
    /// run, anything else fails it.
    pub fn finish_with(&mut self, failure: RunFailure) {
        self.status = match failure {
            RunFailure::Unavailable(_) => RunStatus::Skipped,
            RunFailure::StageExecution(_) | RunFailure::ToleranceExceeded { .. } => RunStatus::Failed,
        };
        self.failure = Some(failure);
        self.ended_at = Utc::now();
    }

    /// Finishes a passing run.
    pub fn finish(&mut self, comparison: Option<ComparisonReport>) {
        self.comparison = comparison;
        self.ended_at = Utc::now();
    }

    /// Returns true if the run passed.
    #[must_use]
    pub fn is_passed(&self) -> bool {
        self.status == RunStatus::Passed
    }

    /// Returns true if the run failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.status == RunStatus::Failed
    }

    /// Returns true if the run was skipped.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        self.status == RunStatus::Skipped
    }

    /// Returns the names of all recorded stages.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|record| record.name.as_str()).collect()
    }

    /// Returns the names of stages with `status`.
    #[must_use]
    pub fn stages_with(&self, status: StageStatus) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|record| record.status == status)
            .map(|record| record.name.as_str())
            .collect()
    }

    /// Returns the record for `name`.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|record| record.name == name)
    }

    /// Returns the stage the run stopped at, if it did not pass.
    #[must_use]
    pub fn failed_stage(&self) -> Option<&str> {
        self.failure.as_ref().map(RunFailure::stage)
    }

    /// Returns the tolerance error, if the comparison failed.
    #[must_use]
    pub fn tolerance_error(&self) -> Option<&ToleranceExceededError> {
        match &self.failure {
            Some(RunFailure::ToleranceExceeded { error, .. }) => Some(error),
            _ => None,
        }
    }

    /// Returns the result for a passed or skipped run and the failure as an
    /// error otherwise.
    ///
    /// # Errors
    ///
    /// Returns the stage or tolerance error of a failed run.
    pub fn into_outcome(self) -> Result<Self, LowerflowError> {
        match self.failure {
            Some(failure) if self.status == RunStatus::Failed => Err(failure.into_error()),
            _ => Ok(self),
        }
    }

    /// Returns the total duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.ended_at - self.started_at).num_milliseconds()
    }

    /// Summarises the run as JSON.
    #[must_use]
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "run_id": self.run_id.to_string(),
            "profile": self.profile,
            "label": self.label,
            "status": self.status,
            "duration_ms": self.duration_ms(),
            "stages": self.stages,
            "failure": self.failure.as_ref().map(|failure| serde_json::json!({
                "stage": failure.stage(),
                "message": failure.to_string(),
            })),
            "comparison": self.comparison,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tolerance_error() -> ToleranceExceededError {
        ToleranceExceededError {
            output: 0,
            index: 2,
            candidate: 7.0,
            reference: 6.0,
            max_abs_error: 1.0,
            max_rel_error: 1.0 / 6.0,
            atol: 1e-3,
            rtol: 1e-3,
        }
    }

    #[test]
    fn test_passing_run() {
        let mut result = RunResult::new(Uuid::new_v4(), "reference", Some("ones".to_string()));
        result.push(StageRecord::passed("export", StageKind::Export, Utc::now(), serde_json::json!({})));
        result.finish(None);

        assert!(result.is_passed());
        assert_eq!(result.stage_names(), vec!["export"]);
        assert!(result.failed_stage().is_none());
        assert!(result.into_outcome().is_ok());
    }

    #[test]
    fn test_tolerance_failure() {
        let mut result = RunResult::new(Uuid::new_v4(), "reference", None);
        result.push(StageRecord::failed(
            "compare_outputs",
            StageKind::Compare,
            Utc::now(),
            tolerance_error().to_string(),
        ));
        result.finish_with(RunFailure::ToleranceExceeded {
            stage: "compare_outputs".to_string(),
            error: tolerance_error(),
        });

        assert!(result.is_failed());
        assert_eq!(result.failed_stage(), Some("compare_outputs"));
        assert_eq!(result.tolerance_error().map(|err| err.index), Some(2));
        assert_eq!(result.stages_with(StageStatus::Failed), vec!["compare_outputs"]);

        let summary = result.summary();
        assert_eq!(summary["status"], "failed");
        assert_eq!(summary["failure"]["stage"], "compare_outputs");

        let err = result.into_outcome().unwrap_err();
        assert!(matches!(err, LowerflowError::ToleranceExceeded(_)));
    }

    #[test]
    fn test_unavailable_dependency_skips() {
        let mut result = RunResult::new(Uuid::new_v4(), "ethos-u55", None);
        result.push(StageRecord::skipped("run_method", StageKind::Execute, "corstone-300", true));
        result.finish_with(RunFailure::Unavailable(UnavailableDependencyError::new(
            "run_method",
            "corstone-300",
        )));

        assert!(result.is_skipped());
        assert_eq!(result.stage("run_method").unwrap().diagnostics["unavailable_dependency"], "corstone-300");
        assert!(result.into_outcome().is_ok());
    }
}
