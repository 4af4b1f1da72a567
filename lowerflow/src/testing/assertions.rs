//! Assertions on run results.

use crate::core::{RunStatus, StageStatus};
use crate::pipeline::RunResult;

/// Asserts that the run passed.
pub fn assert_run_passed(result: &RunResult) {
    assert!(
        result.is_passed(),
        "Expected run to pass, got {} ({})",
        result.status,
        result
            .failure
            .as_ref()
            .map_or_else(String::new, ToString::to_string)
    );
}

/// Asserts that the run failed at `stage`.
pub fn assert_run_failed_at(result: &RunResult, stage: &str) {
    assert_eq!(
        result.status,
        RunStatus::Failed,
        "Expected run to fail at '{stage}', got status {}",
        result.status
    );
    assert_eq!(
        result.failed_stage(),
        Some(stage),
        "Expected failure at '{stage}', got {:?}",
        result.failed_stage()
    );
}

/// Asserts that the run was skipped.
pub fn assert_run_skipped(result: &RunResult) {
    assert_eq!(
        result.status,
        RunStatus::Skipped,
        "Expected run to be skipped, got {}",
        result.status
    );
}

/// Asserts the status of one stage record.
pub fn assert_stage_status(result: &RunResult, stage: &str, expected: StageStatus) {
    let record = result
        .stage(stage)
        .unwrap_or_else(|| panic!("No record for stage '{stage}'; recorded: {:?}", result.stage_names()));
    assert_eq!(
        record.status, expected,
        "Expected stage '{stage}' to be {expected}, got {}",
        record.status
    );
}

/// Asserts the recorded stage names, in order.
pub fn assert_stage_order(result: &RunResult, expected: &[&str]) {
    assert_eq!(result.stage_names(), expected, "Unexpected stage order");
}
