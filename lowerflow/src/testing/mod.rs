//! Testing utilities for lowerflow pipelines.
//!
//! This module provides:
//! - Fixture programs, samples and stage contexts
//! - Mock stages (recording, fixed-output, failing)
//! - Assertions on run results

mod assertions;
pub mod fixtures;
pub mod mocks;

pub use assertions::{
    assert_run_failed_at, assert_run_passed, assert_run_skipped, assert_stage_order,
    assert_stage_status,
};
pub use mocks::{FailingStage, FixedOutputStage, RecordingStage};
