//! Pipeline assembly and execution.
//!
//! This module provides:
//! - Stage slots and the ordered stage sequence
//! - The stage registry and toolchain of collaborators
//! - Target profiles (stage templates per lowering target)
//! - Pipeline instances, their mutation surface and run results
//! - Sample-set sweeps

mod profile;
mod registry;
mod result;
mod runner;
mod sequence;
mod spec;
mod sweep;

#[cfg(test)]
mod integration_tests;

pub use profile::{
    ProfileCatalog, ProfileDefaults, TargetProfile, TemplateEntry, ETHOS_U55, ETHOS_U85, QUANTIZED,
    REFERENCE,
};
pub use registry::{StageFactory, StageRegistry, Toolchain};
pub use result::{RunFailure, RunResult, StageRecord};
pub use runner::{Pipeline, PipelineBuilder};
pub use sequence::StageSequence;
pub use spec::{StageChange, StageSpec};
pub use sweep::{run_sample_set, SweepOutcome};
