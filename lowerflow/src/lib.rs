//! # Lowerflow
//!
//! Staged validation pipelines for tensor programs headed to accelerators.
//!
//! A pipeline takes one program and one input sample through a target
//! profile's stages:
//!
//! - **Capture and quantize**: export the program to an operator graph,
//!   optionally wrap it in quantize/dequantize pairs
//! - **Lower**: convert to the edge dialect and partition supported runs
//!   into backend delegates
//! - **Execute**: serialize the program and run it on the host or an
//!   external simulator, skipping gracefully when the simulator is missing
//! - **Compare**: check the outputs against the program's own reference
//!   output within a tolerance
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use lowerflow::prelude::*;
//!
//! let mut pipeline = Pipeline::for_profile(REFERENCE, program, sample)?
//!     .label("1d_range")
//!     .tolerance(Tolerance::new(1e-3, 1e-3))
//!     .build()?;
//!
//! pipeline.change_args("run_method", StageChange::Stage(Arc::new(my_runner)))?;
//! let result = pipeline.run().await?;
//! assert!(result.is_passed());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod availability;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod program;
pub mod stages;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::availability::{AvailabilityGuard, ProcessAvailability, StaticAvailability, HOST};
    pub use crate::config::{AvailabilityConfig, QuantDtype, QuantizationConfig, Tolerance};
    pub use crate::core::{
        Artifact, ComparisonReport, ExecutionOutput, GraphArtifact, RunStatus, Sample, StageKind, StageStatus,
        Tensor,
    };
    pub use crate::errors::{ContractErrorInfo, LowerflowError, StageFault, ToleranceExceededError};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::pipeline::{
        run_sample_set, Pipeline, PipelineBuilder, ProfileCatalog, RunFailure, RunResult, StageChange, StageRecord,
        StageRegistry, StageSpec, TargetProfile, Toolchain, ETHOS_U55, ETHOS_U85, QUANTIZED, REFERENCE,
    };
    pub use crate::program::{FnProgram, Program, SampleSet};
    pub use crate::stages::{params, Simulator, Stage, StageContext, StageParams};
    pub use std::sync::Arc;
}
