//! Core domain model types for lowerflow.
//!
//! This module contains the fundamental types threaded through a pipeline:
//! - Stage kind, stage status and run status enums
//! - Tensors used as program inputs and outputs
//! - The artifact handed from one stage to the next
//! - Element-wise output comparison

mod artifact;
mod comparison;
mod status;
mod tensor;

pub use artifact::{
    Artifact, Dialect, ExecutionOutput, GraphArtifact, GraphNode, SerializedArtifact,
    DELEGATE_OP,
};
pub use comparison::{compare_outputs, ComparisonReport};
pub use status::{RunStatus, StageKind, StageStatus};
pub use tensor::{Sample, Tensor};
