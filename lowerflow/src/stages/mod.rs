//! Stage trait and the built-in stage kinds.
//!
//! A stage consumes the artifact produced by the previous stage and returns
//! the next one. Built-in stages wrap an external collaborator (exporter,
//! quantizer, backend, simulator) behind a narrow trait.

mod check;
mod compare;
mod context;
mod execute;
mod export;
mod lower;
mod quantize;
mod serialize;

pub use check::{CheckMode, CheckStage};
pub use compare::CompareStage;
pub use context::{ReferenceOutputs, StageContext};
pub use execute::{HostSimulator, ProcessSimulator, RunStage, Simulator};
pub use export::{ExportStage, Exporter, TracingExporter};
pub use lower::{Backend, OperatorSupportBackend, PartitionStage, ToEdgeStage};
pub use quantize::{QuantizeStage, Quantizer, SymmetricQuantizer, DEQUANTIZE_OP, QUANTIZE_OP};
pub use serialize::SerializeStage;

#[cfg(test)]
pub use execute::MockSimulator;

use crate::core::{Artifact, StageKind};
use crate::errors::{LowerflowError, StageFault};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::fmt::Debug;

/// Parameters of a stage: a flat JSON object.
pub type StageParams = serde_json::Map<String, serde_json::Value>;

/// Registry identifiers of the built-in stage kinds.
pub mod kinds {
    /// Captures the program into an aten graph.
    pub const EXPORT: &str = "export";
    /// Inserts quantize/dequantize nodes.
    pub const QUANTIZE: &str = "quantize";
    /// Converts an aten graph to the edge dialect.
    pub const TO_EDGE: &str = "to_edge";
    /// Delegates supported subgraphs to a backend.
    pub const PARTITION: &str = "partition";
    /// Serializes the graph into a program binary.
    pub const SERIALIZE: &str = "serialize";
    /// Executes the program binary on a simulator.
    pub const RUN_METHOD: &str = "run_method";
    /// Compares executed outputs with the reference.
    pub const COMPARE_OUTPUTS: &str = "compare_outputs";
    /// Requires every pattern to occur.
    pub const CHECK: &str = "check";
    /// Requires no pattern to occur.
    pub const CHECK_NOT: &str = "check_not";
    /// Requires exact occurrence counts.
    pub const CHECK_COUNT: &str = "check_count";
}

/// A pipeline stage.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the kind of work the stage performs.
    fn kind(&self) -> StageKind;

    /// Transforms `artifact` into the next artifact.
    ///
    /// # Errors
    ///
    /// Returns a [`StageFault`] if the transform fails; the run stops here.
    async fn apply(&self, ctx: &StageContext, artifact: Artifact) -> Result<Artifact, StageFault>;
}

/// A stage backed by a closure.
pub struct FnStage<F>
where
    F: Fn(&StageContext, Artifact) -> Result<Artifact, StageFault> + Send + Sync,
{
    kind: StageKind,
    func: F,
}

impl<F> FnStage<F>
where
    F: Fn(&StageContext, Artifact) -> Result<Artifact, StageFault> + Send + Sync,
{
    /// Creates a closure-backed stage of kind [`StageKind::Custom`].
    pub fn new(func: F) -> Self {
        Self {
            kind: StageKind::Custom,
            func,
        }
    }

    /// Sets the stage kind.
    #[must_use]
    pub fn with_kind(mut self, kind: StageKind) -> Self {
        self.kind = kind;
        self
    }
}

impl<F> Debug for FnStage<F>
where
    F: Fn(&StageContext, Artifact) -> Result<Artifact, StageFault> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage").field("kind", &self.kind).finish()
    }
}

#[async_trait]
impl<F> Stage for FnStage<F>
where
    F: Fn(&StageContext, Artifact) -> Result<Artifact, StageFault> + Send + Sync,
{
    fn kind(&self) -> StageKind {
        self.kind
    }

    async fn apply(&self, ctx: &StageContext, artifact: Artifact) -> Result<Artifact, StageFault> {
        (self.func)(ctx, artifact)
    }
}

/// Deserializes `params` into a typed parameter struct.
///
/// # Errors
///
/// Returns [`LowerflowError::InvalidParams`] naming `kind` if the parameters
/// do not match.
pub fn parse_params<T: DeserializeOwned>(kind: &str, params: &StageParams) -> Result<T, LowerflowError> {
    serde_json::from_value(serde_json::Value::Object(params.clone()))
        .map_err(|err| LowerflowError::invalid_params(kind, err.to_string()))
}

/// Shallow merge: keys in `patch` replace keys in `base`.
#[must_use]
pub fn merge_params(base: &StageParams, patch: &StageParams) -> StageParams {
    let mut merged = base.clone();
    for (key, value) in patch {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Builds a parameter object from a `json!` object literal.
///
/// Non-object values produce an empty map.
#[must_use]
pub fn params(value: serde_json::Value) -> StageParams {
    match value {
        serde_json::Value::Object(map) => map,
        _ => StageParams::new(),
    }
}

fn unexpected(stage: &str, expected: &str, artifact: &Artifact) -> StageFault {
    StageFault::msg(format!(
        "{stage} expects {expected}, got a {} artifact",
        artifact.variant_name()
    ))
}
