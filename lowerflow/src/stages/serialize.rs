//! Program serialization.

use super::{unexpected, Stage, StageContext};
use crate::core::{Artifact, Dialect, SerializedArtifact, StageKind};
use crate::errors::StageFault;
use async_trait::async_trait;

const PORTABLE_TARGET: &str = "portable";

/// The `to_executorch` stage: serializes an edge graph into a program binary.
///
/// The binary is tagged with the configured target, else the graph's
/// delegate target, else `portable`.
#[derive(Debug, Clone, Default)]
pub struct SerializeStage {
    target: Option<String>,
}

impl SerializeStage {
    /// Creates a serialize stage.
    #[must_use]
    pub fn new(target: Option<String>) -> Self {
        Self { target }
    }
}

#[async_trait]
impl Stage for SerializeStage {
    fn kind(&self) -> StageKind {
        StageKind::Serialize
    }

    async fn apply(&self, ctx: &StageContext, artifact: Artifact) -> Result<Artifact, StageFault> {
        let graph = match artifact {
            Artifact::Graph(graph) if graph.dialect == Dialect::Edge => graph,
            other => return Err(unexpected(ctx.stage_name(), "an edge graph", &other)),
        };
        let target = self
            .target
            .clone()
            .or_else(|| graph.delegate_target.clone())
            .unwrap_or_else(|| PORTABLE_TARGET.to_string());
        Ok(Artifact::Serialized(SerializedArtifact::from_graph(graph, target)?))
    }
}
