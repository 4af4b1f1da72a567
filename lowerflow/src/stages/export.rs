//! Program capture.

use super::{unexpected, Stage, StageContext};
use crate::core::{Artifact, GraphArtifact, StageKind, Tensor};
use crate::errors::StageFault;
use crate::program::Program;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::debug;

/// Captures a program into an aten-dialect graph.
pub trait Exporter: Send + Sync + Debug {
    /// Captures `program` as it runs on `sample`.
    ///
    /// # Errors
    ///
    /// Returns an error if the program cannot be captured.
    fn export(&self, program: &dyn Program, sample: &[Tensor]) -> anyhow::Result<GraphArtifact>;
}

/// Exporter that records the program's declared operator list.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingExporter;

impl Exporter for TracingExporter {
    fn export(&self, program: &dyn Program, sample: &[Tensor]) -> anyhow::Result<GraphArtifact> {
        let operators = program.operators();
        if operators.is_empty() {
            anyhow::bail!("program '{}' declares no operators to capture", program.name());
        }
        // Tracing runs the program once; a failing forward fails the capture.
        program.forward(sample)?;
        Ok(GraphArtifact::new(program.name(), sample.len(), operators))
    }
}

/// The `export` stage.
#[derive(Debug, Clone)]
pub struct ExportStage {
    exporter: Arc<dyn Exporter>,
}

impl ExportStage {
    /// Creates an export stage around `exporter`.
    #[must_use]
    pub fn new(exporter: Arc<dyn Exporter>) -> Self {
        Self { exporter }
    }
}

#[async_trait]
impl Stage for ExportStage {
    fn kind(&self) -> StageKind {
        StageKind::Export
    }

    async fn apply(&self, ctx: &StageContext, artifact: Artifact) -> Result<Artifact, StageFault> {
        if !matches!(artifact, Artifact::Source) {
            return Err(unexpected(ctx.stage_name(), "the source program", &artifact));
        }
        let graph = self.exporter.export(ctx.program(), ctx.sample())?;
        debug!(stage = ctx.stage_name(), nodes = graph.nodes.len(), "Captured graph");
        Ok(Artifact::Graph(graph))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Dialect;
    use crate::testing::fixtures;

    #[tokio::test]
    async fn test_export_captures_operators() {
        let stage = ExportStage::new(Arc::new(TracingExporter));
        let ctx = fixtures::stage_context("export");

        let artifact = stage.apply(&ctx, Artifact::Source).await.unwrap();
        let graph = artifact.graph().unwrap();
        assert_eq!(graph.dialect, Dialect::Aten);
        assert_eq!(graph.targets(), vec!["torch.ops.aten.add.Tensor"]);
        assert_eq!(graph.inputs, 1);
    }

    #[tokio::test]
    async fn test_export_rejects_graph_input() {
        let stage = ExportStage::new(Arc::new(TracingExporter));
        let ctx = fixtures::stage_context("export");
        let graph = Artifact::Graph(GraphArtifact::new("add", 1, ["aten.add.Tensor"]));

        let fault = stage.apply(&ctx, graph).await.unwrap_err();
        assert!(fault.to_string().contains("expects the source program"));
    }

    #[test]
    fn test_exporter_needs_operators() {
        let program = crate::program::FnProgram::new("empty", Vec::<String>::new(), |inputs| Ok(inputs.to_vec()));
        assert!(TracingExporter.export(&program, &[]).is_err());
    }
}
