//! Edge conversion and backend partitioning.

use super::quantize::{DEQUANTIZE_OP, QUANTIZE_OP};
use super::{unexpected, Stage, StageContext};
use crate::core::{Artifact, Dialect, GraphArtifact, GraphNode, StageKind};
use crate::errors::StageFault;
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::debug;

const TOSA_OPERATORS: &[&str] = &[
    "aten.add.Tensor",
    "aten.sub.Tensor",
    "aten.mul.Tensor",
    "aten.div.Tensor",
    "aten.relu.default",
    "aten.sigmoid.default",
    "aten.tanh.default",
    "aten.exp.default",
    "aten.convolution.default",
    "aten.addmm.default",
    "aten.mm.default",
    "aten.mean.dim",
    "aten.avg_pool2d.default",
    "aten.max_pool2d.default",
    "aten.view_copy.default",
    "aten.permute_copy.default",
    "aten.clone.default",
    QUANTIZE_OP,
    DEQUANTIZE_OP,
];

/// A lowering backend.
pub trait Backend: Send + Sync + Debug {
    /// Returns the backend name.
    fn name(&self) -> &str;

    /// Returns true if the backend can execute `node`.
    fn supports(&self, node: &GraphNode) -> bool;

    /// Lowers `graph` for `target`, replacing each maximal run of supported
    /// nodes with a single delegate call.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph is not in the edge dialect.
    fn lower(&self, graph: GraphArtifact, target: &str) -> anyhow::Result<GraphArtifact> {
        partition_supported(self, graph, target)
    }
}

fn partition_supported<B: Backend + ?Sized>(
    backend: &B,
    graph: GraphArtifact,
    target: &str,
) -> anyhow::Result<GraphArtifact> {
    if graph.dialect != Dialect::Edge {
        anyhow::bail!("{} partitions edge graphs, got {:?}", backend.name(), graph.dialect);
    }

    let mut nodes = Vec::with_capacity(graph.nodes.len());
    let mut in_run = false;
    let mut delegated = false;
    for node in graph.nodes {
        if node.is_delegate() || !backend.supports(&node) {
            in_run = false;
            nodes.push(node);
        } else if !in_run {
            in_run = true;
            delegated = true;
            nodes.push(GraphNode::delegate());
        }
    }

    Ok(GraphArtifact {
        nodes,
        delegate_target: if delegated { Some(target.to_string()) } else { graph.delegate_target },
        ..graph
    })
}

/// Backend described by the set of operators it supports.
#[derive(Debug, Clone)]
pub struct OperatorSupportBackend {
    name: String,
    supported: HashSet<String>,
    requires_quantization: bool,
}

impl OperatorSupportBackend {
    /// Creates a backend supporting `operators`.
    #[must_use]
    pub fn new(name: impl Into<String>, operators: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            supported: operators.into_iter().map(Into::into).collect(),
            requires_quantization: false,
        }
    }

    /// The TOSA backend, for floating point and quantized graphs.
    #[must_use]
    pub fn tosa() -> Self {
        Self::new("tosa", TOSA_OPERATORS.iter().copied())
    }

    /// An Ethos-U backend; it only accepts quantized graphs.
    #[must_use]
    pub fn ethos_u(name: impl Into<String>) -> Self {
        Self::new(name, TOSA_OPERATORS.iter().copied()).quantized_only()
    }

    /// Rejects graphs without a quantization config.
    #[must_use]
    pub fn quantized_only(mut self) -> Self {
        self.requires_quantization = true;
        self
    }
}

impl Backend for OperatorSupportBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, node: &GraphNode) -> bool {
        self.supported.contains(&node.op)
    }

    fn lower(&self, graph: GraphArtifact, target: &str) -> anyhow::Result<GraphArtifact> {
        if self.requires_quantization && !graph.is_quantized() {
            anyhow::bail!("{} requires a quantized graph", self.name);
        }
        partition_supported(self, graph, target)
    }
}

/// The `to_edge` stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToEdgeStage;

#[async_trait]
impl Stage for ToEdgeStage {
    fn kind(&self) -> StageKind {
        StageKind::Lower
    }

    async fn apply(&self, ctx: &StageContext, artifact: Artifact) -> Result<Artifact, StageFault> {
        match artifact {
            Artifact::Graph(graph) if graph.dialect == Dialect::Aten => {
                Ok(Artifact::Graph(graph.into_dialect(Dialect::Edge)))
            }
            other => Err(unexpected(ctx.stage_name(), "an aten graph", &other)),
        }
    }
}

/// The `partition` stage.
#[derive(Debug, Clone)]
pub struct PartitionStage {
    backend: Arc<dyn Backend>,
    target: String,
}

impl PartitionStage {
    /// Creates a partition stage lowering to `target` with `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, target: impl Into<String>) -> Self {
        Self {
            backend,
            target: target.into(),
        }
    }
}

#[async_trait]
impl Stage for PartitionStage {
    fn kind(&self) -> StageKind {
        StageKind::Lower
    }

    async fn apply(&self, ctx: &StageContext, artifact: Artifact) -> Result<Artifact, StageFault> {
        let Artifact::Graph(graph) = artifact else {
            return Err(unexpected(ctx.stage_name(), "an edge graph", &artifact));
        };
        let lowered = self.backend.lower(graph, &self.target)?;
        debug!(
            stage = ctx.stage_name(),
            backend = self.backend.name(),
            target = %self.target,
            delegates = lowered.count_matching(crate::core::DELEGATE_OP),
            "Partitioned graph"
        );
        Ok(Artifact::Graph(lowered))
    }
}
