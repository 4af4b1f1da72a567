//! Post-training quantization.

use super::{unexpected, Stage, StageContext};
use crate::config::QuantizationConfig;
use crate::core::{Artifact, Dialect, GraphArtifact, GraphNode, StageKind};
use crate::errors::StageFault;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::debug;

/// Operator inserted where a value enters the quantized domain.
pub const QUANTIZE_OP: &str = "quantized_decomposed.quantize_per_tensor.default";
/// Operator inserted where a value leaves the quantized domain.
pub const DEQUANTIZE_OP: &str = "quantized_decomposed.dequantize_per_tensor.default";

/// Annotates and converts a graph according to a quantization policy.
pub trait Quantizer: Send + Sync + Debug {
    /// Quantizes `graph`. The config is consumed as given.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph cannot be quantized with `config`.
    fn quantize(&self, graph: GraphArtifact, config: &QuantizationConfig) -> anyhow::Result<GraphArtifact>;
}

/// Per-tensor quantizer that wraps values in quantize/dequantize pairs.
///
/// Every graph input gets a pair; with `io_only` a single pair guards the
/// output, otherwise every operator output gets one.
#[derive(Debug, Clone, Copy, Default)]
pub struct SymmetricQuantizer;

impl Quantizer for SymmetricQuantizer {
    fn quantize(&self, graph: GraphArtifact, config: &QuantizationConfig) -> anyhow::Result<GraphArtifact> {
        if graph.dialect != Dialect::Aten {
            anyhow::bail!("quantization must run on an aten graph, got {:?}", graph.dialect);
        }
        if graph.is_quantized() {
            anyhow::bail!("graph '{}' is already quantized", graph.program);
        }

        let qdq = || {
            [
                GraphNode::new(QUANTIZE_OP, Dialect::Aten),
                GraphNode::new(DEQUANTIZE_OP, Dialect::Aten),
            ]
        };

        let mut nodes = Vec::with_capacity(graph.nodes.len() * 3 + graph.inputs * 2);
        for _ in 0..graph.inputs {
            nodes.extend(qdq());
        }
        for node in graph.nodes {
            nodes.push(node);
            if !config.io_only {
                nodes.extend(qdq());
            }
        }
        if config.io_only {
            nodes.extend(qdq());
        }

        Ok(GraphArtifact {
            nodes,
            quantization: Some(config.clone()),
            ..graph
        })
    }
}

/// The `quantize` stage.
#[derive(Debug, Clone)]
pub struct QuantizeStage {
    quantizer: Arc<dyn Quantizer>,
    config: QuantizationConfig,
}

impl QuantizeStage {
    /// Creates a quantize stage.
    #[must_use]
    pub fn new(quantizer: Arc<dyn Quantizer>, config: QuantizationConfig) -> Self {
        Self { quantizer, config }
    }

    /// Returns the quantization config.
    #[must_use]
    pub fn config(&self) -> &QuantizationConfig {
        &self.config
    }
}

#[async_trait]
impl Stage for QuantizeStage {
    fn kind(&self) -> StageKind {
        StageKind::Quantize
    }

    async fn apply(&self, ctx: &StageContext, artifact: Artifact) -> Result<Artifact, StageFault> {
        let Artifact::Graph(graph) = artifact else {
            return Err(unexpected(ctx.stage_name(), "a captured graph", &artifact));
        };
        let quantized = self.quantizer.quantize(graph, &self.config)?;
        debug!(stage = ctx.stage_name(), config = %self.config.name, "Quantized graph");
        Ok(Artifact::Graph(quantized))
    }
}
