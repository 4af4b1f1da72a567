//! The artifact threaded from one stage to the next.

use super::comparison::ComparisonReport;
use super::Tensor;
use crate::config::QuantizationConfig;
use crate::errors::LowerflowError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Operator identifier of a node that hands a subgraph to a backend.
pub const DELEGATE_OP: &str = "executorch_call_delegate";

const ATEN_PREFIX: &str = "torch.ops.";
const EDGE_PREFIX: &str = "executorch_exir_dialects_edge__ops_";

/// The operator dialect a graph is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// Captured framework operators (`torch.ops.aten.add.Tensor`).
    Aten,
    /// Edge dialect operators after decomposition.
    Edge,
}

/// A single operator node.
///
/// `op` is the canonical operator identifier and never changes; `target`
/// is its dialect-qualified spelling and is what check stages match on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Canonical operator identifier, e.g. `aten.add.Tensor`.
    pub op: String,
    /// Dialect-qualified target name.
    pub target: String,
}

impl GraphNode {
    /// Creates a node spelled in the given dialect.
    #[must_use]
    pub fn new(op: impl Into<String>, dialect: Dialect) -> Self {
        let op = op.into();
        let target = qualify(&op, dialect);
        Self { op, target }
    }

    /// Creates a delegate call node.
    #[must_use]
    pub fn delegate() -> Self {
        Self {
            op: DELEGATE_OP.to_string(),
            target: DELEGATE_OP.to_string(),
        }
    }

    /// Returns true if this node is a delegate call.
    #[must_use]
    pub fn is_delegate(&self) -> bool {
        self.op == DELEGATE_OP
    }
}

fn qualify(op: &str, dialect: Dialect) -> String {
    if op == DELEGATE_OP {
        return op.to_string();
    }
    match dialect {
        Dialect::Aten => format!("{ATEN_PREFIX}{op}"),
        Dialect::Edge => format!("{EDGE_PREFIX}{}", op.replace('.', "_")),
    }
}

/// A captured (and possibly quantized or partitioned) program graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphArtifact {
    /// Name of the program the graph was captured from.
    pub program: String,
    /// The dialect node targets are spelled in.
    pub dialect: Dialect,
    /// Number of graph inputs.
    pub inputs: usize,
    /// Operator nodes in execution order.
    pub nodes: Vec<GraphNode>,
    /// Quantization applied to the graph, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<QuantizationConfig>,
    /// Backend target the delegated subgraphs were lowered for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegate_target: Option<String>,
}

impl GraphArtifact {
    /// Creates an unquantized graph in the aten dialect.
    #[must_use]
    pub fn new(program: impl Into<String>, inputs: usize, ops: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            dialect: Dialect::Aten,
            inputs,
            nodes: ops
                .into_iter()
                .map(|op| GraphNode::new(op, Dialect::Aten))
                .collect(),
            quantization: None,
            delegate_target: None,
        }
    }

    /// Re-spells every node in `dialect`.
    #[must_use]
    pub fn into_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        for node in &mut self.nodes {
            node.target = qualify(&node.op, dialect);
        }
        self
    }

    /// Counts nodes whose target contains `pattern`.
    #[must_use]
    pub fn count_matching(&self, pattern: &str) -> usize {
        self.nodes
            .iter()
            .filter(|node| node.target.contains(pattern))
            .count()
    }

    /// Returns the node targets in order.
    #[must_use]
    pub fn targets(&self) -> Vec<&str> {
        self.nodes.iter().map(|node| node.target.as_str()).collect()
    }

    /// Returns true if the graph carries a quantization config.
    #[must_use]
    pub fn is_quantized(&self) -> bool {
        self.quantization.is_some()
    }
}

/// A serialized program binary ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct SerializedArtifact {
    /// Backend target the binary was produced for.
    pub target: String,
    /// The program bytes.
    pub bytes: Vec<u8>,
    /// Hex-encoded sha256 of `bytes`.
    pub digest: String,
    /// The graph the binary was produced from.
    pub graph: GraphArtifact,
}

impl SerializedArtifact {
    /// Serializes `graph` for `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph cannot be encoded.
    pub fn from_graph(graph: GraphArtifact, target: impl Into<String>) -> Result<Self, LowerflowError> {
        let bytes = serde_json::to_vec(&graph)?;
        let digest = hex::encode(Sha256::digest(&bytes));
        Ok(Self {
            target: target.into(),
            bytes,
            digest,
            graph,
        })
    }
}

/// Outputs produced by executing a serialized program.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutput {
    /// Output tensors.
    pub outputs: Vec<Tensor>,
    /// Output quantization scale when the program ran quantized.
    pub quantization_scale: Option<f64>,
    /// Simulator or backend that produced the outputs.
    pub backend: String,
    /// Set once the outputs were compared against the reference.
    pub comparison: Option<ComparisonReport>,
}

impl ExecutionOutput {
    /// Creates an execution output.
    #[must_use]
    pub fn new(backend: impl Into<String>, outputs: Vec<Tensor>) -> Self {
        Self {
            outputs,
            quantization_scale: None,
            backend: backend.into(),
            comparison: None,
        }
    }

    /// Sets the output quantization scale.
    #[must_use]
    pub fn with_quantization_scale(mut self, scale: f64) -> Self {
        self.quantization_scale = Some(scale);
        self
    }
}

/// The value handed from stage to stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    /// Nothing captured yet; the program itself is available from the stage context.
    Source,
    /// A program graph.
    Graph(GraphArtifact),
    /// A serialized program binary.
    Serialized(SerializedArtifact),
    /// Execution outputs.
    Executed(ExecutionOutput),
}

impl Artifact {
    /// Returns a short name for the variant.
    #[must_use]
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Graph(_) => "graph",
            Self::Serialized(_) => "serialized",
            Self::Executed(_) => "executed",
        }
    }

    /// Returns the graph carried by this artifact, if any.
    #[must_use]
    pub fn graph(&self) -> Option<&GraphArtifact> {
        match self {
            Self::Graph(graph) => Some(graph),
            Self::Serialized(serialized) => Some(&serialized.graph),
            Self::Source | Self::Executed(_) => None,
        }
    }

    /// Returns the execution output, if any.
    #[must_use]
    pub fn execution(&self) -> Option<&ExecutionOutput> {
        match self {
            Self::Executed(output) => Some(output),
            _ => None,
        }
    }

    /// Summarises the artifact as a diagnostic payload.
    #[must_use]
    pub fn summary(&self) -> serde_json::Value {
        match self {
            Self::Source => serde_json::json!({ "artifact": "source" }),
            Self::Graph(graph) => serde_json::json!({
                "artifact": "graph",
                "dialect": graph.dialect,
                "nodes": graph.targets(),
                "quantized": graph.is_quantized(),
                "delegate_target": graph.delegate_target,
            }),
            Self::Serialized(serialized) => serde_json::json!({
                "artifact": "serialized",
                "target": serialized.target,
                "bytes": serialized.bytes.len(),
                "digest": serialized.digest,
            }),
            Self::Executed(output) => serde_json::json!({
                "artifact": "executed",
                "backend": output.backend,
                "outputs": output.outputs.len(),
                "quantization_scale": output.quantization_scale,
                "comparison": output.comparison,
            }),
        }
    }
}
