//! Graph assertions.

use super::{Stage, StageContext};
use crate::core::{Artifact, GraphArtifact, StageKind};
use crate::errors::StageFault;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// What a check stage asserts about the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckMode {
    /// Every pattern matches at least one node.
    Present(Vec<String>),
    /// No pattern matches any node.
    Absent(Vec<String>),
    /// Each pattern matches exactly the given number of nodes.
    Count(BTreeMap<String, usize>),
}

/// A stage asserting on node targets of the current graph.
///
/// Patterns are substrings of node targets. The artifact passes through
/// unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckStage {
    mode: CheckMode,
}

impl CheckStage {
    /// Requires every pattern to be present.
    #[must_use]
    pub fn present(patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            mode: CheckMode::Present(patterns.into_iter().map(Into::into).collect()),
        }
    }

    /// Requires every pattern to be absent.
    #[must_use]
    pub fn absent(patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            mode: CheckMode::Absent(patterns.into_iter().map(Into::into).collect()),
        }
    }

    /// Requires exact occurrence counts.
    #[must_use]
    pub fn count(counts: impl IntoIterator<Item = (impl Into<String>, usize)>) -> Self {
        Self {
            mode: CheckMode::Count(counts.into_iter().map(|(k, v)| (k.into(), v)).collect()),
        }
    }

    /// Returns the check mode.
    #[must_use]
    pub fn mode(&self) -> &CheckMode {
        &self.mode
    }

    fn violations(&self, graph: &GraphArtifact) -> Vec<String> {
        match &self.mode {
            CheckMode::Present(patterns) => patterns
                .iter()
                .filter(|pattern| graph.count_matching(pattern) == 0)
                .map(|pattern| format!("'{pattern}' not found"))
                .collect(),
            CheckMode::Absent(patterns) => patterns
                .iter()
                .filter_map(|pattern| match graph.count_matching(pattern) {
                    0 => None,
                    found => Some(format!("'{pattern}' found {found} time(s)")),
                })
                .collect(),
            CheckMode::Count(counts) => counts
                .iter()
                .filter_map(|(pattern, &expected)| {
                    let found = graph.count_matching(pattern);
                    (found != expected).then(|| format!("'{pattern}' expected {expected} time(s), found {found}"))
                })
                .collect(),
        }
    }
}

#[async_trait]
impl Stage for CheckStage {
    fn kind(&self) -> StageKind {
        StageKind::Check
    }

    async fn apply(&self, ctx: &StageContext, artifact: Artifact) -> Result<Artifact, StageFault> {
        let Some(graph) = artifact.graph() else {
            return Err(StageFault::msg(format!(
                "{} has no graph to check in a {} artifact",
                ctx.stage_name(),
                artifact.variant_name()
            )));
        };

        let violations = self.violations(graph);
        if violations.is_empty() {
            return Ok(artifact);
        }
        Err(StageFault::msg(format!(
            "{}: {} in [{}]",
            ctx.stage_name(),
            violations.join("; "),
            graph.targets().join(", ")
        )))
    }
}
