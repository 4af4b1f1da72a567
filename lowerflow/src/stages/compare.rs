//! Output comparison against the reference.

use super::{unexpected, Stage, StageContext};
use crate::config::Tolerance;
use crate::core::{compare_outputs, Artifact, StageKind};
use crate::errors::StageFault;
use async_trait::async_trait;
use tracing::debug;

/// The `compare_outputs` stage.
///
/// Compares the executed outputs with the reference outputs of the
/// unmodified program and attaches the report to the execution output.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompareStage {
    tolerance: Tolerance,
}

impl CompareStage {
    /// Creates a compare stage.
    #[must_use]
    pub fn new(tolerance: Tolerance) -> Self {
        Self { tolerance }
    }

    /// Returns the tolerance.
    #[must_use]
    pub fn tolerance(&self) -> Tolerance {
        self.tolerance
    }
}

#[async_trait]
impl Stage for CompareStage {
    fn kind(&self) -> StageKind {
        StageKind::Compare
    }

    async fn apply(&self, ctx: &StageContext, artifact: Artifact) -> Result<Artifact, StageFault> {
        let Artifact::Executed(mut output) = artifact else {
            return Err(unexpected(ctx.stage_name(), "execution outputs", &artifact));
        };
        let reference = ctx.reference_outputs()?;
        let report = compare_outputs(reference, &output.outputs, &self.tolerance, output.quantization_scale)?;
        debug!(
            stage = ctx.stage_name(),
            elements = report.elements,
            max_abs_error = report.max_abs_error,
            "Outputs within tolerance"
        );
        output.comparison = Some(report);
        Ok(Artifact::Executed(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ExecutionOutput, Tensor};
    use crate::testing::fixtures;

    fn executed(data: &[f64]) -> Artifact {
        Artifact::Executed(ExecutionOutput::new("mock", vec![Tensor::from_vec(data.to_vec())]))
    }

    #[tokio::test]
    async fn test_matching_outputs_attach_report() {
        let ctx = fixtures::stage_context("compare_outputs");
        let artifact = CompareStage::default()
            .apply(&ctx, executed(&[2.0, 4.0, 6.0]))
            .await
            .unwrap();

        let report = artifact.execution().unwrap().comparison.clone().unwrap();
        assert_eq!(report.elements, 3);
        assert!(report.max_abs_error.abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_divergent_outputs_raise_tolerance_fault() {
        let ctx = fixtures::stage_context("compare_outputs");
        let fault = CompareStage::default()
            .apply(&ctx, executed(&[2.0, 4.0, 7.0]))
            .await
            .unwrap_err();

        let StageFault::Tolerance(err) = fault else {
            panic!("expected a tolerance fault");
        };
        assert_eq!(err.index, 2);
        assert!((err.max_abs_error - 1.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_compare_needs_execution_output() {
        let ctx = fixtures::stage_context("compare_outputs");
        let fault = CompareStage::default().apply(&ctx, Artifact::Source).await.unwrap_err();
        assert!(matches!(fault, StageFault::Fault(_)));
    }
}
