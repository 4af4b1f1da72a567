//! Per-stage execution context.

use crate::core::{Sample, Tensor};
use crate::errors::StageFault;
use crate::program::Program;
use crate::stages::StageParams;
use std::sync::{Arc, OnceLock};

/// Reference outputs of a run, computed at most once from the unmodified
/// program (or supplied by the caller).
#[derive(Debug, Default)]
pub struct ReferenceOutputs {
    cell: OnceLock<Result<Vec<Tensor>, String>>,
}

impl ReferenceOutputs {
    /// Creates an empty holder; the first request runs the program.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a holder with caller-supplied reference outputs.
    #[must_use]
    pub fn provided(outputs: Vec<Tensor>) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(Ok(outputs));
        Self { cell }
    }

    /// Returns the reference outputs, running `program` on `sample` the
    /// first time.
    ///
    /// # Errors
    ///
    /// Returns a fault if the program itself fails on the sample.
    pub fn get_or_compute(&self, program: &dyn Program, sample: &[Tensor]) -> Result<&[Tensor], StageFault> {
        let outputs = self
            .cell
            .get_or_init(|| program.forward(sample).map_err(|err| format!("{err:#}")));
        match outputs {
            Ok(outputs) => Ok(outputs),
            Err(message) => Err(StageFault::msg(format!("reference run failed: {message}"))),
        }
    }
}

/// Everything a stage may read while it runs.
///
/// The program and sample are shared and immutable.
#[derive(Debug, Clone)]
pub struct StageContext {
    stage_name: String,
    profile: String,
    label: Option<String>,
    program: Arc<dyn Program>,
    sample: Arc<Sample>,
    params: StageParams,
    reference: Arc<ReferenceOutputs>,
}

impl StageContext {
    /// Creates a stage context.
    #[must_use]
    pub fn new(
        stage_name: impl Into<String>,
        profile: impl Into<String>,
        program: Arc<dyn Program>,
        sample: Arc<Sample>,
        reference: Arc<ReferenceOutputs>,
    ) -> Self {
        Self {
            stage_name: stage_name.into(),
            profile: profile.into(),
            label: None,
            program,
            sample,
            params: StageParams::new(),
            reference,
        }
    }

    /// Sets the sample label.
    #[must_use]
    pub fn with_label(mut self, label: Option<String>) -> Self {
        self.label = label;
        self
    }

    /// Sets the stage parameters.
    #[must_use]
    pub fn with_params(mut self, params: StageParams) -> Self {
        self.params = params;
        self
    }

    /// Returns the name of the running stage.
    #[must_use]
    pub fn stage_name(&self) -> &str {
        &self.stage_name
    }

    /// Returns the profile name.
    #[must_use]
    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// Returns the sample label, if any.
    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Returns the program under test.
    #[must_use]
    pub fn program(&self) -> &dyn Program {
        self.program.as_ref()
    }

    /// Returns the input sample.
    #[must_use]
    pub fn sample(&self) -> &[Tensor] {
        &self.sample
    }

    /// Returns the running stage's parameters.
    #[must_use]
    pub fn params(&self) -> &StageParams {
        &self.params
    }

    /// Returns the reference outputs for this run.
    ///
    /// # Errors
    ///
    /// Returns a fault if the program fails on the sample.
    pub fn reference_outputs(&self) -> Result<&[Tensor], StageFault> {
        self.reference.get_or_compute(self.program.as_ref(), &self.sample)
    }
}
