//! Mock stages for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::core::{Artifact, ExecutionOutput, StageKind, Tensor};
use crate::errors::StageFault;
use crate::stages::{Stage, StageContext};

/// A stage that passes the artifact through and records its calls.
#[derive(Debug)]
pub struct RecordingStage {
    name: String,
    kind: StageKind,
    calls: Mutex<usize>,
    log: Option<Arc<Mutex<Vec<String>>>>,
}

impl RecordingStage {
    /// Creates a recording stage.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: StageKind::Custom,
            calls: Mutex::new(0),
            log: None,
        }
    }

    /// Sets the stage kind.
    #[must_use]
    pub fn with_kind(mut self, kind: StageKind) -> Self {
        self.kind = kind;
        self
    }

    /// Appends this stage's name to `log` on every call.
    #[must_use]
    pub fn with_log(mut self, log: Arc<Mutex<Vec<String>>>) -> Self {
        self.log = Some(log);
        self
    }

    /// Returns the number of calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl Stage for RecordingStage {
    fn kind(&self) -> StageKind {
        self.kind
    }

    async fn apply(&self, _ctx: &StageContext, artifact: Artifact) -> Result<Artifact, StageFault> {
        *self.calls.lock() += 1;
        if let Some(log) = &self.log {
            log.lock().push(self.name.clone());
        }
        Ok(artifact)
    }
}

/// An execution stage returning fixed outputs, whatever it receives.
#[derive(Debug)]
pub struct FixedOutputStage {
    outputs: Vec<Tensor>,
    quantization_scale: Option<f64>,
    calls: Mutex<usize>,
}

impl FixedOutputStage {
    /// Creates a stage returning `outputs`.
    #[must_use]
    pub fn new(outputs: Vec<Tensor>) -> Self {
        Self {
            outputs,
            quantization_scale: None,
            calls: Mutex::new(0),
        }
    }

    /// Reports a quantization scale with the outputs.
    #[must_use]
    pub fn with_quantization_scale(mut self, scale: f64) -> Self {
        self.quantization_scale = Some(scale);
        self
    }

    /// Returns the number of calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl Stage for FixedOutputStage {
    fn kind(&self) -> StageKind {
        StageKind::Execute
    }

    async fn apply(&self, _ctx: &StageContext, _artifact: Artifact) -> Result<Artifact, StageFault> {
        *self.calls.lock() += 1;
        let output = ExecutionOutput::new("fixed", self.outputs.clone());
        Ok(Artifact::Executed(match self.quantization_scale {
            Some(scale) => output.with_quantization_scale(scale),
            None => output,
        }))
    }
}

/// A stage that always faults.
#[derive(Debug)]
pub struct FailingStage {
    message: String,
    kind: StageKind,
}

impl FailingStage {
    /// Creates a stage failing with `message`.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: StageKind::Custom,
        }
    }

    /// Sets the stage kind.
    #[must_use]
    pub fn with_kind(mut self, kind: StageKind) -> Self {
        self.kind = kind;
        self
    }
}

#[async_trait]
impl Stage for FailingStage {
    fn kind(&self) -> StageKind {
        self.kind
    }

    async fn apply(&self, _ctx: &StageContext, _artifact: Artifact) -> Result<Artifact, StageFault> {
        Err(StageFault::msg(self.message.clone()))
    }
}
