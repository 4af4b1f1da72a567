//! Program execution on a simulator.

use super::{unexpected, Stage, StageContext};
use crate::availability::find_executable;
use crate::core::{Artifact, ExecutionOutput, SerializedArtifact, StageKind, Tensor};
use crate::errors::StageFault;
use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Executes a serialized program on one input sample.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Simulator: Send + Sync {
    /// Runs `artifact` on the sample carried by `ctx`.
    ///
    /// # Errors
    ///
    /// Returns an error if the program cannot be run.
    async fn execute(&self, artifact: &SerializedArtifact, ctx: &StageContext) -> anyhow::Result<ExecutionOutput>;
}

/// In-process simulator.
///
/// Runs the program directly. Quantized graphs have their outputs
/// fake-quantized with a symmetric per-tensor scale, which is reported so
/// the comparison can allow for it.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostSimulator;

#[async_trait]
impl Simulator for HostSimulator {
    async fn execute(&self, artifact: &SerializedArtifact, ctx: &StageContext) -> anyhow::Result<ExecutionOutput> {
        let outputs = ctx.program().forward(ctx.sample())?;
        let Some(config) = &artifact.graph.quantization else {
            return Ok(ExecutionOutput::new(crate::availability::HOST, outputs));
        };

        let qmax = config.activation_dtype.qmax();
        let scale = outputs.iter().map(Tensor::max_abs).fold(0.0_f64, f64::max) / qmax;
        if scale == 0.0 || !scale.is_finite() {
            return Ok(ExecutionOutput::new(crate::availability::HOST, outputs));
        }

        let quantized = outputs
            .iter()
            .map(|tensor| tensor.map(|v| (v / scale).round().clamp(-qmax, qmax) * scale))
            .collect();
        Ok(ExecutionOutput::new(crate::availability::HOST, quantized).with_quantization_scale(scale))
    }
}

#[derive(Serialize)]
struct SimulatorRequest<'a> {
    target: &'a str,
    digest: &'a str,
    program: String,
    inputs: &'a [Tensor],
}

#[derive(Deserialize)]
struct SimulatorResponse {
    outputs: Vec<Tensor>,
    #[serde(default)]
    quantization_scale: Option<f64>,
}

/// Simulator driven as an external process.
///
/// The request is written to stdin as one JSON object
/// (`target`, `digest`, base64 `program`, `inputs`); the process answers on
/// stdout with `{"outputs": [...], "quantization_scale": ...}`.
#[derive(Debug, Clone)]
pub struct ProcessSimulator {
    name: String,
    binary: String,
    search_paths: Vec<PathBuf>,
    args: Vec<String>,
}

impl ProcessSimulator {
    /// Creates a simulator that launches `binary`.
    #[must_use]
    pub fn new(name: impl Into<String>, binary: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            binary: binary.into(),
            search_paths: Vec::new(),
            args: Vec::new(),
        }
    }

    /// Sets the directories searched before `PATH`.
    #[must_use]
    pub fn with_search_paths(mut self, search_paths: Vec<PathBuf>) -> Self {
        self.search_paths = search_paths;
        self
    }

    /// Appends a command-line argument.
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn resolve(&self) -> PathBuf {
        find_executable(&self.binary, &self.search_paths).unwrap_or_else(|| PathBuf::from(&self.binary))
    }
}

#[async_trait]
impl Simulator for ProcessSimulator {
    async fn execute(&self, artifact: &SerializedArtifact, ctx: &StageContext) -> anyhow::Result<ExecutionOutput> {
        let request = serde_json::to_vec(&SimulatorRequest {
            target: &artifact.target,
            digest: &artifact.digest,
            program: base64::engine::general_purpose::STANDARD.encode(&artifact.bytes),
            inputs: ctx.sample(),
        })?;

        let binary = self.resolve();
        debug!(simulator = %self.name, binary = %binary.display(), "Launching simulator");
        let mut child = Command::new(&binary)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to launch {}", binary.display()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&request).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            anyhow::bail!(
                "{} exited with {}: {}",
                self.name,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let response: SimulatorResponse =
            serde_json::from_slice(&output.stdout).with_context(|| format!("{} returned malformed output", self.name))?;
        let execution = ExecutionOutput::new(self.name.clone(), response.outputs);
        Ok(match response.quantization_scale {
            Some(scale) => execution.with_quantization_scale(scale),
            None => execution,
        })
    }
}

/// The `run_method` stage.
pub struct RunStage {
    simulator_name: String,
    simulator: Arc<dyn Simulator>,
}

impl RunStage {
    /// Creates a run stage executing on `simulator`.
    #[must_use]
    pub fn new(simulator_name: impl Into<String>, simulator: Arc<dyn Simulator>) -> Self {
        Self {
            simulator_name: simulator_name.into(),
            simulator,
        }
    }
}

impl Debug for RunStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunStage")
            .field("simulator", &self.simulator_name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Stage for RunStage {
    fn kind(&self) -> StageKind {
        StageKind::Execute
    }

    async fn apply(&self, ctx: &StageContext, artifact: Artifact) -> Result<Artifact, StageFault> {
        let Artifact::Serialized(serialized) = artifact else {
            return Err(unexpected(ctx.stage_name(), "a serialized program", &artifact));
        };
        let output = self
            .simulator
            .execute(&serialized, ctx)
            .await
            .with_context(|| format!("{} failed", self.simulator_name))?;
        Ok(Artifact::Executed(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuantizationConfig;
    use crate::core::{Dialect, GraphArtifact};
    use crate::testing::fixtures;

    fn serialized(quantized: bool) -> SerializedArtifact {
        let mut graph = GraphArtifact::new("add", 1, ["aten.add.Tensor"]).into_dialect(Dialect::Edge);
        if quantized {
            graph.quantization = Some(QuantizationConfig::symmetric_int8());
        }
        SerializedArtifact::from_graph(graph, "TOSA-0.80+MI").unwrap()
    }

    #[tokio::test]
    async fn test_host_simulator_runs_program() {
        let ctx = fixtures::stage_context("run_method");
        let output = HostSimulator.execute(&serialized(false), &ctx).await.unwrap();

        assert_eq!(output.outputs[0].data(), &[2.0, 4.0, 6.0]);
        assert!(output.quantization_scale.is_none());
    }

    #[tokio::test]
    async fn test_host_simulator_fake_quantizes() {
        let ctx = fixtures::stage_context("run_method");
        let output = HostSimulator.execute(&serialized(true), &ctx).await.unwrap();

        let scale = output.quantization_scale.unwrap();
        assert!((scale - 6.0 / 127.0).abs() < 1e-12);
        for (value, expected) in output.outputs[0].data().iter().zip([2.0, 4.0, 6.0]) {
            assert!((value - expected).abs() <= scale / 2.0 + 1e-12);
        }
    }

    #[tokio::test]
    async fn test_run_stage_uses_simulator() {
        let mut simulator = MockSimulator::new();
        simulator
            .expect_execute()
            .times(1)
            .returning(|_, _| Ok(ExecutionOutput::new("mock", vec![Tensor::from_vec(vec![1.0])])));
        let stage = RunStage::new("mock", Arc::new(simulator));
        let ctx = fixtures::stage_context("run_method");

        let artifact = stage
            .apply(&ctx, Artifact::Serialized(serialized(false)))
            .await
            .unwrap();
        assert_eq!(artifact.execution().unwrap().backend, "mock");
    }

    #[tokio::test]
    async fn test_run_stage_wraps_simulator_error() {
        let mut simulator = MockSimulator::new();
        simulator
            .expect_execute()
            .returning(|_, _| Err(anyhow::anyhow!("FVP crashed")));
        let stage = RunStage::new("corstone-300", Arc::new(simulator));
        let ctx = fixtures::stage_context("run_method");

        let fault = stage
            .apply(&ctx, Artifact::Serialized(serialized(false)))
            .await
            .unwrap_err();
        let message = format!("{fault:#}");
        assert!(message.contains("corstone-300 failed"));
        assert!(message.contains("FVP crashed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_simulator_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake_fvp.sh");
        std::fs::write(
            &script,
            "cat > /dev/null\necho '{\"outputs\": [{\"shape\": [3], \"data\": [2.0, 4.0, 6.0]}], \"quantization_scale\": 0.05}'\n",
        )
        .unwrap();
        let simulator = ProcessSimulator::new("fake-fvp", "/bin/sh").with_arg(script.to_string_lossy());
        let ctx = fixtures::stage_context("run_method");

        let output = simulator.execute(&serialized(false), &ctx).await.unwrap();
        assert_eq!(output.backend, "fake-fvp");
        assert_eq!(output.outputs[0].data(), &[2.0, 4.0, 6.0]);
        assert_eq!(output.quantization_scale, Some(0.05));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_simulator_failure() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("broken_fvp.sh");
        std::fs::write(&script, "cat > /dev/null\necho 'license expired' >&2\nexit 3\n").unwrap();
        let simulator = ProcessSimulator::new("broken-fvp", "/bin/sh").with_arg(script.to_string_lossy());
        let ctx = fixtures::stage_context("run_method");

        let err = simulator.execute(&serialized(false), &ctx).await.unwrap_err();
        assert!(err.to_string().contains("license expired"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_simulator_rejects_short_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake_fvp.sh");
        std::fs::write(
            &script,
            "cat > /dev/null\necho '{\"outputs\": [{\"shape\": [3], \"data\": [2.0, 4.0]}]}'\n",
        )
        .unwrap();
        let simulator = ProcessSimulator::new("fake-fvp", "/bin/sh").with_arg(script.to_string_lossy());
        let ctx = fixtures::stage_context("run_method");

        let err = simulator.execute(&serialized(false), &ctx).await.unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("fake-fvp returned malformed output"));
        assert!(message.contains("expects 3 elements, got 2"));
    }

    #[tokio::test]
    async fn test_missing_binary_fails_to_launch() {
        let simulator = ProcessSimulator::new("ghost", "lowerflow-no-such-simulator");
        let ctx = fixtures::stage_context("run_method");

        let err = simulator.execute(&serialized(false), &ctx).await.unwrap_err();
        assert!(err.to_string().contains("failed to launch"));
    }
}
