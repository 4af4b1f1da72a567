//! Pipeline instances: build from a profile, mutate, run once.

use super::profile::ProfileCatalog;
use super::{RunFailure, RunResult, StageChange, StageRecord, StageRegistry, StageSequence, StageSpec, TargetProfile, Toolchain};
use crate::availability::{AvailabilityGuard, ProcessAvailability};
use crate::config::{QuantizationConfig, Tolerance};
use crate::core::{Artifact, Sample, Tensor};
use crate::errors::{
    LowerflowError, PipelineAlreadyRunError, StageExecutionError, StageFault, UnavailableDependencyError,
    UnknownStageError,
};
use crate::events::{EventSink, EventType, NoOpEventSink, PipelineEvent};
use crate::observability::SpanTimer;
use crate::program::Program;
use crate::stages::{params, ReferenceOutputs, StageContext, StageParams};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

const COMPARE_OUTPUTS: &str = "compare_outputs";

/// Builder for a [`Pipeline`].
pub struct PipelineBuilder {
    profile: TargetProfile,
    program: Arc<dyn Program>,
    sample: Arc<Sample>,
    label: Option<String>,
    overrides: HashMap<String, StageChange>,
    registry: Option<Arc<StageRegistry>>,
    toolchain: Option<Arc<Toolchain>>,
    guard: Option<Arc<dyn AvailabilityGuard>>,
    events: Option<Arc<dyn EventSink>>,
    reference: Option<Vec<Tensor>>,
    tolerance: Option<Tolerance>,
}

impl PipelineBuilder {
    /// Creates a builder for `program` on `sample` with `profile`.
    #[must_use]
    pub fn new(profile: TargetProfile, program: Arc<dyn Program>, sample: impl Into<Arc<Sample>>) -> Self {
        Self {
            profile,
            program,
            sample: sample.into(),
            label: None,
            overrides: HashMap::new(),
            registry: None,
            toolchain: None,
            guard: None,
            events: None,
            reference: None,
            tolerance: None,
        }
    }

    /// Sets the sample label.
    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Overrides a template stage before instantiation.
    #[must_use]
    pub fn override_stage(mut self, name: impl Into<String>, change: StageChange) -> Self {
        let name = name.into();
        let change = match self.overrides.remove(&name) {
            Some(previous) => previous.then(change),
            None => change,
        };
        self.overrides.insert(name, change);
        self
    }

    /// Patches the default parameters of a template stage.
    #[must_use]
    pub fn override_params(self, name: impl Into<String>, patch: StageParams) -> Self {
        self.override_stage(name, StageChange::Params(patch))
    }

    /// Overrides the comparison tolerance.
    ///
    /// Ignored when the instantiated template has no `compare_outputs`
    /// stage, e.g. a hardware profile built without hardware execution.
    #[must_use]
    pub fn tolerance(mut self, tolerance: Tolerance) -> Self {
        self.tolerance = Some(tolerance);
        self
    }

    /// Overrides the quantization config.
    #[must_use]
    pub fn quantization(self, config: &QuantizationConfig) -> Self {
        self.override_params("quantize", params(serde_json::json!({ "config": config })))
    }

    /// Operators expected in the captured graph.
    #[must_use]
    pub fn aten_ops(self, ops: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let patterns: Vec<String> = ops.into_iter().map(Into::into).collect();
        self.override_params("check.aten", params(serde_json::json!({ "patterns": patterns })))
    }

    /// Operators that must not remain after partitioning.
    #[must_use]
    pub fn exir_ops(self, ops: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let patterns: Vec<String> = ops.into_iter().map(Into::into).collect();
        self.override_params("check_not.exir", params(serde_json::json!({ "patterns": patterns })))
    }

    /// Requests (or suppresses) hardware execution stages.
    #[must_use]
    pub fn run_on_hardware(mut self, enabled: bool) -> Self {
        self.profile.defaults.run_on_hardware = enabled;
        self
    }

    /// Sets the stage registry.
    #[must_use]
    pub fn registry(mut self, registry: Arc<StageRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets the toolchain.
    #[must_use]
    pub fn toolchain(mut self, toolchain: Arc<Toolchain>) -> Self {
        self.toolchain = Some(toolchain);
        self
    }

    /// Sets the availability guard.
    #[must_use]
    pub fn availability(mut self, guard: Arc<dyn AvailabilityGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Supplies the reference outputs instead of running the program.
    #[must_use]
    pub fn reference_outputs(mut self, outputs: Vec<Tensor>) -> Self {
        self.reference = Some(outputs);
        self
    }

    /// Instantiates the profile's stages and returns the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if an override names an unknown stage or a stage
    /// cannot be instantiated.
    pub fn build(mut self) -> Result<Pipeline, LowerflowError> {
        if let Some(tolerance) = self.tolerance.take() {
            let compares = self
                .profile
                .active_entries(self.profile.defaults.run_on_hardware)
                .any(|entry| entry.name == COMPARE_OUTPUTS);
            if compares {
                self = self.override_params(
                    COMPARE_OUTPUTS,
                    params(serde_json::json!({
                        "atol": tolerance.atol,
                        "rtol": tolerance.rtol,
                        "qtol": tolerance.qtol,
                    })),
                );
            }
        }

        let registry = self.registry.unwrap_or_else(|| Arc::new(StageRegistry::builtin()));
        let toolchain = self.toolchain.unwrap_or_default();
        let sequence = StageSequence::build(&self.profile, &registry, &toolchain, self.overrides)?;
        let reference = match self.reference {
            Some(outputs) => ReferenceOutputs::provided(outputs),
            None => ReferenceOutputs::new(),
        };

        Ok(Pipeline {
            profile: self.profile,
            sequence,
            program: self.program,
            sample: self.sample,
            label: self.label,
            registry,
            toolchain,
            guard: self.guard.unwrap_or_else(|| Arc::new(ProcessAvailability)),
            events: self.events.unwrap_or_else(|| Arc::new(NoOpEventSink)),
            reference: Arc::new(reference),
            has_run: false,
        })
    }
}

/// One program, one sample, one profile, run at most once.
pub struct Pipeline {
    profile: TargetProfile,
    sequence: StageSequence,
    program: Arc<dyn Program>,
    sample: Arc<Sample>,
    label: Option<String>,
    registry: Arc<StageRegistry>,
    toolchain: Arc<Toolchain>,
    guard: Arc<dyn AvailabilityGuard>,
    events: Arc<dyn EventSink>,
    reference: Arc<ReferenceOutputs>,
    has_run: bool,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("profile", &self.profile.name)
            .field("label", &self.label)
            .field("stages", &self.sequence.names())
            .field("has_run", &self.has_run)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Starts a builder for `profile`.
    #[must_use]
    pub fn builder(profile: TargetProfile, program: Arc<dyn Program>, sample: impl Into<Arc<Sample>>) -> PipelineBuilder {
        PipelineBuilder::new(profile, program, sample)
    }

    /// Starts a builder for a built-in profile by name.
    ///
    /// # Errors
    ///
    /// Returns an error if no built-in profile has this name.
    pub fn for_profile(
        name: &str,
        program: Arc<dyn Program>,
        sample: impl Into<Arc<Sample>>,
    ) -> Result<PipelineBuilder, LowerflowError> {
        let profile = ProfileCatalog::builtin().get(name)?.clone();
        Ok(PipelineBuilder::new(profile, program, sample))
    }

    /// Returns the profile name.
    #[must_use]
    pub fn profile(&self) -> &str {
        &self.profile.name
    }

    /// Returns the sample label.
    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Returns the stage sequence.
    #[must_use]
    pub fn sequence(&self) -> &StageSequence {
        &self.sequence
    }

    /// Returns the stage names in order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<String> {
        self.sequence.names()
    }

    /// Returns true once `run()` was called.
    #[must_use]
    pub fn has_run(&self) -> bool {
        self.has_run
    }

    /// Changes the stage called `stage`.
    ///
    /// # Errors
    ///
    /// Returns an error after `run()`, for an unknown stage, or if the new
    /// parameters are rejected. The sequence is unchanged on error.
    pub fn change_args(&mut self, stage: &str, change: StageChange) -> Result<(), LowerflowError> {
        self.ensure_not_run("change_args")?;
        let slot = self
            .sequence
            .get(stage)
            .ok_or_else(|| UnknownStageError::new(stage, self.sequence.names()))?;
        let spec = change.apply_to(slot, &self.registry, &self.toolchain)?;
        self.sequence.replace(stage, spec)?;
        debug!(stage, profile = %self.profile.name, "Stage changed");
        Ok(())
    }

    /// Inserts `spec` right after `anchor`.
    ///
    /// # Errors
    ///
    /// Returns an error after `run()`, for an unknown anchor, or a taken name.
    pub fn insert_after(&mut self, anchor: &str, spec: StageSpec) -> Result<(), LowerflowError> {
        self.ensure_not_run("insert_after")?;
        self.sequence.insert_after(anchor, spec)
    }

    /// Inserts `spec` right before `anchor`.
    ///
    /// # Errors
    ///
    /// Returns an error after `run()`, for an unknown anchor, or a taken name.
    pub fn insert_before(&mut self, anchor: &str, spec: StageSpec) -> Result<(), LowerflowError> {
        self.ensure_not_run("insert_before")?;
        self.sequence.insert_before(anchor, spec)
    }

    /// Removes the stage called `name`.
    ///
    /// # Errors
    ///
    /// Returns an error after `run()` or for an unknown stage.
    pub fn remove_stage(&mut self, name: &str) -> Result<StageSpec, LowerflowError> {
        self.ensure_not_run("remove_stage")?;
        self.sequence.remove(name)
    }

    /// Runs every stage in order.
    ///
    /// Stage faults and tolerance failures are reported in the returned
    /// [`RunResult`]; only misuse is an `Err`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineAlreadyRunError`] if the pipeline already ran.
    pub async fn run(&mut self) -> Result<RunResult, LowerflowError> {
        self.ensure_not_run("run")?;
        self.has_run = true;

        let run_id = Uuid::new_v4();
        let span = info_span!(
            "pipeline.run",
            profile = %self.profile.name,
            label = self.label.as_deref().unwrap_or("-"),
            %run_id,
        );
        Ok(self.execute(run_id).instrument(span).await)
    }

    fn ensure_not_run(&self, attempted: &str) -> Result<(), LowerflowError> {
        if self.has_run {
            return Err(PipelineAlreadyRunError::new(&self.profile.name, attempted).into());
        }
        Ok(())
    }

    async fn execute(&self, run_id: Uuid) -> RunResult {
        let mut result = RunResult::new(run_id, &self.profile.name, self.label.clone());
        info!(stages = self.sequence.len(), "Pipeline started");
        self.events
            .emit(PipelineEvent::pipeline(
                EventType::PipelineStarted,
                serde_json::json!({
                    "run_id": run_id.to_string(),
                    "profile": self.profile.name,
                    "label": self.label,
                    "stages": self.sequence.names(),
                }),
            ))
            .await;

        let mut artifact = Artifact::Source;
        for spec in &self.sequence {
            if let Some(dependency) = spec.requires.as_deref() {
                if !self.guard.available(dependency) {
                    warn!(stage = %spec.name, dependency, required = spec.required, "Dependency unavailable, skipping stage");
                    result.push(StageRecord::skipped(&spec.name, spec.kind(), dependency, spec.required));
                    self.events
                        .emit(PipelineEvent::stage(
                            EventType::StageSkipped,
                            &spec.name,
                            serde_json::json!({ "dependency": dependency, "required": spec.required }),
                        ))
                        .await;
                    if spec.required {
                        result.finish_with(RunFailure::Unavailable(UnavailableDependencyError::new(
                            &spec.name, dependency,
                        )));
                        return self.complete(result).await;
                    }
                    continue;
                }
            }

            let ctx = StageContext::new(
                &spec.name,
                &self.profile.name,
                Arc::clone(&self.program),
                Arc::clone(&self.sample),
                Arc::clone(&self.reference),
            )
            .with_label(self.label.clone())
            .with_params(spec.params.clone());

            debug!(stage = %spec.name, kind = %spec.kind(), "Stage started");
            self.events
                .emit(PipelineEvent::stage(
                    EventType::StageStarted,
                    &spec.name,
                    serde_json::json!({ "kind": spec.kind() }),
                ))
                .await;
            let started_at = Utc::now();
            let timer = SpanTimer::start(&spec.name);

            match spec.runner.apply(&ctx, artifact).await {
                Ok(next) => {
                    let duration_ms = timer.finish();
                    let diagnostics = next.summary();
                    info!(stage = %spec.name, duration_ms, "Stage passed");
                    self.events
                        .emit(PipelineEvent::stage(
                            EventType::StageCompleted,
                            &spec.name,
                            serde_json::json!({ "duration_ms": duration_ms, "artifact": diagnostics }),
                        ))
                        .await;
                    result.push(StageRecord::passed(&spec.name, spec.kind(), started_at, diagnostics));
                    artifact = next;
                }
                Err(fault) => {
                    let duration_ms = timer.finish();
                    let failure = match fault {
                        StageFault::Tolerance(error) => RunFailure::ToleranceExceeded {
                            stage: spec.name.clone(),
                            error,
                        },
                        StageFault::Fault(cause) => {
                            RunFailure::StageExecution(StageExecutionError::new(&spec.name, format!("{cause:#}")))
                        }
                    };
                    let message = failure.to_string();
                    warn!(stage = %spec.name, duration_ms, error = %message, "Stage failed");
                    self.events
                        .emit(PipelineEvent::stage(
                            EventType::StageFailed,
                            &spec.name,
                            serde_json::json!({ "duration_ms": duration_ms, "error": message }),
                        ))
                        .await;
                    result.push(StageRecord::failed(&spec.name, spec.kind(), started_at, message));
                    result.finish_with(failure);
                    return self.complete(result).await;
                }
            }
        }

        result.finish(artifact.execution().and_then(|output| output.comparison.clone()));
        self.complete(result).await
    }

    async fn complete(&self, result: RunResult) -> RunResult {
        info!(status = %result.status, duration_ms = result.duration_ms(), "Pipeline completed");
        self.events
            .emit(PipelineEvent::pipeline(
                EventType::PipelineCompleted,
                serde_json::json!({
                    "run_id": result.run_id.to_string(),
                    "status": result.status,
                    "failed_stage": result.failed_stage(),
                }),
            ))
            .await;
        result
    }
}
