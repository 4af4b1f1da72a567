//! End-to-end pipeline tests.

use super::{Pipeline, RunFailure, StageChange, StageSpec, TargetProfile, Toolchain};
use crate::availability::{StaticAvailability, HOST};
use crate::config::{QuantDtype, QuantizationConfig, Tolerance};
use crate::core::{ExecutionOutput, StageStatus, Tensor};
use crate::errors::LowerflowError;
use crate::events::{CollectingEventSink, EventType};
use crate::program::FnProgram;
use crate::stages::{params, CheckStage, HostSimulator, MockSimulator, QUANTIZE_OP};
use crate::testing::{
    assert_run_failed_at, assert_run_passed, assert_run_skipped, assert_stage_order, assert_stage_status,
    fixtures, FailingStage, FixedOutputStage, RecordingStage,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn builder(profile: TargetProfile) -> super::PipelineBuilder {
    Pipeline::builder(profile, fixtures::add_program(), fixtures::self_add_sample())
        .availability(Arc::new(StaticAvailability::new()))
}

fn reference() -> Pipeline {
    builder(TargetProfile::reference()).build().unwrap()
}

#[tokio::test]
async fn test_reference_run_follows_template() {
    let mut pipeline = reference();
    let result = pipeline.run().await.unwrap();

    assert_run_passed(&result);
    assert_eq!(
        result.stage_names(),
        TargetProfile::reference().stage_names(false)
    );
    let comparison = result.comparison.as_ref().unwrap();
    assert_eq!(comparison.elements, 3);
    assert_eq!(result.profile, "reference");
}

#[tokio::test]
async fn test_second_run_is_rejected() {
    let mut pipeline = reference();
    pipeline.run().await.unwrap();

    let err = pipeline.run().await.unwrap_err();
    assert!(matches!(err, LowerflowError::PipelineAlreadyRun(ref err) if err.attempted == "run"));
    assert!(err.is_structural());
}

#[tokio::test]
async fn test_replacement_runs_instead_of_original() {
    let original = Arc::new(RecordingStage::new("run_method"));
    let mut pipeline = builder(TargetProfile::reference())
        .override_stage("run_method", StageChange::Stage(original.clone()))
        .build()
        .unwrap();
    let replacement = Arc::new(FixedOutputStage::new(vec![Tensor::from_vec(vec![2.0, 4.0, 6.0])]));
    pipeline
        .change_args("run_method", StageChange::Stage(replacement.clone()))
        .unwrap();

    let result = pipeline.run().await.unwrap();
    assert_run_passed(&result);
    assert_eq!(original.call_count(), 0);
    assert_eq!(replacement.call_count(), 1);
    assert_eq!(result.stage("run_method").unwrap().diagnostics["backend"], "fixed");
}

#[tokio::test]
async fn test_insert_after_runs_in_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline = reference();
    pipeline
        .insert_after(
            "export",
            StageSpec::new("probe.after_export", Arc::new(RecordingStage::new("probe.after_export").with_log(Arc::clone(&log)))),
        )
        .unwrap();
    pipeline
        .insert_before(
            "export",
            StageSpec::new("probe.first", Arc::new(RecordingStage::new("probe.first").with_log(Arc::clone(&log)))),
        )
        .unwrap();

    let result = pipeline.run().await.unwrap();
    assert_run_passed(&result);
    assert_eq!(&result.stage_names()[..4], ["probe.first", "export", "probe.after_export", "check.aten"]);
    assert_eq!(log.lock().as_slice(), ["probe.first", "probe.after_export"]);
}

#[tokio::test]
async fn test_unknown_anchor_leaves_pipeline_unchanged() {
    let mut pipeline = reference();
    let before = pipeline.stage_names();

    let err = pipeline
        .insert_after("quantise", StageSpec::new("probe", Arc::new(RecordingStage::new("probe"))))
        .unwrap_err();
    let LowerflowError::UnknownStage(err) = err else {
        panic!("expected an unknown stage error");
    };
    assert_eq!(err.available, before);
    assert_eq!(pipeline.stage_names(), before);

    let err = pipeline
        .insert_after("export", StageSpec::new("to_edge", Arc::new(RecordingStage::new("dup"))))
        .unwrap_err();
    assert!(matches!(err, LowerflowError::DuplicateStageName(_)));
    assert_eq!(pipeline.stage_names(), before);
}

#[tokio::test]
async fn test_remove_stage() {
    let mut pipeline = reference();
    let removed = pipeline.remove_stage("check_count.exir").unwrap();
    assert_eq!(removed.name, "check_count.exir");

    let result = pipeline.run().await.unwrap();
    assert_run_passed(&result);
    assert!(result.stage("check_count.exir").is_none());
}

#[tokio::test]
async fn test_self_add_end_to_end() {
    let mut matching = reference();
    matching
        .change_args(
            "run_method",
            StageChange::Stage(Arc::new(FixedOutputStage::new(vec![Tensor::from_vec(vec![2.0, 4.0, 6.0])]))),
        )
        .unwrap();
    assert_run_passed(&matching.run().await.unwrap());

    let mut diverging = reference();
    diverging
        .change_args(
            "run_method",
            StageChange::Stage(Arc::new(FixedOutputStage::new(vec![Tensor::from_vec(vec![2.0, 4.0, 7.0])]))),
        )
        .unwrap();
    let result = diverging.run().await.unwrap();

    assert_run_failed_at(&result, "compare_outputs");
    let err = result.tolerance_error().unwrap();
    assert_eq!(err.index, 2);
    assert!((err.max_abs_error - 1.0).abs() < 1e-12);
    assert_stage_status(&result, "compare_outputs", StageStatus::Failed);
}

#[tokio::test]
async fn test_tolerance_against_supplied_reference() {
    let run = |tolerance: Tolerance| {
        let mut pipeline = builder(TargetProfile::reference())
            .reference_outputs(vec![Tensor::from_vec(vec![1.0, 2.0])])
            .tolerance(tolerance)
            .build()
            .unwrap();
        pipeline
            .change_args(
                "run_method",
                StageChange::Stage(Arc::new(FixedOutputStage::new(vec![Tensor::from_vec(vec![1.0001, 2.0])]))),
            )
            .unwrap();
        pipeline
    };

    let result = run(Tolerance::new(0.001, 0.0)).run().await.unwrap();
    assert_run_passed(&result);

    let result = run(Tolerance::new(0.00001, 0.0)).run().await.unwrap();
    assert_run_failed_at(&result, "compare_outputs");
    let err = result.tolerance_error().unwrap();
    assert_eq!((err.output, err.index), (0, 0));
}

#[tokio::test]
async fn test_stage_fault_stops_run() {
    let events = Arc::new(CollectingEventSink::new());
    let mut pipeline = builder(TargetProfile::reference())
        .event_sink(events.clone())
        .build()
        .unwrap();
    pipeline
        .insert_after("to_edge", StageSpec::new("explode", Arc::new(FailingStage::new("lowering crashed"))))
        .unwrap();

    let result = pipeline.run().await.unwrap();
    assert_run_failed_at(&result, "explode");
    assert_stage_order(&result, &["export", "check.aten", "to_edge", "explode"]);

    let Some(RunFailure::StageExecution(err)) = &result.failure else {
        panic!("expected a stage execution failure");
    };
    assert!(err.cause.contains("lowering crashed"));
    assert!(events.stages_with(EventType::StageStarted).iter().all(|stage| stage != "partition"));
    assert_eq!(events.stages_with(EventType::StageFailed), vec!["explode"]);
}

#[tokio::test]
async fn test_optional_dependency_skips_stages() {
    let events = Arc::new(CollectingEventSink::new());
    let mut pipeline = builder(TargetProfile::quantized())
        .event_sink(events.clone())
        .build()
        .unwrap();

    let result = pipeline.run().await.unwrap();
    assert_run_passed(&result);
    assert_stage_status(&result, "run_method", StageStatus::Skipped);
    assert_stage_status(&result, "compare_outputs", StageStatus::Skipped);
    assert!(result.comparison.is_none());
    assert_eq!(events.stages_with(EventType::StageSkipped), vec!["run_method", "compare_outputs"]);
}

#[tokio::test]
async fn test_required_dependency_skips_run() {
    let mut pipeline = builder(TargetProfile::ethos_u55()).run_on_hardware(true).build().unwrap();

    let result = pipeline.run().await.unwrap();
    assert_run_skipped(&result);
    assert_eq!(result.stage_names().last().copied(), Some("run_method"));
    assert!(result.stage("compare_outputs").is_none());
    let Some(RunFailure::Unavailable(err)) = &result.failure else {
        panic!("expected an unavailable dependency");
    };
    assert_eq!(err.dependency, "corstone-300");
}

#[tokio::test]
async fn test_ethos_u_without_hardware_stops_after_serialization() {
    let mut pipeline = builder(TargetProfile::ethos_u85()).build().unwrap();

    let result = pipeline.run().await.unwrap();
    assert_run_passed(&result);
    assert_eq!(result.stage_names().last().copied(), Some("to_executorch"));
}

#[tokio::test]
async fn test_ethos_u_hardware_run_on_simulator() {
    let toolchain = Toolchain::default().with_simulator("corstone-300", Arc::new(HostSimulator));
    let mut pipeline = Pipeline::builder(TargetProfile::ethos_u55(), fixtures::add_program(), fixtures::self_add_sample())
        .availability(Arc::new(StaticAvailability::new().with("corstone-300", true)))
        .toolchain(Arc::new(toolchain))
        .run_on_hardware(true)
        .build()
        .unwrap();

    let result = pipeline.run().await.unwrap();
    assert_run_passed(&result);
    let partition = result.stage("partition").unwrap();
    assert_eq!(partition.diagnostics["delegate_target"], "ethos-u55-128");
    assert!(result.comparison.as_ref().unwrap().atol > 1e-3);
}

#[tokio::test]
async fn test_ethos_u_rejects_unquantized_graph() {
    let mut pipeline = builder(TargetProfile::ethos_u55()).build().unwrap();
    pipeline.remove_stage("quantize").unwrap();
    pipeline.remove_stage("check.quant_nodes").unwrap();

    let result = pipeline.run().await.unwrap();
    assert_run_failed_at(&result, "partition");
}

#[tokio::test]
async fn test_quantize_override_with_grafted_count() {
    let mut pipeline = builder(TargetProfile::quantized()).build().unwrap();
    let config = QuantizationConfig::symmetric_int8()
        .with_name("int32_activations")
        .with_activation_dtype(QuantDtype::Int32);
    pipeline
        .change_args("quantize", StageChange::Params(params(serde_json::json!({ "config": config }))))
        .unwrap();
    pipeline
        .insert_after(
            "quantize",
            StageSpec::new(
                "check_count.quant",
                Arc::new(CheckStage::count([(format!("torch.ops.{QUANTIZE_OP}"), 2)])),
            ),
        )
        .unwrap();

    assert_eq!(
        pipeline.sequence().get("quantize").unwrap().params["config"]["activation_dtype"],
        "int32"
    );
    let result = pipeline.run().await.unwrap();
    assert_run_passed(&result);
    assert_stage_status(&result, "check_count.quant", StageStatus::Passed);
    assert_stage_status(&result, "check_not.exir_quant_nodes", StageStatus::Passed);
}

#[tokio::test]
async fn test_quantized_run_on_reference_model() {
    let toolchain = Toolchain::default().with_simulator("tosa-reference-model", Arc::new(HostSimulator));
    let mut pipeline = Pipeline::builder(TargetProfile::quantized(), fixtures::add_program(), fixtures::self_add_sample())
        .availability(Arc::new(StaticAvailability::new().with("tosa-reference-model", true)))
        .toolchain(Arc::new(toolchain))
        .label("1d_range")
        .build()
        .unwrap();

    let result = pipeline.run().await.unwrap();
    assert_run_passed(&result);
    assert_eq!(result.label.as_deref(), Some("1d_range"));
    assert!(result.comparison.is_some());
}

#[tokio::test]
async fn test_mock_simulator_is_called_once() {
    let mut simulator = MockSimulator::new();
    simulator
        .expect_execute()
        .times(1)
        .returning(|_, ctx| Ok(ExecutionOutput::new("mock", ctx.program().forward(ctx.sample())?)));
    let toolchain = Toolchain::default().with_simulator(HOST, Arc::new(simulator));

    let mut pipeline = builder(TargetProfile::reference())
        .toolchain(Arc::new(toolchain))
        .build()
        .unwrap();
    let result = pipeline.run().await.unwrap();

    assert_run_passed(&result);
    assert_eq!(result.stage("run_method").unwrap().diagnostics["backend"], "mock");
}

#[tokio::test]
async fn test_failing_program_fails_export() {
    let program = Arc::new(FnProgram::new("broken", ["aten.add.Tensor"], |_| {
        anyhow::bail!("shape mismatch")
    }));
    let mut pipeline = Pipeline::builder(TargetProfile::reference(), program, fixtures::self_add_sample())
        .availability(Arc::new(StaticAvailability::new()))
        .build()
        .unwrap();

    let result = pipeline.run().await.unwrap();
    assert_run_failed_at(&result, "export");
    assert!(result.into_outcome().is_err());
}

#[tokio::test]
async fn test_event_stream() {
    let events = Arc::new(CollectingEventSink::new());
    let mut pipeline = builder(TargetProfile::reference())
        .event_sink(events.clone())
        .build()
        .unwrap();
    let result = pipeline.run().await.unwrap();

    let all = events.events();
    assert_eq!(all.first().map(|event| event.event_type), Some(EventType::PipelineStarted));
    assert_eq!(all.last().map(|event| event.event_type), Some(EventType::PipelineCompleted));
    let completed = events.stages_with(EventType::StageCompleted);
    assert_eq!(completed, result.stage_names());
}

#[test]
fn test_run_blocking() {
    let mut pipeline = reference();
    let result = tokio_test::block_on(pipeline.run()).unwrap();
    assert_run_passed(&result);
}

#[tokio::test]
async fn test_tolerance_without_compare_stage_is_ignored() {
    let tolerance = Tolerance::new(0.5, 0.0);
    let mut pipeline = builder(TargetProfile::ethos_u85()).tolerance(tolerance).build().unwrap();
    assert!(!pipeline.stage_names().contains(&"compare_outputs".to_string()));
    assert_run_passed(&pipeline.run().await.unwrap());

    let mut pipeline = builder(TargetProfile::ethos_u55())
        .availability(Arc::new(StaticAvailability::new().with("corstone-300", true)))
        .toolchain(Arc::new(Toolchain::default().with_simulator("corstone-300", Arc::new(HostSimulator))))
        .tolerance(tolerance)
        .run_on_hardware(true)
        .build()
        .unwrap();
    let result = pipeline.run().await.unwrap();
    assert_run_passed(&result);
    assert!((result.comparison.as_ref().unwrap().atol - 0.5).abs() < 1e-9);
}
