//! Pipeline lifecycle events for observability.
//!
//! The pipeline emits one event when a run starts, one per stage outcome
//! and one when the run finishes. Sinks decide what to do with them.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// A run started.
    #[serde(rename = "pipeline.started")]
    PipelineStarted,
    /// A stage is about to execute.
    #[serde(rename = "stage.started")]
    StageStarted,
    /// A stage passed.
    #[serde(rename = "stage.completed")]
    StageCompleted,
    /// A stage was skipped.
    #[serde(rename = "stage.skipped")]
    StageSkipped,
    /// A stage failed.
    #[serde(rename = "stage.failed")]
    StageFailed,
    /// A run finished, whatever its status.
    #[serde(rename = "pipeline.completed")]
    PipelineCompleted,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PipelineStarted => "pipeline.started",
            Self::StageStarted => "stage.started",
            Self::StageCompleted => "stage.completed",
            Self::StageSkipped => "stage.skipped",
            Self::StageFailed => "stage.failed",
            Self::PipelineCompleted => "pipeline.completed",
        };
        f.write_str(name)
    }
}

/// A lifecycle event with its JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// The event kind.
    pub event_type: EventType,
    /// Stage the event refers to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Event payload.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl PipelineEvent {
    /// Creates a pipeline-level event.
    #[must_use]
    pub fn pipeline(event_type: EventType, data: serde_json::Value) -> Self {
        Self {
            event_type,
            stage: None,
            data,
        }
    }

    /// Creates a stage-level event.
    #[must_use]
    pub fn stage(event_type: EventType, stage: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type,
            stage: Some(stage.into()),
            data,
        }
    }
}
