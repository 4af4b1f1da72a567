//! Running one pipeline per labelled sample.

use super::{Pipeline, RunResult};
use crate::core::Sample;
use crate::errors::LowerflowError;
use crate::program::SampleSet;
use futures::future::join_all;
use std::sync::Arc;
use tracing::info;

/// Outcome of one labelled run in a sweep.
pub type SweepOutcome = (String, Result<RunResult, LowerflowError>);

/// Builds a pipeline per sample with `make` and runs them concurrently.
///
/// Outcomes come back in label order. A pipeline that fails to build is
/// reported for its label; the other samples still run.
pub async fn run_sample_set<F>(samples: &SampleSet, mut make: F) -> Vec<SweepOutcome>
where
    F: FnMut(&str, Arc<Sample>) -> Result<Pipeline, LowerflowError>,
{
    let pipelines: Vec<(String, Result<Pipeline, LowerflowError>)> = samples
        .iter()
        .map(|(label, sample)| (label.to_string(), make(label, Arc::clone(sample))))
        .collect();
    info!(samples = pipelines.len(), "Running sample set");

    join_all(pipelines.into_iter().map(|(label, pipeline)| async move {
        let outcome = match pipeline {
            Ok(mut pipeline) => pipeline.run().await,
            Err(err) => Err(err),
        };
        (label, outcome)
    }))
    .await
}
