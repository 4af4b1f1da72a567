//! Fixture programs and samples.

use crate::core::{Sample, Tensor};
use crate::program::{FnProgram, Program, SampleSet};
use crate::stages::{ReferenceOutputs, StageContext};
use std::sync::Arc;

/// A program adding its inputs: `x + x` for one input, `x + y` for two.
#[must_use]
pub fn add_program() -> Arc<dyn Program> {
    Arc::new(FnProgram::new("add", ["aten.add.Tensor"], |inputs| match inputs {
        [x] => Ok(vec![x.zip_with(x, |a, b| a + b)?]),
        [x, y] => Ok(vec![x.zip_with(y, |a, b| a + b)?]),
        _ => anyhow::bail!("add takes one or two inputs, got {}", inputs.len()),
    }))
}

/// The sample `[1.0, 2.0, 3.0]`; [`add_program`] maps it to `[2.0, 4.0, 6.0]`.
#[must_use]
pub fn self_add_sample() -> Sample {
    vec![Tensor::from_vec(vec![1.0, 2.0, 3.0])]
}

/// A few labelled single-input samples.
#[must_use]
pub fn add_samples() -> SampleSet {
    let mut samples = SampleSet::new();
    let cases = [
        ("1d_ones", Tensor::ones(vec![8])),
        ("1d_range", Tensor::from_vec(vec![1.0, 2.0, 3.0])),
        ("2d_half", Tensor::full(vec![4, 4], 0.5)),
        ("4d_negative", Tensor::full(vec![1, 2, 2, 2], -1.25)),
    ];
    for (label, tensor) in cases {
        // Labels above are distinct.
        let _ = samples.insert(label, vec![tensor]);
    }
    samples
}

/// A stage context for `stage` running [`add_program`] on [`self_add_sample`].
#[must_use]
pub fn stage_context(stage: &str) -> StageContext {
    StageContext::new(
        stage,
        "reference",
        add_program(),
        Arc::new(self_add_sample()),
        Arc::new(ReferenceOutputs::new()),
    )
}
