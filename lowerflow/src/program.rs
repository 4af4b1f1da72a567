//! Programs under test and the labelled samples they are run on.

use crate::core::{Sample, Tensor};
use crate::errors::LowerflowError;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

/// A computational graph under test.
///
/// The pipeline never inspects a program beyond this trait: exporters read
/// its operator list, the reference output comes from `forward`.
pub trait Program: Send + Sync + Debug {
    /// Returns the program name.
    fn name(&self) -> &str;

    /// Runs the program on one input tuple.
    ///
    /// # Errors
    ///
    /// Returns an error if the inputs are not valid for this program.
    fn forward(&self, inputs: &[Tensor]) -> anyhow::Result<Vec<Tensor>>;

    /// Canonical operator identifiers the program is built from, in
    /// execution order (e.g. `aten.add.Tensor`).
    fn operators(&self) -> Vec<String>;
}

type ForwardFn = dyn Fn(&[Tensor]) -> anyhow::Result<Vec<Tensor>> + Send + Sync;

/// A program backed by a closure.
#[derive(Clone)]
pub struct FnProgram {
    name: String,
    operators: Vec<String>,
    func: Arc<ForwardFn>,
}

impl FnProgram {
    /// Creates a closure-backed program.
    pub fn new<F>(
        name: impl Into<String>,
        operators: impl IntoIterator<Item = impl Into<String>>,
        func: F,
    ) -> Self
    where
        F: Fn(&[Tensor]) -> anyhow::Result<Vec<Tensor>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            operators: operators.into_iter().map(Into::into).collect(),
            func: Arc::new(func),
        }
    }
}

impl Debug for FnProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnProgram")
            .field("name", &self.name)
            .field("operators", &self.operators)
            .finish()
    }
}

impl Program for FnProgram {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, inputs: &[Tensor]) -> anyhow::Result<Vec<Tensor>> {
        (self.func)(inputs)
    }

    fn operators(&self) -> Vec<String> {
        self.operators.clone()
    }
}

/// Labelled input samples for parametrized runs.
#[derive(Debug, Clone, Default)]
pub struct SampleSet {
    samples: BTreeMap<String, Arc<Sample>>,
}

impl SampleSet {
    /// Creates an empty sample set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sample.
    ///
    /// # Errors
    ///
    /// Returns an error if the label is already present.
    pub fn insert(&mut self, label: impl Into<String>, sample: Sample) -> Result<(), LowerflowError> {
        let label = label.into();
        if self.samples.contains_key(&label) {
            return Err(LowerflowError::DuplicateSampleLabel(label));
        }
        self.samples.insert(label, Arc::new(sample));
        Ok(())
    }

    /// Adds a sample, builder style.
    ///
    /// # Errors
    ///
    /// Returns an error if the label is already present.
    pub fn with_sample(mut self, label: impl Into<String>, sample: Sample) -> Result<Self, LowerflowError> {
        self.insert(label, sample)?;
        Ok(self)
    }

    /// Returns the sample for `label`.
    #[must_use]
    pub fn get(&self, label: &str) -> Option<&Arc<Sample>> {
        self.samples.get(label)
    }

    /// Iterates over `(label, sample)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<Sample>)> {
        self.samples.iter().map(|(label, sample)| (label.as_str(), sample))
    }

    /// Returns the labels.
    #[must_use]
    pub fn labels(&self) -> Vec<&str> {
        self.samples.keys().map(String::as_str).collect()
    }

    /// Returns the number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns true if the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
