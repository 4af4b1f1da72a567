//! Ordered, uniquely named stage slots.

use super::{StageChange, StageRegistry, StageSpec, TargetProfile, Toolchain};
use crate::errors::{DuplicateStageNameError, LowerflowError, UnknownStageError};
use crate::stages::merge_params;
use std::collections::HashMap;

/// The ordered stage list of a pipeline.
///
/// Names are unique. Every mutation either succeeds completely or leaves
/// the sequence untouched.
#[derive(Debug, Clone, Default)]
pub struct StageSequence {
    stages: Vec<StageSpec>,
}

impl StageSequence {
    /// Creates an empty sequence.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sequence from `specs` in order.
    ///
    /// # Errors
    ///
    /// Returns an error if two specs share a name.
    pub fn from_specs(specs: impl IntoIterator<Item = StageSpec>) -> Result<Self, LowerflowError> {
        let mut sequence = Self::new();
        for spec in specs {
            sequence.push(spec)?;
        }
        Ok(sequence)
    }

    /// Instantiates the template of `profile`.
    ///
    /// Hardware-only entries are left out unless the profile's defaults
    /// request hardware execution. An override replaces the entry's runner,
    /// its whole slot, or patches its default parameters. Template gating is
    /// kept unless the whole slot is replaced.
    ///
    /// # Errors
    ///
    /// Returns an error if an override names a stage the template does not
    /// produce, or a stage cannot be instantiated.
    pub fn build(
        profile: &TargetProfile,
        registry: &StageRegistry,
        toolchain: &Toolchain,
        mut overrides: HashMap<String, StageChange>,
    ) -> Result<Self, LowerflowError> {
        let mut sequence = Self::new();
        for entry in profile.active_entries(profile.defaults.run_on_hardware) {
            let spec = match overrides.remove(&entry.name) {
                Some(StageChange::Spec(spec)) => StageSpec {
                    name: entry.name.clone(),
                    ..spec
                },
                change => {
                    let mut spec = match change {
                        Some(StageChange::Stage(runner)) => {
                            StageSpec::new(&entry.name, runner).with_params(entry.defaults.clone())
                        }
                        Some(StageChange::Params(patch)) => StageSpec::from_registry(
                            &entry.name,
                            &entry.kind,
                            merge_params(&entry.defaults, &patch),
                            registry,
                            toolchain,
                        )?,
                        _ => StageSpec::from_registry(
                            &entry.name,
                            &entry.kind,
                            entry.defaults.clone(),
                            registry,
                            toolchain,
                        )?,
                    };
                    spec.requires.clone_from(&entry.requires);
                    spec.required = entry.required;
                    spec
                }
            };
            sequence.push(spec)?;
        }

        let mut unused: Vec<String> = overrides.into_keys().collect();
        unused.sort();
        if let Some(name) = unused.into_iter().next() {
            return Err(UnknownStageError::new(name, sequence.names()).into());
        }
        Ok(sequence)
    }

    /// Appends a slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is already taken.
    pub fn push(&mut self, spec: StageSpec) -> Result<(), LowerflowError> {
        self.ensure_unique(&spec.name)?;
        self.stages.push(spec);
        Ok(())
    }

    /// Replaces the slot called `name`. The slot keeps its name and position.
    ///
    /// # Errors
    ///
    /// Returns an error if no slot is called `name`.
    pub fn replace(&mut self, name: &str, mut spec: StageSpec) -> Result<StageSpec, LowerflowError> {
        let index = self.position_or_err(name)?;
        spec.name = name.to_string();
        Ok(std::mem::replace(&mut self.stages[index], spec))
    }

    /// Inserts `spec` immediately before `anchor`.
    ///
    /// # Errors
    ///
    /// Returns an error if `anchor` is unknown or `spec`'s name is taken.
    pub fn insert_before(&mut self, anchor: &str, spec: StageSpec) -> Result<(), LowerflowError> {
        let index = self.position_or_err(anchor)?;
        self.ensure_unique(&spec.name)?;
        self.stages.insert(index, spec);
        Ok(())
    }

    /// Inserts `spec` immediately after `anchor`.
    ///
    /// # Errors
    ///
    /// Returns an error if `anchor` is unknown or `spec`'s name is taken.
    pub fn insert_after(&mut self, anchor: &str, spec: StageSpec) -> Result<(), LowerflowError> {
        let index = self.position_or_err(anchor)?;
        self.ensure_unique(&spec.name)?;
        self.stages.insert(index + 1, spec);
        Ok(())
    }

    /// Removes and returns the slot called `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if no slot is called `name`.
    pub fn remove(&mut self, name: &str) -> Result<StageSpec, LowerflowError> {
        let index = self.position_or_err(name)?;
        Ok(self.stages.remove(index))
    }

    /// Returns the slot called `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|spec| spec.name == name)
    }

    /// Returns the index of `name`.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|spec| spec.name == name)
    }

    /// Returns true if a slot is called `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Returns the slot names in order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.stages.iter().map(|spec| spec.name.clone()).collect()
    }

    /// Iterates over the slots in order.
    pub fn iter(&self) -> impl Iterator<Item = &StageSpec> {
        self.stages.iter()
    }

    /// Returns the number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if there are no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    fn position_or_err(&self, name: &str) -> Result<usize, LowerflowError> {
        self.position(name)
            .ok_or_else(|| UnknownStageError::new(name, self.names()).into())
    }

    fn ensure_unique(&self, name: &str) -> Result<(), LowerflowError> {
        if self.contains(name) {
            return Err(DuplicateStageNameError::new(name).into());
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a StageSequence {
    type Item = &'a StageSpec;
    type IntoIter = std::slice::Iter<'a, StageSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.stages.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::{kinds, params, StageParams};
    use crate::testing::mocks::RecordingStage;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn spec(name: &str) -> StageSpec {
        StageSpec::new(name, Arc::new(RecordingStage::new(name)))
    }

    fn sequence() -> StageSequence {
        StageSequence::from_specs([spec("export"), spec("to_edge"), spec("to_executorch")]).unwrap()
    }

    #[test]
    fn test_insert_after() {
        let mut seq = sequence();
        seq.insert_after("export", spec("check")).unwrap();
        assert_eq!(seq.names(), vec!["export", "check", "to_edge", "to_executorch"]);

        seq.insert_after("to_executorch", spec("tail")).unwrap();
        assert_eq!(seq.names().last().map(String::as_str), Some("tail"));
    }

    #[test]
    fn test_insert_before() {
        let mut seq = sequence();
        seq.insert_before("export", spec("head")).unwrap();
        assert_eq!(seq.names(), vec!["head", "export", "to_edge", "to_executorch"]);
    }

    #[test]
    fn test_unknown_anchor_leaves_sequence_unchanged() {
        let mut seq = sequence();
        let err = seq.insert_after("quantise", spec("check")).unwrap_err();

        match err {
            LowerflowError::UnknownStage(err) => {
                assert_eq!(err.name, "quantise");
                assert_eq!(err.available, vec!["export", "to_edge", "to_executorch"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(seq.names(), vec!["export", "to_edge", "to_executorch"]);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut seq = sequence();
        let err = seq.insert_before("to_edge", spec("export")).unwrap_err();

        assert!(matches!(err, LowerflowError::DuplicateStageName(_)));
        assert_eq!(seq.len(), 3);
        assert!(StageSequence::from_specs([spec("a"), spec("a")]).is_err());
    }

    #[test]
    fn test_replace_keeps_name_and_position() {
        let mut seq = sequence();
        let old = seq.replace("to_edge", spec("something_else")).unwrap();

        assert_eq!(old.name, "to_edge");
        assert_eq!(seq.names(), vec!["export", "to_edge", "to_executorch"]);
        assert!(seq.replace("missing", spec("x")).is_err());
    }

    #[test]
    fn test_build_follows_template() {
        let profile = TargetProfile::reference();
        let seq = StageSequence::build(&profile, &StageRegistry::builtin(), &Toolchain::default(), HashMap::new()).unwrap();

        assert_eq!(seq.names(), profile.stage_names(false));
        assert_eq!(seq.get("partition").unwrap().kind_id.as_deref(), Some(kinds::PARTITION));
    }

    #[test]
    fn test_build_applies_overrides() {
        let profile = TargetProfile::quantized();
        let mut overrides = HashMap::new();
        overrides.insert(
            "compare_outputs".to_string(),
            StageChange::Params(params(serde_json::json!({"atol": 0.5}))),
        );
        overrides.insert("export".to_string(), StageChange::Stage(Arc::new(RecordingStage::new("export"))));

        let seq = StageSequence::build(&profile, &StageRegistry::builtin(), &Toolchain::default(), overrides).unwrap();
        let compare = seq.get("compare_outputs").unwrap();
        assert_eq!(compare.params["atol"], 0.5);
        assert_eq!(compare.params["qtol"], 1.0);
        assert_eq!(compare.requires.as_deref(), Some("tosa-reference-model"));
        assert!(seq.get("export").unwrap().kind_id.is_none());
    }

    #[test]
    fn test_build_rejects_unknown_override() {
        let mut overrides = HashMap::new();
        overrides.insert("quantize".to_string(), StageChange::Params(StageParams::new()));

        let err = StageSequence::build(
            &TargetProfile::reference(),
            &StageRegistry::builtin(),
            &Toolchain::default(),
            overrides,
        )
        .unwrap_err();
        assert!(matches!(err, LowerflowError::UnknownStage(ref err) if err.name == "quantize"));
    }

    #[test]
    fn test_build_includes_hardware_stages_on_request() {
        let mut profile = TargetProfile::ethos_u85();
        let registry = StageRegistry::builtin();
        let toolchain = Toolchain::default();

        let seq = StageSequence::build(&profile, &registry, &toolchain, HashMap::new()).unwrap();
        assert!(!seq.contains("run_method"));

        profile.defaults.run_on_hardware = true;
        let seq = StageSequence::build(&profile, &registry, &toolchain, HashMap::new()).unwrap();
        let run = seq.get("run_method").unwrap();
        assert!(run.required);
        assert_eq!(run.requires.as_deref(), Some("corstone-320"));
    }

    #[test]
    fn test_remove() {
        let mut seq = sequence();
        let removed = seq.remove("to_edge").unwrap();

        assert_eq!(removed.name, "to_edge");
        assert_eq!(seq.names(), vec!["export", "to_executorch"]);
        assert!(seq.remove("to_edge").is_err());
    }
}
