//! Stage slots and the changes that can be applied to them.

use super::registry::{StageRegistry, Toolchain};
use crate::core::StageKind;
use crate::errors::LowerflowError;
use crate::stages::{merge_params, Stage, StageParams};
use std::sync::Arc;

/// A named slot in a pipeline.
#[derive(Debug, Clone)]
pub struct StageSpec {
    /// The unique name of the slot.
    pub name: String,
    /// The stage implementation.
    pub runner: Arc<dyn Stage>,
    /// Parameters the runner was instantiated with.
    pub params: StageParams,
    /// Registry kind the runner was created from; `None` for caller-supplied runners.
    pub kind_id: Option<String>,
    /// External dependency that must be available for the slot to run.
    pub requires: Option<String>,
    /// Whether a missing dependency ends the run as skipped instead of
    /// skipping only this slot.
    pub required: bool,
}

impl StageSpec {
    /// Creates a slot for a caller-supplied runner.
    #[must_use]
    pub fn new(name: impl Into<String>, runner: Arc<dyn Stage>) -> Self {
        Self {
            name: name.into(),
            runner,
            params: StageParams::new(),
            kind_id: None,
            requires: None,
            required: false,
        }
    }

    /// Instantiates a slot from the registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the kind is unknown or the parameters are invalid.
    pub fn from_registry(
        name: impl Into<String>,
        kind_id: impl Into<String>,
        params: StageParams,
        registry: &StageRegistry,
        toolchain: &Toolchain,
    ) -> Result<Self, LowerflowError> {
        let kind_id = kind_id.into();
        let runner = registry.create(&kind_id, &params, toolchain)?;
        Ok(Self {
            name: name.into(),
            runner,
            params,
            kind_id: Some(kind_id),
            requires: None,
            required: false,
        })
    }

    /// Sets the parameters recorded on the slot.
    #[must_use]
    pub fn with_params(mut self, params: StageParams) -> Self {
        self.params = params;
        self
    }

    /// Gates the slot on an external dependency.
    #[must_use]
    pub fn requires(mut self, dependency: impl Into<String>) -> Self {
        self.requires = Some(dependency.into());
        self
    }

    /// Marks the slot's dependency as required for the whole run.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Returns the runner's stage kind.
    #[must_use]
    pub fn kind(&self) -> StageKind {
        self.runner.kind()
    }
}

/// A change applied to an existing slot.
#[derive(Debug, Clone)]
pub enum StageChange {
    /// Swap in a new runner; name, parameters and gating stay.
    Stage(Arc<dyn Stage>),
    /// Replace the whole slot. The slot keeps its name.
    Spec(StageSpec),
    /// Merge parameters over the slot's current ones and re-instantiate the
    /// runner from the registry.
    Params(StageParams),
}

impl StageChange {
    /// Merges two changes to the same slot; parameter patches combine,
    /// anything else replaces.
    #[must_use]
    pub fn then(self, next: Self) -> Self {
        match (self, next) {
            (Self::Params(first), Self::Params(second)) => Self::Params(merge_params(&first, &second)),
            (_, next) => next,
        }
    }

    /// Applies the change to `slot`, returning the replacement slot.
    ///
    /// # Errors
    ///
    /// Returns an error if a parameter change targets a slot that was not
    /// created from the registry, or the merged parameters are invalid.
    pub fn apply_to(
        self,
        slot: &StageSpec,
        registry: &StageRegistry,
        toolchain: &Toolchain,
    ) -> Result<StageSpec, LowerflowError> {
        match self {
            Self::Stage(runner) => Ok(StageSpec {
                runner,
                kind_id: None,
                ..slot.clone()
            }),
            Self::Spec(spec) => Ok(StageSpec {
                name: slot.name.clone(),
                ..spec
            }),
            Self::Params(patch) => {
                let Some(kind_id) = slot.kind_id.as_deref() else {
                    return Err(LowerflowError::invalid_params(
                        &slot.name,
                        "slot has a caller-supplied runner; replace the stage instead",
                    ));
                };
                let params = merge_params(&slot.params, &patch);
                let runner = registry.create(kind_id, &params, toolchain)?;
                Ok(StageSpec {
                    runner,
                    params,
                    ..slot.clone()
                })
            }
        }
    }
}
