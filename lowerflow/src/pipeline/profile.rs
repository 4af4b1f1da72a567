//! Target profiles: declarative stage templates per lowering target.

use crate::config::{QuantizationConfig, Tolerance};
use crate::core::DELEGATE_OP;
use crate::errors::LowerflowError;
use crate::stages::{kinds, params, StageParams};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the full-precision TOSA profile.
pub const REFERENCE: &str = "reference";
/// Name of the int8 TOSA profile.
pub const QUANTIZED: &str = "quantized";
/// Name of the Ethos-U55 profile.
pub const ETHOS_U55: &str = "ethos-u55";
/// Name of the Ethos-U85 profile.
pub const ETHOS_U85: &str = "ethos-u85";

const TOSA_REFERENCE_MODEL: &str = "tosa-reference-model";

/// One stage of a profile template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateEntry {
    /// Stage name, unique within the template.
    pub name: String,
    /// Registry kind the stage is instantiated from.
    pub kind: String,
    /// Default parameters.
    #[serde(default)]
    pub defaults: StageParams,
    /// Dependency gating the stage.
    #[serde(default)]
    pub requires: Option<String>,
    /// Whether a missing dependency skips the whole run.
    #[serde(default)]
    pub required: bool,
    /// Only included when hardware execution is requested.
    #[serde(default)]
    pub hardware_only: bool,
}

impl TemplateEntry {
    /// Creates an entry with no parameters or gating.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            defaults: StageParams::new(),
            requires: None,
            required: false,
            hardware_only: false,
        }
    }

    /// Sets the default parameters.
    #[must_use]
    pub fn with_defaults(mut self, defaults: StageParams) -> Self {
        self.defaults = defaults;
        self
    }

    /// Gates the entry on `dependency` (no-op for `None`).
    #[must_use]
    pub fn requires(mut self, dependency: Option<impl Into<String>>) -> Self {
        self.requires = dependency.map(Into::into);
        self
    }

    /// Marks the dependency as required for the whole run.
    #[must_use]
    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// Restricts the entry to hardware runs.
    #[must_use]
    pub fn hardware_only(mut self, hardware_only: bool) -> Self {
        self.hardware_only = hardware_only;
        self
    }
}

/// Profile-wide defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileDefaults {
    /// Quantization applied by the `quantize` stage; `None` for float profiles.
    #[serde(default)]
    pub quantization: Option<QuantizationConfig>,
    /// Backend key in the toolchain.
    pub backend: String,
    /// Lowering target id.
    pub target: String,
    /// Simulator key in the toolchain.
    pub simulator: String,
    /// Execute hardware-only stages.
    #[serde(default)]
    pub run_on_hardware: bool,
    /// Comparison tolerance.
    #[serde(default)]
    pub tolerance: Tolerance,
}

/// A named stage template plus its defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetProfile {
    /// Profile name.
    pub name: String,
    /// Profile-wide defaults.
    pub defaults: ProfileDefaults,
    /// Ordered template entries.
    pub entries: Vec<TemplateEntry>,
}

impl TargetProfile {
    /// Creates a profile with no entries.
    #[must_use]
    pub fn new(name: impl Into<String>, defaults: ProfileDefaults) -> Self {
        Self {
            name: name.into(),
            defaults,
            entries: Vec::new(),
        }
    }

    /// Appends a template entry.
    #[must_use]
    pub fn with_entry(mut self, entry: TemplateEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Returns the entries instantiated for a run with or without hardware.
    pub fn active_entries(&self, run_on_hardware: bool) -> impl Iterator<Item = &TemplateEntry> {
        self.entries
            .iter()
            .filter(move |entry| run_on_hardware || !entry.hardware_only)
    }

    /// Returns the stage names instantiated for a run.
    #[must_use]
    pub fn stage_names(&self, run_on_hardware: bool) -> Vec<String> {
        self.active_entries(run_on_hardware)
            .map(|entry| entry.name.clone())
            .collect()
    }

    /// Full-precision TOSA, executed in-process.
    #[must_use]
    pub fn reference() -> Self {
        let defaults = ProfileDefaults {
            quantization: None,
            backend: "tosa".to_string(),
            target: "TOSA-0.80+MI".to_string(),
            simulator: crate::availability::HOST.to_string(),
            run_on_hardware: false,
            tolerance: Tolerance::default(),
        };
        standard(REFERENCE, defaults, Execution::Always)
    }

    /// Int8 TOSA, executed on the TOSA reference model when it is installed.
    #[must_use]
    pub fn quantized() -> Self {
        let defaults = ProfileDefaults {
            quantization: Some(QuantizationConfig::symmetric_int8()),
            backend: "tosa".to_string(),
            target: "TOSA-0.80+BI".to_string(),
            simulator: TOSA_REFERENCE_MODEL.to_string(),
            run_on_hardware: false,
            tolerance: Tolerance::default().with_qtol(1.0),
        };
        standard(QUANTIZED, defaults, Execution::WhenAvailable)
    }

    /// Ethos-U55, executed on Corstone-300 when hardware execution is requested.
    #[must_use]
    pub fn ethos_u55() -> Self {
        ethos_u(ETHOS_U55, "ethos-u55-128", "corstone-300")
    }

    /// Ethos-U85, executed on Corstone-320 when hardware execution is requested.
    #[must_use]
    pub fn ethos_u85() -> Self {
        ethos_u(ETHOS_U85, "ethos-u85-128", "corstone-320")
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Execution {
    Always,
    WhenAvailable,
    OnHardware,
}

fn ethos_u(name: &str, target: &str, simulator: &str) -> TargetProfile {
    let defaults = ProfileDefaults {
        quantization: Some(QuantizationConfig::symmetric_int8()),
        backend: name.to_string(),
        target: target.to_string(),
        simulator: simulator.to_string(),
        run_on_hardware: false,
        tolerance: Tolerance::default().with_qtol(1.0),
    };
    standard(name, defaults, Execution::OnHardware)
}

fn standard(name: &str, defaults: ProfileDefaults, execution: Execution) -> TargetProfile {
    let quantized = defaults.quantization.is_some();
    let dependency = match execution {
        Execution::Always => None,
        Execution::WhenAvailable | Execution::OnHardware => Some(defaults.simulator.clone()),
    };
    let on_hardware = execution == Execution::OnHardware;

    let mut entries = vec![
        TemplateEntry::new("export", kinds::EXPORT),
        TemplateEntry::new("check.aten", kinds::CHECK).with_defaults(params(serde_json::json!({ "patterns": [] }))),
    ];
    if let Some(config) = &defaults.quantization {
        entries.push(
            TemplateEntry::new("quantize", kinds::QUANTIZE)
                .with_defaults(params(serde_json::json!({ "config": config }))),
        );
        entries.push(
            TemplateEntry::new("check.quant_nodes", kinds::CHECK)
                .with_defaults(params(serde_json::json!({ "patterns": ["torch.ops.quantized_decomposed"] }))),
        );
    }
    entries.extend([
        TemplateEntry::new("to_edge", kinds::TO_EDGE),
        TemplateEntry::new("partition", kinds::PARTITION).with_defaults(params(serde_json::json!({
            "backend": defaults.backend,
            "target": defaults.target,
        }))),
        TemplateEntry::new("check_not.exir", kinds::CHECK_NOT)
            .with_defaults(params(serde_json::json!({ "patterns": [] }))),
        TemplateEntry::new("check_count.exir", kinds::CHECK_COUNT)
            .with_defaults(params(serde_json::json!({ "counts": { (DELEGATE_OP): 1 } }))),
    ]);
    if quantized {
        entries.push(
            TemplateEntry::new("check_not.exir_quant_nodes", kinds::CHECK_NOT).with_defaults(params(
                serde_json::json!({ "patterns": ["executorch_exir_dialects_edge__ops_quantized_decomposed"] }),
            )),
        );
    }
    entries.extend([
        TemplateEntry::new("to_executorch", kinds::SERIALIZE)
            .with_defaults(params(serde_json::json!({ "target": defaults.target }))),
        TemplateEntry::new("run_method", kinds::RUN_METHOD)
            .with_defaults(params(serde_json::json!({ "simulator": defaults.simulator })))
            .requires(dependency.clone())
            .required(on_hardware)
            .hardware_only(on_hardware),
        TemplateEntry::new("compare_outputs", kinds::COMPARE_OUTPUTS)
            .with_defaults(params(serde_json::json!({
                "atol": defaults.tolerance.atol,
                "rtol": defaults.tolerance.rtol,
                "qtol": defaults.tolerance.qtol,
            })))
            .requires(dependency)
            .hardware_only(on_hardware),
    ]);

    TargetProfile {
        name: name.to_string(),
        defaults,
        entries,
    }
}

/// Named profiles available to pipelines.
#[derive(Debug, Clone, Default)]
pub struct ProfileCatalog {
    profiles: BTreeMap<String, TargetProfile>,
}

impl ProfileCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a catalog with the built-in profiles.
    #[must_use]
    pub fn builtin() -> Self {
        Self::new()
            .with_profile(TargetProfile::reference())
            .with_profile(TargetProfile::quantized())
            .with_profile(TargetProfile::ethos_u55())
            .with_profile(TargetProfile::ethos_u85())
    }

    /// Registers (or replaces) a profile.
    pub fn register(&mut self, profile: TargetProfile) -> Option<TargetProfile> {
        self.profiles.insert(profile.name.clone(), profile)
    }

    /// Registers a profile, builder style.
    #[must_use]
    pub fn with_profile(mut self, profile: TargetProfile) -> Self {
        self.register(profile);
        self
    }

    /// Returns the profile called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`LowerflowError::UnknownProfile`] if it is not registered.
    pub fn get(&self, name: &str) -> Result<&TargetProfile, LowerflowError> {
        self.profiles
            .get(name)
            .ok_or_else(|| LowerflowError::UnknownProfile(name.to_string()))
    }

    /// Returns the profile names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }
}
