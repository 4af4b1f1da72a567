//! Configuration types: comparison tolerances, quantization policies and
//! availability probing.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

/// Environment variable listing extra directories searched for simulator
/// executables (platform path-list syntax).
pub const SIMULATOR_PATH_ENV: &str = "LOWERFLOW_SIMULATOR_PATH";
/// Environment variable listing dependencies forced available (comma separated).
pub const FORCE_AVAILABLE_ENV: &str = "LOWERFLOW_FORCE_AVAILABLE";
/// Environment variable listing dependencies forced unavailable (comma separated).
pub const FORCE_UNAVAILABLE_ENV: &str = "LOWERFLOW_FORCE_UNAVAILABLE";

/// Numeric comparison tolerance.
///
/// An element passes if `|candidate - reference| <= atol + qtol * scale + rtol * |reference|`,
/// where `scale` is the output quantization scale reported by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    /// Absolute tolerance.
    #[serde(default = "default_atol")]
    pub atol: f64,
    /// Relative tolerance.
    #[serde(default = "default_rtol")]
    pub rtol: f64,
    /// Additional absolute tolerance in quantization steps.
    #[serde(default)]
    pub qtol: f64,
}

fn default_atol() -> f64 {
    1e-3
}

fn default_rtol() -> f64 {
    1e-3
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            atol: default_atol(),
            rtol: default_rtol(),
            qtol: 0.0,
        }
    }
}

impl Tolerance {
    /// Creates a tolerance with no quantization allowance.
    #[must_use]
    pub fn new(atol: f64, rtol: f64) -> Self {
        Self { atol, rtol, qtol: 0.0 }
    }

    /// Sets the allowance in quantization steps.
    #[must_use]
    pub fn with_qtol(mut self, qtol: f64) -> Self {
        self.qtol = qtol;
        self
    }

    /// Returns the absolute tolerance including the quantization allowance.
    #[must_use]
    pub fn effective_atol(&self, quantization_scale: Option<f64>) -> f64 {
        quantization_scale.map_or(self.atol, |scale| self.atol + self.qtol * scale)
    }
}

/// Integer type used for quantized values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantDtype {
    /// 8-bit integers.
    #[default]
    Int8,
    /// 16-bit integers.
    Int16,
    /// 32-bit integers.
    Int32,
}

impl QuantDtype {
    /// Largest representable magnitude for symmetric quantization.
    #[must_use]
    pub fn qmax(self) -> f64 {
        match self {
            Self::Int8 => f64::from(i8::MAX),
            Self::Int16 => f64::from(i16::MAX),
            Self::Int32 => f64::from(i32::MAX),
        }
    }
}

/// Quantization policy handed to the quantizer unmodified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationConfig {
    /// Human-readable policy name.
    pub name: String,
    /// Activation integer type.
    #[serde(default)]
    pub activation_dtype: QuantDtype,
    /// Weight integer type.
    #[serde(default)]
    pub weight_dtype: QuantDtype,
    /// Symmetric (zero point 0) or affine quantization.
    #[serde(default = "default_symmetric")]
    pub symmetric: bool,
    /// Only quantize graph inputs and outputs.
    #[serde(default)]
    pub io_only: bool,
    /// Quantizer-specific options, passed through untouched.
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

fn default_symmetric() -> bool {
    true
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self::symmetric_int8()
    }
}

impl QuantizationConfig {
    /// Symmetric per-tensor int8 quantization, the default for quantized profiles.
    #[must_use]
    pub fn symmetric_int8() -> Self {
        Self {
            name: "symmetric_int8".to_string(),
            activation_dtype: QuantDtype::Int8,
            weight_dtype: QuantDtype::Int8,
            symmetric: true,
            io_only: false,
            options: serde_json::Map::new(),
        }
    }

    /// Sets the policy name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the activation integer type.
    #[must_use]
    pub fn with_activation_dtype(mut self, dtype: QuantDtype) -> Self {
        self.activation_dtype = dtype;
        self
    }

    /// Restricts quantization to graph inputs and outputs.
    #[must_use]
    pub fn io_only(mut self) -> Self {
        self.io_only = true;
        self
    }

    /// Adds a quantizer-specific option.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }
}

/// How availability probes locate external simulators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityConfig {
    /// Executable looked up for each dependency key.
    #[serde(default = "default_binaries")]
    pub binaries: HashMap<String, String>,
    /// Directories searched before `PATH`.
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,
    /// Dependencies reported available without probing.
    #[serde(default)]
    pub forced_available: HashSet<String>,
    /// Dependencies reported unavailable without probing.
    #[serde(default)]
    pub forced_unavailable: HashSet<String>,
}

fn default_binaries() -> HashMap<String, String> {
    [
        ("tosa-reference-model", "tosa_reference_model"),
        ("corstone-300", "FVP_Corstone_SSE-300_Ethos-U55"),
        ("corstone-320", "FVP_Corstone_SSE-320"),
    ]
    .into_iter()
    .map(|(dep, binary)| (dep.to_string(), binary.to_string()))
    .collect()
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self {
            binaries: default_binaries(),
            search_paths: Vec::new(),
            forced_available: HashSet::new(),
            forced_unavailable: HashSet::new(),
        }
    }
}

impl AvailabilityConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads overrides from the environment on top of the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(paths) = std::env::var_os(SIMULATOR_PATH_ENV) {
            config.search_paths = std::env::split_paths(&paths).collect();
        }
        if let Ok(list) = std::env::var(FORCE_AVAILABLE_ENV) {
            config.forced_available = parse_list(&list);
        }
        if let Ok(list) = std::env::var(FORCE_UNAVAILABLE_ENV) {
            config.forced_unavailable = parse_list(&list);
        }
        config
    }

    /// Sets the executable probed for `dependency`.
    #[must_use]
    pub fn with_binary(mut self, dependency: impl Into<String>, binary: impl Into<String>) -> Self {
        self.binaries.insert(dependency.into(), binary.into());
        self
    }

    /// Adds a directory searched before `PATH`.
    #[must_use]
    pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_paths.push(path.into());
        self
    }
}

fn parse_list(list: &str) -> HashSet<String> {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tolerance_defaults() {
        let tol = Tolerance::default();
        assert!((tol.atol - 1e-3).abs() < f64::EPSILON);
        assert!((tol.rtol - 1e-3).abs() < f64::EPSILON);
        assert!(tol.qtol.abs() < f64::EPSILON);
    }

    #[test]
    fn test_tolerance_partial_json() {
        let tol: Tolerance = serde_json::from_str(r#"{"atol": 0.5}"#).unwrap();
        assert!((tol.atol - 0.5).abs() < f64::EPSILON);
        assert!((tol.rtol - 1e-3).abs() < f64::EPSILON);
    }

    #[test]
    fn test_effective_atol() {
        let tol = Tolerance::new(0.01, 0.0).with_qtol(2.0);
        assert!((tol.effective_atol(None) - 0.01).abs() < f64::EPSILON);
        assert!((tol.effective_atol(Some(0.5)) - 1.01).abs() < 1e-12);
    }

    #[test]
    fn test_quantization_config_roundtrip_keeps_options() {
        let config = QuantizationConfig::symmetric_int8()
            .with_name("int32_activations")
            .with_activation_dtype(QuantDtype::Int32)
            .with_option("eps", serde_json::json!(1.52e-5));

        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["activation_dtype"], "int32");

        let back: QuantizationConfig = serde_json::from_value(value).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_qmax() {
        assert!((QuantDtype::Int8.qmax() - 127.0).abs() < f64::EPSILON);
        assert!((QuantDtype::Int32.qmax() - 2_147_483_647.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_list() {
        let items = parse_list(" corstone-300, ,tosa-reference-model ");
        assert_eq!(items.len(), 2);
        assert!(items.contains("corstone-300"));
    }

    #[test]
    fn test_availability_defaults() {
        let config = AvailabilityConfig::new().with_search_path("/opt/fvp/bin");
        assert_eq!(
            config.binaries.get("corstone-320").map(String::as_str),
            Some("FVP_Corstone_SSE-320")
        );
        assert_eq!(config.search_paths.len(), 1);
    }
}
