//! Stage factories and the collaborators they are built from.

use crate::availability::HOST;
use crate::config::{AvailabilityConfig, QuantizationConfig, Tolerance};
use crate::errors::LowerflowError;
use crate::stages::{
    kinds, parse_params, Backend, CheckStage, CompareStage, ExportStage, Exporter, HostSimulator,
    OperatorSupportBackend, PartitionStage, ProcessSimulator, QuantizeStage, Quantizer, RunStage,
    SerializeStage, Simulator, Stage, StageParams, SymmetricQuantizer, ToEdgeStage, TracingExporter,
};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::Arc;

/// The external collaborators stages delegate to.
#[derive(Clone)]
pub struct Toolchain {
    exporter: Arc<dyn Exporter>,
    quantizer: Arc<dyn Quantizer>,
    backends: HashMap<String, Arc<dyn Backend>>,
    simulators: HashMap<String, Arc<dyn Simulator>>,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self::from_config(&AvailabilityConfig::from_env())
    }
}

impl Debug for Toolchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut backends: Vec<_> = self.backends.keys().collect();
        backends.sort();
        let mut simulators: Vec<_> = self.simulators.keys().collect();
        simulators.sort();
        f.debug_struct("Toolchain")
            .field("exporter", &self.exporter)
            .field("quantizer", &self.quantizer)
            .field("backends", &backends)
            .field("simulators", &simulators)
            .finish()
    }
}

impl Toolchain {
    /// Builds the default toolchain. Simulator processes are located the
    /// same way availability probes locate them.
    #[must_use]
    pub fn from_config(config: &AvailabilityConfig) -> Self {
        let mut toolchain = Self {
            exporter: Arc::new(TracingExporter),
            quantizer: Arc::new(SymmetricQuantizer),
            backends: HashMap::new(),
            simulators: HashMap::new(),
        }
        .with_backend("tosa", Arc::new(OperatorSupportBackend::tosa()))
        .with_backend("ethos-u55", Arc::new(OperatorSupportBackend::ethos_u("ethos-u55")))
        .with_backend("ethos-u85", Arc::new(OperatorSupportBackend::ethos_u("ethos-u85")))
        .with_simulator(HOST, Arc::new(HostSimulator));

        for (dependency, binary) in &config.binaries {
            let simulator = ProcessSimulator::new(dependency.clone(), binary.clone())
                .with_search_paths(config.search_paths.clone());
            toolchain.simulators.insert(dependency.clone(), Arc::new(simulator));
        }
        toolchain
    }

    /// Sets the exporter.
    #[must_use]
    pub fn with_exporter(mut self, exporter: Arc<dyn Exporter>) -> Self {
        self.exporter = exporter;
        self
    }

    /// Sets the quantizer.
    #[must_use]
    pub fn with_quantizer(mut self, quantizer: Arc<dyn Quantizer>) -> Self {
        self.quantizer = quantizer;
        self
    }

    /// Registers a backend under `key`.
    #[must_use]
    pub fn with_backend(mut self, key: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        self.backends.insert(key.into(), backend);
        self
    }

    /// Registers a simulator under `key`.
    #[must_use]
    pub fn with_simulator(mut self, key: impl Into<String>, simulator: Arc<dyn Simulator>) -> Self {
        self.simulators.insert(key.into(), simulator);
        self
    }

    /// Returns the exporter.
    #[must_use]
    pub fn exporter(&self) -> Arc<dyn Exporter> {
        Arc::clone(&self.exporter)
    }

    /// Returns the quantizer.
    #[must_use]
    pub fn quantizer(&self) -> Arc<dyn Quantizer> {
        Arc::clone(&self.quantizer)
    }

    /// Returns the backend registered under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if no backend is registered under `key`.
    pub fn backend(&self, key: &str) -> Result<Arc<dyn Backend>, LowerflowError> {
        self.backends
            .get(key)
            .cloned()
            .ok_or_else(|| LowerflowError::invalid_params(kinds::PARTITION, format!("unknown backend '{key}'")))
    }

    /// Returns the simulator registered under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if no simulator is registered under `key`.
    pub fn simulator(&self, key: &str) -> Result<Arc<dyn Simulator>, LowerflowError> {
        self.simulators
            .get(key)
            .cloned()
            .ok_or_else(|| LowerflowError::invalid_params(kinds::RUN_METHOD, format!("unknown simulator '{key}'")))
    }
}

/// Creates a stage from its parameters.
pub type StageFactory =
    Arc<dyn Fn(&StageParams, &Toolchain) -> Result<Arc<dyn Stage>, LowerflowError> + Send + Sync>;

/// Maps stage kind identifiers to factories.
#[derive(Clone, Default)]
pub struct StageRegistry {
    factories: HashMap<String, StageFactory>,
}

impl Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry").field("kinds", &self.kinds()).finish()
    }
}

#[derive(Deserialize)]
struct QuantizeParams {
    #[serde(default)]
    config: QuantizationConfig,
}

#[derive(Deserialize)]
struct PartitionParams {
    backend: String,
    target: String,
}

#[derive(Deserialize)]
struct SerializeParams {
    #[serde(default)]
    target: Option<String>,
}

#[derive(Deserialize)]
struct RunParams {
    #[serde(default = "default_simulator")]
    simulator: String,
}

fn default_simulator() -> String {
    HOST.to_string()
}

#[derive(Deserialize)]
struct PatternParams {
    #[serde(default)]
    patterns: Vec<String>,
}

#[derive(Deserialize)]
struct CountParams {
    #[serde(default)]
    counts: BTreeMap<String, usize>,
}

impl StageRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with every built-in stage kind.
    #[must_use]
    pub fn builtin() -> Self {
        Self::new()
            .with(kinds::EXPORT, |_, tools| Ok(Arc::new(ExportStage::new(tools.exporter()))))
            .with(kinds::QUANTIZE, |params, tools| {
                let QuantizeParams { config } = parse_params(kinds::QUANTIZE, params)?;
                Ok(Arc::new(QuantizeStage::new(tools.quantizer(), config)))
            })
            .with(kinds::TO_EDGE, |_, _| Ok(Arc::new(ToEdgeStage)))
            .with(kinds::PARTITION, |params, tools| {
                let PartitionParams { backend, target } = parse_params(kinds::PARTITION, params)?;
                Ok(Arc::new(PartitionStage::new(tools.backend(&backend)?, target)))
            })
            .with(kinds::SERIALIZE, |params, _| {
                let SerializeParams { target } = parse_params(kinds::SERIALIZE, params)?;
                Ok(Arc::new(SerializeStage::new(target)))
            })
            .with(kinds::RUN_METHOD, |params, tools| {
                let RunParams { simulator } = parse_params(kinds::RUN_METHOD, params)?;
                let runner = tools.simulator(&simulator)?;
                Ok(Arc::new(RunStage::new(simulator, runner)))
            })
            .with(kinds::COMPARE_OUTPUTS, |params, _| {
                let tolerance: Tolerance = parse_params(kinds::COMPARE_OUTPUTS, params)?;
                Ok(Arc::new(CompareStage::new(tolerance)))
            })
            .with(kinds::CHECK, |params, _| {
                let PatternParams { patterns } = parse_params(kinds::CHECK, params)?;
                Ok(Arc::new(CheckStage::present(patterns)))
            })
            .with(kinds::CHECK_NOT, |params, _| {
                let PatternParams { patterns } = parse_params(kinds::CHECK_NOT, params)?;
                Ok(Arc::new(CheckStage::absent(patterns)))
            })
            .with(kinds::CHECK_COUNT, |params, _| {
                let CountParams { counts } = parse_params(kinds::CHECK_COUNT, params)?;
                Ok(Arc::new(CheckStage::count(counts)))
            })
    }

    /// Registers a factory, returning the one it replaced.
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F) -> Option<StageFactory>
    where
        F: Fn(&StageParams, &Toolchain) -> Result<Arc<dyn Stage>, LowerflowError> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory))
    }

    /// Registers a factory, builder style.
    #[must_use]
    pub fn with<F>(mut self, kind: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&StageParams, &Toolchain) -> Result<Arc<dyn Stage>, LowerflowError> + Send + Sync + 'static,
    {
        self.register(kind, factory);
        self
    }

    /// Instantiates a stage of `kind`.
    ///
    /// # Errors
    ///
    /// Returns an error if the kind is unknown or the factory rejects the
    /// parameters.
    pub fn create(
        &self,
        kind: &str,
        params: &StageParams,
        toolchain: &Toolchain,
    ) -> Result<Arc<dyn Stage>, LowerflowError> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| LowerflowError::UnknownStageKind(kind.to_string()))?;
        factory(params, toolchain)
    }

    /// Returns true if a factory is registered for `kind`.
    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Returns the registered kinds, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageKind;
    use crate::stages::params;
    use crate::testing::mocks::RecordingStage;

    #[test]
    fn test_builtin_kinds() {
        let registry = StageRegistry::builtin();
        assert_eq!(registry.kinds().len(), 10);
        assert!(registry.contains(kinds::CHECK_COUNT));
    }

    #[test]
    fn test_create_partition() {
        let registry = StageRegistry::builtin();
        let stage = registry
            .create(
                kinds::PARTITION,
                &params(serde_json::json!({"backend": "tosa", "target": "TOSA-0.80+MI"})),
                &Toolchain::default(),
            )
            .unwrap();
        assert_eq!(stage.kind(), StageKind::Lower);
    }

    #[test]
    fn test_unknown_backend_and_kind() {
        let registry = StageRegistry::builtin();
        let toolchain = Toolchain::default();

        let err = registry
            .create(
                kinds::PARTITION,
                &params(serde_json::json!({"backend": "vulkan", "target": "x"})),
                &toolchain,
            )
            .unwrap_err();
        assert!(err.to_string().contains("unknown backend 'vulkan'"));

        let err = registry.create("fuse", &StageParams::new(), &toolchain).unwrap_err();
        assert!(matches!(err, LowerflowError::UnknownStageKind(ref kind) if kind == "fuse"));
    }

    #[test]
    fn test_invalid_params() {
        let err = StageRegistry::builtin()
            .create(
                kinds::CHECK_COUNT,
                &params(serde_json::json!({"counts": {"delegate": "one"}})),
                &Toolchain::default(),
            )
            .unwrap_err();
        assert!(err.is_structural());
    }

    #[test]
    fn test_custom_factory() {
        let mut registry = StageRegistry::builtin();
        let previous = registry.register(kinds::TO_EDGE, |_, _| Ok(Arc::new(RecordingStage::new("edge"))));

        assert!(previous.is_some());
        let stage = registry
            .create(kinds::TO_EDGE, &StageParams::new(), &Toolchain::default())
            .unwrap();
        assert_eq!(stage.kind(), StageKind::Custom);
    }

    #[test]
    fn test_toolchain_simulators() {
        let toolchain = Toolchain::from_config(&AvailabilityConfig::new());
        assert!(toolchain.simulator(HOST).is_ok());
        assert!(toolchain.simulator("corstone-300").is_ok());
        assert!(toolchain.simulator("corstone-999").is_err());
        assert!(format!("{toolchain:?}").contains("ethos-u85"));
    }
}
