//! Availability guard for external dependencies such as hardware simulators.
//!
//! Each dependency key maps to a probe. The first query runs the probe and
//! the answer is cached for the rest of the process; it is never
//! invalidated. Unknown keys are unavailable.

use crate::config::AvailabilityConfig;
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt::Debug;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

/// Dependency key that is always available (in-process execution).
pub const HOST: &str = "host";

/// A predicate answering whether a named dependency can be used.
pub trait AvailabilityGuard: Send + Sync + Debug {
    /// Returns true if `dependency` is present. Never panics.
    fn available(&self, dependency: &str) -> bool;
}

type Probe = Arc<dyn Fn() -> bool + Send + Sync>;

struct ProbeRegistry {
    probes: DashMap<String, Probe>,
    cache: DashMap<String, Arc<OnceLock<bool>>>,
}

impl ProbeRegistry {
    fn from_config(config: &AvailabilityConfig) -> Self {
        let probes: DashMap<String, Probe> = DashMap::new();
        probes.insert(HOST.to_string(), Arc::new(|| true));

        for (dependency, binary) in &config.binaries {
            let binary = binary.clone();
            let search_paths = config.search_paths.clone();
            probes.insert(
                dependency.clone(),
                Arc::new(move || find_executable(&binary, &search_paths).is_some()),
            );
        }
        for dependency in &config.forced_available {
            probes.insert(dependency.clone(), Arc::new(|| true));
        }
        for dependency in &config.forced_unavailable {
            probes.insert(dependency.clone(), Arc::new(|| false));
        }

        Self {
            probes,
            cache: DashMap::new(),
        }
    }

    fn query(&self, dependency: &str) -> bool {
        let cell = self
            .cache
            .entry(dependency.to_string())
            .or_insert_with(|| Arc::new(OnceLock::new()))
            .clone();
        *cell.get_or_init(|| self.probe(dependency))
    }

    fn probe(&self, dependency: &str) -> bool {
        let probe = self.probes.get(dependency).map(|entry| Arc::clone(entry.value()));
        let Some(probe) = probe else {
            warn!(dependency, "Unknown dependency, treating as unavailable");
            return false;
        };

        let available = catch_unwind(AssertUnwindSafe(|| probe())).unwrap_or_else(|_| {
            warn!(dependency, "Availability probe panicked, treating as unavailable");
            false
        });
        info!(dependency, available, "Probed dependency");
        available
    }
}

static REGISTRY: OnceLock<ProbeRegistry> = OnceLock::new();

fn registry() -> &'static ProbeRegistry {
    REGISTRY.get_or_init(|| ProbeRegistry::from_config(&AvailabilityConfig::from_env()))
}

/// Returns true if `dependency` is available in this process.
///
/// The probe runs at most once per dependency, even under concurrent first
/// queries; later calls read the cached answer.
pub fn available(dependency: &str) -> bool {
    registry().query(dependency)
}

/// Registers (or replaces) the probe for `dependency`.
///
/// Returns false if the dependency was already queried, in which case the
/// cached answer stays in effect for the rest of the process.
pub fn register_probe<F>(dependency: impl Into<String>, probe: F) -> bool
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let dependency = dependency.into();
    let registry = registry();
    let already_queried = registry
        .cache
        .get(&dependency)
        .is_some_and(|cell| cell.get().is_some());
    registry.probes.insert(dependency, Arc::new(probe));
    !already_queried
}

/// Looks for an executable named `name` in `search_paths`, then on `PATH`.
#[must_use]
pub fn find_executable(name: &str, search_paths: &[PathBuf]) -> Option<PathBuf> {
    let path_dirs = std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).collect::<Vec<_>>())
        .unwrap_or_default();

    search_paths
        .iter()
        .chain(path_dirs.iter())
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Guard backed by the process-wide probe cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessAvailability;

impl AvailabilityGuard for ProcessAvailability {
    fn available(&self, dependency: &str) -> bool {
        available(dependency)
    }
}

/// Guard with a fixed answer per dependency, for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct StaticAvailability {
    dependencies: HashMap<String, bool>,
}

impl StaticAvailability {
    /// Creates a guard where only [`HOST`] is available.
    #[must_use]
    pub fn new() -> Self {
        Self::default().with(HOST, true)
    }

    /// Sets the answer for `dependency`.
    #[must_use]
    pub fn with(mut self, dependency: impl Into<String>, available: bool) -> Self {
        self.dependencies.insert(dependency.into(), available);
        self
    }

    /// Marks every dependency in `dependencies` available.
    #[must_use]
    pub fn with_available(mut self, dependencies: impl IntoIterator<Item = impl Into<String>>) -> Self {
        for dependency in dependencies {
            self.dependencies.insert(dependency.into(), true);
        }
        self
    }
}

impl AvailabilityGuard for StaticAvailability {
    fn available(&self, dependency: &str) -> bool {
        self.dependencies.get(dependency).copied().unwrap_or(false)
    }
}
