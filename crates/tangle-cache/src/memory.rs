//! The in-memory package cache.

use crate::{PackageCache, shrink_guard};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tangle_core::{Dependency, Package, Result, Version};

type PackageKey = (String, String, String);

#[derive(Debug, Default)]
struct State {
    /// source -> name -> version -> package
    packages: BTreeMap<String, BTreeMap<String, BTreeMap<Version, Package>>>,
    /// full name -> dependencies recorded as resolved
    resolved: HashMap<String, HashSet<Dependency>>,
    /// (source, name, version) -> resolvers that enriched the package
    updated: HashMap<PackageKey, BTreeSet<String>>,
}

fn key_of(package: &Package) -> PackageKey {
    (
        package.source.clone(),
        package.name.clone(),
        package.version.to_string(),
    )
}

/// Thread-safe in-memory implementation of [`PackageCache`].
#[derive(Debug, Default)]
pub struct InMemoryPackageCache {
    state: RwLock<State>,
}

impl InMemoryPackageCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PackageCache for InMemoryPackageCache {
    fn len(&self) -> usize {
        self.state
            .read()
            .packages
            .values()
            .flat_map(BTreeMap::values)
            .map(BTreeMap::len)
            .sum()
    }

    fn packages(&self) -> Vec<Package> {
        self.state
            .read()
            .packages
            .values()
            .flat_map(BTreeMap::values)
            .flat_map(BTreeMap::values)
            .cloned()
            .collect()
    }

    fn add(&self, package: &Package) -> Result<()> {
        let mut state = self.state.write();
        let slot = state
            .packages
            .entry(package.source.clone())
            .or_default()
            .entry(package.name.clone())
            .or_default();
        match slot.get(&package.version) {
            Some(existing) => {
                shrink_guard(existing, package)?;
                let mut merged = existing
                    .clone()
                    .update_dependencies(package.dependencies.iter().cloned())
                    .update_vulnerabilities(package.vulnerabilities.iter().cloned());
                if merged.maintenance.is_none() {
                    merged.maintenance = package.maintenance.clone();
                }
                if merged.source_repo.is_none() {
                    merged.source_repo = package.source_repo.clone();
                }
                slot.insert(package.version.clone(), merged);
            }
            None => {
                slot.insert(package.version.clone(), package.clone());
            }
        }
        Ok(())
    }

    fn match_dependency(&self, dependency: &Dependency) -> Vec<Package> {
        let state = self.state.read();
        state
            .packages
            .get(&dependency.source)
            .and_then(|names| names.get(&dependency.package))
            .map(|versions| {
                versions
                    .iter()
                    .filter(|(version, _)| dependency.spec.matches(version))
                    .map(|(_, package)| package.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn was_resolved(&self, dependency: &Dependency) -> bool {
        self.state
            .read()
            .resolved
            .get(&dependency.full_name())
            .is_some_and(|deps| deps.contains(dependency))
    }

    fn set_resolved(&self, dependency: &Dependency) {
        self.state
            .write()
            .resolved
            .entry(dependency.full_name())
            .or_default()
            .insert(dependency.clone());
    }

    fn was_updated(&self, package: &Package, resolver: &str) -> bool {
        if package.source == resolver {
            return true;
        }
        self.state
            .read()
            .updated
            .get(&key_of(package))
            .is_some_and(|resolvers| resolvers.contains(resolver))
    }

    fn set_updated(&self, package: &Package, resolver: &str) {
        self.state
            .write()
            .updated
            .entry(key_of(package))
            .or_default()
            .insert(resolver.to_string());
    }

    fn updated_by(&self, package: &Package) -> BTreeSet<String> {
        self.state
            .read()
            .updated
            .get(&key_of(package))
            .cloned()
            .unwrap_or_default()
    }

    fn package_full_names(&self) -> BTreeSet<String> {
        let state = self.state.read();
        state
            .packages
            .iter()
            .flat_map(|(source, names)| {
                names.keys().map(move |name| format!("{source}:{name}"))
            })
            .collect()
    }

    fn package_versions(&self, full_name: &str) -> Vec<Package> {
        let Some((source, name)) = full_name.split_once(':') else {
            return Vec::new();
        };
        self.state
            .read()
            .packages
            .get(source)
            .and_then(|names| names.get(name))
            .map(|versions| versions.values().cloned().collect())
            .unwrap_or_default()
    }
}

/// The repository of packages produced by one resolution run.
///
/// Shares the in-memory cache implementation; the engine fills one of these
/// and hands it to the graph builder, the SBOM backtracker and the enrichers.
pub type PackageRepository = InMemoryPackageCache;
