//! Package caches: the authoritative store of everything resolution learns.
//!
//! A [`PackageCache`] holds [`Package`]s keyed by `(source, name, version)`
//! plus two bookkeeping maps:
//!
//! - the *resolved set*: dependencies whose resolution has been attempted and
//!   recorded, empty results included. Once a dependency is in this set,
//!   `match_dependency` is authoritative and resolution must not run again;
//! - the *updated-by* map: which resolvers have already enriched a package,
//!   so cross-ecosystem enrichment runs at most once per (package, resolver).
//!
//! Two implementations share the contract: [`InMemoryPackageCache`] and the
//! SQLite-backed [`SqlitePackageCache`]. Both are thread-safe and monotonic
//! within a run: packages are never removed, and re-adding a package unions
//! its dependency set with what is already known. An `add` that would *lose*
//! dependencies fails with [`Error::CacheConflict`].

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

mod memory;
mod sqlite;

pub use memory::{InMemoryPackageCache, PackageRepository};
pub use sqlite::SqlitePackageCache;

use serde_json::json;
use std::collections::BTreeSet;
use tangle_core::{Dependency, Error, Package, Result, Version};

/// A collection of packages with resolution and enrichment bookkeeping.
pub trait PackageCache: Send + Sync {
    /// Number of packages stored.
    fn len(&self) -> usize;

    /// True if no packages are stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every stored package.
    fn packages(&self) -> Vec<Package>;

    /// Insert a package, unioning dependency sets on an existing key.
    ///
    /// Fails with [`Error::CacheConflict`] if the existing entry has strictly
    /// more dependencies than the incoming one.
    fn add(&self, package: &Package) -> Result<()>;

    /// [`PackageCache::add`] every package in `packages`.
    fn extend(&self, packages: &[Package]) -> Result<()> {
        for package in packages {
            self.add(package)?;
        }
        Ok(())
    }

    /// Every stored package whose `(source, name)` matches `dependency` and
    /// whose version satisfies its spec. Performs no resolution.
    fn match_dependency(&self, dependency: &Dependency) -> Vec<Package>;

    /// Stored packages equal in identity to `package`.
    fn match_package(&self, package: &Package) -> Vec<Package> {
        self.match_dependency(&package.to_dependency())
    }

    /// Match against a fully-qualified package string (`source:name@version`).
    fn match_str(&self, query: &str) -> Result<Vec<Package>> {
        let package = Package::from_string(query)?;
        Ok(self.match_package(&package))
    }

    /// True if resolution of `dependency` has been recorded.
    fn was_resolved(&self, dependency: &Dependency) -> bool;

    /// Record that `dependency` has been resolved (results are in the cache).
    fn set_resolved(&self, dependency: &Dependency);

    /// True if `resolver` has already enriched `package`. A package's own
    /// resolver counts as having updated it.
    fn was_updated(&self, package: &Package, resolver: &str) -> bool;

    /// Record that `resolver` has enriched `package`.
    fn set_updated(&self, package: &Package, resolver: &str);

    /// The set of resolver names that have enriched `package`.
    fn updated_by(&self, package: &Package) -> BTreeSet<String>;

    /// All distinct `source:name` pairs stored.
    fn package_full_names(&self) -> BTreeSet<String>;

    /// All stored versions of `source:name`.
    fn package_versions(&self, full_name: &str) -> Vec<Package>;

    /// Look up one package by exact identity.
    fn get(&self, source: &str, name: &str, version: &Version) -> Option<Package> {
        self.match_package(&Package::new(source, name, version.clone()))
            .into_iter()
            .next()
    }

    /// True if a package with this identity is stored.
    fn contains(&self, package: &Package) -> bool {
        !self.match_package(package).is_empty()
    }

    /// The highest-version stored package satisfying `dependency`.
    fn latest_match(&self, dependency: &Dependency) -> Option<Package> {
        self.match_dependency(dependency)
            .into_iter()
            .max_by(|a, b| a.version.cmp(&b.version))
    }

    /// Packages discovered from local source trees (the graph roots).
    fn source_packages(&self) -> Vec<Package> {
        self.packages()
            .into_iter()
            .filter(Package::is_source_package)
            .collect()
    }

    /// Dependencies of stored packages whose resolution was never recorded.
    fn unresolved_dependencies(&self) -> Vec<Dependency> {
        let mut seen = BTreeSet::new();
        let mut unresolved = Vec::new();
        for package in self.packages() {
            for dep in &package.dependencies {
                if !self.was_resolved(dep) && seen.insert(dep.clone()) {
                    unresolved.push(dep.clone());
                }
            }
        }
        unresolved
    }

    /// Enter a cache context. Contexts are reference-counted: the physical
    /// store opens on the outermost entry and closes on the outermost
    /// [`PackageCache::exit`]. An incompatible on-disk schema surfaces here.
    fn enter(&self) -> Result<()> {
        Ok(())
    }

    /// Leave a cache context (see [`PackageCache::enter`]).
    fn exit(&self) {}

    /// JSON projection: `full_name -> version -> package details`.
    fn to_obj(&self) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        for full_name in self.package_full_names() {
            let mut versions = serde_json::Map::new();
            for package in self.package_versions(&full_name) {
                let deps: serde_json::Map<String, serde_json::Value> = package
                    .dependencies
                    .iter()
                    .map(|d| (d.full_name(), json!(d.spec.to_string())))
                    .collect();
                let vulns: Vec<serde_json::Value> = package
                    .vulnerabilities
                    .iter()
                    .map(|v| json!({"id": v.id, "aliases": v.aliases, "summary": v.summary}))
                    .collect();
                let mut entry = serde_json::Map::new();
                entry.insert("source".to_string(), json!(package.source));
                entry.insert("dependencies".to_string(), serde_json::Value::Object(deps));
                entry.insert("vulnerabilities".to_string(), json!(vulns));
                if package.is_source_package() {
                    entry.insert("is_source_package".to_string(), json!(true));
                }
                if let Some(maintenance) = &package.maintenance {
                    entry.insert(
                        "maintenance".to_string(),
                        serde_json::to_value(maintenance).unwrap_or_default(),
                    );
                }
                versions.insert(
                    package.version.to_string(),
                    serde_json::Value::Object(entry),
                );
            }
            out.insert(full_name, serde_json::Value::Object(versions));
        }
        serde_json::Value::Object(out)
    }
}

/// RAII guard for a reference-counted cache context.
///
/// Nested guards over the same cache share one physical connection; the
/// connection closes when the last guard drops.
pub struct CacheSession<'a> {
    cache: &'a dyn PackageCache,
}

impl std::fmt::Debug for CacheSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSession").finish_non_exhaustive()
    }
}

impl<'a> CacheSession<'a> {
    /// Enter a cache context.
    pub fn enter(cache: &'a dyn PackageCache) -> Result<Self> {
        cache.enter()?;
        Ok(Self { cache })
    }
}

impl Drop for CacheSession<'_> {
    fn drop(&mut self) {
        self.cache.exit();
    }
}

/// Shared guard used by both cache implementations: fail an [`PackageCache::add`]
/// that would shrink an existing entry's dependency set.
fn check_shrink(existing: &Package, incoming: &Package) -> Result<()> {
    if existing.dependencies.len() > incoming.dependencies.len() {
        return Err(Error::CacheConflict {
            package: incoming.to_string(),
            existing: existing.to_string(),
        });
    }
    Ok(())
}

pub(crate) use check_shrink as shrink_guard;
