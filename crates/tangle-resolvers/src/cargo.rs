//! Rust crate resolution via `cargo metadata`.

use crate::resolver::{Availability, DependencyResolver, ResolverError};
use crate::util::{command_exists, run_command};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use tangle_cache::{InMemoryPackageCache, PackageCache};
use tangle_core::{Dependency, Package, SourceRepository, Version, VersionSpec};
use tracing::{debug, warn};

/// Classifies the dependencies of Rust packages using `cargo metadata`.
#[derive(Debug, Default)]
pub struct CargoResolver {
    client: reqwest::Client,
}

impl CargoResolver {
    /// Create the resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `cargo metadata` in `repo` and convert every package in the
    /// resolved tree. The workspace root comes back as a source package.
    async fn get_dependencies(
        &self,
        path: &Path,
    ) -> Result<(Option<Package>, Vec<Package>), ResolverError> {
        let output = run_command(
            "cargo",
            &["metadata", "--format-version", "1"],
            Some(path),
        )
        .await?;
        let metadata: serde_json::Value = serde_json::from_slice(&output)
            .map_err(|e| ResolverError::failed(format!("invalid cargo metadata: {e}")))?;

        let workspace_members: Vec<&str> = metadata["workspace_members"]
            .as_array()
            .map(|members| members.iter().filter_map(|m| m.as_str()).collect())
            .unwrap_or_default();
        let root_id = metadata["resolve"]["root"]
            .as_str()
            .or_else(|| workspace_members.first().copied());

        let mut root = None;
        let mut rest = Vec::new();
        for entry in metadata["packages"].as_array().into_iter().flatten() {
            let Some(name) = entry["name"].as_str() else {
                continue;
            };
            let Ok(version) = Version::parse(entry["version"].as_str().unwrap_or_default())
            else {
                warn!(name, "skipping package with unparseable version");
                continue;
            };

            // multiple requirements on the same crate union their specs
            let mut dependencies: BTreeMap<String, Dependency> = BTreeMap::new();
            for dep in entry["dependencies"].as_array().into_iter().flatten() {
                if !dep["kind"].is_null() {
                    continue; // dev and build dependencies are not runtime edges
                }
                let Some(dep_name) = dep["name"].as_str() else {
                    continue;
                };
                let spec = self
                    .parse_spec(dep["req"].as_str().unwrap_or("*"))
                    .unwrap_or_else(|_| VersionSpec::any());
                dependencies
                    .entry(dep_name.to_string())
                    .and_modify(|existing| existing.spec = existing.spec.union(&spec))
                    .or_insert_with(|| Dependency::with_spec("cargo", dep_name, spec));
            }

            let package = Package::new("cargo", name, version)
                .with_dependencies(dependencies.into_values());
            if entry["id"].as_str() == root_id {
                root = Some(package.with_source_repo(path));
            } else {
                rest.push(package);
            }
        }
        Ok((root, rest))
    }
}

#[async_trait]
impl DependencyResolver for CargoResolver {
    fn name(&self) -> &'static str {
        "cargo"
    }

    fn description(&self) -> &'static str {
        "classifies the dependencies of Rust packages using `cargo metadata`"
    }

    fn is_available(&self) -> Availability {
        if command_exists("cargo") {
            Availability::available()
        } else {
            Availability::unavailable(
                "`cargo` does not appear to be installed! \
                 Make sure it is installed and in the PATH.",
            )
        }
    }

    fn can_resolve_from_source(&self, repo: &SourceRepository) -> bool {
        self.is_available().is_available() && repo.path().join("Cargo.toml").exists()
    }

    async fn resolve_from_source(
        &self,
        repo: &SourceRepository,
        cache: &dyn PackageCache,
    ) -> Result<Option<Package>, ResolverError> {
        if !self.can_resolve_from_source(repo) {
            return Ok(None);
        }
        let (root, rest) = self.get_dependencies(repo.path()).await?;
        // cargo metadata already resolved the whole tree; stash it so the
        // engine's cache drain skips re-resolving every edge
        for package in &rest {
            cache.add(package)?;
            for dep in &package.dependencies {
                if !cache.was_resolved(dep) {
                    cache.set_resolved(dep);
                }
            }
        }
        Ok(root)
    }

    async fn resolve(&self, dependency: &Dependency) -> Result<Vec<Package>, ResolverError> {
        // Ask cargo itself: init a scratch project depending on the spec,
        // then read the resolved tree out of its metadata.
        let scratch = tempfile::tempdir()
            .map_err(|e| ResolverError::failed(format!("failed to create scratch dir: {e}")))?;
        run_command("cargo", &["init", "--vcs", "none"], Some(scratch.path())).await?;

        let requirement = dependency
            .spec
            .to_string()
            .split(',')
            .map(|block| {
                let block = block.trim();
                if block.starts_with(|c: char| c.is_ascii_digit()) {
                    format!("={block}")
                } else {
                    block.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(",");
        let manifest = scratch.path().join("Cargo.toml");
        let mut contents = std::fs::read_to_string(&manifest)
            .map_err(|e| ResolverError::failed(format!("failed to read scratch manifest: {e}")))?;
        contents.push_str(&format!(
            "{} = \"{requirement}\"\n",
            dependency.package
        ));
        std::fs::write(&manifest, contents)
            .map_err(|e| ResolverError::failed(format!("failed to write scratch manifest: {e}")))?;
        debug!(package = dependency.package, requirement, "resolving via scratch project");

        let local = InMemoryPackageCache::new();
        let (root, rest) = self.get_dependencies(scratch.path()).await?;
        local.extend(&rest).map_err(ResolverError::Core)?;
        if let Some(root) = root {
            local.add(&root).map_err(ResolverError::Core)?;
        }
        Ok(local.match_dependency(dependency))
    }

    async fn repository_url(&self, package: &Package) -> Option<String> {
        let response = self
            .client
            .get(format!("https://crates.io/api/v1/crates/{}", package.name))
            .header(reqwest::header::USER_AGENT, "tangle")
            .send()
            .await
            .ok()?;
        let body: serde_json::Value = response.json().await.ok()?;
        body["crate"]["repository"].as_str().map(ToString::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cargo_specs_are_comma_anded() {
        let resolver = CargoResolver::new();
        let spec = resolver.parse_spec(">=1.2, <1.5").unwrap();
        assert_eq!(spec.to_string(), ">=1.2,<1.5");
        assert!(spec.matches(&Version::parse("1.3.0").unwrap()));
        assert!(!spec.matches(&Version::parse("1.5.0").unwrap()));
    }

    #[test]
    fn detects_cargo_projects() {
        let resolver = CargoResolver::new();
        if !resolver.is_available().is_available() {
            return; // no cargo on this machine, nothing to check
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = SourceRepository::from_path(dir.path());
        assert!(!resolver.can_resolve_from_source(&repo));
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\n").unwrap();
        assert!(resolver.can_resolve_from_source(&repo));
    }
}
