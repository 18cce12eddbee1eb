//! JavaScript package resolution via `npm`.

use crate::resolver::{Availability, DependencyResolver, DockerSetup, ResolverError};
use crate::util::{command_exists, run_command};
use async_trait::async_trait;
use tangle_cache::PackageCache;
use tangle_core::{Dependency, Package, SourceRepository, Version, VersionSpec};
use tracing::warn;

/// Classifies the dependencies of JavaScript packages using `npm`.
#[derive(Debug, Default)]
pub struct NpmResolver;

impl NpmResolver {
    /// Create the resolver.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Turn one `"name": "constraint"` entry from a dependency map into a
    /// [`Dependency`]. A constraint of the form `npm:<real-name>@<spec>`
    /// aliases a different package under this name.
    fn dependency_from_entry(name: &str, constraint: &str) -> Option<Dependency> {
        if let Some(aliased) = constraint.strip_prefix("npm:") {
            // scoped packages contain a second '@': @scope/pkg@^1.0
            let (real_name, spec) = aliased.rsplit_once('@')?;
            let spec = Self::lenient_spec(spec);
            return Some(Dependency::with_spec("npm", real_name, spec).aliased(name));
        }
        if constraint.starts_with("file:")
            || constraint.starts_with("git")
            || constraint.starts_with("link:")
        {
            // local and git dependencies have no registry version to match
            return Some(Dependency::new("npm", name));
        }
        Some(Dependency::with_spec(
            "npm",
            name,
            Self::lenient_spec(constraint),
        ))
    }

    /// npm constraint strings are forgiving; anything unparseable widens to
    /// the wildcard rather than failing the whole manifest.
    fn lenient_spec(spec: &str) -> VersionSpec {
        if let Ok(parsed) = VersionSpec::parse(spec) {
            return parsed;
        }
        let no_whitespace: String = spec.split_whitespace().collect::<Vec<_>>().join(",");
        VersionSpec::parse(&no_whitespace).unwrap_or_else(|_| VersionSpec::any())
    }

    fn package_from_json(value: &serde_json::Value, name: &str) -> Option<Package> {
        let version = Version::parse(value["version"].as_str()?).ok()?;
        let dependencies = value["dependencies"]
            .as_object()
            .into_iter()
            .flatten()
            .filter_map(|(dep_name, constraint)| {
                Self::dependency_from_entry(dep_name, constraint.as_str()?)
            });
        Some(Package::new("npm", name, version).with_dependencies(dependencies))
    }
}

#[async_trait]
impl DependencyResolver for NpmResolver {
    fn name(&self) -> &'static str {
        "npm"
    }

    fn description(&self) -> &'static str {
        "classifies the dependencies of JavaScript packages using `npm`"
    }

    fn is_available(&self) -> Availability {
        if command_exists("npm") {
            Availability::available()
        } else {
            Availability::unavailable(
                "`npm` does not appear to be installed! \
                 Make sure it is installed and in the PATH.",
            )
        }
    }

    fn parse_spec(&self, spec: &str) -> tangle_core::Result<VersionSpec> {
        Ok(Self::lenient_spec(spec))
    }

    fn docker_setup(&self) -> Option<DockerSetup> {
        Some(DockerSetup {
            apt_get_packages: vec!["npm"],
            install_package_script: "#!/usr/bin/env bash\nnpm install $1@$2\n",
            load_package_script: "#!/usr/bin/env bash\nnode -e \"require(\\\"$1\\\")\"\n",
            baseline_script: "#!/usr/bin/env node -e \"\"\n",
            post_install: "",
        })
    }

    fn can_resolve_from_source(&self, repo: &SourceRepository) -> bool {
        repo.path().join("package.json").exists()
    }

    async fn resolve_from_source(
        &self,
        repo: &SourceRepository,
        _cache: &dyn PackageCache,
    ) -> Result<Option<Package>, ResolverError> {
        let path = repo.path().join("package.json");
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| ResolverError::failed(format!("failed to read {}: {e}", path.display())))?;
        let manifest: serde_json::Value = serde_json::from_str(&contents)
            .map_err(|e| ResolverError::failed(format!("invalid {}: {e}", path.display())))?;

        let fallback_name = repo
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let name = manifest["name"].as_str().unwrap_or(&fallback_name);
        let version = Version::parse(manifest["version"].as_str().unwrap_or("0"))
            .map_err(ResolverError::Core)?;
        let dependencies = manifest["dependencies"]
            .as_object()
            .into_iter()
            .flatten()
            .filter_map(|(dep_name, constraint)| {
                Self::dependency_from_entry(dep_name, constraint.as_str()?)
            });
        Ok(Some(
            Package::new("npm", name, version)
                .with_dependencies(dependencies)
                .with_source_repo(repo.path()),
        ))
    }

    async fn resolve(&self, dependency: &Dependency) -> Result<Vec<Package>, ResolverError> {
        if dependency.source != self.name() {
            return Ok(Vec::new());
        }
        // scoped packages need their @ back when queried
        let query_name = match &dependency.alias {
            Some(alias) => format!("@{alias}"),
            None
                if dependency.package.matches('/').count() == 1
                    && !dependency.package.starts_with('@') =>
            {
                format!("@{}", dependency.package)
            }
            None => dependency.package.clone(),
        };
        let query = format!("{query_name}@{}", dependency.spec);
        let output = match run_command(
            "npm",
            &["view", "--json", &query, "name", "version", "dependencies"],
            None,
        )
        .await
        {
            Ok(output) => output,
            Err(error) => {
                warn!(%dependency, %error, "npm view failed");
                return Ok(Vec::new());
            }
        };
        let result: serde_json::Value = serde_json::from_slice(&output)
            .map_err(|e| ResolverError::failed(format!("error parsing npm view output: {e}")))?;

        let packages = match &result {
            one @ serde_json::Value::Object(_) => {
                Self::package_from_json(one, &dependency.package)
                    .into_iter()
                    .collect()
            }
            serde_json::Value::Array(many) => many
                .iter()
                .filter_map(|entry| Self::package_from_json(entry, &dependency.package))
                .collect(),
            _ => Vec::new(),
        };
        Ok(packages)
    }

    async fn repository_url(&self, package: &Package) -> Option<String> {
        let output = run_command(
            "npm",
            &["view", "--json", &package.name, "repository.url"],
            None,
        )
        .await
        .ok()?;
        let value: serde_json::Value = serde_json::from_slice(&output).ok()?;
        value.as_str().map(ToString::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test]
    fn plain_dependency_entry() {
        let dep = NpmResolver::dependency_from_entry("lodash", "^4.17.0").unwrap();
        assert_eq!(dep.to_string(), "npm:lodash@^4.17.0");
        assert!(dep.alias.is_none());
    }

    #[test]
    fn aliased_dependency_entry() {
        let dep = NpmResolver::dependency_from_entry("my-lodash", "npm:lodash@^4.0").unwrap();
        assert_eq!(dep.package, "lodash");
        assert_eq!(dep.alias.as_deref(), Some("my-lodash"));
        assert_eq!(dep.to_string(), "npm:my-lodash@lodash@^4.0");
    }

    #[test]
    fn scoped_alias_entry() {
        let dep =
            NpmResolver::dependency_from_entry("compat", "npm:@scope/pkg@~2.1").unwrap();
        assert_eq!(dep.package, "@scope/pkg");
        assert_eq!(dep.alias.as_deref(), Some("compat"));
    }

    #[test_case("^4.17.0", "^4.17.0" ; "caret passes through")]
    #[test_case(">=1.0 <2.0", ">=1.0,<2.0" ; "space separated range becomes and")]
    #[test_case("workspace:*", "*" ; "unparseable falls back to wildcard")]
    fn lenient_spec_parsing(input: &str, expected: &str) {
        assert_eq!(NpmResolver::lenient_spec(input).to_string(), expected);
    }

    #[tokio::test]
    async fn source_package_from_package_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{
                "name": "demo",
                "version": "1.2.3",
                "dependencies": {
                    "lodash": "^4.17.0",
                    "legacy-lodash": "npm:lodash@^3.0"
                }
            }"#,
        )
        .unwrap();
        let repo = SourceRepository::from_path(dir.path());
        let resolver = NpmResolver::new();
        assert!(resolver.can_resolve_from_source(&repo));

        let cache = tangle_cache::InMemoryPackageCache::new();
        let package = resolver
            .resolve_from_source(&repo, &cache)
            .await
            .unwrap()
            .unwrap();
        assert!(package.is_source_package());
        assert_eq!(package.name, "demo");
        assert_eq!(package.version.to_string(), "1.2.3");
        assert_eq!(package.dependencies.len(), 2);
        assert!(package.dependencies.iter().any(|d| d.alias.is_some()));
    }
}
