//! Python package resolution via the `PyPI` JSON API.

use crate::resolver::{Availability, DependencyResolver, DockerSetup, ResolverError};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tangle_cache::PackageCache;
use tangle_core::{Dependency, Package, SourceRepository, Version, VersionSpec};
use tracing::warn;

/// `requires_dist` entry: `name (>=1.0) ; extra == 'dev'` or `name>=1.0`.
static REQUIRES_DIST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?P<name>[A-Za-z0-9._-]+)\s*(?:\[[^\]]*\])?\s*\(?(?P<spec>[^;)]*)\)?\s*(?:;(?P<marker>.*))?$")
        .unwrap_or_else(|_| unreachable!())
});

/// `requirements.txt` line: `name==1.0` / `name>=1.0,<2.0` / bare `name`.
static REQUIREMENT_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?P<name>[A-Za-z0-9._-]+)\s*(?:\[[^\]]*\])?\s*(?P<spec>[=<>!~^][^#;]*)?")
        .unwrap_or_else(|_| unreachable!())
});

/// Classifies the dependencies of Python packages using the `PyPI` registry.
#[derive(Debug, Default)]
pub struct PipResolver {
    client: reqwest::Client,
}

impl PipResolver {
    /// Create the resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Python specs use `==` for equality and allow `.*` suffixes; clean
    /// them into the simple grammar, widening to `*` on failure.
    fn lenient_spec(spec: &str) -> VersionSpec {
        let cleaned: String = spec.split_whitespace().collect();
        let cleaned = cleaned
            .replace("===", "=")
            .replace("==", "=")
            .replace("~=", "~");
        if cleaned.is_empty() {
            return VersionSpec::any();
        }
        VersionSpec::parse(&cleaned).unwrap_or_else(|_| VersionSpec::any())
    }

    fn parse_requires_dist(entry: &str) -> Option<Dependency> {
        let captured = REQUIRES_DIST.captures(entry)?;
        // requirements gated behind an extra are optional; skip them
        if let Some(marker) = captured.name("marker")
            && marker.as_str().contains("extra")
        {
            return None;
        }
        let name = captured.name("name")?.as_str();
        let spec = Self::lenient_spec(captured.name("spec").map_or("", |m| m.as_str()));
        Some(Dependency::with_spec("pip", name, spec))
    }

    fn parse_requirements_txt(contents: &str) -> Vec<Dependency> {
        contents
            .lines()
            .map(str::trim)
            .filter(|line| {
                !line.is_empty()
                    && !line.starts_with('#')
                    && !line.starts_with('-')
                    && !line.contains("://")
            })
            .filter_map(|line| {
                let captured = REQUIREMENT_LINE.captures(line)?;
                let name = captured.name("name")?.as_str();
                let spec = Self::lenient_spec(captured.name("spec").map_or("", |m| m.as_str()));
                Some(Dependency::with_spec("pip", name, spec))
            })
            .collect()
    }

    /// Pull name/version/dependencies out of a `pyproject.toml` `[project]`
    /// table, when the tree carries one.
    fn parse_pyproject(contents: &str) -> Option<(String, Version, Vec<Dependency>)> {
        let manifest: toml::Value = contents.parse().ok()?;
        let project = manifest.get("project")?;
        let name = project.get("name")?.as_str()?.to_string();
        let version = project
            .get("version")
            .and_then(toml::Value::as_str)
            .and_then(|v| Version::parse(v).ok())
            .unwrap_or_else(|| Version::parse("0").unwrap_or_else(|_| unreachable!()));
        let dependencies = project
            .get("dependencies")
            .and_then(toml::Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.as_str())
            .filter_map(Self::parse_requires_dist)
            .collect();
        Some((name, version, dependencies))
    }

    async fn pypi_json(&self, url: String) -> Result<serde_json::Value, ResolverError> {
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ResolverError::failed(format!("pypi request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(ResolverError::failed(format!(
                "pypi returned {} for {url}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ResolverError::failed(format!("invalid pypi response: {e}")))
    }
}

#[async_trait]
impl DependencyResolver for PipResolver {
    fn name(&self) -> &'static str {
        "pip"
    }

    fn description(&self) -> &'static str {
        "classifies the dependencies of Python packages using PyPI metadata"
    }

    fn is_available(&self) -> Availability {
        Availability::available()
    }

    fn parse_spec(&self, spec: &str) -> tangle_core::Result<VersionSpec> {
        Ok(Self::lenient_spec(spec))
    }

    fn docker_setup(&self) -> Option<DockerSetup> {
        Some(DockerSetup {
            apt_get_packages: vec!["python3", "python3-pip", "python3-dev", "gcc"],
            install_package_script: "#!/usr/bin/env bash\npip3 install $1==$2\n",
            load_package_script: "#!/usr/bin/env bash\npython3 -c \"import $1\"\n",
            baseline_script: "#!/usr/bin/env python3 -c \"\"\n",
            post_install: "",
        })
    }

    fn can_resolve_from_source(&self, repo: &SourceRepository) -> bool {
        repo.path().join("setup.py").exists()
            || repo.path().join("requirements.txt").exists()
            || repo.path().join("pyproject.toml").exists()
    }

    async fn resolve_from_source(
        &self,
        repo: &SourceRepository,
        _cache: &dyn PackageCache,
    ) -> Result<Option<Package>, ResolverError> {
        if !self.can_resolve_from_source(repo) {
            return Ok(None);
        }
        let fallback_name = repo
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let pyproject = repo.path().join("pyproject.toml");
        let (name, version, mut dependencies) = if pyproject.exists() {
            std::fs::read_to_string(&pyproject)
                .ok()
                .and_then(|contents| Self::parse_pyproject(&contents))
                .unwrap_or_else(|| {
                    (
                        fallback_name.clone(),
                        Version::parse("0").unwrap_or_else(|_| unreachable!()),
                        Vec::new(),
                    )
                })
        } else {
            (
                fallback_name,
                Version::parse("0").unwrap_or_else(|_| unreachable!()),
                Vec::new(),
            )
        };

        let requirements = repo.path().join("requirements.txt");
        if let Ok(contents) = std::fs::read_to_string(&requirements) {
            dependencies.extend(Self::parse_requirements_txt(&contents));
        }

        Ok(Some(
            Package::new("pip", name, version)
                .with_dependencies(dependencies)
                .with_source_repo(repo.path()),
        ))
    }

    async fn resolve(&self, dependency: &Dependency) -> Result<Vec<Package>, ResolverError> {
        if dependency.source != self.name() {
            return Ok(Vec::new());
        }
        let index = self
            .pypi_json(format!("https://pypi.org/pypi/{}/json", dependency.package))
            .await?;
        let releases: Vec<String> = index["releases"]
            .as_object()
            .map(|releases| releases.keys().cloned().collect())
            .unwrap_or_default();

        let mut packages = Vec::new();
        for release in releases {
            let Ok(version) = Version::parse(&release) else {
                continue;
            };
            if !dependency.spec.matches(&version) {
                continue;
            }
            let detail = match self
                .pypi_json(format!(
                    "https://pypi.org/pypi/{}/{release}/json",
                    dependency.package
                ))
                .await
            {
                Ok(detail) => detail,
                Err(error) => {
                    warn!(package = dependency.package, release, %error, "skipping release");
                    continue;
                }
            };
            let dependencies = detail["info"]["requires_dist"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|entry| entry.as_str())
                .filter_map(Self::parse_requires_dist);
            packages.push(
                Package::new("pip", dependency.package.clone(), version)
                    .with_dependencies(dependencies),
            );
        }
        Ok(packages)
    }

    async fn repository_url(&self, package: &Package) -> Option<String> {
        let info = self
            .pypi_json(format!("https://pypi.org/pypi/{}/json", package.name))
            .await
            .ok()?;
        let urls = info["info"]["project_urls"].as_object()?;
        for key in ["Source", "Repository", "Source Code", "Homepage"] {
            if let Some(url) = urls.get(key).and_then(|u| u.as_str()) {
                return Some(url.to_string());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("requests (>=2.0)", Some(("requests", ">=2.0")) ; "parenthesized spec")]
    #[test_case("requests>=2.0,<3.0", Some(("requests", ">=2.0,<3.0")) ; "bare range")]
    #[test_case("idna", Some(("idna", "*")) ; "no constraint")]
    #[test_case("pytest ; extra == 'test'", None ; "extras are skipped")]
    fn requires_dist_parsing(entry: &str, expected: Option<(&str, &str)>) {
        let parsed = PipResolver::parse_requires_dist(entry);
        match expected {
            Some((name, spec)) => {
                let dep = parsed.unwrap();
                assert_eq!(dep.package, name);
                assert_eq!(dep.spec.to_string(), spec);
            }
            None => assert!(parsed.is_none()),
        }
    }

    #[test]
    fn requirements_txt_parsing() {
        let deps = PipResolver::parse_requirements_txt(
            "# comment\n\
             requests==2.31.0\n\
             flask>=2.0,<3.0\n\
             -r other.txt\n\
             https://example.com/pkg.tar.gz\n\
             click\n",
        );
        let rendered: Vec<String> = deps.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec![
                "pip:requests@=2.31.0".to_string(),
                "pip:flask@>=2.0,<3.0".to_string(),
                "pip:click@*".to_string(),
            ]
        );
    }

    #[test]
    fn pyproject_parsing() {
        let (name, version, deps) = PipResolver::parse_pyproject(
            r#"
[project]
name = "demo"
version = "1.2.3"
dependencies = ["requests >=2.0", "click"]
"#,
        )
        .unwrap();
        assert_eq!(name, "demo");
        assert_eq!(version.to_string(), "1.2.3");
        assert_eq!(deps.len(), 2);
    }

    #[test]
    fn detects_python_projects() {
        let dir = tempfile::tempdir().unwrap();
        let repo = SourceRepository::from_path(dir.path());
        let resolver = PipResolver::new();
        assert!(!resolver.can_resolve_from_source(&repo));
        std::fs::write(dir.path().join("requirements.txt"), "requests\n").unwrap();
        assert!(resolver.can_resolve_from_source(&repo));
    }
}
