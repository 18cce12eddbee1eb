//! CMake source-tree classification.
//!
//! A `CMakeLists.txt` declares its system requirements through
//! `find_package`, `pkg_check_modules` and `check_include_file` calls. As
//! with autotools, every probe becomes an `ubuntu:` file-path dependency
//! that the Ubuntu resolver maps to owning system packages.

use crate::resolver::{Availability, DependencyResolver, ResolverError};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tangle_cache::PackageCache;
use tangle_core::{Dependency, Package, SourceRepository, Version, VersionSpec};
use tracing::{debug, warn};

static PROJECT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^\s*project\s*\(\s*([A-Za-z0-9_.-]+)([^)]*)\)")
        .unwrap_or_else(|_| unreachable!())
});
static PROJECT_VERSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)VERSION\s+([0-9][^\s)]*)").unwrap_or_else(|_| unreachable!())
});
static FIND_PACKAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^\s*find_package\s*\(\s*([A-Za-z0-9_.-]+)\s*([^)]*)\)")
        .unwrap_or_else(|_| unreachable!())
});
static PKG_CHECK_MODULES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^\s*pkg_check_modules\s*\(\s*[A-Za-z0-9_.-]+\s+([^)]*)\)")
        .unwrap_or_else(|_| unreachable!())
});
static CHECK_INCLUDE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?im)^\s*check_include_files?(?:_cxx)?\s*\(\s*"?([A-Za-z0-9/_.-]+)"?"#)
        .unwrap_or_else(|_| unreachable!())
});

const FIND_PACKAGE_KEYWORDS: &[&str] = &[
    "EXACT",
    "QUIET",
    "REQUIRED",
    "COMPONENTS",
    "OPTIONAL_COMPONENTS",
    "CONFIG",
    "NO_MODULE",
    "NAMES",
    "CONFIGS",
    "HINTS",
    "PATHS",
];

/// Classifies the dependencies of `CMake` source trees from `CMakeLists.txt`.
#[derive(Debug, Default)]
pub struct CmakeResolver;

impl CmakeResolver {
    /// Create the resolver.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn parse_cmakelists(
        contents: &str,
    ) -> (Option<(String, Option<String>)>, Vec<Dependency>) {
        let mut dependencies = Vec::new();

        for captured in FIND_PACKAGE.captures_iter(contents) {
            let name = captured[1].to_string();
            // the first non-keyword argument is a version constraint
            let spec = captured[2]
                .split_whitespace()
                .next()
                .filter(|arg| !FIND_PACKAGE_KEYWORDS.contains(arg))
                .and_then(|version| VersionSpec::parse(&format!(">={version}")).ok())
                .unwrap_or_else(VersionSpec::any);
            // config-mode packages install <Name>Config.cmake
            dependencies.push(Dependency::with_spec(
                "ubuntu",
                format!("/{name}Config.cmake"),
                spec,
            ));
        }
        for captured in PKG_CHECK_MODULES.captures_iter(contents) {
            for module in captured[1].split_whitespace() {
                if FIND_PACKAGE_KEYWORDS.contains(&module) {
                    continue;
                }
                // strip inline constraints like glib-2.0>=2.40
                let name = module
                    .split(|c| c == '>' || c == '<' || c == '=')
                    .next()
                    .unwrap_or(module);
                dependencies.push(Dependency::new("ubuntu", format!("/{name}.pc")));
            }
        }
        for captured in CHECK_INCLUDE.captures_iter(contents) {
            dependencies.push(Dependency::new("ubuntu", format!("/{}", &captured[1])));
        }

        let project = PROJECT.captures(contents).map(|captured| {
            let version = PROJECT_VERSION
                .captures(&captured[2])
                .map(|v| v[1].to_string());
            (captured[1].to_string(), version)
        });
        (project, dependencies)
    }
}

#[async_trait]
impl DependencyResolver for CmakeResolver {
    fn name(&self) -> &'static str {
        "cmake"
    }

    fn description(&self) -> &'static str {
        "classifies the dependencies of CMake source trees from CMakeLists.txt"
    }

    fn is_available(&self) -> Availability {
        Availability::available()
    }

    fn can_resolve_from_source(&self, repo: &SourceRepository) -> bool {
        repo.path().join("CMakeLists.txt").exists()
    }

    async fn resolve_from_source(
        &self,
        repo: &SourceRepository,
        _cache: &dyn PackageCache,
    ) -> Result<Option<Package>, ResolverError> {
        let path = repo.path().join("CMakeLists.txt");
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| ResolverError::failed(format!("failed to read {}: {e}", path.display())))?;
        let (project, dependencies) = Self::parse_cmakelists(&contents);
        let fallback_name = repo
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let (name, version) = project.unwrap_or((fallback_name, None));
        let version = version
            .and_then(|v| Version::parse(&v).ok())
            .unwrap_or_else(|| Version::parse("0").unwrap_or_else(|_| unreachable!()));
        debug!(name, deps = dependencies.len(), "parsed CMakeLists.txt");
        Ok(Some(
            Package::new("cmake", name, version)
                .with_dependencies(dependencies)
                .with_source_repo(repo.path()),
        ))
    }

    async fn resolve(&self, dependency: &Dependency) -> Result<Vec<Package>, ResolverError> {
        warn!(%dependency, "cmake packages can not be resolved from a registry");
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CMAKELISTS: &str = r#"
cmake_minimum_required(VERSION 3.10)
project(demo VERSION 2.1.0 LANGUAGES C)

find_package(ZLIB 1.2 REQUIRED)
find_package(Threads REQUIRED)
pkg_check_modules(GLIB REQUIRED glib-2.0>=2.40)
check_include_file("openssl/ssl.h" HAVE_SSL_H)
"#;

    #[test]
    fn parses_cmakelists() {
        let (project, deps) = CmakeResolver::parse_cmakelists(CMAKELISTS);
        assert_eq!(
            project,
            Some(("demo".to_string(), Some("2.1.0".to_string())))
        );
        let rendered: Vec<String> = deps.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec![
                "ubuntu:/ZLIBConfig.cmake@>=1.2".to_string(),
                "ubuntu:/ThreadsConfig.cmake@*".to_string(),
                "ubuntu:/glib-2.0.pc@*".to_string(),
                "ubuntu:/openssl/ssl.h@*".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn source_package_from_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("CMakeLists.txt"), CMAKELISTS).unwrap();
        let repo = SourceRepository::from_path(dir.path());
        let resolver = CmakeResolver::new();
        assert!(resolver.can_resolve_from_source(&repo));

        let cache = tangle_cache::InMemoryPackageCache::new();
        let package = resolver
            .resolve_from_source(&repo, &cache)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(package.name, "demo");
        assert_eq!(package.version.to_string(), "2.1.0");
        assert_eq!(package.dependencies.len(), 4);
    }
}
