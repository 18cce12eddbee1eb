//! Autotools source-tree classification.
//!
//! A `configure.ac` names the libraries, headers and pkg-config modules a
//! package probes for. Each probe becomes an `ubuntu:` file-path dependency
//! (the same shape native-library discovery produces); the Ubuntu resolver
//! later maps those paths to the system packages owning them.

use crate::resolver::{Availability, DependencyResolver, ResolverError};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tangle_cache::PackageCache;
use tangle_core::{Dependency, Package, SourceRepository, Version, VersionSpec};
use tracing::{debug, warn};

static AC_INIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"AC_INIT\(\s*\[?([^\]\),]+)\]?\s*(?:,\s*\[?([^\]\),]+)\]?)?")
        .unwrap_or_else(|_| unreachable!())
});
static AC_CHECK_HEADERS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"AC_CHECK_HEADERS?\(\s*\[?([^\]\),]+)").unwrap_or_else(|_| unreachable!())
});
static AC_CHECK_LIB: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"AC_CHECK_LIB\(\s*\[?([A-Za-z0-9_+.-]+)").unwrap_or_else(|_| unreachable!())
});
static PKG_CHECK_MODULES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"PKG_CHECK_MODULES\(\s*\[?[^\],]+\]?\s*,\s*\[?([^\]\),]+)")
        .unwrap_or_else(|_| unreachable!())
});

/// Classifies the dependencies of autotools source trees from `configure.ac`.
#[derive(Debug, Default)]
pub struct AutotoolsResolver;

impl AutotoolsResolver {
    /// Create the resolver.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn configure_script(repo: &SourceRepository) -> Option<std::path::PathBuf> {
        ["configure.ac", "configure.in"]
            .iter()
            .map(|name| repo.path().join(name))
            .find(|path| path.exists())
    }

    /// `PKG_CHECK_MODULES(PREFIX, glib-2.0 >= 2.40)`: the module list may
    /// carry version constraints per module.
    fn parse_pkg_modules(modules: &str) -> Vec<Dependency> {
        let mut dependencies = Vec::new();
        let tokens: Vec<&str> = modules.split_whitespace().collect();
        let mut index = 0;
        while index < tokens.len() {
            let module = tokens[index];
            index += 1;
            let mut spec = VersionSpec::any();
            if index + 1 < tokens.len()
                && matches!(tokens[index], ">=" | "<=" | "=" | ">" | "<")
            {
                let raw = format!("{}{}", tokens[index], tokens[index + 1]);
                spec = VersionSpec::parse(&raw).unwrap_or_else(|_| VersionSpec::any());
                index += 2;
            }
            dependencies.push(Dependency::with_spec("ubuntu", format!("/{module}.pc"), spec));
        }
        dependencies
    }

    fn parse_configure(contents: &str) -> (Option<(String, Option<String>)>, Vec<Dependency>) {
        let mut dependencies = Vec::new();
        for captured in AC_CHECK_LIB.captures_iter(contents) {
            dependencies.push(Dependency::new("ubuntu", format!("/lib{}.so", &captured[1])));
        }
        for captured in AC_CHECK_HEADERS.captures_iter(contents) {
            for header in captured[1].split_whitespace() {
                dependencies.push(Dependency::new("ubuntu", format!("/{header}")));
            }
        }
        for captured in PKG_CHECK_MODULES.captures_iter(contents) {
            dependencies.extend(Self::parse_pkg_modules(&captured[1]));
        }
        let init = AC_INIT.captures(contents).map(|captured| {
            (
                captured[1].trim().to_string(),
                captured.get(2).map(|m| m.as_str().trim().to_string()),
            )
        });
        (init, dependencies)
    }
}

#[async_trait]
impl DependencyResolver for AutotoolsResolver {
    fn name(&self) -> &'static str {
        "autotools"
    }

    fn description(&self) -> &'static str {
        "classifies the dependencies of autotools source trees from configure.ac"
    }

    fn is_available(&self) -> Availability {
        Availability::available()
    }

    fn can_resolve_from_source(&self, repo: &SourceRepository) -> bool {
        Self::configure_script(repo).is_some()
    }

    async fn resolve_from_source(
        &self,
        repo: &SourceRepository,
        _cache: &dyn PackageCache,
    ) -> Result<Option<Package>, ResolverError> {
        let Some(script) = Self::configure_script(repo) else {
            return Ok(None);
        };
        let contents = std::fs::read_to_string(&script).map_err(|e| {
            ResolverError::failed(format!("failed to read {}: {e}", script.display()))
        })?;
        let (init, dependencies) = Self::parse_configure(&contents);
        let fallback_name = repo
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let (name, version) = init
            .map(|(name, version)| (name, version.and_then(|v| Version::parse(&v).ok())))
            .unwrap_or((fallback_name, None));
        let version =
            version.unwrap_or_else(|| Version::parse("0").unwrap_or_else(|_| unreachable!()));
        debug!(name, deps = dependencies.len(), "parsed configure.ac");
        Ok(Some(
            Package::new("autotools", name, version)
                .with_dependencies(dependencies)
                .with_source_repo(repo.path()),
        ))
    }

    async fn resolve(&self, dependency: &Dependency) -> Result<Vec<Package>, ResolverError> {
        // autotools packages exist only as source trees; there is no
        // registry to look versions up in
        warn!(%dependency, "autotools packages can not be resolved from a registry");
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CONFIGURE_AC: &str = r"
AC_INIT([libdemo], [1.4.2])
AC_CHECK_LIB([z], [deflate])
AC_CHECK_HEADERS([openssl/ssl.h])
PKG_CHECK_MODULES([GLIB], [glib-2.0 >= 2.40])
";

    #[test]
    fn parses_configure_macros() {
        let (init, deps) = AutotoolsResolver::parse_configure(CONFIGURE_AC);
        assert_eq!(init, Some(("libdemo".to_string(), Some("1.4.2".to_string()))));
        let rendered: Vec<String> = deps.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec![
                "ubuntu:/libz.so@*".to_string(),
                "ubuntu:/openssl/ssl.h@*".to_string(),
                "ubuntu:/glib-2.0.pc@>=2.40".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn source_package_from_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("configure.ac"), CONFIGURE_AC).unwrap();
        let repo = SourceRepository::from_path(dir.path());
        let resolver = AutotoolsResolver::new();
        assert!(resolver.can_resolve_from_source(&repo));

        let cache = tangle_cache::InMemoryPackageCache::new();
        let package = resolver
            .resolve_from_source(&repo, &cache)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(package.name, "libdemo");
        assert_eq!(package.version.to_string(), "1.4.2");
        assert_eq!(package.dependencies.len(), 3);
        assert!(package.is_source_package());
    }
}
