//! The contract every ecosystem resolver implements.

use async_trait::async_trait;
use tangle_cache::PackageCache;
use tangle_core::{Dependency, Package, SourceRepository, Version, VersionSpec};
use thiserror::Error;

/// Why a resolver call produced no useful result.
///
/// The engine pattern-matches on this instead of catching exceptions:
/// an unavailable or inapplicable resolver is skipped silently, a failed
/// one is logged and yields no packages.
#[derive(Debug, Error)]
pub enum ResolverError {
    /// The resolver's required external tool is absent.
    #[error("resolver not available: {reason}")]
    NotAvailable {
        /// What is missing and how to get it.
        reason: String,
    },

    /// The resolver does not apply to the given input.
    #[error("resolver not applicable to this input")]
    NotApplicable,

    /// An external command or network call failed.
    #[error("{0}")]
    Failed(String),

    /// A data-model error (parsing, cache conflicts) that must propagate.
    #[error(transparent)]
    Core(#[from] tangle_core::Error),
}

impl ResolverError {
    /// Create a [`ResolverError::Failed`] from any displayable cause.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Result of a resolver's capability probe.
#[derive(Debug, Clone)]
pub struct Availability {
    available: bool,
    reason: String,
}

impl Availability {
    /// The resolver can run.
    #[must_use]
    pub fn available() -> Self {
        Self {
            available: true,
            reason: String::new(),
        }
    }

    /// The resolver cannot run, and `reason` says why.
    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: reason.into(),
        }
    }

    /// True if the resolver can run.
    #[must_use]
    pub const fn is_available(&self) -> bool {
        self.available
    }

    /// Why the resolver cannot run (empty when it can).
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Scripts an enrichment resolver runs inside the sandbox container.
#[derive(Debug, Clone)]
pub struct DockerSetup {
    /// apt packages installed into the sandbox image.
    pub apt_get_packages: Vec<&'static str>,
    /// Script installing one package at `$1` version `$2`.
    pub install_package_script: &'static str,
    /// Script dynamically loading the package named `$1`.
    pub load_package_script: &'static str,
    /// Script exercising a bare runtime, for baseline subtraction.
    pub baseline_script: &'static str,
    /// Extra Dockerfile lines appended after package installation.
    pub post_install: &'static str,
}

/// Where a resolver sorts in the enrichment pass. Ubuntu runs after every
/// other resolver so that native-library attachment sees final metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunOrder {
    /// No ordering requirement.
    Normal,
    /// Run after all `Normal` resolvers.
    Last,
}

/// Finds sets of [`Package`]s that agree with a [`Dependency`] specification.
///
/// Implementations are registered once at startup and shared as trait
/// objects; all methods take `&self` and must be safe to call concurrently.
#[async_trait]
pub trait DependencyResolver: Send + Sync {
    /// Unique registry name; the `source` field of everything this
    /// resolver produces.
    fn name(&self) -> &'static str;

    /// One-line description for `--list`.
    fn description(&self) -> &'static str;

    /// Probe for the external tools this resolver needs.
    fn is_available(&self) -> Availability {
        Availability::available()
    }

    /// Parse a version string using this ecosystem's syntax.
    fn parse_version(&self, version: &str) -> tangle_core::Result<Version> {
        Version::parse(version)
    }

    /// Parse a constraint string using this ecosystem's syntax.
    fn parse_spec(&self, spec: &str) -> tangle_core::Result<VersionSpec> {
        VersionSpec::parse(spec)
    }

    /// Where this resolver sorts in the enrichment pass.
    fn run_order(&self) -> RunOrder {
        RunOrder::Normal
    }

    /// Sandbox scripts for native-library discovery, if this ecosystem
    /// supports dynamically loading its packages.
    fn docker_setup(&self) -> Option<DockerSetup> {
        None
    }

    /// Does this source tree look like something I handle?
    fn can_resolve_from_source(&self, repo: &SourceRepository) -> bool;

    /// Produce the root source package from a local tree. Resolvers may use
    /// `cache` to stash intermediate packages they discover along the way.
    async fn resolve_from_source(
        &self,
        repo: &SourceRepository,
        cache: &dyn PackageCache,
    ) -> Result<Option<Package>, ResolverError>;

    /// Expand a dependency into every known package satisfying it, each
    /// carrying its own dependency list.
    async fn resolve(&self, dependency: &Dependency) -> Result<Vec<Package>, ResolverError>;

    /// The package's upstream source repository URL, if the ecosystem's
    /// registry knows one. Feeds the maintenance checker.
    async fn repository_url(&self, _package: &Package) -> Option<String> {
        None
    }

    /// Can this resolver add dependencies to a package produced by a
    /// different resolver?
    fn can_update_dependencies(&self, _package: &Package) -> bool {
        false
    }

    /// Enrich `package` with additional dependencies (monotonic).
    async fn update_dependencies(&self, package: Package) -> Package {
        package
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn availability_carries_reason() {
        assert!(Availability::available().is_available());
        let gone = Availability::unavailable("docker is not installed");
        assert!(!gone.is_available());
        assert_eq!(gone.reason(), "docker is not installed");
    }

    #[test]
    fn run_order_sorts_last_after_normal() {
        assert!(RunOrder::Normal < RunOrder::Last);
    }
}
