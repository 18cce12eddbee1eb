//! Go module resolution via `go.mod` parsing.
//!
//! Go requirements pin exact versions, so the constraint grammar here is
//! string equality. Resolving a dependency fetches the target module's own
//! `go.mod`: straight from raw.githubusercontent.com for GitHub-hosted
//! modules, via a shallow git fetch otherwise.

use crate::resolver::{Availability, DependencyResolver, ResolverError};
use crate::util::command_exists;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use tangle_cache::PackageCache;
use tangle_core::{Dependency, Package, SourceRepository, Version, VersionSpec};
use tokio::process::Command;
use tracing::{debug, warn};

static MODULE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*module\s+(\S+)\s*$").unwrap_or_else(|_| unreachable!()));
static REQUIRE_SINGLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*require\s+(\S+)\s+(\S+)\s*(?://.*)?$").unwrap_or_else(|_| unreachable!())
});
static REQUIRE_BLOCK_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*require\s+\(\s*$").unwrap_or_else(|_| unreachable!()));
static REQUIRE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\S+)\s+(\S+)\s*(?://.*)?$").unwrap_or_else(|_| unreachable!())
});
static GITHUB_MODULE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^github\.com/(?P<org>[^/]+)/(?P<repo>[^/]+)").unwrap_or_else(|_| unreachable!())
});

/// A parsed `go.mod`: the module path and its `require` entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoModule {
    /// The module path from the `module` line.
    pub name: String,
    /// `(module path, pinned version)` pairs from `require`.
    pub dependencies: Vec<(String, String)>,
}

impl GoModule {
    /// Parse `go.mod` contents: the `module` line plus single-line and
    /// block-form `require` entries (`// indirect` markers included).
    pub fn parse_mod(contents: &str) -> Result<Self, ResolverError> {
        let mut name = None;
        let mut dependencies = Vec::new();
        let mut in_require = false;
        for line in contents.lines() {
            if in_require {
                if line.trim() == ")" {
                    in_require = false;
                } else if let Some(captured) = REQUIRE_LINE.captures(line) {
                    dependencies.push((captured[1].to_string(), captured[2].to_string()));
                }
            } else if let Some(captured) = REQUIRE_SINGLE.captures(line) {
                dependencies.push((captured[1].to_string(), captured[2].to_string()));
            } else if name.is_none()
                && let Some(captured) = MODULE_LINE.captures(line)
            {
                name = Some(captured[1].to_string());
            } else {
                in_require = REQUIRE_BLOCK_START.is_match(line);
            }
        }
        let name = name
            .ok_or_else(|| ResolverError::failed("missing `module` line in go mod specification"))?;
        Ok(Self { name, dependencies })
    }

    /// Go pseudo-versions (`v0.0.0-20150119174127-31079b680792`) embed the
    /// commit hash as their last segment; plain tags stay as they are.
    #[must_use]
    pub fn tag_to_git_hash(tag: &str) -> &str {
        let segments: Vec<&str> = tag.split('-').collect();
        if segments.len() == 3 {
            segments[2]
        } else {
            tag
        }
    }
}

/// Classifies the dependencies of Go modules from their `go.mod` files.
#[derive(Debug, Default)]
pub struct GoResolver {
    client: reqwest::Client,
}

impl GoResolver {
    /// Create the resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the `go.mod` of `module` at `tag`. A module with no fetchable
    /// `go.mod` has no dependencies.
    async fn fetch_module(&self, module: &str, tag: &str) -> GoModule {
        let empty = GoModule {
            name: module.to_string(),
            dependencies: Vec::new(),
        };
        if let Some(captured) = GITHUB_MODULE.captures(module) {
            let url = format!(
                "https://raw.githubusercontent.com/{}/{}/{tag}/go.mod",
                &captured["org"], &captured["repo"]
            );
            debug!(url, "fetching go.mod");
            if let Ok(response) = self.client.get(&url).send().await
                && response.status().is_success()
                && let Ok(contents) = response.text().await
                && let Ok(module) = GoModule::parse_mod(&contents)
            {
                return module;
            }
        }
        match self.clone_module(module, tag).await {
            Ok(Some(parsed)) => parsed,
            Ok(None) => empty,
            Err(error) => {
                warn!(module, tag, %error, "could not fetch go.mod");
                empty
            }
        }
    }

    /// Shallow-fetch the module's repository at the tagged commit and read
    /// its `go.mod`. Returns `Ok(None)` when the checkout has none.
    async fn clone_module(
        &self,
        module: &str,
        tag: &str,
    ) -> Result<Option<GoModule>, ResolverError> {
        let checkout = tempfile::tempdir()
            .map_err(|e| ResolverError::failed(format!("failed to create checkout dir: {e}")))?;
        let git_url = format!("https://{module}");
        let hash = GoModule::tag_to_git_hash(tag);
        git(&["init"], checkout.path()).await?;
        git(&["remote", "add", "origin", &git_url], checkout.path()).await?;
        if git(&["fetch", "--depth", "1", "origin", hash], checkout.path())
            .await
            .is_err()
        {
            // not all git servers support depth-1 fetches of a hash
            git(&["fetch", "origin"], checkout.path()).await?;
        }
        git(&["checkout", "FETCH_HEAD"], checkout.path()).await?;
        let go_mod = checkout.path().join("go.mod");
        if !go_mod.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&go_mod)
            .map_err(|e| ResolverError::failed(format!("failed to read go.mod: {e}")))?;
        GoModule::parse_mod(&contents).map(Some)
    }
}

async fn git(args: &[&str], cwd: &Path) -> Result<(), ResolverError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .env("GIT_TERMINAL_PROMPT", "0")
        .env("GIT_SSH_COMMAND", "ssh -oControlMaster=no -oBatchMode=yes")
        .output()
        .await
        .map_err(|e| ResolverError::failed(format!("failed to spawn git: {e}")))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(ResolverError::failed(format!(
            "git {} exited with {}",
            args.join(" "),
            output.status
        )))
    }
}

#[async_trait]
impl DependencyResolver for GoResolver {
    fn name(&self) -> &'static str {
        "go"
    }

    fn description(&self) -> &'static str {
        "classifies the dependencies of Go modules from their go.mod files"
    }

    fn is_available(&self) -> Availability {
        if command_exists("git") {
            Availability::available()
        } else {
            Availability::unavailable(
                "`git` does not appear to be installed! \
                 Make sure it is installed and in the PATH.",
            )
        }
    }

    fn parse_version(&self, version: &str) -> tangle_core::Result<Version> {
        Ok(Version::raw(version.trim().trim_start_matches('=')))
    }

    fn parse_spec(&self, spec: &str) -> tangle_core::Result<VersionSpec> {
        Ok(VersionSpec::exact_raw(spec.trim()))
    }

    fn can_resolve_from_source(&self, repo: &SourceRepository) -> bool {
        self.is_available().is_available() && repo.path().join("go.mod").exists()
    }

    async fn resolve_from_source(
        &self,
        repo: &SourceRepository,
        _cache: &dyn PackageCache,
    ) -> Result<Option<Package>, ResolverError> {
        let go_mod = repo.path().join("go.mod");
        if !go_mod.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&go_mod)
            .map_err(|e| ResolverError::failed(format!("failed to read go.mod: {e}")))?;
        let module = GoModule::parse_mod(&contents)?;
        let commit = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(repo.path())
            .output()
            .await
            .ok()
            .filter(|output| output.status.success())
            .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string());
        let version = Version::raw(format!(
            "v0.0.0-{}",
            commit.as_deref().unwrap_or("????")
        ));
        Ok(Some(
            Package::new("go", module.name, version)
                .with_dependencies(module.dependencies.iter().map(|(package, version)| {
                    Dependency::with_spec(
                        "go",
                        package,
                        VersionSpec::exact_raw(format!("={version}")),
                    )
                }))
                .with_source_repo(repo.path()),
        ))
    }

    async fn resolve(&self, dependency: &Dependency) -> Result<Vec<Package>, ResolverError> {
        if dependency.source != self.name() {
            return Ok(Vec::new());
        }
        let spec_string = dependency.spec.to_string();
        let tag = spec_string.trim_start_matches('=');
        let tag = if tag == "*" { "HEAD" } else { tag };
        let module = self.fetch_module(&dependency.package, tag).await;
        let version = if tag == "HEAD" { "v0.0.0" } else { tag };
        Ok(vec![
            Package::new("go", module.name, Version::raw(version)).with_dependencies(
                module.dependencies.iter().map(|(package, version)| {
                    Dependency::with_spec(
                        "go",
                        package,
                        VersionSpec::exact_raw(format!("={version}")),
                    )
                }),
            ),
        ])
    }

    async fn repository_url(&self, package: &Package) -> Option<String> {
        GITHUB_MODULE.captures(&package.name).map(|captured| {
            format!(
                "https://github.com/{}/{}",
                &captured["org"], &captured["repo"]
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const BTCD_GO_MOD: &str = "\
module github.com/btcsuite/btcd

require (
\tgithub.com/btcsuite/btclog v0.0.0-20170628155309-84c8d2346e9f
\tgithub.com/btcsuite/btcutil v0.0.0-20190425235716-9e5f4b9a998d
\tgithub.com/btcsuite/go-socks v0.0.0-20170105172521-4720035b7bfd
\tgithub.com/btcsuite/goleveldb v1.0.0
\tgithub.com/btcsuite/snappy-go v1.0.0
\tgithub.com/btcsuite/websocket v0.0.0-20150119174127-31079b680792
\tgithub.com/btcsuite/winsvc v1.0.0
\tgithub.com/davecgh/go-spew v1.1.1
\tgithub.com/decred/dcrd/lru v1.0.0
\tgithub.com/jessevdk/go-flags v1.4.0
\tgithub.com/jrick/logrotate v1.0.0
\tgithub.com/kkdai/bstream v0.0.0-20161212061736-f391b8402d23
\tgithub.com/onsi/ginkgo v1.7.0 // indirect
\tgithub.com/onsi/gomega v1.4.3 // indirect
\tgolang.org/x/crypto v0.0.0-20170930174604-8ac0e0d97ce4
)
";

    #[test]
    fn parses_btcd_go_mod() {
        let module = GoModule::parse_mod(BTCD_GO_MOD).unwrap();
        assert_eq!(module.name, "github.com/btcsuite/btcd");
        assert_eq!(module.dependencies.len(), 15);
        assert!(module.dependencies.contains(&(
            "github.com/btcsuite/websocket".to_string(),
            "v0.0.0-20150119174127-31079b680792".to_string()
        )));
    }

    #[test]
    fn parses_single_line_requires() {
        let module = GoModule::parse_mod(
            "module example.com/demo\n\
             require github.com/pkg/errors v0.9.1\n",
        )
        .unwrap();
        assert_eq!(
            module.dependencies,
            vec![("github.com/pkg/errors".to_string(), "v0.9.1".to_string())]
        );
    }

    #[test]
    fn missing_module_line_is_an_error() {
        assert!(GoModule::parse_mod("require (\n)\n").is_err());
    }

    #[test]
    fn tag_to_git_hash_extracts_pseudo_version_hash() {
        assert_eq!(
            GoModule::tag_to_git_hash("v0.0.0-20150119174127-31079b680792"),
            "31079b680792"
        );
        assert_eq!(GoModule::tag_to_git_hash("v1.4.0"), "v1.4.0");
    }

    #[test]
    fn go_specs_are_exact_strings() {
        let resolver = GoResolver::new();
        let spec = resolver.parse_spec("v1.4.0").unwrap();
        assert!(spec.matches(&Version::raw("v1.4.0")));
        assert!(!spec.matches(&Version::raw("v1.4.1")));
    }
}
