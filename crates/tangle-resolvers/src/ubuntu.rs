//! Ubuntu system-package resolution via `apt`.
//!
//! Dependencies are parsed out of `apt show -a` transcripts. A package name
//! beginning with `/` is a file path (produced by native-library discovery);
//! it resolves to the packages owning that file via `apt-file`.

use crate::native;
use crate::registry::resolver_by_name;
use crate::resolver::{Availability, DependencyResolver, ResolverError, RunOrder};
use crate::sandbox::container_runtime;
use crate::util::{command_exists, run_command, run_command_tolerant};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tangle_cache::PackageCache;
use tangle_core::{Dependency, Package, SourceRepository, Version, VersionSpec};
use tracing::{debug, warn};

/// `apt show` exit code for a package that does not exist.
const APT_NO_SUCH_PACKAGE: i32 = 100;

static VERSION_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:[0-9]+:)*(?P<version>[^-]*)(?:-.*)*$").unwrap_or_else(|_| unreachable!()));
static DEPENDS_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?P<package>[^\s(]+)\s*(?:\((?P<version>[^)]*)\))?\s*$").unwrap_or_else(|_| unreachable!()));

/// Transcript cache: `apt show -a` is slow and package lists don't change
/// within a run.
static APT_SHOW_CACHE: Lazy<Mutex<HashMap<String, Vec<Package>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Expands dependencies based upon Ubuntu package dependencies.
#[derive(Debug, Default)]
pub struct UbuntuResolver;

impl UbuntuResolver {
    /// Create the resolver.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Parse one `Version:` line into a package version, stripping the
    /// epoch, the Ubuntu revision and anything after a `~`.
    fn parse_version_line(line: &str, package_name: &str) -> Option<Version> {
        let raw = line.strip_prefix("Version: ")?;
        let captured = VERSION_LINE.captures(raw)?;
        let cleaned = captured.name("version")?.as_str();
        let cleaned = cleaned.split('~').next().unwrap_or(cleaned);
        match Version::parse(cleaned) {
            Ok(version) => Some(version),
            Err(_) => {
                warn!(package = package_name, line, "failed to parse version line");
                None
            }
        }
    }

    /// Parse one `Depends:` line. OR-alternatives (`a | b`) are flattened
    /// into separate ANDed dependencies.
    fn parse_depends_line(line: &str, package_name: &str) -> Result<Vec<Dependency>, ResolverError> {
        let mut dependencies = Vec::new();
        for segment in line.split(',') {
            for alternative in segment.split('|') {
                let captured = DEPENDS_SEGMENT.captures(alternative).ok_or_else(|| {
                    ResolverError::failed(format!(
                        "invalid dependency line in apt output for {package_name}: {line:?}"
                    ))
                })?;
                let dep_package = captured.name("package").map_or("", |m| m.as_str());
                let spec = captured
                    .name("version")
                    .map_or_else(VersionSpec::any, |constraint| {
                        Self::parse_depends_spec(constraint.as_str())
                    });
                dependencies.push(Dependency::with_spec("ubuntu", dep_package, spec));
            }
        }
        Ok(dependencies)
    }

    /// Dependency constraints keep their operator when the version parses;
    /// a constraint that still fails after stripping the Ubuntu revision
    /// (`>= 1:7.0.1-12` and friends) falls back to the wildcard.
    fn parse_depends_spec(constraint: &str) -> VersionSpec {
        let cleaned = constraint.split('-').next().unwrap_or(constraint);
        let cleaned: String = cleaned.split_whitespace().collect();
        VersionSpec::parse(&cleaned).unwrap_or_else(|_| VersionSpec::any())
    }

    /// Parse a complete `apt show -a` transcript into packages.
    ///
    /// `apt show` sometimes emits several stanzas that reduce to the same
    /// version with different `Depends:` lines; their dependency sets are
    /// unioned into a single package.
    fn parse_apt_show(package_name: &str, contents: &str) -> Result<Vec<Package>, ResolverError> {
        let mut stanzas: BTreeMap<Version, BTreeSet<Dependency>> = BTreeMap::new();
        let mut current: Option<Version> = None;
        for line in contents.lines() {
            if line.starts_with("Version: ") {
                current = Self::parse_version_line(line, package_name);
                if let Some(version) = &current {
                    stanzas.entry(version.clone()).or_default();
                }
            } else if let Some(version) = current.take_if(|_| line.starts_with("Depends: ")) {
                let depends = line.strip_prefix("Depends: ").unwrap_or_default();
                let deps = Self::parse_depends_line(depends, package_name)?;
                stanzas.entry(version).or_default().extend(deps);
            }
        }
        Ok(stanzas
            .into_iter()
            .map(|(version, dependencies)| {
                Package::new("ubuntu", package_name, version).with_dependencies(dependencies)
            })
            .collect())
    }

    /// All package versions `apt` knows for `package_name`, memoized.
    async fn ubuntu_packages(package_name: &str) -> Result<Vec<Package>, ResolverError> {
        if let Some(cached) = APT_SHOW_CACHE.lock().get(package_name) {
            return Ok(cached.clone());
        }
        debug!(package = package_name, "running `apt show -a`");
        let output = apt_command(&["show", "-a", package_name], &[APT_NO_SUCH_PACKAGE]).await?;
        let contents = String::from_utf8_lossy(&output);
        if contents.trim().is_empty() {
            warn!(
                package = package_name,
                "package not found in ubuntu apt sources"
            );
        }
        let packages = Self::parse_apt_show(package_name, &contents)?;
        APT_SHOW_CACHE
            .lock()
            .insert(package_name.to_string(), packages.clone());
        Ok(packages)
    }

    /// Resolve a file path to the packages that provide it.
    async fn file_to_packages(path: &str) -> Result<Vec<String>, ResolverError> {
        debug!(path, "running `apt-file -x search`");
        let output = apt_file_command(&["-x", "search", path]).await?;
        let contents = String::from_utf8_lossy(&output);
        let mut owners: Vec<String> = contents
            .lines()
            .filter_map(|line| line.split_once(": ").map(|(package, _)| package.to_string()))
            .collect();
        owners.sort();
        owners.dedup();
        Ok(owners)
    }
}

/// Run `apt` locally when installed, otherwise inside a disposable
/// container.
async fn apt_command(args: &[&str], tolerated: &[i32]) -> Result<Vec<u8>, ResolverError> {
    if command_exists("apt") {
        return run_command_tolerant("apt", args, None, tolerated).await;
    }
    let runtime = container_runtime().ok_or_else(|| ResolverError::NotAvailable {
        reason: "`ubuntu` resolver needs apt or a container runtime (docker)".to_string(),
    })?;
    let script = format!(
        "apt-get update -qq > /dev/null 2>&1; apt {}",
        args.join(" ")
    );
    run_command(runtime, &["run", "--rm", "ubuntu:20.04", "bash", "-c", &script], None).await
}

async fn apt_file_command(args: &[&str]) -> Result<Vec<u8>, ResolverError> {
    if command_exists("apt-file") {
        return run_command("apt-file", args, None).await;
    }
    let runtime = container_runtime().ok_or_else(|| ResolverError::NotAvailable {
        reason: "`ubuntu` resolver needs apt-file or a container runtime (docker)".to_string(),
    })?;
    let script = format!(
        "apt-get update -qq > /dev/null 2>&1; \
         apt-get install -qqy apt-file > /dev/null 2>&1; \
         apt-file update > /dev/null 2>&1; apt-file {}",
        args.join(" ")
    );
    run_command(runtime, &["run", "--rm", "ubuntu:20.04", "bash", "-c", &script], None).await
}

#[async_trait]
impl DependencyResolver for UbuntuResolver {
    fn name(&self) -> &'static str {
        "ubuntu"
    }

    fn description(&self) -> &'static str {
        "expands dependencies based upon Ubuntu package dependencies"
    }

    fn is_available(&self) -> Availability {
        if command_exists("apt") || container_runtime().is_some() {
            Availability::available()
        } else {
            Availability::unavailable(
                "`ubuntu` resolver needs apt or Docker installed. Try apt install docker.io.",
            )
        }
    }

    fn run_order(&self) -> RunOrder {
        RunOrder::Last
    }

    fn can_resolve_from_source(&self, _repo: &SourceRepository) -> bool {
        false
    }

    async fn resolve_from_source(
        &self,
        _repo: &SourceRepository,
        _cache: &dyn PackageCache,
    ) -> Result<Option<Package>, ResolverError> {
        Ok(None)
    }

    async fn resolve(&self, dependency: &Dependency) -> Result<Vec<Package>, ResolverError> {
        if dependency.source != "ubuntu" {
            return Err(ResolverError::failed(format!(
                "ubuntu resolver can not resolve dependencies from other sources ({dependency})"
            )));
        }
        if dependency.package.starts_with('/') {
            // a file path produced by native-library discovery
            let owners = match Self::file_to_packages(&dependency.package).await {
                Ok(owners) => owners,
                Err(error) => {
                    warn!(path = dependency.package, %error, "apt-file search failed");
                    return Ok(Vec::new());
                }
            };
            if owners.is_empty() {
                return Ok(Vec::new());
            }
            let deps = owners
                .into_iter()
                .map(|owner| Dependency::new("ubuntu", owner));
            let version = Version::parse("0").map_err(ResolverError::Core)?;
            return Ok(vec![
                Package::new("ubuntu", dependency.package.clone(), version)
                    .with_dependencies(deps),
            ]);
        }
        let packages = Self::ubuntu_packages(&dependency.package).await?;
        Ok(packages
            .into_iter()
            .filter(|package| dependency.spec.matches(&package.version))
            .collect())
    }

    fn can_update_dependencies(&self, package: &Package) -> bool {
        package.source != self.name()
            && self.is_available().is_available()
            && resolver_by_name(&package.source)
                .is_ok_and(|resolver| resolver.docker_setup().is_some())
    }

    async fn update_dependencies(&self, package: Package) -> Package {
        match native::native_dependencies(&package, true).await {
            Ok(native_deps) => package.update_dependencies(native_deps),
            Err(error) => {
                warn!(package = %package, %error, "native dependency discovery failed");
                package
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    /// Two stanzas reducing to the same upstream version (2.8.1) with
    /// different Depends lines; the parsed package unions them.
    const DKMS_TRANSCRIPT: &str = "\
Package: dkms
Version: 2.8.1-5ubuntu2
Priority: optional
Section: admin
Origin: Ubuntu
Installed-Size: 296 kB
Pre-Depends: lsb-release
Depends: kmod | kldutils, gcc | c-compiler, dpkg-dev, make | build-essential, coreutils (>= 7.4), patch, dctrl-tools
Recommends: fakeroot, sudo, linux-headers-686-pae | linux-headers-amd64 | linux-headers-generic
Suggests: menu, e2fsprogs
Breaks: shim-signed (<< 1.34~)
Homepage: https://github.com/dell-oss/dkms
Description: Dynamic Kernel Module Support Framework

Package: dkms
Version: 2.8.1-5ubuntu1
Priority: optional
Section: admin
Origin: Ubuntu
Installed-Size: 296 kB
Pre-Depends: lsb-release
Depends: kmod | kldutils, gcc | c-compiler, dpkg-dev, make | build-essential, coreutils (>= 7.4), patch
Recommends: fakeroot, sudo
Suggests: menu, e2fsprogs
Breaks: shim-signed (<< 1.34~)
Homepage: https://github.com/dell-oss/dkms
Description: Dynamic Kernel Module Support Framework
";

    #[test]
    fn parses_apt_show_with_duplicate_versions() {
        let packages = UbuntuResolver::parse_apt_show("dkms", DKMS_TRANSCRIPT).unwrap();
        assert_eq!(packages.len(), 1, "duplicate version stanzas are unioned");
        assert_eq!(
            packages[0].to_string(),
            "ubuntu:dkms@2.8.1[ubuntu:build-essential@*,ubuntu:c-compiler@*,\
             ubuntu:coreutils@>=7.4,ubuntu:dctrl-tools@*,ubuntu:dpkg-dev@*,\
             ubuntu:gcc@*,ubuntu:kldutils@*,ubuntu:kmod@*,ubuntu:make@*,ubuntu:patch@*]"
        );
    }

    #[test]
    fn distinct_versions_stay_separate() {
        let transcript = "\
Package: libfoo
Version: 2.0.0-1ubuntu1
Depends: libc6 (>= 2.29)

Package: libfoo
Version: 1.9.0-3
Depends: libc6 (>= 2.27)
";
        let packages = UbuntuResolver::parse_apt_show("libfoo", transcript).unwrap();
        assert_eq!(packages.len(), 2);
        let versions: Vec<String> = packages.iter().map(|p| p.version.to_string()).collect();
        assert_eq!(versions, vec!["1.9.0", "2.0.0"]);
    }

    #[test_case("Version: 2.8.1-5ubuntu2", "2.8.1" ; "revision stripped")]
    #[test_case("Version: 1:7.0.1-12ubuntu1", "7.0.1" ; "epoch stripped")]
    #[test_case("Version: 1.34~rc2-1", "1.34" ; "tilde truncated")]
    fn version_line_parsing(line: &str, expected: &str) {
        let version = UbuntuResolver::parse_version_line(line, "test").unwrap();
        assert_eq!(version.to_string(), expected);
    }

    #[test_case(">= 7.4", ">=7.4" ; "operator kept")]
    #[test_case(">= 2.29-10ubuntu4", ">=2.29" ; "revision dropped")]
    #[test_case("= 1:7.0.1", "*" ; "epoch falls back to wildcard")]
    #[test_case("<< 1.34", "*" ; "debian only operator falls back")]
    fn depends_spec_parsing(constraint: &str, expected: &str) {
        assert_eq!(
            UbuntuResolver::parse_depends_spec(constraint).to_string(),
            expected
        );
    }

    #[tokio::test]
    async fn rejects_foreign_sources() {
        let resolver = UbuntuResolver::new();
        let dep = Dependency::new("pip", "whatever");
        assert!(resolver.resolve(&dep).await.is_err());
    }
}
