//! Packages, dependencies, vulnerabilities and maintenance metadata.
//!
//! A [`Dependency`] is a `(source, package, version-spec)` requirement where
//! `source` names the resolver that knows how to expand it. A [`Package`] is
//! identified by `(source, name, version)`; its dependency and vulnerability
//! sets only ever grow (monotonic set union).

use crate::error::{Error, Result};
use crate::version::{Version, VersionSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// A dependency requirement: which resolver, which package, which versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dependency {
    /// Name of the resolver this dependency belongs to.
    pub source: String,
    /// Package name within that ecosystem.
    pub package: String,
    /// Alias under which the package is required, for ecosystems (npm) that
    /// allow renaming a package inside a dependency tree.
    pub alias: Option<String>,
    /// Version constraint.
    pub spec: VersionSpec,
}

impl Dependency {
    /// Create a dependency with the wildcard spec.
    #[must_use]
    pub fn new(source: impl Into<String>, package: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            package: package.into(),
            alias: None,
            spec: VersionSpec::any(),
        }
    }

    /// Create a dependency with an explicit spec.
    #[must_use]
    pub fn with_spec(
        source: impl Into<String>,
        package: impl Into<String>,
        spec: VersionSpec,
    ) -> Self {
        Self {
            source: source.into(),
            package: package.into(),
            alias: None,
            spec,
        }
    }

    /// Attach an alias to this dependency.
    #[must_use]
    pub fn aliased(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// `source:package`.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}:{}", self.source, self.package)
    }

    /// Parse `source:package[@spec]` (or `source:alias@package@spec` for
    /// aliased dependencies). The spec defaults to the wildcard.
    pub fn from_string(description: &str) -> Result<Self> {
        let err = || Error::DependencyParse {
            input: description.to_string(),
        };
        let (source, tail) = description.split_once(':').ok_or_else(err)?;
        if source.is_empty() || tail.is_empty() {
            return Err(err());
        }
        let segments: Vec<&str> = tail.splitn(3, '@').collect();
        let (package, alias, spec) = match segments.as_slice() {
            [package] => ((*package).to_string(), None, VersionSpec::any()),
            [package, spec] => (
                (*package).to_string(),
                None,
                VersionSpec::parse(spec).map_err(|_| err())?,
            ),
            // a leading '@' is a scoped package name, not an alias
            ["", scoped, spec] => (
                format!("@{scoped}"),
                None,
                VersionSpec::parse(spec).map_err(|_| err())?,
            ),
            [alias, package, spec] => (
                (*package).to_string(),
                Some((*alias).to_string()),
                VersionSpec::parse(spec).map_err(|_| err())?,
            ),
            _ => return Err(err()),
        };
        if package.is_empty() {
            return Err(err());
        }
        Ok(Self {
            source: source.to_string(),
            package,
            alias,
            spec,
        })
    }

    /// True if `package` is a solution for this dependency.
    #[must_use]
    pub fn matches(&self, package: &Package) -> bool {
        package.source == self.source
            && package.name == self.package
            && self.spec.matches(&package.version)
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.alias {
            Some(alias) => write!(f, "{}:{alias}@{}@{}", self.source, self.package, self.spec),
            None => write!(f, "{}:{}@{}", self.source, self.package, self.spec),
        }
    }
}

impl FromStr for Dependency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_string(s)
    }
}

/// A known vulnerability. Identity and ordering are on `id` alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vulnerability {
    /// Canonical identifier (e.g. an OSV or CVE id).
    pub id: String,
    /// Alternative identifiers for the same issue.
    pub aliases: Vec<String>,
    /// Short human-readable summary.
    pub summary: String,
}

impl Vulnerability {
    /// Create a vulnerability record.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        aliases: impl IntoIterator<Item = String>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            aliases: aliases.into_iter().collect(),
            summary: summary.into(),
        }
    }

    /// `id (alias, alias, ...)` one-line form.
    #[must_use]
    pub fn to_compact_str(&self) -> String {
        format!("{} ({})", self.id, self.aliases.join(", "))
    }
}

impl PartialEq for Vulnerability {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Vulnerability {}

impl Hash for Vulnerability {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Ord for Vulnerability {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl PartialOrd for Vulnerability {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Upstream maintenance status for a package's source repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceInfo {
    /// Canonical repository URL, when one could be determined.
    pub repository_url: Option<String>,
    /// Timestamp of the most recent commit activity.
    pub last_commit_date: Option<DateTime<Utc>>,
    /// Whether the repository looks unmaintained.
    pub is_stale: Option<bool>,
    /// Days elapsed since the last observed update.
    pub days_since_update: Option<i64>,
    /// Error encountered while checking, if any.
    pub error: Option<String>,
}

/// A package at a specific version, with everything learned about it so far.
///
/// Equality, ordering and hashing use only `(source, name, version)`; the
/// dependency/vulnerability sets and maintenance info are payload that grows
/// monotonically as resolvers and enrichers report in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    /// Name of the resolver that produced this package.
    pub source: String,
    /// Package name within that ecosystem.
    pub name: String,
    /// Concrete version.
    pub version: Version,
    /// Known direct dependencies.
    pub dependencies: BTreeSet<Dependency>,
    /// Known vulnerabilities.
    pub vulnerabilities: BTreeSet<Vulnerability>,
    /// Maintenance status, when checked.
    pub maintenance: Option<MaintenanceInfo>,
    /// For packages discovered from a local source tree: the tree's path.
    /// Packages with a source repo are the roots of the dependency graph.
    pub source_repo: Option<PathBuf>,
}

impl Package {
    /// Create a package with no dependencies.
    #[must_use]
    pub fn new(source: impl Into<String>, name: impl Into<String>, version: Version) -> Self {
        Self {
            source: source.into(),
            name: name.into(),
            version,
            dependencies: BTreeSet::new(),
            vulnerabilities: BTreeSet::new(),
            maintenance: None,
            source_repo: None,
        }
    }

    /// Replace the dependency set (builder style).
    #[must_use]
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = Dependency>) -> Self {
        self.dependencies = deps.into_iter().collect();
        self
    }

    /// Mark this package as originating from a local source tree.
    #[must_use]
    pub fn with_source_repo(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_repo = Some(path.into());
        self
    }

    /// `source:name`.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}:{}", self.source, self.name)
    }

    /// True when this package was discovered from a local source tree.
    #[must_use]
    pub fn is_source_package(&self) -> bool {
        self.source_repo.is_some()
    }

    /// The path of the source tree this package came from, if any.
    #[must_use]
    pub fn source_repo(&self) -> Option<&Path> {
        self.source_repo.as_deref()
    }

    /// The dependency exactly satisfied by this package.
    #[must_use]
    pub fn to_dependency(&self) -> Dependency {
        Dependency {
            source: self.source.clone(),
            package: self.name.clone(),
            alias: None,
            spec: VersionSpec::exact(&self.version),
        }
    }

    /// Merge new dependencies into this package (set union).
    #[must_use]
    pub fn update_dependencies(mut self, deps: impl IntoIterator<Item = Dependency>) -> Self {
        self.dependencies.extend(deps);
        self
    }

    /// Merge new vulnerabilities into this package (set union).
    #[must_use]
    pub fn update_vulnerabilities(
        mut self,
        vulns: impl IntoIterator<Item = Vulnerability>,
    ) -> Self {
        self.vulnerabilities.extend(vulns);
        self
    }

    /// True if `other` is the same `(source, name)` at any version.
    #[must_use]
    pub fn same_package(&self, other: &Self) -> bool {
        self.source == other.source && self.name == other.name
    }

    /// Parse the canonical package form:
    ///
    /// ```text
    /// ubuntu:libc6@2.31
    /// ubuntu:libc6@2.31[]
    /// ubuntu:libc6@2.31[ubuntu:somepkg@<0.1.0,ubuntu:otherpkg@=2.1.0]
    /// ```
    pub fn from_string(description: &str) -> Result<Self> {
        let err = || Error::PackageParse {
            input: description.to_string(),
        };
        let (source, tail) = description.split_once(':').ok_or_else(err)?;
        let (name, version_part) = tail.split_once('@').ok_or_else(err)?;
        if source.is_empty() || name.is_empty() {
            return Err(err());
        }
        let (version_str, deps_part) = match version_part.split_once('[') {
            Some((v, rest)) => (v, Some(rest.trim_end_matches(']').trim())),
            None => (version_part, None),
        };
        let version = Version::parse(version_str).map_err(|_| err())?;
        let mut dependencies = BTreeSet::new();
        if let Some(deps) = deps_part
            && !deps.is_empty()
        {
            for dep in deps.split(',') {
                dependencies.insert(Dependency::from_string(dep.trim())?);
            }
        }
        Ok(Self {
            source: source.to_string(),
            name: name.to_string(),
            version,
            dependencies,
            vulnerabilities: BTreeSet::new(),
            maintenance: None,
            source_repo: None,
        })
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.source, self.name, self.version)?;
        if !self.dependencies.is_empty() {
            let deps: Vec<String> = self.dependencies.iter().map(ToString::to_string).collect();
            write!(f, "[{}]", deps.join(","))?;
        }
        if let Some(repo) = &self.source_repo {
            write!(f, ":{}", repo.display())?;
        }
        Ok(())
    }
}

impl PartialEq for Package {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.name == other.name && self.version == other.version
    }
}

impl Eq for Package {}

impl Hash for Package {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source.hash(state);
        self.name.hash(state);
        self.version.hash(state);
    }
}

impl Ord for Package {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.source, &self.name, &self.version).cmp(&(
            &other.source,
            &other.name,
            &other.version,
        ))
    }
}

impl PartialOrd for Package {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for Package {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_string(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn dependency_round_trip() {
        let dep = Dependency::from_string("pip:cvedb@*").unwrap();
        assert_eq!(dep.source, "pip");
        assert_eq!(dep.package, "cvedb");
        assert!(dep.spec.is_any());
        assert_eq!(dep.to_string(), "pip:cvedb@*");
        assert_eq!(Dependency::from_string(&dep.to_string()).unwrap(), dep);
    }

    #[test]
    fn dependency_without_spec_defaults_to_wildcard() {
        let dep = Dependency::from_string("cargo:serde").unwrap();
        assert!(dep.spec.is_any());
    }

    #[test]
    fn aliased_dependency_round_trip() {
        let dep = Dependency::with_spec("npm", "lodash", VersionSpec::parse("^4.0").unwrap())
            .aliased("my-lodash");
        assert_eq!(dep.to_string(), "npm:my-lodash@lodash@^4.0");
        assert_eq!(Dependency::from_string(&dep.to_string()).unwrap(), dep);
    }

    #[test]
    fn scoped_package_is_not_an_alias() {
        let dep = Dependency::from_string("npm:@scope/pkg@^1.0").unwrap();
        assert_eq!(dep.package, "@scope/pkg");
        assert!(dep.alias.is_none());
        assert_eq!(Dependency::from_string(&dep.to_string()).unwrap(), dep);
    }

    #[test]
    fn alias_participates_in_equality() {
        let plain = Dependency::new("npm", "lodash");
        let aliased = plain.clone().aliased("my-lodash");
        assert_ne!(plain, aliased);
    }

    #[test]
    fn dependency_match_respects_spec() {
        let dep = Dependency::from_string("pip:cvedb@<0.2.1").unwrap();
        assert!(dep.matches(&Package::new("pip", "cvedb", v("0.2.0"))));
        assert!(!dep.matches(&Package::new("pip", "cvedb", v("0.2.1"))));
        assert!(!dep.matches(&Package::new("npm", "cvedb", v("0.2.0"))));
    }

    #[test]
    fn package_round_trip() {
        for description in [
            "ubuntu:libc6@2.31",
            "ubuntu:libc6@2.31[ubuntu:somepkg@<0.1.0]",
            "ubuntu:libc6@2.31[ubuntu:otherpkg@=2.1.0,ubuntu:somepkg@<0.1.0]",
        ] {
            let package = Package::from_string(description).unwrap();
            assert_eq!(package.to_string(), description);
            assert_eq!(Package::from_string(&package.to_string()).unwrap(), package);
        }
    }

    #[test]
    fn package_empty_bracket_list() {
        let package = Package::from_string("ubuntu:libc6@2.31[]").unwrap();
        assert!(package.dependencies.is_empty());
        assert_eq!(package.to_string(), "ubuntu:libc6@2.31");
    }

    #[test]
    fn package_identity_ignores_payload() {
        let bare = Package::new("cargo", "serde", v("1.0.0"));
        let rich = bare
            .clone()
            .update_dependencies([Dependency::new("cargo", "serde_derive")]);
        assert_eq!(bare, rich);

        let other_version = Package::new("cargo", "serde", v("1.0.1"));
        assert_ne!(bare, other_version);
    }

    #[test]
    fn update_dependencies_is_union() {
        let a = Dependency::new("cargo", "a");
        let b = Dependency::new("cargo", "b");
        let package = Package::new("cargo", "root", v("1.0.0"))
            .update_dependencies([a.clone()])
            .update_dependencies([a.clone(), b.clone()]);
        assert_eq!(package.dependencies, BTreeSet::from([a, b]));
    }

    #[test]
    fn to_dependency_is_exact() {
        let package = Package::new("cargo", "serde", v("1.0.219"));
        let dep = package.to_dependency();
        assert_eq!(dep.to_string(), "cargo:serde@=1.0.219");
        assert!(dep.matches(&package));
        assert!(!dep.matches(&Package::new("cargo", "serde", v("1.0.218"))));
    }

    #[test]
    fn source_package_display_appends_path() {
        let package = Package::new("cargo", "tangle", v("0.1.0")).with_source_repo("/tmp/src");
        assert!(package.is_source_package());
        assert_eq!(package.to_string(), "cargo:tangle@0.1.0:/tmp/src");
    }

    #[test]
    fn vulnerability_identity_is_id_only() {
        let a = Vulnerability::new("OSV-1", vec!["CVE-1".to_string()], "first");
        let b = Vulnerability::new("OSV-1", vec![], "different summary");
        assert_eq!(a, b);
        assert_eq!(a.to_compact_str(), "OSV-1 (CVE-1)");

        let mut set = BTreeSet::new();
        set.insert(a);
        set.insert(b);
        assert_eq!(set.len(), 1);
    }
}
