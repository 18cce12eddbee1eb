//! SBOM generation: depth-first backtracking over version assignments.
//!
//! A software bill of materials is a *version-consistent* package set: at
//! most one version per `(source, name)`, with every dependency of every
//! included package satisfied by another included package. The backtracker
//! enumerates such sets over a resolved [`PackageRepository`], most-preferred
//! version first.

use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tangle_cache::PackageCache;
use tangle_core::{Dependency, Package, VersionSpec};
use tracing::info;

type PackageKey = (String, String);

fn key_of(package: &Package) -> PackageKey {
    (package.source.clone(), package.name.clone())
}

/// A version-consistent set of packages with designated roots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sbom {
    /// `(package, depends_on)` edges included in this bill of materials.
    pub dependencies: BTreeSet<(Package, Package)>,
    /// The root packages the bill was generated for.
    pub root_packages: BTreeSet<Package>,
}

impl Sbom {
    /// Create an SBOM from its edges and roots.
    #[must_use]
    pub fn new(
        dependencies: impl IntoIterator<Item = (Package, Package)>,
        root_packages: impl IntoIterator<Item = Package>,
    ) -> Self {
        Self {
            dependencies: dependencies.into_iter().collect(),
            root_packages: root_packages.into_iter().collect(),
        }
    }

    /// Every package included in this bill of materials.
    #[must_use]
    pub fn packages(&self) -> BTreeSet<Package> {
        let mut packages = self.root_packages.clone();
        for (from, to) in &self.dependencies {
            packages.insert(from.clone());
            packages.insert(to.clone());
        }
        packages
    }

    /// Render as a CycloneDX 1.5 JSON document.
    #[must_use]
    pub fn to_cyclonedx(&self) -> serde_json::Value {
        let bom_ref = |package: &Package| {
            if self.root_packages.contains(package) {
                package.full_name()
            } else {
                format!("{}@{}", package.full_name(), package.version)
            }
        };

        let mut components = Vec::new();
        let mut root_component = None;
        for root in self.root_packages.iter().rev() {
            let component = json!({
                "type": "application",
                "bom-ref": bom_ref(root),
                "name": root.name,
                "version": root.version.to_string(),
            });
            components.push(component.clone());
            root_component = Some(component);
        }
        for package in self.packages() {
            if self.root_packages.contains(&package) {
                continue;
            }
            components.push(json!({
                "type": "library",
                "bom-ref": bom_ref(&package),
                "name": package.name,
                "version": package.version.to_string(),
            }));
        }

        let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (from, to) in &self.dependencies {
            edges.entry(bom_ref(from)).or_default().insert(bom_ref(to));
        }
        let dependencies: Vec<serde_json::Value> = edges
            .into_iter()
            .map(|(reference, depends_on)| {
                json!({ "ref": reference, "dependsOn": depends_on })
            })
            .collect();

        json!({
            "bomFormat": "CycloneDX",
            "specVersion": "1.5",
            "version": 1,
            "metadata": {
                "tools": {
                    "components": [{
                        "type": "application",
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    }],
                },
                "component": root_component,
            },
            "components": components,
            "dependencies": dependencies,
        })
    }
}

impl fmt::Display for Sbom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.packages().iter().map(Package::full_name).collect();
        write!(f, "{}", names.join(", "))
    }
}

impl std::ops::BitOr for Sbom {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self {
            dependencies: self.dependencies.into_iter().chain(rhs.dependencies).collect(),
            root_packages: self
                .root_packages
                .into_iter()
                .chain(rhs.root_packages)
                .collect(),
        }
    }
}

/// The committed package choices of one backtracking node plus the residual
/// unsatisfied dependencies, grouped by target `(source, name)`.
#[derive(Debug, Clone, Default)]
struct PackageSet {
    packages: BTreeMap<PackageKey, Package>,
    unsatisfied: BTreeMap<PackageKey, BTreeMap<Dependency, BTreeSet<Package>>>,
    is_valid: bool,
    is_complete: bool,
}

impl PackageSet {
    fn new() -> Self {
        Self {
            is_valid: true,
            is_complete: true,
            ..Self::default()
        }
    }

    fn add(&mut self, package: &Package) {
        let key = key_of(package);
        if let Some(existing) = self.packages.get(&key)
            && existing.version != package.version
        {
            self.is_valid = false;
        }
        if !self.is_valid {
            return;
        }
        self.packages.insert(key.clone(), package.clone());

        // this package may satisfy dependencies recorded earlier
        if let Some(waiting) = self.unsatisfied.get_mut(&key) {
            waiting.retain(|dep, _| !dep.matches(package));
            if waiting.is_empty() {
                self.unsatisfied.remove(&key);
            }
        }

        // record this package's own unsatisfied dependencies
        for dep in &package.dependencies {
            let dep_key = (dep.source.clone(), dep.package.clone());
            match self.packages.get(&dep_key) {
                None => {
                    self.unsatisfied
                        .entry(dep_key)
                        .or_default()
                        .entry(dep.clone())
                        .or_default()
                        .insert(package.clone());
                }
                Some(chosen) if !dep.matches(chosen) => {
                    self.is_valid = false;
                    break;
                }
                Some(_) => {}
            }
        }

        self.is_complete = self.is_valid && self.unsatisfied.is_empty();
    }

    /// Unsatisfied dependency groups, fewest-requirements first. Multiple
    /// requirements on the same package conjoin into a compound spec.
    fn unsatisfied_dependencies(&self) -> Vec<(Dependency, BTreeSet<Package>)> {
        let mut groups: Vec<(&PackageKey, &BTreeMap<Dependency, BTreeSet<Package>>)> =
            self.unsatisfied.iter().collect();
        groups.sort_by_key(|(key, deps)| (deps.len(), (*key).clone()));
        groups
            .into_iter()
            .filter(|(_, deps)| !deps.is_empty())
            .map(|((source, name), deps)| {
                if deps.len() == 1 {
                    let (dep, required_by) =
                        deps.iter().next().unwrap_or_else(|| unreachable!());
                    (dep.clone(), required_by.clone())
                } else {
                    let spec = VersionSpec::conjunction(deps.keys().map(|d| &d.spec));
                    let compound = Dependency::with_spec(source.clone(), name.clone(), spec);
                    let required_by = deps.values().flatten().cloned().collect();
                    (compound, required_by)
                }
            })
            .collect()
    }
}

impl PartialEq for PackageSet {
    fn eq(&self, other: &Self) -> bool {
        self.packages == other.packages
    }
}

impl Eq for PackageSet {}

impl Hash for PackageSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for package in self.packages.values() {
            package.hash(state);
        }
    }
}

/// One node of the backtracking search. Parents are shared between
/// children; the materialized [`PackageSet`] is copied per node so validity
/// checks stay O(1).
#[derive(Debug, Clone)]
struct PartialResolution {
    packages: Vec<Package>,
    depends_on: Vec<Package>,
    parent: Option<Arc<PartialResolution>>,
    set: PackageSet,
}

impl PartialResolution {
    fn root(packages: impl IntoIterator<Item = Package>) -> Self {
        Self::build(packages.into_iter().collect(), Vec::new(), None)
    }

    fn build(
        packages: Vec<Package>,
        depends_on: Vec<Package>,
        parent: Option<Arc<PartialResolution>>,
    ) -> Self {
        let mut set = parent
            .as_ref()
            .map_or_else(PackageSet::new, |p| p.set.clone());
        for package in &packages {
            set.add(package);
            if !set.is_valid {
                break;
            }
        }
        if set.is_valid {
            for package in &depends_on {
                set.add(package);
                if !set.is_valid {
                    break;
                }
            }
        }
        Self {
            packages,
            depends_on,
            parent,
            set,
        }
    }

    /// Extend with one satisfying package for a dependency group.
    fn add(self: &Arc<Self>, required_by: &BTreeSet<Package>, chosen: Package) -> Self {
        Self::build(
            required_by.iter().cloned().collect(),
            vec![chosen],
            Some(Arc::clone(self)),
        )
    }

    /// All `(package, depends_on)` edges committed along the parent chain.
    fn dependencies(&self) -> BTreeSet<(Package, Package)> {
        let mut edges = BTreeSet::new();
        let mut node: Option<&PartialResolution> = Some(self);
        while let Some(current) = node {
            for depends_on in &current.depends_on {
                for package in &current.packages {
                    edges.insert((package.clone(), depends_on.clone()));
                }
            }
            node = current.parent.as_deref();
        }
        edges
    }
}

impl PartialEq for PartialResolution {
    fn eq(&self, other: &Self) -> bool {
        self.set == other.set
    }
}

impl Eq for PartialResolution {}

impl Hash for PartialResolution {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.set.hash(state);
    }
}

/// Enumerate the version-consistent SBOMs of `root_package` over the
/// packages in `repo`.
///
/// With `order_ascending` the oldest satisfying versions are preferred,
/// otherwise the newest. Yields nothing when no consistent assignment
/// exists.
pub fn resolve_sbom<'a>(
    root_package: &Package,
    repo: &'a dyn PackageCache,
    order_ascending: bool,
) -> impl Iterator<Item = Sbom> + 'a {
    let root = root_package.clone();
    info!(
        root = %root.full_name(),
        order = if order_ascending { "oldest" } else { "newest" },
        "resolving SBOM"
    );

    let mut stack: Vec<Arc<PartialResolution>> = Vec::new();
    let mut history: HashSet<Arc<PartialResolution>> = HashSet::new();
    let mut trivial: Option<Sbom> = None;

    if root.dependencies.is_empty() {
        trivial = Some(Sbom::new([], [root.clone()]));
    } else {
        let start = Arc::new(PartialResolution::root([root.clone()]));
        if start.set.is_valid {
            history.insert(Arc::clone(&start));
        }
        stack.push(start);
    }

    std::iter::from_fn(move || {
        if let Some(sbom) = trivial.take() {
            return Some(sbom);
        }
        while let Some(pr) = stack.pop() {
            if pr.set.is_complete {
                return Some(Sbom::new(pr.dependencies(), [root.clone()]));
            }
            if !pr.set.is_valid {
                continue;
            }
            for (dep, required_by) in pr.set.unsatisfied_dependencies() {
                let mut matches = repo.match_dependency(&dep);
                // pushed in this order, the stack explores the preferred
                // version first
                matches.sort_by(|a, b| {
                    if order_ascending {
                        b.version.cmp(&a.version)
                    } else {
                        a.version.cmp(&b.version)
                    }
                });
                for chosen in matches {
                    let next = Arc::new(pr.add(&required_by, chosen));
                    if next.set.is_valid && !history.contains(&next) {
                        history.insert(Arc::clone(&next));
                        stack.push(next);
                    }
                }
            }
        }
        None
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tangle_cache::{InMemoryPackageCache, PackageRepository};
    use tangle_core::Version;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn spec(s: &str) -> VersionSpec {
        VersionSpec::parse(s).unwrap()
    }

    fn repo_with(packages: &[Package]) -> PackageRepository {
        let repo = InMemoryPackageCache::new();
        repo.extend(packages).unwrap();
        repo
    }

    #[test]
    fn root_without_dependencies_yields_itself() {
        let root = Package::new("pip", "lonely", v("1.0.0"));
        let repo = repo_with(&[root.clone()]);
        let sboms: Vec<Sbom> = resolve_sbom(&root, &repo, true).collect();
        assert_eq!(sboms.len(), 1);
        assert_eq!(sboms[0].packages(), BTreeSet::from([root]));
    }

    #[test]
    fn picks_newest_version_first_when_descending() {
        let root = Package::new("pip", "app", v("1.0.0"))
            .with_dependencies([Dependency::with_spec("pip", "lib", spec(">=1.0"))]);
        let lib1 = Package::new("pip", "lib", v("1.0.0"));
        let lib2 = Package::new("pip", "lib", v("2.0.0"));
        let repo = repo_with(&[root.clone(), lib1.clone(), lib2.clone()]);

        let newest = resolve_sbom(&root, &repo, false).next().unwrap();
        assert!(newest.packages().contains(&lib2));

        let oldest = resolve_sbom(&root, &repo, true).next().unwrap();
        assert!(oldest.packages().contains(&lib1));
    }

    #[test]
    fn sboms_are_valid_and_complete() {
        let root = Package::new("pip", "app", v("1.0.0")).with_dependencies([
            Dependency::with_spec("pip", "a", spec(">=1.0")),
            Dependency::with_spec("pip", "b", spec(">=1.0")),
        ]);
        let a = Package::new("pip", "a", v("1.5.0"))
            .with_dependencies([Dependency::with_spec("pip", "b", spec("<2.0"))]);
        let b1 = Package::new("pip", "b", v("1.9.0"));
        let b2 = Package::new("pip", "b", v("2.0.0"));
        let repo = repo_with(&[root.clone(), a.clone(), b1.clone(), b2.clone()]);

        for sbom in resolve_sbom(&root, &repo, false) {
            let packages = sbom.packages();
            // at most one version per (source, name)
            let mut names = BTreeSet::new();
            for package in &packages {
                assert!(
                    names.insert((package.source.clone(), package.name.clone())),
                    "duplicate package in {sbom}"
                );
            }
            // every dependency of every member is satisfied inside the set
            for package in &packages {
                for dep in &package.dependencies {
                    assert!(
                        packages.iter().any(|candidate| dep.matches(candidate)),
                        "{dep} unsatisfied in {sbom}"
                    );
                }
            }
            // the compound constraint >=1.0 AND <2.0 forces b 1.9.0
            assert!(packages.contains(&b1));
            assert!(!packages.contains(&b2));
        }
        assert!(resolve_sbom(&root, &repo, false).next().is_some());
    }

    #[test]
    fn unsatisfiable_roots_yield_nothing() {
        let root = Package::new("pip", "app", v("1.0.0"))
            .with_dependencies([Dependency::with_spec("pip", "missing", spec(">=1.0"))]);
        let repo = repo_with(&[root.clone()]);
        assert_eq!(resolve_sbom(&root, &repo, false).count(), 0);
    }

    #[test]
    fn union_merges_sboms() {
        let a = Package::new("pip", "a", v("1.0.0"));
        let b = Package::new("pip", "b", v("1.0.0"));
        let merged = Sbom::new([], [a.clone()]) | Sbom::new([], [b.clone()]);
        assert_eq!(merged.root_packages.len(), 2);
    }

    #[test]
    fn cyclonedx_document_shape() {
        let root = Package::new("cargo", "app", v("0.1.0")).with_source_repo("/src/app");
        let lib = Package::new("cargo", "lib", v("1.0.0"));
        let sbom = Sbom::new([(root.clone(), lib.clone())], [root.clone()]);
        let bom = sbom.to_cyclonedx();

        assert_eq!(bom["bomFormat"], "CycloneDX");
        assert_eq!(bom["specVersion"], "1.5");
        assert_eq!(bom["metadata"]["component"]["name"], "app");
        let components = bom["components"].as_array().unwrap();
        assert_eq!(components.len(), 2);
        let dependencies = bom["dependencies"].as_array().unwrap();
        assert_eq!(dependencies[0]["ref"], "cargo:app");
        assert_eq!(dependencies[0]["dependsOn"][0], "cargo:lib@1.0.0");
    }
}
