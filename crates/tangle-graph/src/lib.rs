//! Rooted dependency graphs.
//!
//! A [`DependencyGraph`] is a rooted directed multigraph whose nodes are
//! [`Package`]s and whose edges carry the [`Dependency`] that created them.
//! Roots are packages discovered from local source trees. Two derived
//! operations matter to the CLI: collapsing all versions of a package into a
//! single node, and an edit-distance-like metric between two rooted graphs.

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tangle_cache::PackageCache;
use tangle_core::{Dependency, Package};
use tracing::warn;

/// A rooted directed multigraph of packages.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<Package, Dependency>,
    indices: HashMap<Package, NodeIndex>,
    roots: HashSet<NodeIndex>,
    collapsed: bool,
}

impl DependencyGraph {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Materialize the dependency graph of everything in `cache`: one node
    /// per package, one edge per (dependency, satisfying package) pair.
    #[must_use]
    pub fn from_cache(cache: &dyn PackageCache) -> Self {
        let mut graph = Self::new();
        for package in cache.packages() {
            graph.add_node(package.clone());
            for dep in &package.dependencies {
                for satisfying in cache.match_dependency(dep) {
                    graph.add_edge(&package, &satisfying, dep.clone());
                }
            }
        }
        graph
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// True if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Add a node; source packages become roots. Re-adding is a no-op.
    pub fn add_node(&mut self, package: Package) -> NodeIndex {
        if let Some(&index) = self.indices.get(&package) {
            return index;
        }
        let is_root = package.is_source_package();
        let index = self.graph.add_node(package.clone());
        self.indices.insert(package, index);
        if is_root {
            self.roots.insert(index);
        }
        index
    }

    /// Add an edge from `from` to `to`, labeled with the dependency that
    /// produced it. Both endpoints are added as needed.
    pub fn add_edge(&mut self, from: &Package, to: &Package, dependency: Dependency) {
        let from = self.add_node(from.clone());
        let to = self.add_node(to.clone());
        self.graph.add_edge(from, to, dependency);
    }

    /// Iterate over all node packages.
    pub fn packages(&self) -> impl Iterator<Item = &Package> {
        self.graph.node_weights()
    }

    /// Iterate over edges as `(from, to, dependency)` triples.
    pub fn edges(&self) -> impl Iterator<Item = (&Package, &Package, &Dependency)> {
        self.graph.edge_references().map(|edge| {
            (
                &self.graph[edge.source()],
                &self.graph[edge.target()],
                edge.weight(),
            )
        })
    }

    /// The root packages (source packages, unless [`Self::find_roots`] ran).
    #[must_use]
    pub fn roots(&self) -> Vec<&Package> {
        self.roots.iter().map(|&index| &self.graph[index]).collect()
    }

    /// True if `package` is a node in this graph.
    #[must_use]
    pub fn contains(&self, package: &Package) -> bool {
        self.indices.contains_key(package)
    }

    /// Length of the shortest path from any root to `package`, or -1 when
    /// the package is unreachable or the graph has no roots.
    #[must_use]
    pub fn shortest_path_from_root(&self, package: &Package) -> i64 {
        let Some(&target) = self.indices.get(package) else {
            return -1;
        };
        self.root_distances().get(&target).copied().unwrap_or(-1)
    }

    /// Multi-source BFS from every root.
    fn root_distances(&self) -> HashMap<NodeIndex, i64> {
        let mut distances = HashMap::new();
        let mut queue = VecDeque::new();
        for &root in &self.roots {
            distances.insert(root, 0);
            queue.push_back(root);
        }
        while let Some(node) = queue.pop_front() {
            let next = distances[&node] + 1;
            for neighbor in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if !distances.contains_key(&neighbor) {
                    distances.insert(neighbor, next);
                    queue.push_back(neighbor);
                }
            }
        }
        distances
    }

    /// A copy of this graph whose roots are the nodes with no incoming
    /// edges. Used when a graph has no source packages to anchor it.
    #[must_use]
    pub fn find_roots(&self) -> Self {
        let mut found = self.clone();
        found.roots = self
            .graph
            .node_indices()
            .filter(|&index| {
                self.graph
                    .neighbors_directed(index, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect();
        found
    }

    fn packages_by_name(&self) -> BTreeMap<(String, String), Vec<&Package>> {
        let mut by_name: BTreeMap<(String, String), Vec<&Package>> = BTreeMap::new();
        for package in self.packages() {
            by_name
                .entry((package.source.clone(), package.name.clone()))
                .or_default()
                .push(package);
        }
        by_name
    }

    /// Group all versions of a package into a single node.
    ///
    /// The representative of a group is its maximum version; when any
    /// collapsed instance is a source package the representative becomes one
    /// too. Dependency edges between groups are rebuilt with wildcard specs.
    #[must_use]
    pub fn collapse_versions(&self) -> Self {
        if self.collapsed {
            return self.clone();
        }
        let mut collapsed = Self {
            collapsed: true,
            ..Self::default()
        };
        let mut representatives: HashMap<String, Package> = HashMap::new();

        for ((source, name), instances) in self.packages_by_name() {
            let package = if let [only] = instances.as_slice() {
                (*only).clone()
            } else {
                let deps: Vec<Dependency> = instances
                    .iter()
                    .flat_map(|p| p.dependencies.iter())
                    .map(|dep| Dependency::new(dep.source.clone(), dep.package.clone()))
                    .collect();
                let version = instances
                    .iter()
                    .map(|p| p.version.clone())
                    .max()
                    .unwrap_or_else(|| unreachable!("instance groups are non-empty"));
                let source_repos: HashSet<_> = instances
                    .iter()
                    .filter_map(|p| p.source_repo())
                    .collect();
                let mut package =
                    Package::new(source.clone(), name.clone(), version).with_dependencies(deps);
                if let Some(repo) = source_repos.iter().next() {
                    if source_repos.len() > 1 {
                        warn!(
                            package = format!("{source}:{name}"),
                            "package is provided by multiple source repositories; \
                             collapsing to {}",
                            repo.display()
                        );
                    }
                    package = package.with_source_repo(*repo);
                }
                package
            };
            representatives.insert(package.full_name(), package.clone());
            collapsed.add_node(package);
        }

        let packages: Vec<Package> = collapsed.packages().cloned().collect();
        for package in packages {
            for dep in package.dependencies.clone() {
                if let Some(target) = representatives.get(&dep.full_name()) {
                    collapsed.add_edge(&package, target, dep);
                }
            }
        }
        collapsed
    }

    /// Edit-distance-like metric between two rooted graphs.
    ///
    /// Without `normalize`, zero means identical and the value grows with
    /// the difference. With `normalize`, the result is in `[0, 1]` and
    /// identical graphs score exactly 1.0. Both graphs are collapsed first,
    /// and graphs without source packages fall back to in-degree roots.
    #[must_use]
    pub fn distance_to(&self, other: &Self, normalize: bool) -> f64 {
        let mut ours = self.collapse_versions();
        if ours.roots.is_empty() {
            ours = ours.find_roots();
        }
        let mut theirs = other.collapse_versions();
        if theirs.roots.is_empty() {
            theirs = theirs.find_roots();
        }
        compare_rooted_graphs(&ours, &theirs, normalize)
    }
}

/// Distance used by the comparison terms: unreached and root-level nodes
/// count as depth 1.
fn coerced_depth(graph: &DependencyGraph, package: &Package) -> f64 {
    let depth = graph.shortest_path_from_root(package);
    if depth < 1 { 1.0 } else { depth as f64 }
}

fn compare_rooted_graphs(graph1: &DependencyGraph, graph2: &DependencyGraph, normalize: bool) -> f64 {
    let roots1: HashSet<&Package> = graph1.roots().into_iter().collect();
    let roots2: HashSet<&Package> = graph2.roots().into_iter().collect();
    let nodes1: HashSet<&Package> = graph1.packages().filter(|p| !roots1.contains(p)).collect();
    let nodes2: HashSet<&Package> = graph2.packages().filter(|p| !roots2.contains(p)).collect();

    let mut distance = 0.0;
    for node in nodes1.intersection(&nodes2) {
        let d1 = coerced_depth(graph1, node);
        let d2 = coerced_depth(graph2, node);
        if (d1 - d2).abs() > f64::EPSILON {
            distance += (1.0 / d1.min(d2) - 1.0 / d1.max(d2)).abs();
        }
    }
    for node in nodes1.difference(&nodes2) {
        distance += 1.0 / coerced_depth(graph1, node);
    }
    for node in nodes2.difference(&nodes1) {
        distance += 1.0 / coerced_depth(graph2, node);
    }

    if normalize {
        if distance > 0.0 {
            let max_distance: f64 = nodes1.iter().map(|n| coerced_depth(graph1, n)).sum::<f64>()
                + nodes2.iter().map(|n| coerced_depth(graph2, n)).sum::<f64>();
            if max_distance > 0.0 {
                distance /= max_distance;
            }
        }
        distance = 1.0 - distance;
    }
    distance
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tangle_cache::InMemoryPackageCache;
    use tangle_core::Version;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn node(name: &str) -> Package {
        Package::new("test", name, v("1.0.0"))
    }

    fn root(name: &str) -> Package {
        node(name).with_source_repo(format!("/src/{name}"))
    }

    fn dep(name: &str) -> Dependency {
        Dependency::new("test", name)
    }

    /// root 0 with edges 0->1, 0->2, 1->3, 2->4
    fn diamondish() -> (DependencyGraph, Package) {
        let mut graph = DependencyGraph::new();
        let n0 = root("n0");
        let (n1, n2, n3, n4) = (node("n1"), node("n2"), node("n3"), node("n4"));
        graph.add_edge(&n0, &n1, dep("n1"));
        graph.add_edge(&n0, &n2, dep("n2"));
        graph.add_edge(&n1, &n3, dep("n3"));
        graph.add_edge(&n2, &n4, dep("n4"));
        (graph, n4)
    }

    #[test]
    fn shortest_path_from_root() {
        let (graph, n4) = diamondish();
        assert_eq!(graph.shortest_path_from_root(&n4), 2);
        assert_eq!(graph.shortest_path_from_root(&root("n0")), 0);
        assert_eq!(graph.shortest_path_from_root(&node("absent")), -1);
    }

    #[test]
    fn find_roots_uses_in_degree() {
        let mut graph = DependencyGraph::new();
        let (a, b, c) = (node("a"), node("b"), node("c"));
        graph.add_edge(&a, &b, dep("b"));
        graph.add_edge(&b, &c, dep("c"));
        assert!(graph.roots().is_empty(), "no source packages, no roots");

        let rooted = graph.find_roots();
        assert_eq!(rooted.roots(), vec![&a]);
        assert_eq!(rooted.shortest_path_from_root(&c), 2);
    }

    #[test]
    fn identical_graphs_score_one() {
        let (graph, _) = diamondish();
        let (other, _) = diamondish();
        assert!((graph.distance_to(&other, true) - 1.0).abs() < f64::EPSILON);
        assert!(graph.distance_to(&other, false).abs() < f64::EPSILON);
    }

    #[test]
    fn distance_is_symmetric() {
        let (graph, _) = diamondish();
        let mut other = DependencyGraph::new();
        let n0 = root("n0");
        other.add_edge(&n0, &node("n1"), dep("n1"));
        other.add_edge(&n0, &node("n9"), dep("n9"));

        let forward = graph.distance_to(&other, true);
        let backward = other.distance_to(&graph, true);
        assert!((forward - backward).abs() < f64::EPSILON);
        assert!(forward < 1.0);
    }

    #[test]
    fn collapse_merges_versions() {
        let mut graph = DependencyGraph::new();
        let app = root("app");
        let lib_old =
            Package::new("test", "lib", v("1.0.0")).with_dependencies([dep("transitive")]);
        let lib_new = Package::new("test", "lib", v("2.0.0"));
        let transitive = node("transitive");
        graph.add_edge(&app, &lib_old, dep("lib"));
        graph.add_edge(&app, &lib_new, dep("lib"));
        graph.add_edge(&lib_old, &transitive, dep("transitive"));

        let collapsed = graph.collapse_versions();
        assert_eq!(collapsed.len(), 3, "two lib versions become one node");
        let lib = collapsed
            .packages()
            .find(|p| p.name == "lib")
            .expect("collapsed lib node");
        assert_eq!(lib.version, v("2.0.0"), "max version wins");
        assert!(
            lib.dependencies.iter().all(|d| d.spec.is_any()),
            "collapsed edges are wildcards"
        );
    }

    #[test]
    fn collapse_promotes_source_packages() {
        let mut graph = DependencyGraph::new();
        let plain = Package::new("test", "app", v("1.0.0"));
        let source = Package::new("test", "app", v("2.0.0")).with_source_repo("/src/app");
        graph.add_node(plain);
        graph.add_node(source);

        let collapsed = graph.collapse_versions();
        assert_eq!(collapsed.len(), 1);
        assert_eq!(collapsed.roots().len(), 1, "collapsed node is still a root");
    }

    #[test]
    fn from_cache_links_satisfying_packages() {
        let cache = InMemoryPackageCache::new();
        let app = Package::new("test", "app", v("1.0.0"))
            .with_source_repo("/src/app")
            .with_dependencies([dep("lib")]);
        cache.add(&app).unwrap();
        cache.add(&node("lib")).unwrap();
        cache.add(&Package::new("test", "lib", v("2.0.0"))).unwrap();

        let graph = DependencyGraph::from_cache(&cache);
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.edges().count(), 2, "one edge per satisfying version");
        assert_eq!(graph.roots().len(), 1);
    }
}
