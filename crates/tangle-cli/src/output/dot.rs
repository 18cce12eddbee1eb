//! Graphviz DOT rendering of the dependency hierarchy.
//!
//! Packages are rectangles (triangles when they carry vulnerabilities),
//! dependencies are ovals, and edges run package -> dependency ->
//! satisfying package. When the repository contains source packages the
//! graph is rooted at them; otherwise every package is rendered.

use std::collections::HashMap;
use tangle_cache::PackageCache;
use tangle_core::{Dependency, Package};

fn escape(label: &str) -> String {
    label.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Render the dependency hierarchy of `repo` as a DOT document.
#[must_use]
pub fn render(repo: &dyn PackageCache) -> String {
    let sources = repo.source_packages();
    let mut queue = if sources.is_empty() {
        repo.packages()
    } else {
        sources
    };

    let mut out = String::from("digraph dependencies {\n");
    let mut package_ids: HashMap<Package, String> = HashMap::new();
    let mut dependency_ids: HashMap<Dependency, String> = HashMap::new();
    let mut edges = Vec::new();

    fn package_node(
        out: &mut String,
        package_ids: &mut HashMap<Package, String>,
        package: &Package,
    ) -> (String, bool) {
        if let Some(id) = package_ids.get(package) {
            return (id.clone(), true);
        }
        let id = format!("package{}", package_ids.len());
        let shape = if package.vulnerabilities.is_empty() {
            "rectangle"
        } else {
            "triangle"
        };
        out.push_str(&format!(
            "    {id} [label=\"{}\" shape={shape}];\n",
            escape(&package.to_string())
        ));
        package_ids.insert(package.clone(), id.clone());
        (id, false)
    }

    while let Some(package) = queue.pop() {
        let (package_id, _) = package_node(&mut out, &mut package_ids, &package);
        for dependency in &package.dependencies {
            let already_expanded = dependency_ids.contains_key(dependency);
            let dep_id = if let Some(id) = dependency_ids.get(dependency) {
                id.clone()
            } else {
                let id = format!("dep{}", dependency_ids.len());
                out.push_str(&format!(
                    "    {id} [label=\"{}\" shape=oval];\n",
                    escape(&dependency.to_string())
                ));
                dependency_ids.insert(dependency.clone(), id.clone());
                id
            };
            edges.push(format!("    {package_id} -> {dep_id};\n"));
            if already_expanded {
                continue;
            }
            for satisfying in repo.match_dependency(dependency) {
                let (satisfying_id, seen) =
                    package_node(&mut out, &mut package_ids, &satisfying);
                edges.push(format!("    {dep_id} -> {satisfying_id};\n"));
                if !seen {
                    queue.push(satisfying);
                }
            }
        }
    }

    for edge in edges {
        out.push_str(&edge);
    }
    out.push_str("}\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tangle_cache::InMemoryPackageCache;
    use tangle_core::{Version, Vulnerability};

    #[test]
    fn renders_packages_dependencies_and_edges() {
        let repo = InMemoryPackageCache::new();
        let root = Package::new("pip", "app", Version::parse("1.0.0").unwrap())
            .with_source_repo("/src/app")
            .with_dependencies([Dependency::new("pip", "lib")]);
        let lib = Package::new("pip", "lib", Version::parse("2.0.0").unwrap())
            .update_vulnerabilities([Vulnerability::new("OSV-1", Vec::new(), "bad")]);
        repo.add(&root).unwrap();
        repo.add(&lib).unwrap();

        let dot = render(&repo);
        assert!(dot.starts_with("digraph dependencies {"));
        assert!(dot.contains("shape=rectangle"), "root is a rectangle");
        assert!(dot.contains("shape=triangle"), "vulnerable lib is a triangle");
        assert!(dot.contains("shape=oval"), "dependency is an oval");
        assert!(dot.contains("package0 -> dep0"));
        assert!(dot.contains("dep0 -> package1"));
    }
}
