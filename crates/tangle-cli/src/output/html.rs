//! Interactive HTML rendering of the dependency graph using vis.js.

use serde_json::json;
use tangle_cache::PackageCache;
use tangle_graph::DependencyGraph;

const TEMPLATE: &str = r#"<html>
<head>
<style type="text/css">
mynetwork {
    width: 100%;
    height: 100%;
    border: 1px solid lightgray;
}
</style>

<link rel="stylesheet" href="https://cdnjs.cloudflare.com/ajax/libs/vis/4.16.1/vis.css" type="text/css" />
<script type="text/javascript" src="https://cdnjs.cloudflare.com/ajax/libs/vis/4.16.1/vis-network.min.js"> </script>
<center>
<h1>Dependency Graph</h1>
</center>
</head>

<body>
<div id = "mynetwork"></div>

<script type="text/javascript">

var edges;
var nodes;
var network;
var container;
var options, data;

function drawGraph() {
    var container = document.getElementById('mynetwork');

    nodes = new vis.DataSet($NODES);
    edges = new vis.DataSet($EDGES);

    data = {nodes: nodes, edges: edges};

    const options = {
        manipulation: false,
        height: "90%",
        physics: {
            hierarchicalRepulsion: {
              nodeDistance: 300,
            },
          },
        edges: {
            color: {
                inherit: false
            },
        },
        layout: {
            improvedLayout: false
        }
    };

    network = new vis.Network(container, data, options);
    return network;
}

drawGraph();

</script>
</body>
</html>
"#;

/// Render the dependency graph as a self-contained HTML page.
#[must_use]
pub fn render(repo: &dyn PackageCache, collapse_versions: bool) -> String {
    let mut graph = DependencyGraph::from_cache(repo);
    if collapse_versions {
        graph = graph.collapse_versions();
    }

    // deterministic node ids: sorted package order
    let mut packages: Vec<_> = graph.packages().cloned().collect();
    packages.sort();
    let node_id = |package: &tangle_core::Package| {
        packages
            .iter()
            .position(|candidate| candidate == package)
            .unwrap_or_default()
    };

    let nodes: Vec<serde_json::Value> = packages
        .iter()
        .enumerate()
        .map(|(id, package)| {
            let mut node = json!({"id": id, "label": package.full_name()});
            if package.is_source_package() {
                node["shape"] = json!("square");
                node["color"] = json!("red");
                node["borderWidth"] = json!(4);
            }
            node
        })
        .collect();

    let edges: Vec<serde_json::Value> = graph
        .edges()
        .map(|(from, to, dependency)| {
            let mut edge = json!({
                "from": node_id(from),
                "to": node_id(to),
                "shape": "dot",
            });
            // omit version constraints on collapsed graphs
            let label = if collapse_versions {
                dependency.full_name()
            } else {
                dependency.to_string()
            };
            if label != to.full_name() {
                edge["label"] = json!(label);
            }
            edge
        })
        .collect();

    TEMPLATE
        .replace("$NODES", &serde_json::to_string(&nodes).unwrap_or_default())
        .replace("$EDGES", &serde_json::to_string(&edges).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tangle_cache::InMemoryPackageCache;
    use tangle_core::{Dependency, Package, Version};

    #[test]
    fn substitutes_nodes_and_edges() {
        let repo = InMemoryPackageCache::new();
        let root = Package::new("pip", "app", Version::parse("1.0.0").unwrap())
            .with_source_repo("/src/app")
            .with_dependencies([Dependency::new("pip", "lib")]);
        repo.add(&root).unwrap();
        repo.add(&Package::new("pip", "lib", Version::parse("2.0.0").unwrap()))
            .unwrap();

        let html = render(&repo, true);
        assert!(!html.contains("$NODES"));
        assert!(!html.contains("$EDGES"));
        assert!(html.contains("pip:app"));
        assert!(html.contains("\"shape\":\"square\""), "roots are squares");
    }
}
