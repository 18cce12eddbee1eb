//! Native shared-library discovery.
//!
//! Loading a package inside a clean sandbox under `strace` reveals every
//! shared object the dynamic loader opens. Each opened `.so` path becomes an
//! `ubuntu:` file-path dependency which the Ubuntu resolver later maps to
//! the owning system package. A baseline run of the bare runtime is
//! subtracted so shell and interpreter libraries are not attributed to
//! every package.

use crate::registry::resolver_by_name;
use crate::resolver::ResolverError;
use crate::sandbox::DockerContainer;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tangle_core::{Dependency, Package};
use tracing::info;

static STRACE_LIBRARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^open(?:at)?\(\s*[^,]*\s*,\s*"((?:.+?)(?:[^\./]+)\.so(?:\.(?:.+?))?)".*"#)
        .unwrap_or_else(|_| unreachable!())
});

/// Sandbox containers and baselines are built at most once per resolver.
static CONTAINERS: Lazy<tokio::sync::Mutex<HashMap<String, Arc<DockerContainer>>>> =
    Lazy::new(|| tokio::sync::Mutex::new(HashMap::new()));
static BASELINES: Lazy<tokio::sync::Mutex<HashMap<String, BTreeSet<Dependency>>>> =
    Lazy::new(|| tokio::sync::Mutex::new(HashMap::new()));

fn parse_strace_output(output: &str) -> BTreeSet<Dependency> {
    output
        .lines()
        .filter_map(|line| STRACE_LIBRARY.captures(line))
        .filter_map(|captured| captured.get(1).map(|m| m.as_str().to_string()))
        .filter(|path| path.starts_with('/') && path != "/etc/ld.so.cache")
        .map(|path| Dependency::new("ubuntu", path))
        .collect()
}

async fn container_for(resolver_name: &str) -> Result<Arc<DockerContainer>, ResolverError> {
    let mut containers = CONTAINERS.lock().await;
    if let Some(container) = containers.get(resolver_name) {
        return Ok(Arc::clone(container));
    }
    let resolver = resolver_by_name(resolver_name).map_err(ResolverError::Core)?;
    let setup = resolver.docker_setup().ok_or_else(|| {
        ResolverError::failed(format!(
            "source {resolver_name} does not support native dependency resolution"
        ))
    })?;
    info!(resolver = resolver_name, "configuring sandbox");
    let container = Arc::new(DockerContainer::build(resolver_name, &setup).await?);
    containers.insert(resolver_name.to_string(), Arc::clone(&container));
    Ok(container)
}

async fn baseline_for(resolver_name: &str) -> Result<BTreeSet<Dependency>, ResolverError> {
    let mut baselines = BASELINES.lock().await;
    if let Some(baseline) = baselines.get(resolver_name) {
        return Ok(baseline.clone());
    }
    let container = container_for(resolver_name).await?;
    let output = container
        .run("strace -e open,openat -f ./baseline.sh 3>&1 1>&2 2>&3")
        .await?;
    let baseline = parse_strace_output(&String::from_utf8_lossy(&output));
    baselines.insert(resolver_name.to_string(), baseline.clone());
    Ok(baseline)
}

/// The native dependencies of one package: every shared library its load
/// probe opens, minus the baseline when `use_baseline` is set.
pub async fn native_dependencies(
    package: &Package,
    use_baseline: bool,
) -> Result<BTreeSet<Dependency>, ResolverError> {
    let resolver = resolver_by_name(&package.source).map_err(ResolverError::Core)?;
    if resolver.docker_setup().is_none() {
        return Ok(BTreeSet::new());
    }
    let container = container_for(&package.source).await?;
    let baseline = if use_baseline {
        baseline_for(&package.source).await?
    } else {
        BTreeSet::new()
    };
    let script = format!(
        "./install.sh {name} {version} > /dev/null 2>/dev/null && \
         strace -e open,openat -f ./run.sh {name} 3>&1 1>&2 2>&3",
        name = package.name,
        version = package.version,
    );
    let output = container.run(&script).await?;
    let mut dependencies = parse_strace_output(&String::from_utf8_lossy(&output));
    dependencies.retain(|dep| !baseline.contains(dep));
    Ok(dependencies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn strace_output_parsing() {
        let output = r#"openat(AT_FDCWD, "/lib/x86_64-linux-gnu/libc.so.6", O_RDONLY|O_CLOEXEC) = 3
openat(AT_FDCWD, "/etc/ld.so.cache", O_RDONLY|O_CLOEXEC) = 3
open("/usr/lib/libz.so.1", O_RDONLY) = 4
openat(AT_FDCWD, "relative/libfoo.so", O_RDONLY) = -1
read(3, "data", 4) = 4
"#;
        let deps = parse_strace_output(output);
        let paths: Vec<String> = deps.iter().map(|d| d.package.clone()).collect();
        assert_eq!(
            paths,
            vec![
                "/lib/x86_64-linux-gnu/libc.so.6".to_string(),
                "/usr/lib/libz.so.1".to_string(),
            ]
        );
        assert!(deps.iter().all(|d| d.source == "ubuntu" && d.spec.is_any()));
    }

    #[test]
    fn baseline_subtraction_shape() {
        let all = parse_strace_output(
            "open(\"/lib/libc.so.6\", O_RDONLY) = 3\nopen(\"/lib/libssl.so.1\", O_RDONLY) = 4\n",
        );
        let baseline = parse_strace_output("open(\"/lib/libc.so.6\", O_RDONLY) = 3\n");
        let mut remaining = all;
        remaining.retain(|dep| !baseline.contains(dep));
        assert_eq!(remaining.len(), 1);
        assert_eq!(
            remaining.iter().next().map(|d| d.package.as_str()),
            Some("/lib/libssl.so.1")
        );
    }
}
