//! The resolver registry: an explicit table populated at program start.

use crate::resolver::DependencyResolver;
use crate::{
    AutotoolsResolver, CargoResolver, CmakeResolver, GoResolver, NpmResolver, PipResolver,
    UbuntuResolver,
};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use tangle_core::{Dependency, Error, Result, SourceRepository};

static REGISTRY: Lazy<RwLock<Vec<Arc<dyn DependencyResolver>>>> = Lazy::new(|| {
    RwLock::new(vec![
        Arc::new(AutotoolsResolver::new()),
        Arc::new(CargoResolver::new()),
        Arc::new(CmakeResolver::new()),
        Arc::new(GoResolver::new()),
        Arc::new(NpmResolver::new()),
        Arc::new(PipResolver::new()),
        Arc::new(UbuntuResolver::new()),
    ])
});

/// All registered resolvers, ordered for the enrichment pass (Ubuntu last)
/// and by name within the same rank.
#[must_use]
pub fn resolvers() -> Vec<Arc<dyn DependencyResolver>> {
    let mut all = REGISTRY.read().clone();
    all.sort_by(|a, b| {
        a.run_order()
            .cmp(&b.run_order())
            .then_with(|| a.name().cmp(b.name()))
    });
    all
}

/// Look up a resolver by its registered name.
pub fn resolver_by_name(name: &str) -> Result<Arc<dyn DependencyResolver>> {
    REGISTRY
        .read()
        .iter()
        .find(|r| r.name() == name)
        .cloned()
        .ok_or_else(|| Error::UnknownResolver {
            name: name.to_string(),
        })
}

/// True if `name` is a registered resolver.
#[must_use]
pub fn is_known_resolver(name: &str) -> bool {
    resolver_by_name(name).is_ok()
}

/// Register an additional resolver (embedders and tests). A resolver with
/// the same name replaces the existing entry.
pub fn register(resolver: Arc<dyn DependencyResolver>) {
    let mut registry = REGISTRY.write();
    registry.retain(|existing| existing.name() != resolver.name());
    registry.push(resolver);
}

/// Parse `source:package[@spec]` with the named resolver's spec syntax,
/// verifying that `source` is a registered resolver.
pub fn parse_dependency(description: &str) -> Result<Dependency> {
    let parse_err = || Error::DependencyParse {
        input: description.to_string(),
    };
    let (source, tail) = description.split_once(':').ok_or_else(parse_err)?;
    let resolver = resolver_by_name(source)?;
    let segments: Vec<&str> = tail.splitn(3, '@').collect();
    let dependency = match segments.as_slice() {
        [package] if !package.is_empty() => Dependency::new(source, *package),
        [package, spec] if !package.is_empty() => {
            Dependency::with_spec(source, *package, resolver.parse_spec(spec)?)
        }
        // a leading '@' is a scoped package name, not an alias
        ["", scoped, spec] if !scoped.is_empty() => {
            Dependency::with_spec(source, format!("@{scoped}"), resolver.parse_spec(spec)?)
        }
        [alias, package, spec] if !package.is_empty() => {
            Dependency::with_spec(source, *package, resolver.parse_spec(spec)?)
                .aliased(*alias)
        }
        _ => return Err(parse_err()),
    };
    Ok(dependency)
}

/// What the CLI's positional `TARGET` turned out to be.
#[derive(Debug, Clone)]
pub enum Target {
    /// A local source tree to analyze.
    Repository(SourceRepository),
    /// A `resolver:name[@version]` package specification.
    Spec(Dependency),
}

/// Interpret a CLI target: an existing filesystem path wins, otherwise the
/// string must be a valid package specification with a known resolver.
pub fn parse_target(target: &str) -> Result<Target> {
    let path = Path::new(target);
    let dependency = parse_dependency(target);
    match dependency {
        Err(Error::UnknownResolver { name }) if !path.exists() => {
            Err(Error::UnknownResolver { name })
        }
        Ok(dependency) if !path.exists() => Ok(Target::Spec(dependency)),
        _ => {
            if path.exists() {
                Ok(Target::Repository(SourceRepository::from_path(path)))
            } else {
                Err(Error::DependencyParse {
                    input: target.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{Availability, ResolverError};
    use async_trait::async_trait;
    use tangle_cache::PackageCache;
    use tangle_core::Package;

    #[test]
    fn builtins_are_registered() {
        for name in ["autotools", "cargo", "cmake", "go", "npm", "pip", "ubuntu"] {
            assert!(is_known_resolver(name), "{name} should be registered");
        }
        assert!(!is_known_resolver("frobnicator"));
    }

    #[test]
    fn ubuntu_sorts_last() {
        let all = resolvers();
        assert_eq!(all.last().map(|r| r.name()), Some("ubuntu"));
    }

    #[test]
    fn parse_dependency_validates_resolver() {
        let dep = parse_dependency("pip:cvedb@*").unwrap();
        assert_eq!(dep.to_string(), "pip:cvedb@*");

        let err = parse_dependency("frobnicator:thing@*").unwrap_err();
        assert!(matches!(err, Error::UnknownResolver { .. }));
    }

    #[test]
    fn parse_dependency_uses_resolver_syntax() {
        // go specs are exact string matches, not semver ranges
        let dep = parse_dependency("go:github.com/foo/bar@v0.0.0-20150119174127-31079b680792")
            .unwrap();
        assert!(
            dep.spec
                .matches(&tangle_core::Version::raw("v0.0.0-20150119174127-31079b680792"))
        );
    }

    #[test]
    fn parse_target_prefers_existing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().to_string_lossy().to_string();
        assert!(matches!(
            parse_target(&target).unwrap(),
            Target::Repository(_)
        ));

        assert!(matches!(
            parse_target("pip:cvedb").unwrap(),
            Target::Spec(_)
        ));

        let err = parse_target("nonexistent:thing").unwrap_err();
        assert!(matches!(err, Error::UnknownResolver { .. }));
    }

    struct DummyResolver;

    #[async_trait]
    impl DependencyResolver for DummyResolver {
        fn name(&self) -> &'static str {
            "dummy"
        }

        fn description(&self) -> &'static str {
            "test resolver"
        }

        fn is_available(&self) -> Availability {
            Availability::available()
        }

        fn can_resolve_from_source(&self, _repo: &SourceRepository) -> bool {
            false
        }

        async fn resolve_from_source(
            &self,
            _repo: &SourceRepository,
            _cache: &dyn PackageCache,
        ) -> std::result::Result<Option<Package>, ResolverError> {
            Ok(None)
        }

        async fn resolve(
            &self,
            _dependency: &Dependency,
        ) -> std::result::Result<Vec<Package>, ResolverError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn dynamic_registration() {
        register(Arc::new(DummyResolver));
        assert!(is_known_resolver("dummy"));
        assert!(resolvers().iter().any(|r| r.name() == "dummy"));
    }
}
