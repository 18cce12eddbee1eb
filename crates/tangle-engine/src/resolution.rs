//! The concurrent fixed-point resolution driver.
//!
//! Two work queues drive the loop: dependencies awaiting expansion and
//! packages awaiting cross-resolver enrichment. Before dispatching any work
//! the engine drains both queues against the cache until neither changes;
//! whatever survives is submitted to a bounded in-flight set and harvested
//! as it completes. The loop terminates because dependencies enter the
//! `queued` set at most once, package re-adds are no-ops, and a depth limit
//! caps queue growth explicitly.

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tangle_cache::{CacheSession, PackageCache, PackageRepository};
use tangle_core::{Dependency, Package, Progress, SilentProgress, SourceRepository};
use tangle_resolvers::{DependencyResolver, ResolverError, resolver_by_name, resolvers};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a resolution run starts from.
#[derive(Debug, Clone)]
pub enum ResolutionTarget {
    /// Expand a single dependency specification.
    Dependency(Dependency),
    /// Enrich a known package and expand its dependencies.
    Package(Package),
    /// Discover root packages in a local source tree.
    Repository(SourceRepository),
}

impl From<Dependency> for ResolutionTarget {
    fn from(dependency: Dependency) -> Self {
        Self::Dependency(dependency)
    }
}

impl From<Package> for ResolutionTarget {
    fn from(package: Package) -> Self {
        Self::Package(package)
    }
}

impl From<SourceRepository> for ResolutionTarget {
    fn from(repo: SourceRepository) -> Self {
        Self::Repository(repo)
    }
}

/// Why a resolution run failed.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// No registered resolver accepted the source repository.
    #[error("can not resolve {path}")]
    NotResolvable {
        /// Path of the rejected repository.
        path: std::path::PathBuf,
    },

    /// The run was interrupted; the partial repository is preserved so
    /// interactive callers can decide to keep it.
    #[error("resolution cancelled")]
    Cancelled {
        /// Everything resolved before the interrupt.
        partial: PackageRepository,
    },

    /// A cache invariant was violated or the store failed.
    #[error(transparent)]
    Cache(#[from] tangle_core::Error),
}

/// Tunables for one resolution run.
pub struct ResolutionConfig {
    /// Cap on transitive expansion depth; negative means unbounded and
    /// zero yields an empty repository.
    pub depth_limit: i64,
    /// Worker pool size; `<= 1` runs tasks synchronously in deterministic
    /// queue order.
    pub max_workers: usize,
    /// Cooperative cancellation signal, checked between task completions.
    pub token: CancellationToken,
    /// Progress sink.
    pub progress: Arc<dyn Progress>,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            depth_limit: -1,
            max_workers: num_cpus::get(),
            token: CancellationToken::new(),
            progress: Arc::new(SilentProgress),
        }
    }
}

impl std::fmt::Debug for ResolutionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionConfig")
            .field("depth_limit", &self.depth_limit)
            .field("max_workers", &self.max_workers)
            .finish_non_exhaustive()
    }
}

/// One completed unit of work.
enum TaskResult {
    Resolved {
        dependency: Dependency,
        packages: Vec<Package>,
        depth: i64,
    },
    Updated {
        package: Package,
        was_updated: bool,
        updated_in: BTreeSet<String>,
        depth: i64,
    },
}

/// Expand one dependency through its resolver. Transient failures are
/// absorbed into an empty result with a logged warning.
async fn process_dep(dependency: Dependency, depth: i64) -> TaskResult {
    let packages = match resolver_by_name(&dependency.source) {
        Ok(resolver) => match resolver.resolve(&dependency).await {
            Ok(packages) => packages,
            Err(ResolverError::NotApplicable) => Vec::new(),
            Err(error) => {
                warn!(%dependency, %error, "dependency resolution failed");
                Vec::new()
            }
        },
        Err(error) => {
            warn!(%dependency, %error, "no resolver for dependency");
            Vec::new()
        }
    };
    TaskResult::Resolved {
        dependency,
        packages,
        depth,
    }
}

/// Run every applicable resolver's enrichment over one package.
async fn update_package(mut package: Package, depth: i64) -> TaskResult {
    let old_deps = package.dependencies.clone();
    let mut updated_in = BTreeSet::new();
    for resolver in resolvers() {
        if resolver.can_update_dependencies(&package) {
            package = resolver.update_dependencies(package).await;
            updated_in.insert(resolver.name().to_string());
        }
    }
    let was_updated = package.dependencies != old_deps;
    TaskResult::Updated {
        package,
        was_updated,
        updated_in,
        depth,
    }
}

struct Engine {
    cache: Arc<dyn PackageCache>,
    repo: PackageRepository,
    unresolved: Vec<(Dependency, i64)>,
    unupdated: Vec<(Package, i64)>,
    queued: HashSet<Dependency>,
    root_dependency: Option<Dependency>,
    root_package: Option<Package>,
    depth_limit: i64,
    progress: Arc<dyn Progress>,
}

impl Engine {
    fn process_updated_package(
        &mut self,
        package: Package,
        depth: i64,
        updated_in: &BTreeSet<String>,
        was_updated: bool,
    ) -> Result<(), ResolveError> {
        self.repo.add(&package)?;
        let is_root = self.root_package.as_ref() == Some(&package);
        if !package.is_source_package() && !is_root {
            if was_updated {
                self.cache.add(&package)?;
            }
            for resolver in updated_in {
                self.repo.set_updated(&package, resolver);
                self.cache.set_updated(&package, resolver);
            }
        }
        if self.depth_limit < 0 || depth < self.depth_limit {
            let new_deps: BTreeSet<Dependency> = package
                .dependencies
                .iter()
                .filter(|dep| !self.queued.contains(dep))
                .cloned()
                .collect();
            self.progress.add_total(new_deps.len() as u64);
            for dep in new_deps {
                self.queued.insert(dep.clone());
                self.unresolved.push((dep, depth + 1));
            }
        }
        Ok(())
    }

    fn process_resolution(
        &mut self,
        dependency: &Dependency,
        packages: Vec<Package>,
        depth: i64,
        already_cached: bool,
    ) -> Result<(), ResolveError> {
        self.repo.set_resolved(dependency);
        let is_root = self.root_dependency.as_ref() == Some(dependency);
        if !already_cached && !is_root {
            self.cache.set_resolved(dependency);
            self.cache.extend(&packages)?;
        }
        self.progress.add_total(packages.len() as u64);
        self.unupdated
            .extend(packages.into_iter().map(|package| (package, depth)));
        Ok(())
    }

    /// Repeatedly drain both queues against the cache until a pass changes
    /// nothing.
    fn drain_cache(&mut self) -> Result<(), ResolveError> {
        loop {
            let mut reached_fixed_point = true;

            // packages whose every applicable enricher already ran
            let pending = std::mem::take(&mut self.unupdated);
            let mut still_pending = Vec::new();
            for (package, depth) in pending {
                let updatable: Vec<Arc<dyn DependencyResolver>> = resolvers()
                    .into_iter()
                    .filter(|resolver| resolver.can_update_dependencies(&package))
                    .collect();
                let awaiting_update = updatable
                    .iter()
                    .any(|resolver| !self.cache.was_updated(&package, resolver.name()));
                if awaiting_update {
                    still_pending.push((package, depth));
                    continue;
                }
                let package = if updatable.is_empty() {
                    package
                } else {
                    // every enricher already recorded itself; the cache
                    // holds the merged result
                    self.cache
                        .match_package(&package)
                        .into_iter()
                        .next()
                        .unwrap_or(package)
                };
                self.process_updated_package(package, depth, &BTreeSet::new(), true)?;
                self.progress.inc(1);
                reached_fixed_point = false;
            }
            self.unupdated = still_pending;

            // dependencies whose resolution is already recorded
            let pending = std::mem::take(&mut self.unresolved);
            let mut still_pending = Vec::new();
            for (dependency, depth) in pending {
                let is_root = self.root_dependency.as_ref() == Some(&dependency);
                if !is_root && self.cache.was_resolved(&dependency) {
                    let matches = self.cache.match_dependency(&dependency);
                    self.process_resolution(&dependency, matches, depth, true)?;
                    self.progress.inc(1);
                    reached_fixed_point = false;
                } else {
                    still_pending.push((dependency, depth));
                }
            }
            self.unresolved = still_pending;

            if reached_fixed_point {
                return Ok(());
            }
        }
    }

    fn apply(&mut self, result: TaskResult) -> Result<(), ResolveError> {
        self.progress.inc(1);
        match result {
            TaskResult::Updated {
                package,
                was_updated,
                updated_in,
                depth,
            } => self.process_updated_package(package, depth, &updated_in, was_updated),
            TaskResult::Resolved {
                dependency,
                packages,
                depth,
            } => self.process_resolution(&dependency, packages, depth, false),
        }
    }
}

/// Resolve the transitive dependencies of `target`.
///
/// A negative `depth_limit` recurses without bound; zero returns an empty
/// repository. All intermediate results land in `cache`, so repeated runs
/// against a shared cache skip everything already known.
pub async fn resolve(
    target: impl Into<ResolutionTarget>,
    cache: Arc<dyn PackageCache>,
    config: ResolutionConfig,
) -> Result<PackageRepository, ResolveError> {
    let target = target.into();
    if config.depth_limit == 0 {
        return Ok(PackageRepository::new());
    }
    let _session = CacheSession::enter(cache.as_ref())?;
    info!(?target, "resolving");

    let mut engine = Engine {
        cache: Arc::clone(&cache),
        repo: PackageRepository::new(),
        unresolved: Vec::new(),
        unupdated: Vec::new(),
        queued: HashSet::new(),
        root_dependency: None,
        root_package: None,
        depth_limit: config.depth_limit,
        progress: Arc::clone(&config.progress),
    };

    match target {
        ResolutionTarget::Dependency(dependency) => {
            engine.queued.insert(dependency.clone());
            engine.root_dependency = Some(dependency.clone());
            engine.unresolved.push((dependency, 0));
        }
        ResolutionTarget::Package(package) => {
            engine.root_package = Some(package.clone());
            engine.unupdated.push((package, 0));
        }
        ResolutionTarget::Repository(repo) => {
            for resolver in resolvers() {
                if !resolver.can_resolve_from_source(&repo) {
                    continue;
                }
                match resolver.resolve_from_source(&repo, cache.as_ref()).await {
                    Ok(Some(source_package)) => {
                        debug!(
                            resolver = resolver.name(),
                            package = %source_package,
                            "found source package"
                        );
                        engine.unupdated.push((source_package, 0));
                    }
                    Ok(None) | Err(ResolverError::NotApplicable) => {}
                    Err(error) => {
                        warn!(resolver = resolver.name(), %error, "source resolution failed");
                    }
                }
            }
            if engine.unupdated.is_empty() {
                return Err(ResolveError::NotResolvable {
                    path: repo.path().to_path_buf(),
                });
            }
        }
    }
    config
        .progress
        .add_total((engine.unresolved.len() + engine.unupdated.len()) as u64);

    let mut in_flight: FuturesUnordered<BoxFuture<'static, TaskResult>> = FuturesUnordered::new();

    while !engine.unresolved.is_empty() || !engine.unupdated.is_empty() || !in_flight.is_empty() {
        if config.token.is_cancelled() {
            return Err(ResolveError::Cancelled {
                partial: engine.repo,
            });
        }

        engine.drain_cache()?;

        if config.max_workers <= 1 {
            // deterministic sequential mode
            if let Some((package, depth)) = take_first(&mut engine.unupdated) {
                let result = update_package(package, depth).await;
                engine.apply(result)?;
            }
            if let Some((dependency, depth)) = take_first(&mut engine.unresolved) {
                let result = process_dep(dependency, depth).await;
                engine.apply(result)?;
            }
            continue;
        }

        while in_flight.len() < config.max_workers {
            if let Some((package, depth)) = take_first(&mut engine.unupdated) {
                in_flight.push(Box::pin(update_package(package, depth)));
            } else {
                break;
            }
        }
        while in_flight.len() < config.max_workers {
            if let Some((dependency, depth)) = take_first(&mut engine.unresolved) {
                in_flight.push(Box::pin(process_dep(dependency, depth)));
            } else {
                break;
            }
        }

        if let Some(result) = in_flight.next().await {
            engine.apply(result)?;
        }
    }

    config.progress.finish();
    info!(packages = engine.repo.len(), "resolution complete");
    Ok(engine.repo)
}

fn take_first<T>(queue: &mut Vec<T>) -> Option<T> {
    if queue.is_empty() {
        None
    } else {
        Some(queue.remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tangle_cache::InMemoryPackageCache;
    use tangle_core::{Version, VersionSpec};
    use tangle_resolvers::{Availability, register};

    /// A resolver over a tiny fixed universe:
    /// a 1.0.0 -> b >=1.0, c >=1.0; b 1.1.0 -> d >=1.0;
    /// c exists as 1.0.0 and 2.0.0; d 1.0.0 is a leaf.
    struct MockResolver;

    fn universe() -> Vec<Package> {
        let v = |s: &str| Version::parse(s).unwrap();
        let spec = |s: &str| VersionSpec::parse(s).unwrap();
        vec![
            Package::new("mock", "a", v("1.0.0")).with_dependencies([
                Dependency::with_spec("mock", "b", spec(">=1.0")),
                Dependency::with_spec("mock", "c", spec(">=1.0")),
            ]),
            Package::new("mock", "b", v("1.1.0"))
                .with_dependencies([Dependency::with_spec("mock", "d", spec(">=1.0"))]),
            Package::new("mock", "c", v("1.0.0")),
            Package::new("mock", "c", v("2.0.0")),
            Package::new("mock", "d", v("1.0.0")),
        ]
    }

    #[async_trait]
    impl DependencyResolver for MockResolver {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn description(&self) -> &'static str {
            "fixed universe for engine tests"
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
        ) -> Result<Option<Package>, ResolverError> {
            Ok(None)
        }

        async fn resolve(
            &self,
            dependency: &Dependency,
        ) -> Result<Vec<Package>, ResolverError> {
            Ok(universe()
                .into_iter()
                .filter(|package| dependency.matches(package))
                .collect())
        }
    }

    fn setup() -> Arc<dyn PackageCache> {
        register(Arc::new(MockResolver));
        Arc::new(InMemoryPackageCache::new())
    }

    fn names(repo: &PackageRepository) -> Vec<String> {
        let mut all: Vec<String> = repo.packages().iter().map(ToString::to_string).collect();
        all.sort();
        all
    }

    #[tokio::test]
    async fn resolves_transitive_closure() {
        let cache = setup();
        let root = Dependency::new("mock", "a");
        let repo = resolve(root.clone(), Arc::clone(&cache), ResolutionConfig::default())
            .await
            .unwrap();

        // a, b, both versions of c, and d
        assert_eq!(repo.len(), 5);

        // closure: every dependency of every package is recorded resolved
        for package in repo.packages() {
            for dep in &package.dependencies {
                assert!(repo.was_resolved(dep), "{dep} unresolved");
            }
        }
    }

    #[tokio::test]
    async fn determinism_across_empty_caches() {
        let root = Dependency::new("mock", "a");
        let first = resolve(
            root.clone(),
            setup(),
            ResolutionConfig {
                max_workers: 4,
                ..ResolutionConfig::default()
            },
        )
        .await
        .unwrap();
        let second = resolve(
            root,
            setup(),
            ResolutionConfig {
                max_workers: 1,
                ..ResolutionConfig::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(names(&first), names(&second));
    }

    #[tokio::test]
    async fn shared_cache_returns_same_packages() {
        let cache = setup();
        let root = Dependency::new("mock", "a");
        let first = resolve(root.clone(), Arc::clone(&cache), ResolutionConfig::default())
            .await
            .unwrap();
        let second = resolve(root.clone(), Arc::clone(&cache), ResolutionConfig::default())
            .await
            .unwrap();
        assert_eq!(names(&first), names(&second));
        assert!(cache.was_resolved(&Dependency::with_spec(
            "mock",
            "b",
            VersionSpec::parse(">=1.0").unwrap()
        )));
        // the root itself is never marked in the shared cache
        assert!(!cache.was_resolved(&root));
    }

    #[tokio::test]
    async fn depth_limit_zero_is_empty() {
        let repo = resolve(
            Dependency::new("mock", "a"),
            setup(),
            ResolutionConfig {
                depth_limit: 0,
                ..ResolutionConfig::default()
            },
        )
        .await
        .unwrap();
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn depth_limit_truncates_expansion() {
        let repo = resolve(
            Dependency::new("mock", "a"),
            setup(),
            ResolutionConfig {
                depth_limit: 1,
                ..ResolutionConfig::default()
            },
        )
        .await
        .unwrap();
        // a's direct dependencies (b, c) are expanded, but b's own
        // dependency on d sits past the limit and never resolves
        assert_eq!(repo.match_dependency(&Dependency::new("mock", "a")).len(), 1);
        assert_eq!(repo.match_dependency(&Dependency::new("mock", "d")).len(), 0);
        assert_eq!(repo.len(), 4, "a, b and both c versions: {:?}", names(&repo));
    }

    #[tokio::test]
    async fn cancellation_preserves_partial_results() {
        let token = CancellationToken::new();
        token.cancel();
        let err = resolve(
            Dependency::new("mock", "a"),
            setup(),
            ResolutionConfig {
                token,
                ..ResolutionConfig::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ResolveError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn package_roots_are_not_cached() {
        let cache = setup();
        let root = Package::new("mock", "a", Version::parse("1.0.0").unwrap())
            .with_dependencies([Dependency::with_spec(
                "mock",
                "c",
                VersionSpec::parse(">=1.0").unwrap(),
            )]);
        let repo = resolve(root.clone(), Arc::clone(&cache), ResolutionConfig::default())
            .await
            .unwrap();
        assert!(repo.contains(&root));
        // both versions of c got pulled in
        assert_eq!(repo.len(), 3);
    }
}
