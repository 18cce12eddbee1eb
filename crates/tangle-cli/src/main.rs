//! tangle - cross-ecosystem dependency graphs, vulnerability audits and SBOMs.
//!
//! Point it at a source tree or a `resolver:name@version` spec and it
//! produces the transitive dependency graph, optionally audited against OSV
//! and rendered as JSON, Graphviz, HTML or a CycloneDX SBOM.

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

mod output;
mod progress;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use progress::TerminalProgress;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tangle_audit::{MaintenanceChecker, OsvClient};
use tangle_cache::{PackageCache, PackageRepository, SqlitePackageCache};
use tangle_core::Error;
use tangle_engine::{ResolutionConfig, ResolveError, Sbom, resolve, resolve_sbom};
use tangle_graph::DependencyGraph;
use tangle_resolvers::{Target, parse_target, resolvers};
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

/// Exit code for database/schema failures (user errors use 1).
const EXIT_DATABASE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Dot,
    Html,
    Cyclonedx,
}

#[derive(Debug, Parser)]
#[command(
    name = "tangle",
    version,
    about = "Analyzes a source tree or package spec and produces its transitive dependency graph"
)]
struct Cli {
    /// Directory or package spec to analyze. A spec has the form
    /// RESOLVER:NAME[@VERSION], e.g. `pip:numpy`, `ubuntu:libc6@2.31` or
    /// `npm:lodash@>=4.17.0`; RESOLVER must appear in `tangle --list`.
    target: Option<String>,

    /// List the available resolvers and their compatibility with TARGET.
    #[arg(long)]
    list: bool,

    /// Path of the persistent package cache, or `:memory:` to keep all
    /// results in memory.
    #[arg(long, default_value_os_t = default_database_path())]
    database: PathBuf,

    /// Depth limit for recursive dependency expansion; negative means
    /// unbounded.
    #[arg(long, default_value_t = -1)]
    depth_limit: i64,

    /// Maximum number of jobs to run concurrently.
    #[arg(long, default_value_t = num_cpus::get())]
    max_workers: usize,

    /// Delete the database named by `--database` before doing anything.
    #[arg(long)]
    clear_cache: bool,

    /// Audit the resolved packages for known vulnerabilities using OSV.
    #[arg(long)]
    audit: bool,

    /// Check upstream repositories for maintenance activity.
    #[arg(long)]
    check_maintenance: bool,

    /// GitHub API token used by `--check-maintenance`.
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    github_token: Option<String>,

    /// Compare TARGET against another path or package spec and output a
    /// graph-distance metric instead of packages.
    #[arg(long)]
    compare: Option<String>,

    /// With `--compare`, normalize the metric into [0, 1] where 1 means
    /// the graphs are identical.
    #[arg(long)]
    normalize: bool,

    /// Output format. `cyclonedx` emits a single satisfying dependency
    /// resolution rather than the universe of all possible resolutions.
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    output_format: OutputFormat,

    /// Output file; stdout when not given.
    #[arg(long)]
    output_file: Option<PathBuf>,

    /// Overwrite the output file if it already exists.
    #[arg(long)]
    force: bool,

    /// For `--output-format html`, emit every package version satisfying
    /// each dependency instead of collapsing them.
    #[arg(long)]
    all_versions: bool,

    /// For `--output-format cyclonedx`, prefer the newest satisfying
    /// versions instead of the oldest.
    #[arg(long)]
    latest_resolution: bool,

    /// Increase log verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors.
    #[arg(short, long)]
    quiet: bool,
}

fn default_database_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "tangle")
        .map(|dirs| dirs.cache_dir().join("dependencies.sqlite"))
        .unwrap_or_else(|| PathBuf::from("dependencies.sqlite"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 if cli.quiet => Level::ERROR,
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to create runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            // schema and database errors carry a recovery hint
            if let Some(Error::SchemaMismatch { .. } | Error::Database { .. }) =
                e.downcast_ref::<Error>()
            {
                error!(
                    "{e}\n\nThis can occur if your database was created with an older \
                     version of tangle. If you run `tangle --clear-cache` and try again, \
                     the database will be rebuilt from scratch."
                );
                return ExitCode::from(EXIT_DATABASE);
            }
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    if cli.clear_cache && cli.database.as_os_str() != ":memory:" && cli.database.exists() {
        std::fs::remove_file(&cli.database)
            .with_context(|| format!("failed to delete {}", cli.database.display()))?;
        info!(database = %cli.database.display(), "cache cleared");
    }

    let Some(target) = cli.target.as_deref() else {
        if cli.list {
            list_resolvers(None);
            return Ok(ExitCode::SUCCESS);
        }
        error!("a TARGET is required unless --list is given");
        return Ok(ExitCode::FAILURE);
    };

    let target = match parse_target(target) {
        Ok(target) => target,
        Err(e) => {
            error!("{e}");
            return Ok(ExitCode::FAILURE);
        }
    };

    if cli.list {
        list_resolvers(Some(&target));
        return Ok(ExitCode::SUCCESS);
    }

    // refuse to clobber the output file before spending minutes resolving
    if let Some(output_file) = &cli.output_file
        && output_file.exists()
        && !cli.force
    {
        error!(
            "{} already exists!\nRe-run with `--force` to overwrite the file.",
            output_file.display()
        );
        return Ok(ExitCode::FAILURE);
    }

    let cache: Arc<dyn PackageCache> = Arc::new(SqlitePackageCache::new(&cli.database));

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_token.cancel();
        }
    });

    let repo = match resolve_target(&cli, target.clone(), Arc::clone(&cache), &token).await? {
        Some(repo) => repo,
        None => return Ok(ExitCode::FAILURE),
    };
    if repo.is_empty() {
        error!(
            "No packages found. Try --list to check for available resolvers for the target."
        );
    }

    if cli.audit {
        let client = OsvClient::default();
        tangle_audit::audit(&repo, &client, cli.max_workers, progress_reporter(&cli)).await;
    }
    if cli.check_maintenance {
        let checker = MaintenanceChecker::new(
            "https://api.github.com",
            cli.github_token.clone(),
        );
        tangle_audit::check_maintenance(&repo, &checker, cli.max_workers, progress_reporter(&cli))
            .await;
    }

    let rendered = if let Some(compare) = &cli.compare {
        let other_target = match parse_target(compare) {
            Ok(other) => other,
            Err(e) => {
                error!("{e}");
                return Ok(ExitCode::FAILURE);
            }
        };
        let Some(other) =
            resolve_target(&cli, other_target, Arc::clone(&cache), &token).await?
        else {
            return Ok(ExitCode::FAILURE);
        };
        let distance = DependencyGraph::from_cache(&repo)
            .distance_to(&DependencyGraph::from_cache(&other), cli.normalize);
        format!("{distance}")
    } else {
        match cli.output_format {
            OutputFormat::Json => serde_json::to_string_pretty(&repo.to_obj())?,
            OutputFormat::Dot => output::dot::render(&repo),
            OutputFormat::Html => output::html::render(&repo, !cli.all_versions),
            OutputFormat::Cyclonedx => {
                let Some(sbom) = first_sbom(&repo, !cli.latest_resolution) else {
                    error!("no consistent dependency resolution exists for the target");
                    return Ok(ExitCode::FAILURE);
                };
                serde_json::to_string_pretty(&sbom.to_cyclonedx())?
            }
        }
    };

    match &cli.output_file {
        Some(output_file) => {
            std::fs::write(output_file, rendered)
                .with_context(|| format!("failed to write {}", output_file.display()))?;
            info!("Output saved to {}", output_file.display());
        }
        None => println!("{rendered}"),
    }
    Ok(ExitCode::SUCCESS)
}

/// Resolve one target, translating cancellation into the interactive
/// "keep partial results?" flow.
async fn resolve_target(
    cli: &Cli,
    target: Target,
    cache: Arc<dyn PackageCache>,
    token: &CancellationToken,
) -> anyhow::Result<Option<PackageRepository>> {
    let config = ResolutionConfig {
        depth_limit: cli.depth_limit,
        max_workers: cli.max_workers,
        token: token.clone(),
        progress: progress_reporter(cli),
    };
    let result = match target {
        Target::Spec(dependency) => resolve(dependency, cache, config).await,
        Target::Repository(repo) => resolve(repo, cache, config).await,
    };
    match result {
        Ok(repo) => Ok(Some(repo)),
        Err(ResolveError::Cancelled { partial }) => {
            if std::io::stderr().is_terminal() && std::io::stdin().is_terminal() {
                let keep = dialoguer::Confirm::new()
                    .with_prompt("Resolution was interrupted. Output the partial results?")
                    .default(true)
                    .interact()
                    .unwrap_or(false);
                if keep {
                    return Ok(Some(partial));
                }
            }
            Ok(None)
        }
        Err(ResolveError::NotResolvable { path }) => {
            error!(
                "Can not resolve {}. Try --list to check for available resolvers.",
                path.display()
            );
            Ok(None)
        }
        Err(ResolveError::Cache(e)) => Err(e.into()),
    }
}

/// One merged SBOM: the first consistent resolution of every source
/// package in the repository.
fn first_sbom(repo: &PackageRepository, order_ascending: bool) -> Option<Sbom> {
    let mut merged: Option<Sbom> = None;
    for source_package in repo.source_packages() {
        if let Some(sbom) = resolve_sbom(&source_package, repo, order_ascending).next() {
            merged = Some(match merged {
                Some(existing) => existing | sbom,
                None => sbom,
            });
        }
    }
    merged
}

fn progress_reporter(cli: &Cli) -> Arc<dyn tangle_core::Progress> {
    if cli.quiet || !std::io::stderr().is_terminal() {
        Arc::new(tangle_core::SilentProgress)
    } else {
        Arc::new(TerminalProgress::new("resolving"))
    }
}

fn list_resolvers(target: Option<&Target>) {
    match target {
        Some(Target::Repository(repo)) => {
            println!("Available resolvers for {}:\n", repo.path().display());
        }
        Some(Target::Spec(dependency)) => {
            println!("Available resolvers for {dependency}:\n");
        }
        None => println!("Available resolvers:\n"),
    }
    for resolver in resolvers() {
        let status = {
            let availability = resolver.is_available();
            if !availability.is_available() {
                format!("not available: {}", availability.reason())
            } else {
                match target {
                    Some(Target::Repository(repo)) if !resolver.can_resolve_from_source(repo) => {
                        "incompatible with this path".to_string()
                    }
                    Some(Target::Spec(dependency)) if dependency.source != resolver.name() => {
                        "incompatible with this package specifier".to_string()
                    }
                    _ => "enabled".to_string(),
                }
            }
        };
        println!("{:<12}{} ({})", resolver.name(), status, resolver.description());
    }
}
