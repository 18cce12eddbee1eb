//! Error types for tangle operations.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type shared across the tangle crates.
#[derive(Debug, Error)]
pub enum Error {
    /// A package spec named a resolver that is not registered.
    #[error("unknown resolver '{name}'")]
    UnknownResolver {
        /// The unrecognized resolver name.
        name: String,
    },

    /// No registered resolver accepted the given source repository.
    #[error("no resolver can handle the source repository at {path}")]
    NotResolvable {
        /// Path of the rejected repository.
        path: PathBuf,
    },

    /// An external command or network call failed during resolution.
    #[error("resolution failed: {message}")]
    ResolutionFailed {
        /// Human-readable failure description.
        message: String,
    },

    /// `add` attempted to shrink a cached package's dependency set.
    #[error("package {package} has already been cached with more dependencies: {existing}")]
    CacheConflict {
        /// Incoming package description.
        package: String,
        /// The richer entry already present in the cache.
        existing: String,
    },

    /// The persistent cache on disk has an incompatible schema.
    #[error(
        "the package database at {path} has an incompatible schema; \
         run with --clear-cache to rebuild it"
    )]
    SchemaMismatch {
        /// Location of the offending database.
        path: PathBuf,
    },

    /// Database-level failure in the persistent cache.
    #[error("database error: {message}")]
    Database {
        /// Underlying database message.
        message: String,
    },

    /// The run was interrupted by the user.
    #[error("resolution cancelled")]
    Cancelled,

    /// A version string could not be parsed.
    #[error("can not parse version <{input}>")]
    VersionParse {
        /// The offending input.
        input: String,
    },

    /// A version constraint string could not be parsed.
    #[error("can not parse version spec <{input}>")]
    SpecParse {
        /// The offending input.
        input: String,
    },

    /// A `source:name@spec` dependency description could not be parsed.
    #[error("can not parse dependency description <{input}>")]
    DependencyParse {
        /// The offending input.
        input: String,
    },

    /// A `source:name@version[...]` package description could not be parsed.
    #[error("can not parse package description <{input}>")]
    PackageParse {
        /// The offending input.
        input: String,
    },

    /// Filesystem error with the path that caused it.
    #[error("io error at {path}: {source}")]
    Io {
        /// Path involved in the failed operation.
        path: PathBuf,
        /// Underlying io error.
        source: std::io::Error,
    },

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create an IO error with path context.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a resolution failure from any displayable cause.
    #[must_use]
    pub fn resolution(message: impl Into<String>) -> Self {
        Self::ResolutionFailed {
            message: message.into(),
        }
    }
}

/// Result type for tangle operations.
pub type Result<T> = std::result::Result<T, Error>;
