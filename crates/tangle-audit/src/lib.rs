//! Enrichment of resolved packages: vulnerability lookup against the OSV
//! database and maintenance-status checks against GitHub.

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

mod maintenance;
mod osv;

pub use maintenance::{MaintenanceChecker, check_maintenance, extract_github_repo};
pub use osv::{OsvClient, audit};

use thiserror::Error;

/// Enrichment failure.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Network request failed.
    #[error("network error: {0}")]
    Network(String),

    /// Response could not be interpreted.
    #[error("parse error: {0}")]
    Parse(String),
}

/// Result type for enrichment operations.
pub type Result<T> = std::result::Result<T, AuditError>;
