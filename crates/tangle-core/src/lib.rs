//! Core types for the tangle dependency analyzer.
//!
//! This crate provides the foundational data model shared by every other
//! tangle crate:
//! - Versions and version constraints with per-ecosystem syntaxes
//! - Packages, dependencies, vulnerabilities and maintenance metadata
//! - Source repository handles (local trees and git clones)
//! - Error types and the progress-reporting trait

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
mod package;
mod progress;
mod repository;
mod version;

pub use error::{Error, Result};
pub use package::{Dependency, MaintenanceInfo, Package, Vulnerability};
pub use progress::{Progress, SilentProgress};
pub use repository::SourceRepository;
pub use version::{SpecSyntax, Version, VersionSpec};
