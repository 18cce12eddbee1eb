//! The resolution engine and the SBOM backtracker.
//!
//! [`resolve`] turns a root (a dependency, a package, or a local source
//! repository) into a fully-expanded [`PackageRepository`] by
//! orchestrating every registered resolver, memoizing results in a shared
//! cache, and iterating to a fixed point. [`resolve_sbom`] then enumerates
//! version-consistent package sets over the result.

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

mod resolution;
mod sbom;

pub use resolution::{ResolutionConfig, ResolutionTarget, ResolveError, resolve};
pub use sbom::{Sbom, resolve_sbom};
