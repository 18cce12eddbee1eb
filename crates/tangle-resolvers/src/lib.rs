//! Per-ecosystem dependency resolvers and the registry that holds them.
//!
//! Every packaging ecosystem tangle understands implements the
//! [`DependencyResolver`] trait: crates.io (`cargo`), Go modules (`go`),
//! npm (`npm`), `PyPI` (`pip`), autotools and `CMake` source trees, and
//! Ubuntu system packages (`ubuntu`). Resolvers are registered by name in an
//! explicit table built at startup; `resolver_by_name` is a map lookup and
//! embedders (including tests) can register additional resolvers.

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

mod autotools;
mod cargo;
mod cmake;
mod go;
mod native;
mod npm;
mod pip;
mod registry;
mod resolver;
mod sandbox;
mod ubuntu;
mod util;

pub use autotools::AutotoolsResolver;
pub use cargo::CargoResolver;
pub use cmake::CmakeResolver;
pub use go::GoResolver;
pub use npm::NpmResolver;
pub use pip::PipResolver;
pub use registry::{
    is_known_resolver, parse_dependency, parse_target, register, resolver_by_name, resolvers,
    Target,
};
pub use resolver::{Availability, DependencyResolver, DockerSetup, ResolverError, RunOrder};
pub use sandbox::DockerContainer;
pub use ubuntu::UbuntuResolver;
