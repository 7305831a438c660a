//! padlock is a dependency resolution and lock file engine for the Python
//! packaging ecosystem. Given a set of requirements, a target interpreter
//! profile and one or more package indexes, it computes a consistent set of
//! pinned versions together with their provenance, hashes and environment
//! applicability, and reads/writes that result as a lock file.
//!
//! It is a library, not a package manager: command-line surfaces, virtual
//! environment management and wheel installation live in the embedding
//! application.

#![deny(missing_docs)]

pub mod caches;
pub mod index;
pub mod lockfile;
pub mod preparer;
pub mod project;
pub mod python_env;
pub mod repository;
pub mod resolver;
pub mod types;
pub mod utils;
pub mod wheel_builder;

pub use lockfile::{Compatibility, Lockfile, LockfileError};
pub use project::{Manifest, ProjectContext};
pub use repository::{LockedRepository, PyPiRepository, Repository, RepositoryError};
pub use resolver::{
    resolve, Resolution, ResolutionError, ResolveOptions, UpdateStrategy,
};
pub use types::{Candidate, EnvSpec, Marker, PySpecSet, Requirement, Version};
