//! The repository layer: the candidate and metadata oracle behind the
//! resolver's provider.

mod lock;
pub mod mock;
mod pypi;
mod sources;

pub use lock::{identify_candidate, CandidateKey, LockedRepository, PackageEntry};
pub use mock::MockRepository;
pub use pypi::PyPiRepository;
pub use sources::{filtered_sources, KeyringProvider, RepositoryConfig, SourceType, SOURCE_KEYS};

use crate::index::HttpError;
use crate::types::{
    Candidate, EnvSpec, FileHash, ParsePySpecError, PySpecSet, Requirement, RequirementError,
};
use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

/// What a repository knows about one candidate: its dependencies, its
/// interpreter constraint, and its summary line.
#[derive(Debug, Clone, Default)]
pub struct CandidateMetadata {
    /// The candidate's dependencies.
    pub dependencies: Vec<Requirement>,
    /// The interpreter range the candidate supports.
    pub requires_python: PySpecSet,
    /// The one-line summary for the lock file.
    pub summary: String,
}

/// Error raised by repository operations.
#[derive(Debug, Error, Diagnostic)]
pub enum RepositoryError {
    /// The index has no release at all under this name.
    #[error("unable to find candidates for {0}. There may exist some issues with the package name or network condition")]
    CandidateNotFound(String),

    /// Internal signal: the current metadata source knows nothing about the
    /// candidate and the next source should be consulted. Never surfaces to
    /// callers of [`Repository::get_dependencies`].
    #[error("candidate metadata not available from this source")]
    CandidateInfoNotFound,

    /// A transport failure.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// A malformed requirement coming out of metadata or a lock file.
    #[error(transparent)]
    Requirement(#[from] RequirementError),

    /// A malformed python constraint.
    #[error(transparent)]
    PySpec(#[from] ParsePySpecError),

    /// Preparing a candidate failed (fetch, unpack, or build).
    #[error("failed to prepare {candidate}: {reason}")]
    Prepare {
        /// The candidate display name.
        candidate: String,
        /// The failure description, including the build log tail.
        reason: String,
    },

    /// A cache or filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The resolution was cancelled from the outside.
    #[error("the operation was cancelled")]
    Cancelled,

    /// A broken lock file.
    #[error("{0}")]
    Lockfile(String),
}

/// The candidate and metadata oracle the provider consults. Implementations
/// differ in where candidates come from: a remote index, or a lock file.
#[async_trait]
pub trait Repository: Send + Sync {
    /// The environment this repository filters against.
    fn env_spec(&self) -> &EnvSpec;

    /// Enumerates candidates for a named requirement, most preferred first.
    ///
    /// `allow_prereleases` of `None` lets the specifier decide and enables
    /// the automatic fallback when nothing stable matches;
    /// `ignore_requires_python` disables the interpreter compatibility
    /// filter; `minimal_version` flips the version ordering for direct
    /// minimal-version resolution.
    async fn find_candidates(
        &self,
        requirement: &Requirement,
        allow_prereleases: Option<bool>,
        ignore_requires_python: bool,
        minimal_version: bool,
    ) -> Result<Vec<Candidate>, RepositoryError>;

    /// Returns the dependencies, interpreter constraint, and summary of a
    /// candidate, consulting this repository's metadata sources in order.
    async fn get_dependencies(
        &self,
        candidate: &Candidate,
    ) -> Result<CandidateMetadata, RepositoryError>;

    /// Collects the artifact hashes to be recorded for a pinned candidate.
    async fn get_hashes(&self, candidate: &Candidate) -> Result<Vec<FileHash>, RepositoryError>;

    /// Whether this repository serves a lock file rather than an index. The
    /// provider prepares unnamed requirements itself only against live
    /// repositories.
    fn is_locked(&self) -> bool {
        false
    }

    /// Fills in the name (and possibly version and link) of a candidate for
    /// an unnamed file requirement by preparing it. The default leaves the
    /// candidate untouched.
    async fn resolve_unnamed(&self, candidate: Candidate) -> Result<Candidate, RepositoryError> {
        Ok(candidate)
    }

    /// Dependency groups collected while resolving self-referencing extras.
    fn collected_groups(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether any non-fatal package warning was emitted.
    fn has_warnings(&self) -> bool {
        false
    }

    /// Fetches hashes for all pinned candidates with bounded parallelism.
    async fn fetch_hashes(
        &self,
        candidates: &mut [Candidate],
    ) -> Result<(), RepositoryError> {
        use futures::stream::{self, StreamExt, TryStreamExt};

        let futures: Vec<_> = candidates
            .iter()
            .map(|candidate| self.get_hashes(candidate))
            .collect();
        let fetched: Vec<Vec<FileHash>> = stream::iter(futures).buffered(8).try_collect().await?;
        for (candidate, hashes) in candidates.iter_mut().zip(fetched) {
            candidate.hashes = hashes;
        }
        Ok(())
    }
}

/// Sorts candidates by the repository preference: yanked releases last,
/// wheels before sdists when binaries are preferred, then version (highest
/// first unless a minimal resolution is requested), then wheel specificity.
pub(crate) fn sort_candidates(
    candidates: &mut [Candidate],
    env_spec: &EnvSpec,
    prefer_binary: bool,
    minimal_version: bool,
) {
    let sort_key = |candidate: &Candidate| {
        let link = candidate.link.as_ref();
        let yanked = link.map_or(false, |l| l.yank_reason.is_some());
        let is_wheel = link.map_or(false, |l| l.is_wheel());
        let compat = link
            .and_then(|l| l.filename())
            .and_then(|f| {
                candidate
                    .key()
                    .and_then(|k| crate::types::WheelFilename::from_filename(&f, &k).ok())
            })
            .and_then(|name| env_spec.wheel_compatibility(&name))
            .unwrap_or(i32::MIN);
        (
            yanked,
            prefer_binary && !is_wheel,
            candidate.version.clone().map(std::cmp::Reverse),
            std::cmp::Reverse(compat),
        )
    };
    if minimal_version {
        candidates.sort_by(|a, b| {
            let (ay, aw, av, ac) = sort_key(a);
            let (by, bw, bv, bc) = sort_key(b);
            // lowest versions first, everything else unchanged
            (ay, aw, bv, ac).cmp(&(by, bw, av, bc))
        });
    } else {
        candidates.sort_by_key(sort_key);
    }
}

/// The non-fatal warning sink repositories report through.
pub trait WarningReporter: Send + Sync {
    /// Reports a package-level warning.
    fn warn_package(&self, message: &str);
}

/// A reporter that forwards warnings to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl WarningReporter for TracingReporter {
    fn warn_package(&self, message: &str) {
        tracing::warn!("{message}");
    }
}

/// Shared filtering for enumerated candidates: keep the ones admitted by the
/// requirement's specifier, then drop releases whose requires-python cannot
/// cover the target (with a package warning), and finally fall back to
/// pre-releases when nothing stable matched and the caller left the decision
/// open.
#[allow(clippy::too_many_arguments)]
pub(crate) fn filter_applicable_candidates(
    candidates: &[Candidate],
    requirement: &Requirement,
    allow_prereleases: Option<bool>,
    ignore_requires_python: bool,
    env_spec: &EnvSpec,
    ignore_warning: &dyn Fn(&str) -> bool,
    reporter: &dyn WarningReporter,
    has_warnings: &mut bool,
) -> Vec<Candidate> {
    let requires_python = &requirement.core().requires_python & &env_spec.requires_python;

    let by_specifier = |prereleases: Option<bool>| -> Vec<Candidate> {
        candidates
            .iter()
            .filter(|candidate| match &candidate.version {
                Some(version) => requirement
                    .core()
                    .specifier
                    .contains(version, prereleases),
                None => true,
            })
            .cloned()
            .collect()
    };

    let python_compatible = |cans: &[Candidate], has_warnings: &mut bool| -> Vec<Candidate> {
        if ignore_requires_python {
            return cans.to_vec();
        }
        cans.iter()
            .filter(|candidate| {
                let candidate_python: PySpecSet =
                    candidate.requires_python.parse().unwrap_or_default();
                if requires_python.is_subset(&candidate_python) {
                    return true;
                }
                let key = candidate
                    .key()
                    .map(|k| k.to_string())
                    .unwrap_or_default();
                if !ignore_warning(&key) {
                    let working = &env_spec.requires_python & &candidate_python;
                    if !working.is_impossible() {
                        reporter.warn_package(&format!(
                            "Skipping {candidate} because it requires Python{} but the lock \
                             targets Python{}. Narrow down `requires-python` (for example to \
                             \"{working}\") to include this version.",
                            candidate.requires_python, env_spec.requires_python,
                        ));
                        *has_warnings = true;
                    }
                }
                false
            })
            .cloned()
            .collect()
    };

    let applicable = by_specifier(allow_prereleases);
    let compatible = python_compatible(&applicable, has_warnings);
    // when the python filter leaves nothing, surface the incompatible ones
    // rather than nothing at all
    let mut chosen = if compatible.is_empty() {
        applicable
    } else {
        compatible
    };

    if chosen.is_empty() && allow_prereleases.is_none() {
        tracing::debug!("no matching candidates, retrying with pre-releases allowed");
        let applicable = by_specifier(Some(true));
        let compatible = python_compatible(&applicable, has_warnings);
        chosen = if compatible.is_empty() {
            applicable
        } else {
            compatible
        };
    }

    if chosen.is_empty() {
        tracing::debug!("could not find any matching candidates for {requirement}");
    }
    chosen
}
