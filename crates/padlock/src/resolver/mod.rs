//! The resolution entry point: wires a repository into a strategy provider,
//! runs the backtracking engine on a blocking thread, and post-processes the
//! result (marker and group inheritance, self-removal, hash fetching).

pub mod engine;
mod graph;
mod provider;
mod python;
mod reporter;

pub use engine::{
    Criteria, Criterion, Preference, PreferenceElem, Provider, ProviderError,
    RequirementInformation, Resolution as ResolutionMachine, ResolutionError, ResolutionResult,
};
pub use graph::{group_sort_key, inherited_groups, merge_markers, DependencyGraph};
pub use provider::{
    BaseProvider, EagerUpdateProvider, ResolvedMetadata, ReuseInstalledProvider,
    ReusePinProvider, StrategyProvider, UpdateStrategy,
};
pub use python::{python_requirement, PYTHON_IDENTIFIER};
pub use reporter::{LogReporter, Reporter, SilentReporter};

use crate::repository::{LockedRepository, Repository};
use crate::types::{
    is_unnamed_identifier, Candidate, PackageName, ProjectKey, PySpecSet, Requirement, Version,
};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// The lock strategy flags controlling the shape of the output.
pub mod strategy {
    /// Record URLs instead of filenames in the hash tables.
    pub const STATIC_URLS: &str = "static_urls";
    /// The lock covers every platform, not just the current one.
    pub const CROSS_PLATFORM: &str = "cross_platform";
    /// Direct dependencies resolve to their lowest admitted versions.
    pub const DIRECT_MINIMAL_VERSIONS: &str = "direct_minimal_versions";
    /// Record inherited markers and groups on each entry.
    pub const INHERIT_METADATA: &str = "inherit_metadata";
}

/// Options governing one resolution run.
#[derive(Clone)]
pub struct ResolveOptions {
    /// The update strategy to run under.
    pub update_strategy: UpdateStrategy,
    /// The lock strategy flags.
    pub strategies: HashSet<String>,
    /// Identifiers being deliberately updated (for reuse strategies).
    pub tracked_names: Vec<String>,
    /// Whether the project's own entry is kept in the result.
    pub keep_self: bool,
    /// The round budget of the engine.
    pub max_rounds: usize,
    /// The project-wide pre-release policy.
    pub allow_prereleases: Option<bool>,
    /// Resolution overrides: name to version or URL.
    pub overrides: IndexMap<String, String>,
    /// Identifiers of the project's direct dependencies, used by
    /// `direct_minimal_versions`.
    pub direct_identifiers: HashSet<String>,
    /// The project's own key, removed from the result unless `keep_self`.
    pub this_key: Option<ProjectKey>,
    /// The lock to reuse pins from, for the reuse/eager strategies.
    pub locked_repository: Option<Arc<LockedRepository>>,
    /// The installed working set, for the reuse-installed strategy.
    pub installed: HashMap<String, (PackageName, Version)>,
    /// Whether hashes are fetched for the pinned candidates.
    pub fetch_hashes: bool,
    /// Cooperative cancellation, checked at every provider boundary.
    pub cancel: Option<tokio_util::sync::CancellationToken>,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        ResolveOptions {
            update_strategy: UpdateStrategy::All,
            strategies: HashSet::from([strategy::INHERIT_METADATA.to_string()]),
            tracked_names: Vec::new(),
            keep_self: false,
            max_rounds: 10_000,
            allow_prereleases: None,
            overrides: IndexMap::new(),
            direct_identifiers: HashSet::new(),
            this_key: None,
            locked_repository: None,
            installed: HashMap::new(),
            fetch_hashes: false,
            cancel: None,
        }
    }
}

/// The final outcome handed to the lock writer.
#[derive(Debug)]
pub struct Resolution {
    /// Identifier to pinned candidate, markers and groups applied.
    pub mapping: IndexMap<String, Candidate>,
    /// The dependencies fetched per candidate, keyed by `(identifier,
    /// version)`.
    pub all_dependencies: HashMap<(String, Option<String>), Vec<Requirement>>,
    /// Metadata remembered per candidate.
    pub metadata: HashMap<(String, Option<String>), ResolvedMetadata>,
    /// The groups collected while resolving self-referencing extras.
    pub collected_groups: Vec<String>,
    /// Whether any non-fatal package warning was emitted along the way.
    pub has_warnings: bool,
}

fn build_provider(
    repository: Arc<dyn Repository>,
    handle: tokio::runtime::Handle,
    options: &ResolveOptions,
) -> StrategyProvider {
    let mut base = BaseProvider::new(repository, handle)
        .with_allow_prereleases(options.allow_prereleases)
        .with_overrides(options.overrides.clone())
        .with_direct_minimal_versions(
            options
                .strategies
                .contains(strategy::DIRECT_MINIMAL_VERSIONS),
            options.direct_identifiers.clone(),
        )
        .with_this_key(options.this_key.clone());
    if let Some(token) = &options.cancel {
        base = base.with_cancellation_token(token.clone());
    }
    if options.update_strategy == UpdateStrategy::All {
        return StrategyProvider::All(base);
    }
    let preferred_pins = options
        .locked_repository
        .as_ref()
        .map(|locked| locked.all_candidates())
        .unwrap_or_default();
    let reuse = ReusePinProvider::new(base, preferred_pins, options.tracked_names.clone());
    match options.update_strategy {
        UpdateStrategy::All => unreachable!(),
        UpdateStrategy::Reuse => StrategyProvider::Reuse(reuse),
        UpdateStrategy::Eager => StrategyProvider::Eager(EagerUpdateProvider::new(reuse)),
        UpdateStrategy::ReuseInstalled => StrategyProvider::ReuseInstalled(
            ReuseInstalledProvider::new(reuse, options.installed.clone()),
        ),
    }
}

/// Resolves `requirements` against `repository` for the interpreter range
/// `requires_python`. The backtracking engine runs on a blocking thread;
/// hash fetching happens afterwards with bounded parallelism.
pub async fn resolve(
    repository: Arc<dyn Repository>,
    requirements: Vec<Requirement>,
    requires_python: PySpecSet,
    options: ResolveOptions,
) -> Result<Resolution, ResolutionError> {
    let handle = tokio::runtime::Handle::current();
    let repo = Arc::clone(&repository);
    let inherit_metadata = options.strategies.contains(strategy::INHERIT_METADATA);
    let keep_self = options.keep_self;
    let this_key = options.this_key.clone();
    let options_for_worker = options.clone();

    let mut resolution = tokio::task::spawn_blocking(move || {
        resolve_inner(
            repo,
            handle,
            requirements,
            requires_python,
            options_for_worker,
            inherit_metadata,
            keep_self,
            this_key,
        )
    })
    .await
    .unwrap_or_else(|join_error| match join_error.try_into_panic() {
        Ok(panic) => std::panic::resume_unwind(panic),
        Err(_) => Err(ResolutionError::Cancelled),
    })?;

    if options.fetch_hashes {
        let mut candidates: Vec<Candidate> = resolution.mapping.values().cloned().collect();
        repository
            .fetch_hashes(&mut candidates)
            .await
            .map_err(|e| ResolutionError::Provider(e.to_string()))?;
        for (candidate, slot) in candidates.into_iter().zip(resolution.mapping.values_mut()) {
            slot.hashes = candidate.hashes;
        }
    }
    Ok(resolution)
}

#[allow(clippy::too_many_arguments)]
fn resolve_inner(
    repository: Arc<dyn Repository>,
    handle: tokio::runtime::Handle,
    requirements: Vec<Requirement>,
    requires_python: PySpecSet,
    options: ResolveOptions,
    inherit_metadata: bool,
    keep_self: bool,
    this_key: Option<ProjectKey>,
) -> Result<Resolution, ResolutionError> {
    let provider = build_provider(Arc::clone(&repository), handle, &options);
    let reporter = LogReporter;

    // a root requirement whose marker can never hold in the target produces
    // no pin and no error
    let requirements: Vec<Requirement> = requirements
        .into_iter()
        .filter(|req| {
            let applicable =
                !(&req.core().requires_python & &requires_python).is_impossible();
            if !applicable {
                tracing::debug!("skipping {req}: not applicable to the lock target");
            }
            applicable
        })
        .collect();

    // the synthetic python requirement goes first: its criterion always
    // resolves before any package
    let mut all_requirements = vec![python_requirement(requires_python)];
    all_requirements.extend(requirements);

    let machine = ResolutionMachine::new(&provider, &reporter);
    let mut result = machine.resolve(all_requirements, options.max_rounds)?;

    if repository.has_warnings() {
        tracing::info!(
            "Use `-q/--quiet` to suppress these warnings, or silence them per-package with \
             the `ignore_package_warnings` setting."
        );
    }

    result.mapping.shift_remove(PYTHON_IDENTIFIER);

    // unnamed file requirements received their real name during
    // preparation; rekey them so downstream consumers never see
    // placeholders
    let placeholder_keys: Vec<String> = result
        .mapping
        .keys()
        .filter(|key| is_unnamed_identifier(key))
        .cloned()
        .collect();
    for key in placeholder_keys {
        if let Some(candidate) = result.mapping.shift_remove(&key) {
            let new_key = candidate.identify();
            if let Some(criterion) = result.criteria.shift_remove(&key) {
                result.criteria.insert(new_key.clone(), criterion);
            }
            result.mapping.insert(new_key, candidate);
        }
    }

    let all_markers = if inherit_metadata {
        merge_markers(&result)
    } else {
        IndexMap::new()
    };
    let groups = if inherit_metadata {
        inherited_groups(&result)
    } else {
        IndexMap::new()
    };

    let base = provider.base();
    let all_dependencies = base.fetched_dependencies();
    let metadata = base.resolved_metadata();

    let mut mapping: IndexMap<String, Candidate> = IndexMap::new();
    for (key, mut candidate) in std::mem::take(&mut result.mapping) {
        if let Some(marker) = all_markers.get(&key) {
            if marker.is_empty() {
                // the merged marker admits no environment at all
                continue;
            }
            candidate
                .req
                .set_marker(if marker.is_any() { None } else { Some(marker.clone()) });
        }
        if let Some(candidate_groups) = groups.get(&key) {
            candidate.req.core_mut().groups = candidate_groups.clone();
        }
        if let Some(resolved) = metadata.get(&candidate.dep_key()) {
            if candidate.requires_python.is_empty() {
                candidate.requires_python = resolved.requires_python.clone();
            }
            candidate.summary = resolved.summary.clone();
        }
        if !keep_self {
            let (bare, _) = crate::types::strip_extras(&key);
            if this_key.as_ref().map(|k| k.as_str()) == Some(bare) {
                continue;
            }
        }
        mapping.insert(key, candidate);
    }

    Ok(Resolution {
        mapping,
        all_dependencies,
        metadata,
        collected_groups: repository.collected_groups(),
        has_warnings: repository.has_warnings(),
    })
}

