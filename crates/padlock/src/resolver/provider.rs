//! The provider layer: wraps a repository with an update strategy and
//! implements the engine's protocol. Strategies are decorators over the
//! base provider, mirroring the update modes `all`, `reuse`, `eager`, and
//! `reuse-installed`.

use super::engine::{
    Criteria, Preference, PreferenceElem, Provider, ProviderError, RequirementInformation,
};
use super::python::{
    find_python_matches, is_python_requirement, is_python_satisfied_by, python_requirement,
    PYTHON_IDENTIFIER,
};
use crate::repository::{Repository, RepositoryError};
use crate::types::{
    requirement_from_override, strip_extras, Candidate, CompareOp, PackageName, ProjectKey,
    Requirement, Version,
};
use crate::utils::LazySequence;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

/// The update strategies a resolution can run under.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum UpdateStrategy {
    /// Ignore any existing pins and re-consult the repository.
    #[default]
    All,
    /// Prefer pins from the existing lock file.
    Reuse,
    /// Like reuse, but packages being updated drag their dependencies into
    /// the update too.
    Eager,
    /// Like reuse, preferring versions installed in the working set.
    ReuseInstalled,
}

/// Metadata the provider remembers per resolved candidate, consumed by the
/// lock writer after the resolution.
#[derive(Debug, Clone, Default)]
pub struct ResolvedMetadata {
    /// The candidate's requires-python constraint, rendered.
    pub requires_python: String,
    /// The candidate's summary.
    pub summary: String,
}

/// The base provider: no reuse preference, always consults the repository.
pub struct BaseProvider {
    repository: Arc<dyn Repository>,
    handle: Handle,
    cancel: CancellationToken,
    allow_prereleases: Option<bool>,
    overrides: IndexMap<String, String>,
    direct_minimal_versions: bool,
    /// Identifiers of the project's own (direct) dependencies.
    direct_identifiers: HashSet<String>,
    /// The project's own key; its candidates always satisfy.
    this_key: Option<ProjectKey>,
    fetched_dependencies: RefCell<HashMap<(String, Option<String>), Vec<Requirement>>>,
    resolved_metadata: RefCell<HashMap<(String, Option<String>), ResolvedMetadata>>,
    dependency_cache: RefCell<HashMap<(String, Option<String>), Result<Vec<Requirement>, String>>>,
    known_depth: RefCell<HashMap<String, i64>>,
}

impl BaseProvider {
    /// Creates a provider over `repository`, blocking on its futures via
    /// `handle`.
    pub fn new(repository: Arc<dyn Repository>, handle: Handle) -> Self {
        BaseProvider {
            repository,
            handle,
            cancel: CancellationToken::new(),
            allow_prereleases: None,
            overrides: IndexMap::new(),
            direct_minimal_versions: false,
            direct_identifiers: HashSet::new(),
            this_key: None,
            fetched_dependencies: RefCell::new(HashMap::new()),
            resolved_metadata: RefCell::new(HashMap::new()),
            dependency_cache: RefCell::new(HashMap::new()),
            known_depth: RefCell::new(HashMap::new()),
        }
    }

    /// Sets the project-wide pre-release policy.
    pub fn with_allow_prereleases(mut self, allow: Option<bool>) -> Self {
        self.allow_prereleases = allow;
        self
    }

    /// Installs the resolution overrides.
    pub fn with_overrides(mut self, overrides: IndexMap<String, String>) -> Self {
        self.overrides = overrides;
        self
    }

    /// Enables minimal-version selection for the given direct dependencies.
    pub fn with_direct_minimal_versions(
        mut self,
        enabled: bool,
        direct_identifiers: HashSet<String>,
    ) -> Self {
        self.direct_minimal_versions = enabled;
        self.direct_identifiers = direct_identifiers;
        self
    }

    /// Declares the project's own key, so self-candidates always satisfy.
    pub fn with_this_key(mut self, key: Option<ProjectKey>) -> Self {
        self.this_key = key;
        self
    }

    /// The token callers cancel the resolution through.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Uses an externally owned cancellation token. The provider checks it
    /// at every `find_matches`/`get_dependencies` boundary.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// The dependencies fetched for every pinned candidate.
    pub fn fetched_dependencies(
        &self,
    ) -> HashMap<(String, Option<String>), Vec<Requirement>> {
        self.fetched_dependencies.borrow().clone()
    }

    /// The metadata remembered for every pinned candidate.
    pub fn resolved_metadata(&self) -> HashMap<(String, Option<String>), ResolvedMetadata> {
        self.resolved_metadata.borrow().clone()
    }

    /// The repository this provider consults.
    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    fn check_cancelled(&self) -> Result<(), ProviderError> {
        if self.cancel.is_cancelled() {
            Err(ProviderError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        let handle = self.handle.clone();
        tokio::task::block_in_place(move || handle.block_on(future))
    }

    /// Orders the requirements of an identifier so the most informative one
    /// drives candidate enumeration: editables, then files/URLs, then pins,
    /// then pre-release opt-ins, then the narrowest specifier.
    fn requirement_preference(
        &self,
        requirement: &Requirement,
    ) -> (bool, bool, bool, bool, std::cmp::Reverse<usize>) {
        let core = requirement.core();
        let is_prerelease = core.prerelease || core.specifier.has_prereleases();
        (
            !core.editable,
            requirement.is_named(),
            !requirement.is_pinned(),
            !is_prerelease,
            std::cmp::Reverse(core.specifier.len()),
        )
    }

    fn override_candidates(&self, identifier: &str) -> Result<Vec<Candidate>, ProviderError> {
        let requested = &self.overrides[identifier];
        let requirement = requirement_from_override(identifier, requested)
            .map_err(|e| ProviderError::Fatal(e.to_string()))?;
        self.enumerate_candidates(&requirement)
    }

    fn is_direct_requirement(&self, requirement: &Requirement) -> bool {
        self.direct_identifiers.contains(&requirement.identify())
    }

    /// Enumerates candidates for one requirement: file/URL requirements are
    /// prepared into their single candidate, named requirements come from
    /// the repository.
    fn enumerate_candidates(
        &self,
        requirement: &Requirement,
    ) -> Result<Vec<Candidate>, ProviderError> {
        self.check_cancelled()?;
        if !requirement.is_named() && !self.repository.is_locked() {
            let candidate = Candidate::new(requirement.clone());
            let candidate = self
                .block_on(self.repository.resolve_unnamed(candidate))
                .map_err(fatal)?;
            return Ok(vec![candidate]);
        }
        let allow = if requirement.core().prerelease {
            Some(true)
        } else {
            self.allow_prereleases
        };
        let minimal = self.direct_minimal_versions && self.is_direct_requirement(requirement);
        self.block_on(self.repository.find_candidates(
            requirement,
            allow,
            false,
            minimal,
        ))
        .map_err(fatal)
    }

    fn requirements_for<'a>(
        criteria: &'a Criteria,
        identifier: &str,
        extra: &'a [Requirement],
    ) -> Vec<&'a Requirement> {
        let mut reqs: Vec<&Requirement> = criteria
            .get(identifier)
            .map(|criterion| criterion.iter_requirement().collect())
            .unwrap_or_default();
        reqs.extend(extra.iter());
        reqs
    }
}

fn fatal(err: RepositoryError) -> ProviderError {
    match err {
        RepositoryError::Cancelled => ProviderError::Cancelled,
        RepositoryError::Requirement(e) => ProviderError::DependenciesUnavailable(e.to_string()),
        RepositoryError::PySpec(e) => ProviderError::DependenciesUnavailable(e.to_string()),
        RepositoryError::Prepare { candidate, reason } => {
            ProviderError::DependenciesUnavailable(format!("{candidate}: {reason}"))
        }
        other => ProviderError::Fatal(other.to_string()),
    }
}

impl Provider for BaseProvider {
    fn get_preference(
        &self,
        identifier: &str,
        _resolutions: &IndexMap<String, Candidate>,
        criteria: &Criteria,
        backtrack_causes: &[RequirementInformation],
    ) -> Preference {
        let Some(criterion) = criteria.get(identifier) else {
            return Preference(vec![PreferenceElem::Str(identifier.to_string())]);
        };
        let is_top = criterion.iter_parent().any(|parent| parent.is_none());
        let backtrack_identifiers: HashSet<String> = backtrack_causes
            .iter()
            .flat_map(|cause| {
                cause
                    .parent
                    .iter()
                    .map(|p| p.identify())
                    .chain(std::iter::once(cause.requirement.identify()))
            })
            .collect();
        let dep_depth = if is_top {
            1
        } else {
            let known_depth = self.known_depth.borrow();
            criterion
                .iter_parent()
                .map(|parent| {
                    parent
                        .map(|p| known_depth.get(&p.identify()).copied().unwrap_or(0))
                        .unwrap_or(0)
                })
                .min()
                .unwrap_or(0)
                + 1
        };
        // fetch the dependencies of the first workable candidate so the
        // backtrack-cause test sees real dependency identifiers
        let mut deps: Vec<Requirement> = Vec::new();
        for candidate in criterion.candidates.iter() {
            match self.get_dependencies(&candidate) {
                Ok(found) => {
                    self.known_depth
                        .borrow_mut()
                        .insert(candidate.identify(), dep_depth);
                    deps = found;
                    break;
                }
                Err(_) => continue,
            }
        }
        let is_backtrack_cause = deps
            .iter()
            .any(|dep| backtrack_identifiers.contains(&dep.identify()));
        let is_file_or_url = criterion
            .iter_requirement()
            .any(|req| !req.is_named());
        let operators: Vec<CompareOp> = criterion
            .iter_requirement()
            .flat_map(|req| req.core().specifier.0.iter().map(|spec| spec.op))
            .collect();
        let is_python = identifier == PYTHON_IDENTIFIER;
        let is_pinned = operators
            .iter()
            .any(|op| matches!(op, CompareOp::Equal | CompareOp::ArbitraryEqual));
        Preference(vec![
            PreferenceElem::Bool(!is_python),
            PreferenceElem::Bool(!is_top),
            PreferenceElem::Bool(!is_file_or_url),
            PreferenceElem::Bool(!is_pinned),
            PreferenceElem::Bool(!is_backtrack_cause),
            PreferenceElem::Int(dep_depth),
            PreferenceElem::Int(-(operators.len() as i64)),
            PreferenceElem::Str(identifier.to_string()),
        ])
    }

    fn find_matches(
        &self,
        identifier: &str,
        criteria: &Criteria,
        extra_requirements: &[Requirement],
        extra_incompatibilities: &[Candidate],
    ) -> Result<LazySequence<Candidate>, ProviderError> {
        self.check_cancelled()?;
        let mut incompatibilities: Vec<Candidate> = criteria
            .get(identifier)
            .map(|criterion| criterion.incompatibilities.clone())
            .unwrap_or_default();
        incompatibilities.extend(extra_incompatibilities.iter().cloned());

        if identifier == PYTHON_IDENTIFIER {
            let requirements: Vec<Requirement> =
                Self::requirements_for(criteria, identifier, extra_requirements)
                    .into_iter()
                    .cloned()
                    .collect();
            let matches: Vec<Candidate> = find_python_matches(&requirements)
                .into_iter()
                .filter(|candidate| !incompatibilities.contains(candidate))
                .collect();
            return Ok(LazySequence::from_vec(matches));
        }

        if self.overrides.contains_key(identifier) {
            // overrides bypass the whole chain
            let candidates = self.override_candidates(identifier)?;
            return Ok(LazySequence::from_vec(candidates));
        }

        let mut reqs: Vec<&Requirement> =
            Self::requirements_for(criteria, identifier, extra_requirements);
        if reqs.is_empty() {
            return Ok(LazySequence::from_vec(Vec::new()));
        }
        reqs.sort_by_key(|req| self.requirement_preference(req));
        let original_req = reqs[0].clone();

        // an extras identifier also observes the criteria of its bare name,
        // so both resolve against one shared candidate set
        let (bare_name, extras) = strip_extras(identifier);
        let has_extras = extras.is_some();
        if has_extras {
            if let Some(bare_criterion) = criteria.get(bare_name) {
                reqs.extend(bare_criterion.iter_requirement());
                reqs.sort_by_key(|req| self.requirement_preference(req));
            }
        }

        let candidates = self.enumerate_candidates(reqs[0])?;
        let checks: Vec<Requirement> = reqs.into_iter().cloned().collect();
        let incompat = incompatibilities;
        let satisfies = {
            // the closure outlives this call, so it owns its inputs
            let provider_allow = self.allow_prereleases;
            let this_key = self.this_key.clone();
            let overrides: HashSet<String> = self.overrides.keys().cloned().collect();
            move |candidate: &Candidate| {
                checks.iter().all(|req| {
                    satisfied_by(req, candidate, provider_allow, this_key.as_ref(), &overrides)
                })
            }
        };
        let matches = candidates.into_iter().filter_map(move |candidate| {
            let candidate = if has_extras {
                // candidates found via the bare identifier must carry the
                // extras-bearing requirement for dependency extraction
                candidate.copy_with(original_req.clone())
            } else {
                candidate
            };
            if incompat.contains(&candidate) {
                return None;
            }
            satisfies(&candidate).then_some(candidate)
        });
        Ok(LazySequence::new(matches))
    }

    fn is_satisfied_by(&self, requirement: &Requirement, candidate: &Candidate) -> bool {
        let overrides: HashSet<String> = self.overrides.keys().cloned().collect();
        if is_python_requirement(requirement) {
            return is_python_satisfied_by(requirement, candidate);
        }
        satisfied_by(
            requirement,
            candidate,
            self.allow_prereleases,
            self.this_key.as_ref(),
            &overrides,
        )
    }

    fn get_dependencies(&self, candidate: &Candidate) -> Result<Vec<Requirement>, ProviderError> {
        if candidate.identify() == PYTHON_IDENTIFIER {
            return Ok(Vec::new());
        }
        self.check_cancelled()?;
        let dep_key = candidate.dep_key();
        if let Some(cached) = self.dependency_cache.borrow().get(&dep_key) {
            return cached
                .clone()
                .map_err(ProviderError::DependenciesUnavailable);
        }
        let result = self.block_on(self.repository.get_dependencies(candidate));
        let metadata = match result {
            Ok(metadata) => metadata,
            Err(err) => {
                let err = fatal(err);
                if let ProviderError::DependenciesUnavailable(reason) = &err {
                    tracing::error!("invalid metadata in {candidate}: {reason}");
                    self.dependency_cache
                        .borrow_mut()
                        .insert(dep_key, Err(reason.clone()));
                }
                return Err(err);
            }
        };

        let env_python = &self.repository.env_spec().requires_python;
        let candidate_python = &candidate.req.core().requires_python;
        let mut valid_deps: Vec<Requirement> = Vec::new();
        for mut dep in metadata.dependencies {
            // dependencies that can never run on any admitted interpreter
            // are dropped before they cause needless build attempts
            let combined = &(&(&dep.core().requires_python & &metadata.requires_python)
                & candidate_python)
                & env_python;
            if combined.is_impossible() {
                continue;
            }
            let narrowed = &dep.core().requires_python & candidate_python;
            dep.core_mut().requires_python = narrowed;
            valid_deps.push(dep);
        }

        self.fetched_dependencies
            .borrow_mut()
            .insert(dep_key.clone(), valid_deps.clone());
        self.resolved_metadata.borrow_mut().insert(
            dep_key.clone(),
            ResolvedMetadata {
                requires_python: if metadata.requires_python.is_allow_all() {
                    candidate.requires_python.clone()
                } else {
                    metadata.requires_python.to_string()
                },
                summary: metadata.summary.clone(),
            },
        );

        // a candidate that narrows the interpreter range contributes a
        // synthetic python requirement, unless it is overridden
        let new_requires_python = candidate_python & env_python;
        let identifier = candidate.identify();
        if !(self.overrides.contains_key(&identifier)
            || new_requires_python.is_impossible()
            || metadata.requires_python.is_superset(&new_requires_python))
        {
            valid_deps.push(python_requirement(metadata.requires_python.clone()));
        }

        self.dependency_cache
            .borrow_mut()
            .insert(dep_key, Ok(valid_deps.clone()));
        Ok(valid_deps)
    }
}

/// The shared satisfaction check of the provider family.
fn satisfied_by(
    requirement: &Requirement,
    candidate: &Candidate,
    allow_prereleases: Option<bool>,
    this_key: Option<&ProjectKey>,
    overrides: &HashSet<String>,
) -> bool {
    if is_python_requirement(requirement) {
        return is_python_satisfied_by(requirement, candidate);
    }
    if overrides.contains(&candidate.identify()) {
        return true;
    }
    if !requirement.is_named() {
        if candidate.req.is_named() {
            return false;
        }
        match (requirement, &candidate.req) {
            (Requirement::Vcs(req), Requirement::Vcs(can)) => {
                return req.vcs == can.vcs && req.repo == can.repo;
            }
            _ => {
                let left = requirement
                    .full_url()
                    .map(|u| crate::utils::expand_env_vars(&u));
                let right = candidate
                    .req
                    .full_url()
                    .map(|u| crate::utils::expand_env_vars(&u));
                return left.is_some() && left == right;
            }
        }
    }
    let Some(version) = &candidate.version else {
        // a URL candidate or the project itself always matches
        return true;
    };
    if candidate.key().as_ref() == this_key && this_key.is_some() {
        return true;
    }
    // once candidates are enumerated, only an explicit project-level opt-out
    // still rejects pre-releases
    let allow = !matches!(allow_prereleases, Some(false)) || !candidate.req.is_named();
    requirement
        .core()
        .specifier
        .contains(version, Some(allow))
}

/// A provider preferring the pins of an existing lock file.
pub struct ReusePinProvider {
    base: BaseProvider,
    preferred_pins: IndexMap<String, Candidate>,
    tracked_names: RefCell<HashSet<String>>,
}

impl ReusePinProvider {
    /// Wraps `base`, preferring `preferred_pins` except for the identifiers
    /// in `tracked_names` (the packages being deliberately updated).
    pub fn new(
        base: BaseProvider,
        preferred_pins: IndexMap<String, Candidate>,
        tracked_names: impl IntoIterator<Item = String>,
    ) -> Self {
        ReusePinProvider {
            base,
            preferred_pins,
            tracked_names: RefCell::new(tracked_names.into_iter().collect()),
        }
    }

    /// Access to the wrapped base provider.
    pub fn base(&self) -> &BaseProvider {
        &self.base
    }

    fn get_reuse_candidate(
        &self,
        identifier: &str,
        requirement: Option<&Requirement>,
    ) -> Option<Candidate> {
        let (bare_name, _) = strip_extras(identifier);
        if self.tracked_names.borrow().contains(bare_name) {
            return None;
        }
        let pin = self.preferred_pins.get(identifier)?;
        let mut pin = pin.clone();
        if let Some(requirement) = requirement {
            pin.req = requirement.clone();
        }
        pin.preferred = true;
        Some(pin)
    }
}

impl Provider for ReusePinProvider {
    fn get_preference(
        &self,
        identifier: &str,
        resolutions: &IndexMap<String, Candidate>,
        criteria: &Criteria,
        backtrack_causes: &[RequirementInformation],
    ) -> Preference {
        self.base
            .get_preference(identifier, resolutions, criteria, backtrack_causes)
    }

    fn find_matches(
        &self,
        identifier: &str,
        criteria: &Criteria,
        extra_requirements: &[Requirement],
        extra_incompatibilities: &[Candidate],
    ) -> Result<LazySequence<Candidate>, ProviderError> {
        let requirements = BaseProvider::requirements_for(criteria, identifier, extra_requirements);
        let requested = requirements
            .iter()
            .find(|req| req.is_named())
            .copied()
            .cloned();
        let mut front = Vec::new();
        if let Some(pin) = self.get_reuse_candidate(identifier, requested.as_ref()) {
            let mut incompat: Vec<Candidate> = criteria
                .get(identifier)
                .map(|criterion| criterion.incompatibilities.clone())
                .unwrap_or_default();
            incompat.extend(extra_incompatibilities.iter().cloned());
            let all_satisfied = requirements
                .iter()
                .all(|req| self.base.is_satisfied_by(req, &pin));
            if !incompat.contains(&pin) && all_satisfied {
                front.push(pin);
            }
        }
        let rest = self.base.find_matches(
            identifier,
            criteria,
            extra_requirements,
            extra_incompatibilities,
        )?;
        if front.is_empty() {
            return Ok(rest);
        }
        let front_clone = front.clone();
        Ok(LazySequence::new(
            front.into_iter().chain(
                rest.iter_owned()
                    .filter(move |candidate| !front_clone.contains(candidate)),
            ),
        ))
    }

    fn is_satisfied_by(&self, requirement: &Requirement, candidate: &Candidate) -> bool {
        self.base.is_satisfied_by(requirement, candidate)
    }

    fn get_dependencies(&self, candidate: &Candidate) -> Result<Vec<Requirement>, ProviderError> {
        self.base.get_dependencies(candidate)
    }
}

/// The eager upgrade strategy: updating a package also updates its whole
/// dependency subtree.
pub struct EagerUpdateProvider {
    inner: ReusePinProvider,
}

impl EagerUpdateProvider {
    /// Wraps a reuse provider.
    pub fn new(inner: ReusePinProvider) -> Self {
        EagerUpdateProvider { inner }
    }

    fn is_tracked(&self, identifier: &str) -> bool {
        let (bare, _) = strip_extras(identifier);
        self.inner.tracked_names.borrow().contains(bare)
            || self.inner.tracked_names.borrow().contains(identifier)
    }
}

impl Provider for EagerUpdateProvider {
    fn get_preference(
        &self,
        identifier: &str,
        resolutions: &IndexMap<String, Candidate>,
        criteria: &Criteria,
        backtrack_causes: &[RequirementInformation],
    ) -> Preference {
        // tracked packages resolve earlier so their pins are freed first
        let mut preference =
            self.inner
                .get_preference(identifier, resolutions, criteria, backtrack_causes);
        preference
            .0
            .insert(1, PreferenceElem::Bool(!self.is_tracked(identifier)));
        preference
    }

    fn find_matches(
        &self,
        identifier: &str,
        criteria: &Criteria,
        extra_requirements: &[Requirement],
        extra_incompatibilities: &[Candidate],
    ) -> Result<LazySequence<Candidate>, ProviderError> {
        if self.is_tracked(identifier) {
            // no pin reuse for packages being updated
            return self.inner.base.find_matches(
                identifier,
                criteria,
                extra_requirements,
                extra_incompatibilities,
            );
        }
        self.inner
            .find_matches(identifier, criteria, extra_requirements, extra_incompatibilities)
    }

    fn is_satisfied_by(&self, requirement: &Requirement, candidate: &Candidate) -> bool {
        self.inner.is_satisfied_by(requirement, candidate)
    }

    fn get_dependencies(&self, candidate: &Candidate) -> Result<Vec<Requirement>, ProviderError> {
        let dependencies = self.inner.get_dependencies(candidate)?;
        if self.is_tracked(&candidate.identify()) {
            let mut tracked = self.inner.tracked_names.borrow_mut();
            for dependency in &dependencies {
                if let Some(key) = dependency.key() {
                    tracked.insert(key.to_string());
                }
            }
        }
        Ok(dependencies)
    }
}

/// The reuse-installed strategy: versions present in the target
/// environment's working set are offered first.
pub struct ReuseInstalledProvider {
    inner: ReusePinProvider,
    installed: HashMap<String, (PackageName, Version)>,
}

impl ReuseInstalledProvider {
    /// Wraps a reuse provider with the installed working set, keyed by
    /// normalized name.
    pub fn new(
        inner: ReusePinProvider,
        installed: HashMap<String, (PackageName, Version)>,
    ) -> Self {
        ReuseInstalledProvider { inner, installed }
    }

    fn installed_candidate(
        &self,
        identifier: &str,
        criteria: &Criteria,
        extra_requirements: &[Requirement],
    ) -> Option<Candidate> {
        let (bare, _) = strip_extras(identifier);
        let (name, version) = self.installed.get(bare)?;
        let requirements =
            BaseProvider::requirements_for(criteria, identifier, extra_requirements);
        let requirement = requirements.iter().find(|r| r.is_named())?;
        Some(Candidate::pinned(
            (*requirement).clone(),
            name.clone(),
            Some(version.clone()),
        ))
    }
}

impl Provider for ReuseInstalledProvider {
    fn get_preference(
        &self,
        identifier: &str,
        resolutions: &IndexMap<String, Candidate>,
        criteria: &Criteria,
        backtrack_causes: &[RequirementInformation],
    ) -> Preference {
        self.inner
            .get_preference(identifier, resolutions, criteria, backtrack_causes)
    }

    fn find_matches(
        &self,
        identifier: &str,
        criteria: &Criteria,
        extra_requirements: &[Requirement],
        extra_incompatibilities: &[Candidate],
    ) -> Result<LazySequence<Candidate>, ProviderError> {
        if let Some(candidate) =
            self.installed_candidate(identifier, criteria, extra_requirements)
        {
            if !extra_incompatibilities.contains(&candidate) {
                let rest = self.inner.find_matches(
                    identifier,
                    criteria,
                    extra_requirements,
                    extra_incompatibilities,
                )?;
                let front = vec![candidate];
                let front_clone = front.clone();
                return Ok(LazySequence::new(front.into_iter().chain(
                    rest.iter_owned()
                        .filter(move |c| !front_clone.contains(c)),
                )));
            }
        }
        self.inner
            .find_matches(identifier, criteria, extra_requirements, extra_incompatibilities)
    }

    fn is_satisfied_by(&self, requirement: &Requirement, candidate: &Candidate) -> bool {
        self.inner.is_satisfied_by(requirement, candidate)
    }

    fn get_dependencies(&self, candidate: &Candidate) -> Result<Vec<Requirement>, ProviderError> {
        self.inner.get_dependencies(candidate)
    }
}

/// The four concrete strategies behind one dispatching type, so the
/// resolver can both drive the protocol and reach the base bookkeeping.
pub enum StrategyProvider {
    /// No reuse preference.
    All(BaseProvider),
    /// Prefer existing lock pins.
    Reuse(ReusePinProvider),
    /// Prefer pins, but update tracked subtrees eagerly.
    Eager(EagerUpdateProvider),
    /// Prefer installed versions, then pins.
    ReuseInstalled(ReuseInstalledProvider),
}

impl StrategyProvider {
    /// The wrapped base provider with its bookkeeping maps.
    pub fn base(&self) -> &BaseProvider {
        match self {
            StrategyProvider::All(base) => base,
            StrategyProvider::Reuse(reuse) => &reuse.base,
            StrategyProvider::Eager(eager) => &eager.inner.base,
            StrategyProvider::ReuseInstalled(installed) => &installed.inner.base,
        }
    }

    fn as_provider(&self) -> &dyn Provider {
        match self {
            StrategyProvider::All(p) => p,
            StrategyProvider::Reuse(p) => p,
            StrategyProvider::Eager(p) => p,
            StrategyProvider::ReuseInstalled(p) => p,
        }
    }
}

impl Provider for StrategyProvider {
    fn get_preference(
        &self,
        identifier: &str,
        resolutions: &IndexMap<String, Candidate>,
        criteria: &Criteria,
        backtrack_causes: &[RequirementInformation],
    ) -> Preference {
        self.as_provider()
            .get_preference(identifier, resolutions, criteria, backtrack_causes)
    }

    fn find_matches(
        &self,
        identifier: &str,
        criteria: &Criteria,
        extra_requirements: &[Requirement],
        extra_incompatibilities: &[Candidate],
    ) -> Result<LazySequence<Candidate>, ProviderError> {
        self.as_provider().find_matches(
            identifier,
            criteria,
            extra_requirements,
            extra_incompatibilities,
        )
    }

    fn is_satisfied_by(&self, requirement: &Requirement, candidate: &Candidate) -> bool {
        self.as_provider().is_satisfied_by(requirement, candidate)
    }

    fn get_dependencies(&self, candidate: &Candidate) -> Result<Vec<Requirement>, ProviderError> {
        self.as_provider().get_dependencies(candidate)
    }
}
