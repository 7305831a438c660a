//! An in-memory repository for tests and examples: a hand-populated
//! universe of releases with literal names, versions and dependency lines.

use super::{
    filter_applicable_candidates, sort_candidates, CandidateMetadata, Repository,
    RepositoryError, TracingReporter,
};
use crate::types::{
    filter_requirements_with_extras, Candidate, EnvSpec, FileHash, PackageName, Requirement,
    Version,
};
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Default)]
struct MockRelease {
    requires_python: String,
    dependencies: Vec<String>,
}

/// A repository whose whole universe is declared up front. Filtering,
/// ordering and the pre-release fallback behave exactly like the index
/// repository, so resolver behavior can be exercised without any network.
pub struct MockRepository {
    env_spec: EnvSpec,
    releases: RwLock<IndexMap<(String, String), MockRelease>>,
    has_warnings: AtomicBool,
}

impl MockRepository {
    /// An empty universe targeting `env_spec`.
    pub fn new(env_spec: EnvSpec) -> Self {
        MockRepository {
            env_spec,
            releases: RwLock::new(IndexMap::new()),
            has_warnings: AtomicBool::new(false),
        }
    }

    /// Declares a release with no interpreter constraint.
    pub fn add_candidate(&self, name: &str, version: &str) {
        self.add_candidate_with_python(name, version, "");
    }

    /// Declares a release constrained to the given interpreter range.
    pub fn add_candidate_with_python(&self, name: &str, version: &str, requires_python: &str) {
        let key = (
            crate::types::normalize_name(name),
            version.to_string(),
        );
        self.releases.write().entry(key).or_default().requires_python =
            requires_python.to_string();
    }

    /// Declares the dependency lines of a release. Lines may carry
    /// `extra == '...'` markers to populate optional dependencies.
    pub fn add_dependencies(&self, name: &str, version: &str, dependencies: &[&str]) {
        let key = (
            crate::types::normalize_name(name),
            version.to_string(),
        );
        self.releases
            .write()
            .entry(key)
            .or_default()
            .dependencies
            .extend(dependencies.iter().map(|s| s.to_string()));
    }
}

#[async_trait]
impl Repository for MockRepository {
    fn env_spec(&self) -> &EnvSpec {
        &self.env_spec
    }

    async fn find_candidates(
        &self,
        requirement: &Requirement,
        allow_prereleases: Option<bool>,
        ignore_requires_python: bool,
        minimal_version: bool,
    ) -> Result<Vec<Candidate>, RepositoryError> {
        let Some(key) = requirement.key() else {
            return Err(RepositoryError::CandidateNotFound(requirement.to_string()));
        };
        let releases = self.releases.read();
        let mut candidates: Vec<Candidate> = releases
            .iter()
            .filter(|entry| entry.0 .0 == key.as_str())
            .filter_map(|entry| {
                let version: Version = entry.0 .1.parse().ok()?;
                let name: PackageName = key.as_str().parse().ok()?;
                let mut candidate =
                    Candidate::pinned(requirement.clone(), name, Some(version));
                candidate.requires_python = entry.1.requires_python.clone();
                candidate.summary = format!("{} is a mock package", key);
                Some(candidate)
            })
            .collect();
        if candidates.is_empty() {
            return Err(RepositoryError::CandidateNotFound(key.to_string()));
        }
        sort_candidates(&mut candidates, &self.env_spec, false, minimal_version);

        let mut has_warnings = self.has_warnings.load(Ordering::Relaxed);
        let applicable = filter_applicable_candidates(
            &candidates,
            requirement,
            allow_prereleases,
            ignore_requires_python,
            &self.env_spec,
            &|_| false,
            &TracingReporter,
            &mut has_warnings,
        );
        self.has_warnings.store(has_warnings, Ordering::Relaxed);
        Ok(applicable)
    }

    async fn get_dependencies(
        &self,
        candidate: &Candidate,
    ) -> Result<CandidateMetadata, RepositoryError> {
        let key = (
            candidate.identify().split('[').next().unwrap_or_default().to_string(),
            candidate
                .version
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_default(),
        );
        let release = self
            .releases
            .read()
            .get(&key)
            .cloned()
            .ok_or_else(|| RepositoryError::CandidateNotFound(candidate.to_string()))?;
        let (mut dependencies, missing) = filter_requirements_with_extras(
            &release.dependencies,
            &candidate.req.core().extras,
        )?;
        if !missing.is_empty() {
            self.has_warnings.store(true, Ordering::Relaxed);
        }
        if !candidate.req.core().extras.is_empty() {
            let mut bare = candidate.req.as_pinned_version(candidate.version.as_ref());
            bare.core_mut().extras.clear();
            bare.set_marker(None);
            dependencies.insert(0, bare);
        }
        Ok(CandidateMetadata {
            dependencies,
            requires_python: release.requires_python.parse().unwrap_or_default(),
            summary: format!("{} is a mock package", key.0),
        })
    }

    async fn get_hashes(&self, candidate: &Candidate) -> Result<Vec<FileHash>, RepositoryError> {
        // deterministic fake hashes keep lock round-trips honest
        let Some(version) = &candidate.version else {
            return Ok(Vec::new());
        };
        let identifier = candidate.identify();
        let digest = rattler_digest::compute_bytes_digest::<rattler_digest::Sha256>(
            format!("{identifier}-{version}").as_bytes(),
        );
        Ok(vec![FileHash {
            file: Some(format!("{identifier}-{version}.tar.gz")),
            url: None,
            hash: format!("sha256:{digest:x}"),
        }])
    }

    fn has_warnings(&self) -> bool {
        self.has_warnings.load(Ordering::Relaxed)
    }
}
