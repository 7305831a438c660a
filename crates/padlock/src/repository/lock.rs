use super::{CandidateMetadata, Repository, RepositoryError};
use crate::project::{ProjectContext, DEFAULT_GROUP};
use crate::types::{
    Candidate, EnvSpec, FileHash, Marker, PySpecSet, Requirement,
};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::sync::Arc;

/// One pinned package read from a lock file.
#[derive(Debug, Clone)]
pub struct PackageEntry {
    /// The pinned candidate, its requirement reconstructed from the entry.
    pub candidate: Candidate,
    /// Dependency lines, verbatim from the lock.
    pub dependencies: Vec<String>,
    /// The entry's requires-python constraint.
    pub requires_python: String,
    /// The recorded summary.
    pub summary: String,
    /// The groups this entry belongs to (under `inherit_metadata`).
    pub groups: Vec<String>,
    /// The inherited environment marker, if any.
    pub marker: Option<Marker>,
    /// The lock targets the entry applies to; empty means all.
    pub targets: Vec<PySpecSet>,
}

/// The key a locked entry is identified by: the requirement identity, the
/// version (for named entries), the expanded URL (for direct references),
/// and the editable flag.
pub type CandidateKey = (String, Option<String>, Option<String>, bool);

/// Identifies a candidate the way locked entries are keyed.
pub fn identify_candidate(candidate: &Candidate) -> CandidateKey {
    let url = candidate
        .req
        .full_url()
        .map(|url| crate::utils::expand_env_vars(&url));
    (
        candidate.identify(),
        if url.is_none() {
            candidate.version.as_ref().map(|v| v.to_string())
        } else {
            None
        },
        url,
        candidate.req.core().editable,
    )
}

/// A read-only repository over an existing lock file: every pinned entry is
/// the sole candidate for its identifier and dependencies come verbatim from
/// the lock. Entries whose requires-python cannot host the target are
/// filtered out.
pub struct LockedRepository {
    context: Arc<ProjectContext>,
    env_spec: EnvSpec,
    packages: IndexMap<CandidateKey, PackageEntry>,
}

impl LockedRepository {
    /// Builds the repository from parsed lock entries.
    pub fn new(
        context: Arc<ProjectContext>,
        env_spec: EnvSpec,
        entries: Vec<PackageEntry>,
    ) -> Self {
        let mut packages = IndexMap::new();
        for entry in entries {
            packages.insert(identify_candidate(&entry.candidate), entry);
        }
        LockedRepository {
            context,
            env_spec,
            packages,
        }
    }

    /// All entries, keyed by candidate key.
    pub fn packages(&self) -> &IndexMap<CandidateKey, PackageEntry> {
        &self.packages
    }

    /// The pinned candidates applicable to the target environment, one per
    /// identifier.
    pub fn all_candidates(&self) -> IndexMap<String, Candidate> {
        let mut result = IndexMap::new();
        for entry in self.packages.values() {
            if !entry.targets.is_empty()
                && !entry
                    .targets
                    .iter()
                    .any(|t| !(t & &self.env_spec.requires_python).is_impossible())
            {
                continue;
            }
            if let Some(marker) = &entry.marker {
                if !self.env_spec.allows_marker(marker) {
                    continue;
                }
            }
            result.insert(entry.candidate.identify(), entry.candidate.clone());
        }
        result
    }

    /// The candidates belonging to any of `groups`, for installation flows.
    pub fn evaluate_candidates<'a>(
        &'a self,
        groups: &'a [String],
    ) -> impl Iterator<Item = &'a Candidate> {
        self.packages.values().filter_map(move |entry| {
            entry
                .groups
                .iter()
                .any(|g| groups.contains(g))
                .then_some(&entry.candidate)
        })
    }

    fn entry_for(&self, candidate: &Candidate) -> Option<&PackageEntry> {
        self.packages.get(&identify_candidate(candidate))
    }

    fn matching_entries<'a>(
        &'a self,
        requirement: &'a Requirement,
    ) -> impl Iterator<Item = &'a PackageEntry> {
        let identifier = requirement.name().map(|_| requirement.identify());
        let req_url = requirement
            .full_url()
            .map(|url| crate::utils::expand_env_vars(&url));
        self.packages.iter().filter_map(move |(key, entry)| {
            match &identifier {
                Some(identifier) => (key.0 == *identifier).then_some(entry),
                None => {
                    // an unnamed requirement can only match a direct
                    // reference with the same URL
                    let entry_url = key.2.as_deref();
                    (entry_url.is_some() && entry_url == req_url.as_deref()).then_some(entry)
                }
            }
        })
    }

    fn python_admits(&self, entry: &PackageEntry) -> bool {
        let entry_python: PySpecSet = entry.requires_python.parse().unwrap_or_default();
        if let Some(interpreter) = &self.context.interpreter {
            return entry_python.contains(&interpreter.version, true);
        }
        !(&entry_python & &self.env_spec.requires_python).is_impossible()
    }
}

#[async_trait]
impl Repository for LockedRepository {
    fn env_spec(&self) -> &EnvSpec {
        &self.env_spec
    }

    fn is_locked(&self) -> bool {
        true
    }

    async fn find_candidates(
        &self,
        requirement: &Requirement,
        _allow_prereleases: Option<bool>,
        _ignore_requires_python: bool,
        _minimal_version: bool,
    ) -> Result<Vec<Candidate>, RepositoryError> {
        let mut result = Vec::new();
        for entry in self.matching_entries(requirement) {
            if !self.python_admits(entry) {
                continue;
            }
            let mut candidate = entry.candidate.copy_with(requirement.clone());
            candidate.requires_python = entry.requires_python.clone();
            if requirement.name().is_none() {
                if let Some(name) = &entry.candidate.name {
                    candidate.fill_name(name.clone());
                }
            }
            result.push(candidate);
        }
        if result.is_empty() {
            return Err(RepositoryError::CandidateNotFound(format!(
                "missing package {} from the lockfile; the lockfile may be out of date",
                requirement.identify()
            )));
        }
        Ok(result)
    }

    async fn get_dependencies(
        &self,
        candidate: &Candidate,
    ) -> Result<CandidateMetadata, RepositoryError> {
        let Some(entry) = self.entry_for(candidate) else {
            return Err(RepositoryError::Lockfile(format!(
                "missing package {} from the lockfile, the lockfile may be broken",
                candidate.identify()
            )));
        };
        let mut dependencies = Vec::new();
        for line in &entry.dependencies {
            let req = if let Some(stripped) = line.strip_prefix("-e ") {
                crate::types::parse_requirement(stripped.trim(), true)?
            } else {
                crate::types::parse_line(line)?
            };
            dependencies.push(req);
        }
        // the project's own entry contributes the manifest's default group
        if self.context.manifest.is_distribution
            && candidate.key() == self.context.project_key()
            && entry.dependencies.is_empty()
            && candidate.req.core().extras.is_empty()
        {
            dependencies.extend(
                self.context
                    .manifest
                    .group_dependencies(DEFAULT_GROUP)
                    .map_err(|e| RepositoryError::Lockfile(e.to_string()))?,
            );
        }
        Ok(CandidateMetadata {
            dependencies,
            requires_python: entry.requires_python.parse().unwrap_or_default(),
            summary: entry.summary.clone(),
        })
    }

    async fn get_hashes(&self, candidate: &Candidate) -> Result<Vec<FileHash>, RepositoryError> {
        Ok(self
            .entry_for(candidate)
            .map(|entry| entry.candidate.hashes.clone())
            .unwrap_or_else(|| candidate.hashes.clone()))
    }
}
