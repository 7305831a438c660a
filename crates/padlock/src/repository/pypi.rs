use super::{
    filter_applicable_candidates, filtered_sources, sort_candidates, CandidateMetadata,
    Repository, RepositoryError, SourceType, TracingReporter, WarningReporter,
};
use crate::caches::CandidateInfo;
use crate::index::{CacheMode, CacheStatus};
use crate::preparer;
use crate::project::{ProjectContext, DEFAULT_GROUP};
use crate::types::{
    filter_requirements_with_extras, ArtifactName, Candidate, EnvSpec, FileHash, Link, PackageName,
    ProjectKey, PySpecSet, Requirement, Version,
};
use crate::wheel_builder::{is_cacheable, WheelBuilder};
use async_trait::async_trait;
use elsa::sync::FrozenMap;
use indexmap::IndexSet;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use url::Url;

/// The Accept header negotiating the PEP 691 JSON form with an HTML
/// fallback.
const SIMPLE_ACCEPT: &str =
    "application/vnd.pypi.simple.v1+json, text/html;q=0.2, */*;q=0.1";

/// The repository backed by one or more PEP 503 simple indexes, with an
/// optional fast path through the legacy per-release JSON endpoint.
pub struct PyPiRepository {
    context: Arc<ProjectContext>,
    env_spec: EnvSpec,
    /// Whether `get_dependencies` may consult `/pypi/<name>/<version>/json`.
    json_api_enabled: bool,
    builder: Option<Arc<WheelBuilder>>,
    reporter: Arc<dyn WarningReporter>,
    /// Memoized page results per project key.
    pages: FrozenMap<String, Box<Vec<(PackageName, Version, Link)>>>,
    collected_groups: Mutex<IndexSet<String>>,
    has_warnings: AtomicBool,
}

impl PyPiRepository {
    /// A repository reading from the context's configured sources.
    pub fn new(context: Arc<ProjectContext>, env_spec: EnvSpec) -> Self {
        PyPiRepository {
            context,
            env_spec,
            json_api_enabled: false,
            builder: None,
            reporter: Arc::new(TracingReporter),
            pages: FrozenMap::new(),
            collected_groups: Mutex::new(IndexSet::new()),
            has_warnings: AtomicBool::new(false),
        }
    }

    /// Enables the `/pypi/<name>/<version>/json` dependency fast path.
    pub fn with_json_api(mut self, enabled: bool) -> Self {
        self.json_api_enabled = enabled;
        self
    }

    /// Attaches the build driver used when metadata must come from a build.
    pub fn with_builder(mut self, builder: Arc<WheelBuilder>) -> Self {
        self.builder = Some(builder);
        self
    }

    /// Replaces the warning sink.
    pub fn with_reporter(mut self, reporter: Arc<dyn WarningReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    fn is_this_package(&self, requirement: &Requirement) -> bool {
        self.context.manifest.is_distribution
            && requirement.is_named()
            && requirement.key() == self.context.project_key()
    }

    fn make_this_candidate(&self, requirement: &Requirement) -> Option<Candidate> {
        let name = self.context.manifest.name.clone()?;
        let version = self
            .context
            .manifest
            .version
            .as_deref()
            .and_then(|v| v.parse().ok());
        let mut candidate = Candidate::pinned(requirement.clone(), name, version);
        candidate.requires_python = self.context.python_requires().to_string();
        candidate.summary = "the project itself".to_string();
        Some(candidate)
    }

    /// Fetches (or reuses) the artifact list of one project across all
    /// applicable sources.
    async fn available_links(
        &self,
        key: &ProjectKey,
    ) -> Result<&[(PackageName, Version, Link)], RepositoryError> {
        if let Some(cached) = self.pages.get(key.as_str()) {
            return Ok(cached.as_slice());
        }
        let sources = filtered_sources(&self.context.manifest.sources, Some(key.as_str()));
        let mut links: Vec<Link> = Vec::new();
        for source in sources {
            match source.source_type {
                SourceType::Index => {
                    let base = source.expanded_url();
                    let url = format!("{}/{}/", base.trim_end_matches('/'), key.as_str());
                    let Ok(url) = Url::parse(&url) else {
                        tracing::warn!("skipping source with invalid url: {url}");
                        continue;
                    };
                    match self.fetch_page(url).await {
                        Ok(mut page_links) => links.append(&mut page_links),
                        Err(err) => {
                            tracing::warn!("failed to fetch index page from {}: {err}", source.name)
                        }
                    }
                }
                SourceType::FindLinks => {
                    let Ok(url) = Url::parse(&source.expanded_url()) else {
                        continue;
                    };
                    match self.fetch_page(url).await {
                        Ok(mut page_links) => links.append(&mut page_links),
                        Err(err) => {
                            tracing::warn!("failed to fetch find-links page {}: {err}", source.name)
                        }
                    }
                }
            }
        }

        // classify filenames, dropping anything that does not belong to the
        // requested project
        let mut entries: Vec<(PackageName, Version, Link)> = Vec::new();
        for link in links {
            let Some(filename) = link.filename() else {
                continue;
            };
            let Ok(name) = ArtifactName::from_filename(&filename, key) else {
                continue;
            };
            let (distribution, version) = match &name {
                ArtifactName::Wheel(wheel) => (wheel.distribution.clone(), wheel.version.clone()),
                ArtifactName::SDist(sdist) => (sdist.distribution.clone(), sdist.version.clone()),
            };
            entries.push((distribution, version, link));
        }
        // deterministic ordering before preference sorting kicks in
        entries.sort_by(|a, b| (&a.1, a.2.url.as_str()).cmp(&(&b.1, b.2.url.as_str())));
        Ok(self
            .pages
            .insert(key.as_str().to_string(), Box::new(entries))
            .as_slice())
    }

    async fn fetch_page(&self, url: Url) -> Result<Vec<Link>, RepositoryError> {
        let response = self
            .context
            .http
            .get(url.clone(), Some(SIMPLE_ACCEPT), CacheMode::Default)
            .await?;
        if response.status == http::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if response.cache_status == CacheStatus::Miss {
            tracing::debug!(url = %url, "fetched fresh index page");
        }
        let content_type: mime::Mime = response
            .content_type
            .as_deref()
            .unwrap_or("text/html")
            .parse()
            .unwrap_or(mime::TEXT_HTML);
        if content_type.type_() == mime::APPLICATION && content_type.suffix() == Some(mime::JSON) {
            parse_json_page(&response.final_url, &response.body)
        } else {
            let body = String::from_utf8_lossy(&response.body);
            let page = crate::index::parse_project_page(&response.final_url, &body)
                .map_err(|e| RepositoryError::Lockfile(e.to_string()))?;
            Ok(page.links)
        }
    }

    fn metadata_from_cache(&self, candidate: &Candidate) -> Result<CandidateMetadata, RepositoryError> {
        let info = self
            .context
            .candidate_info_cache
            .get(candidate)
            .ok_or(RepositoryError::CandidateInfoNotFound)?;
        tracing::debug!("using cached metadata for {candidate}");
        metadata_from_info(info)
    }

    /// Serves the project's own dependencies when the candidate is the
    /// project itself, collecting the groups the requested extras name.
    fn metadata_from_local_project(
        &self,
        candidate: &Candidate,
    ) -> Result<CandidateMetadata, RepositoryError> {
        if !self.context.manifest.is_distribution
            || candidate.key() != self.context.project_key()
        {
            return Err(RepositoryError::CandidateInfoNotFound);
        }
        let manifest = &self.context.manifest;
        let mut dependencies = Vec::new();
        let all_groups = manifest.iter_groups();
        for extra in &candidate.req.core().extras {
            let group = extra.as_str();
            if all_groups.iter().any(|g| g == group) {
                dependencies.extend(
                    manifest
                        .group_dependencies(group)
                        .map_err(|e| RepositoryError::Lockfile(e.to_string()))?,
                );
                self.collected_groups.lock().insert(group.to_string());
            }
        }
        if candidate.req.core().extras.is_empty() {
            dependencies.extend(
                manifest
                    .group_dependencies(DEFAULT_GROUP)
                    .map_err(|e| RepositoryError::Lockfile(e.to_string()))?,
            );
        }
        Ok(CandidateMetadata {
            dependencies,
            requires_python: self.context.python_requires().clone(),
            summary: "the project itself".to_string(),
        })
    }

    async fn metadata_from_json_api(
        &self,
        candidate: &Candidate,
    ) -> Result<CandidateMetadata, RepositoryError> {
        if !self.json_api_enabled {
            return Err(RepositoryError::CandidateInfoNotFound);
        }
        let (Some(name), Some(version)) = (&candidate.name, &candidate.version) else {
            return Err(RepositoryError::CandidateInfoNotFound);
        };
        let sources = filtered_sources(
            &self.context.manifest.sources,
            candidate.key().as_ref().map(|k| k.as_str()),
        );
        for source in sources {
            let base = source.expanded_url();
            let Some(prefix) = base.trim_end_matches('/').strip_suffix("/simple") else {
                continue;
            };
            let url = format!("{prefix}/pypi/{}/{}/json", name.as_str(), version);
            let Ok(url) = Url::parse(&url) else { continue };
            let Ok(response) = self
                .context
                .http
                .get(url, Some("application/json"), CacheMode::Default)
                .await
            else {
                continue;
            };
            if response.status != http::StatusCode::OK {
                continue;
            }
            let Ok(payload) = serde_json::from_slice::<JsonReleaseInfo>(&response.body) else {
                continue;
            };
            let info = payload.info;
            let lines = info.requires_dist.unwrap_or_default();
            let (dependencies, missing) =
                filter_requirements_with_extras(&lines, &candidate.req.core().extras)?;
            self.warn_missing_extras(candidate, &missing);
            return Ok(CandidateMetadata {
                dependencies,
                requires_python: info
                    .requires_python
                    .as_deref()
                    .unwrap_or("")
                    .parse()
                    .unwrap_or_default(),
                summary: info.summary.unwrap_or_default(),
            });
        }
        Err(RepositoryError::CandidateInfoNotFound)
    }

    async fn metadata_from_prepared(
        &self,
        candidate: &Candidate,
    ) -> Result<CandidateMetadata, RepositoryError> {
        let prepared = preparer::prepare(
            &self.context,
            candidate,
            &self.env_spec,
            self.builder.as_deref(),
        )
        .await
        .map_err(|e| RepositoryError::Prepare {
            candidate: candidate.to_string(),
            reason: e.to_string(),
        })?;
        let metadata = prepared.metadata;
        let lines: Vec<String> = metadata
            .requires_dist
            .iter()
            .map(|r| r.as_line())
            .collect();
        let (dependencies, missing) =
            filter_requirements_with_extras(&lines, &candidate.req.core().extras)?;
        self.warn_missing_extras(candidate, &missing);
        let result = CandidateMetadata {
            dependencies,
            requires_python: metadata
                .requires_python
                .as_ref()
                .map(PySpecSet::from_specifiers)
                .transpose()?
                .unwrap_or_default(),
            summary: metadata.summary.unwrap_or_default(),
        };
        // only immutable sources are worth remembering across runs
        let fallback_link =
            crate::types::link_from_requirement(&candidate.req, Some(&self.context.root));
        let cacheable = candidate
            .link
            .as_ref()
            .or(fallback_link.as_ref())
            .map_or(false, |link| is_cacheable(&candidate.req, link));
        if cacheable {
            self.context.candidate_info_cache.set(
                candidate,
                CandidateInfo {
                    dependencies: result.dependencies.iter().map(|r| r.as_line()).collect(),
                    requires_python: result.requires_python.to_string(),
                    summary: result.summary.clone(),
                },
            );
        }
        Ok(result)
    }

    fn warn_missing_extras(&self, candidate: &Candidate, missing: &[crate::types::Extra]) {
        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(|e| e.as_str()).collect();
            self.reporter.warn_package(&format!(
                "Extras {:?} requested for {candidate} are not declared by its metadata",
                names
            ));
            self.has_warnings.store(true, Ordering::Relaxed);
        }
    }
}

#[derive(Deserialize)]
struct JsonReleaseInfo {
    info: JsonReleaseInfoInner,
}

#[derive(Deserialize)]
struct JsonReleaseInfoInner {
    summary: Option<String>,
    requires_python: Option<String>,
    requires_dist: Option<Vec<String>>,
}

/// Parses a PEP 691 JSON project page into links.
fn parse_json_page(base: &Url, body: &[u8]) -> Result<Vec<Link>, RepositoryError> {
    #[derive(Deserialize)]
    struct JsonPage {
        files: Vec<JsonFile>,
    }

    #[derive(Deserialize)]
    struct JsonFile {
        url: String,
        #[serde(default)]
        hashes: indexmap::IndexMap<String, String>,
        #[serde(default, rename = "requires-python")]
        requires_python: Option<String>,
        #[serde(default)]
        yanked: Option<serde_json::Value>,
        #[serde(default, rename = "core-metadata")]
        core_metadata: Option<serde_json::Value>,
    }

    let page: JsonPage = serde_json::from_slice(body)
        .map_err(|e| RepositoryError::Lockfile(format!("invalid JSON index page: {e}")))?;
    let mut links = Vec::new();
    for file in page.files {
        let Ok(url) = base.join(&file.url) else {
            continue;
        };
        let mut link = Link::new(url);
        link.comes_from = Some(base.to_string());
        link.requires_python = file.requires_python;
        for (algo, hex) in file.hashes {
            link.hashes.insert(algo, hex);
        }
        link.yank_reason = match file.yanked {
            Some(serde_json::Value::Bool(true)) => Some(String::new()),
            Some(serde_json::Value::String(reason)) => Some(reason),
            _ => None,
        };
        link.dist_info_metadata = matches!(
            file.core_metadata,
            Some(serde_json::Value::Bool(true)) | Some(serde_json::Value::Object(_))
        );
        links.push(link);
    }
    Ok(links)
}

fn metadata_from_info(info: CandidateInfo) -> Result<CandidateMetadata, RepositoryError> {
    let mut dependencies = Vec::new();
    for line in &info.dependencies {
        if let Some(stripped) = line.strip_prefix("-e ") {
            dependencies.push(crate::types::parse_requirement(stripped.trim(), true)?);
        } else {
            dependencies.push(crate::types::parse_line(line)?);
        }
    }
    Ok(CandidateMetadata {
        dependencies,
        requires_python: info.requires_python.parse().unwrap_or_default(),
        summary: info.summary,
    })
}

#[async_trait]
impl Repository for PyPiRepository {
    fn env_spec(&self) -> &EnvSpec {
        &self.env_spec
    }

    async fn resolve_unnamed(
        &self,
        mut candidate: Candidate,
    ) -> Result<Candidate, RepositoryError> {
        if candidate.name.is_some() && candidate.version.is_some() {
            return Ok(candidate);
        }
        let prepared = preparer::prepare(
            &self.context,
            &candidate,
            &self.env_spec,
            self.builder.as_deref(),
        )
        .await
        .map_err(|e| RepositoryError::Prepare {
            candidate: candidate.to_string(),
            reason: e.to_string(),
        })?;
        candidate.fill_name(prepared.metadata.name.clone());
        candidate.version = Some(prepared.metadata.version.clone());
        if let Some(specifiers) = &prepared.metadata.requires_python {
            candidate.requires_python = specifiers.to_string();
        }
        if let (Requirement::Vcs(vcs), Some(revision)) =
            (&mut candidate.req, prepared.revision.clone())
        {
            vcs.revision = Some(revision);
        }
        if candidate.link.is_none() {
            candidate.link =
                crate::types::link_from_requirement(&candidate.req, Some(&self.context.root));
        }
        Ok(candidate)
    }

    async fn find_candidates(
        &self,
        requirement: &Requirement,
        allow_prereleases: Option<bool>,
        ignore_requires_python: bool,
        minimal_version: bool,
    ) -> Result<Vec<Candidate>, RepositoryError> {
        if self.is_this_package(requirement) {
            return Ok(self.make_this_candidate(requirement).into_iter().collect());
        }
        let Some(key) = requirement.key() else {
            return Err(RepositoryError::CandidateNotFound(requirement.to_string()));
        };
        let entries = self.available_links(&key).await?;
        if entries.is_empty() {
            return Err(RepositoryError::CandidateNotFound(key.to_string()));
        }

        let binary_filter = &self.context.binary_filter;
        let mut candidates: Vec<Candidate> = entries
            .iter()
            .filter(|(_, _, link)| {
                if link.is_wheel() {
                    binary_filter.allows_wheel(key.as_str())
                } else {
                    binary_filter.allows_sdist(key.as_str())
                }
            })
            .map(|(name, version, link)| {
                Candidate::from_link(
                    requirement.clone(),
                    name.clone(),
                    version.clone(),
                    link.clone(),
                )
            })
            .collect();
        sort_candidates(
            &mut candidates,
            &self.env_spec,
            binary_filter.prefers_binary(key.as_str()),
            minimal_version,
        );

        let mut has_warnings = self.has_warnings.load(Ordering::Relaxed);
        let applicable = filter_applicable_candidates(
            &candidates,
            requirement,
            allow_prereleases,
            ignore_requires_python,
            &self.env_spec,
            &|key| self.context.ignores_package_warning(key),
            self.reporter.as_ref(),
            &mut has_warnings,
        );
        self.has_warnings.store(has_warnings, Ordering::Relaxed);
        Ok(applicable)
    }

    async fn get_dependencies(
        &self,
        candidate: &Candidate,
    ) -> Result<CandidateMetadata, RepositoryError> {
        let mut result: Option<CandidateMetadata> = None;
        let generators: [&str; 4] = ["cache", "local", "json", "prepared"];
        let mut last_error: Option<RepositoryError> = None;
        for generator in generators {
            let outcome = match generator {
                "cache" => self.metadata_from_cache(candidate),
                "local" => self.metadata_from_local_project(candidate),
                "json" => self.metadata_from_json_api(candidate).await,
                _ => self.metadata_from_prepared(candidate).await,
            };
            match outcome {
                Ok(metadata) => {
                    result = Some(metadata);
                    break;
                }
                Err(RepositoryError::CandidateInfoNotFound) => continue,
                Err(other) => {
                    last_error = Some(other);
                    break;
                }
            }
        }
        let mut metadata = match (result, last_error) {
            (Some(metadata), _) => metadata,
            (None, Some(error)) => return Err(error),
            (None, None) => return Err(RepositoryError::CandidateNotFound(candidate.to_string())),
        };

        // an extras-bearing candidate depends on its own bare form, pinned to
        // the same version, so both resolve to one release
        if !candidate.req.core().extras.is_empty() {
            let mut bare = candidate
                .req
                .as_pinned_version(candidate.version.as_ref());
            bare.core_mut().extras.clear();
            bare.set_marker(None);
            metadata.dependencies.insert(0, bare);
        }
        Ok(metadata)
    }

    async fn get_hashes(&self, candidate: &Candidate) -> Result<Vec<FileHash>, RepositoryError> {
        if candidate.req.is_vcs() || candidate.req.is_local_dir() {
            return Ok(Vec::new());
        }
        if !candidate.hashes.is_empty() {
            return Ok(candidate.hashes.clone());
        }

        let mut links: Vec<Link> = Vec::new();
        if let Some(link) = &candidate.link {
            if !candidate.req.is_named() {
                links.push(link.clone());
            }
        }
        if candidate.req.is_named() {
            if let (Some(key), Some(version)) = (candidate.key(), &candidate.version) {
                let respect_source_order = self.context.manifest.respect_source_order;
                let comes_from = candidate
                    .link
                    .as_ref()
                    .and_then(|l| l.comes_from.clone());
                for (_, link_version, link) in self.available_links(&key).await? {
                    if link_version != version {
                        continue;
                    }
                    if respect_source_order {
                        if let (Some(origin), Some(link_origin)) =
                            (comes_from.as_ref(), link.comes_from.as_ref())
                        {
                            if origin != link_origin {
                                continue;
                            }
                        }
                    }
                    links.push(link.clone());
                }
            }
        } else if links.is_empty() {
            if let Some(link) = crate::types::link_from_requirement(
                &candidate.req,
                Some(&self.context.root),
            ) {
                links.push(link);
            }
        }

        let mut result = Vec::new();
        let mut logged = false;
        for link in links {
            if link.vcs_kind().is_some() || link.is_local_dir() {
                continue;
            }
            if !logged {
                tracing::info!("fetching hashes for {candidate}");
                logged = true;
            }
            let hash = self
                .context
                .hash_cache
                .get_hash(&link, &self.context.http)
                .await?;
            result.push(FileHash {
                file: link.filename(),
                url: Some(link.url_without_fragment()),
                hash,
            });
        }
        result.sort_by_key(FileHash::sort_key);
        result.dedup_by_key(|h| h.sort_key());
        Ok(result)
    }

    fn collected_groups(&self) -> Vec<String> {
        self.collected_groups.lock().iter().cloned().collect()
    }

    fn has_warnings(&self) -> bool {
        self.has_warnings.load(Ordering::Relaxed)
    }
}
