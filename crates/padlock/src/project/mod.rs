//! The project context: the manifest, the on-disk caches, the HTTP session,
//! and the environment switches that parameterize a resolution. Nothing in
//! the crate reaches for process-global state; every entry point receives a
//! context explicitly.

mod manifest;

pub use manifest::{Manifest, ManifestError, DEFAULT_GROUP};

use crate::caches::{CandidateInfoCache, HashCache};
use crate::index::{FileStore, Http};
use crate::python_env::PythonInterpreter;
use crate::repository::KeyringProvider;
use crate::types::{normalize_name, ProjectKey, PySpecSet};
use crate::utils::clean_stale_files;
use miette::Diagnostic;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A set of package names an environment switch applies to: nothing, all of
/// them (`:all:`), or a comma-separated list.
#[derive(Debug, Clone, Default)]
pub enum NameFilter {
    /// Applies to no package.
    #[default]
    None,
    /// Applies to every package.
    All,
    /// Applies to the listed (normalized) names.
    Names(HashSet<String>),
}

impl NameFilter {
    fn from_env(var: &str) -> Self {
        match std::env::var(var) {
            Err(_) => NameFilter::None,
            Ok(value) if value.trim() == ":all:" => NameFilter::All,
            Ok(value) => NameFilter::Names(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(normalize_name)
                    .collect(),
            ),
        }
    }

    /// Whether the switch covers `key`.
    pub fn covers(&self, key: &str) -> bool {
        match self {
            NameFilter::None => false,
            NameFilter::All => true,
            NameFilter::Names(names) => names.contains(&normalize_name(key)),
        }
    }
}

/// The wheel/sdist admission switches, read from `PDM_NO_BINARY`,
/// `PDM_ONLY_BINARY` and `PDM_PREFER_BINARY`.
#[derive(Debug, Clone, Default)]
pub struct BinaryFilter {
    /// Packages whose wheels must not be used.
    pub no_binary: NameFilter,
    /// Packages that may only be installed from wheels.
    pub only_binary: NameFilter,
    /// Packages whose wheels outrank newer sdist-only versions.
    pub prefer_binary: NameFilter,
}

impl BinaryFilter {
    /// Reads the switches from the environment.
    pub fn from_env() -> Self {
        BinaryFilter {
            no_binary: NameFilter::from_env("PDM_NO_BINARY"),
            only_binary: NameFilter::from_env("PDM_ONLY_BINARY"),
            prefer_binary: NameFilter::from_env("PDM_PREFER_BINARY"),
        }
    }

    /// Whether wheels of `key` are admitted.
    pub fn allows_wheel(&self, key: &str) -> bool {
        !self.no_binary.covers(key)
    }

    /// Whether sdists of `key` are admitted.
    pub fn allows_sdist(&self, key: &str) -> bool {
        !self.only_binary.covers(key)
    }

    /// Whether wheels of `key` sort before higher sdist-only versions.
    pub fn prefers_binary(&self, key: &str) -> bool {
        self.prefer_binary.covers(key)
    }
}

/// Error raised while assembling a project context.
#[derive(Debug, Error, Diagnostic)]
pub enum ProjectError {
    /// A cache directory could not be created.
    #[error("failed to set up cache directories: {0}")]
    CacheSetup(#[from] std::io::Error),

    /// The HTTP client could not be constructed.
    #[error("failed to build the HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Everything a resolution run needs to know about the project it serves.
/// Owns the caches and the per-run scratch space; the scratch directory is
/// deleted when the context is dropped.
pub struct ProjectContext {
    /// The project root, anchoring relative paths and `${PROJECT_ROOT}`.
    pub root: PathBuf,
    /// The parsed manifest.
    pub manifest: Manifest,
    /// The persistent cache root.
    pub cache_dir: PathBuf,
    /// The caching HTTP session.
    pub http: Http,
    /// The candidate metadata cache.
    pub candidate_info_cache: CandidateInfoCache,
    /// The artifact hash cache.
    pub hash_cache: HashCache,
    /// Wheel/sdist admission switches.
    pub binary_filter: BinaryFilter,
    /// Whether interactive prompts are suppressed (`PDM_NON_INTERACTIVE`).
    pub non_interactive: bool,
    /// The external keyring hook, if the embedder provides one.
    pub keyring: Option<Arc<dyn KeyringProvider>>,
    /// The target interpreter, when one has been discovered.
    pub interpreter: Option<PythonInterpreter>,
    /// Per-run scratch space, deleted on drop.
    ephemeral: tempfile::TempDir,
}

impl std::fmt::Debug for ProjectContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectContext")
            .field("root", &self.root)
            .field("cache_dir", &self.cache_dir)
            .finish_non_exhaustive()
    }
}

/// The network timeout applied to every request, in seconds.
const DEFAULT_REQUEST_TIMEOUT: u64 = 15;

impl ProjectContext {
    /// Assembles a context for the project at `root`, with caches under
    /// `cache_dir`.
    pub fn new(root: PathBuf, cache_dir: PathBuf, manifest: Manifest) -> Result<Self, ProjectError> {
        Self::with_timeout(root, cache_dir, manifest, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Like [`ProjectContext::new`] with an explicit request timeout.
    pub fn with_timeout(
        root: PathBuf,
        cache_dir: PathBuf,
        manifest: Manifest,
        request_timeout: u64,
    ) -> Result<Self, ProjectError> {
        fs_err::create_dir_all(&cache_dir)?;
        let logs = cache_dir.join("logs");
        fs_err::create_dir_all(&logs)?;
        clean_stale_files(&logs);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(request_timeout))
            .build()?;
        let http = Http::new(client, FileStore::new(&cache_dir.join("http"))?);
        let candidate_info_cache =
            CandidateInfoCache::new(cache_dir.join("metadata").join("candidates.json"));
        let hash_cache = HashCache::new(&cache_dir.join("hashes"))?;

        Ok(ProjectContext {
            root,
            manifest,
            http,
            candidate_info_cache,
            hash_cache,
            binary_filter: BinaryFilter::from_env(),
            non_interactive: std::env::var_os("PDM_NON_INTERACTIVE").is_some(),
            keyring: None,
            interpreter: None,
            cache_dir,
            ephemeral: tempfile::tempdir()?,
        })
    }

    /// The interpreter range the project targets.
    pub fn python_requires(&self) -> &PySpecSet {
        &self.manifest.requires_python
    }

    /// The normalized key of the project itself, when it has a name.
    pub fn project_key(&self) -> Option<ProjectKey> {
        self.manifest.name.clone().map(ProjectKey::from)
    }

    /// The persistent cache of wheels built from immutable sources.
    pub fn wheel_cache_root(&self) -> PathBuf {
        self.cache_dir.join("wheels")
    }

    /// The per-run cache of wheels built from mutable sources.
    pub fn ephemeral_wheel_root(&self) -> &Path {
        self.ephemeral.path()
    }

    /// The persistent checkout directory for editable VCS requirements.
    pub fn src_root(&self) -> PathBuf {
        self.root.join("src")
    }

    /// A scratch directory for one preparation step.
    pub fn scratch_dir(&self, label: &str) -> std::io::Result<PathBuf> {
        let dir = self.ephemeral.path().join(label);
        fs_err::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Whether a package warning for `key` is silenced by configuration.
    /// A glob matching the project's own name is a no-op.
    pub fn ignores_package_warning(&self, key: &str) -> bool {
        let own_key = self.project_key();
        if own_key.as_ref().map(|k| k.as_str()) == Some(key) {
            tracing::debug!("ignore_package_warnings matching the project itself has no effect");
            return false;
        }
        self.manifest.ignore_package_warnings.iter().any(|pattern| {
            let normalized: String = pattern
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || matches!(c, '?' | '*' | '[' | ']') {
                        c.to_ascii_lowercase()
                    } else {
                        '-'
                    }
                })
                .collect();
            crate::utils::glob_match(&normalized, key)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn context_with(manifest_text: &str) -> ProjectContext {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::from_toml(manifest_text).unwrap();
        ProjectContext::new(
            dir.path().to_path_buf(),
            dir.path().join("cache"),
            manifest,
        )
        .unwrap()
    }

    #[test]
    fn test_ignore_package_warnings_globs() {
        let context = context_with(
            r#"
[project]
name = "demo"
requires-python = ">=3.8"

[tool.pdm]
ignore_package_warnings = ["Django-*", "pytest"]
"#,
        );
        assert!(context.ignores_package_warning("django-q"));
        assert!(context.ignores_package_warning("pytest"));
        assert!(!context.ignores_package_warning("requests"));
        // self matches are no-ops
        assert!(!context.ignores_package_warning("demo"));
    }

    #[test]
    fn test_name_filter() {
        std::env::set_var("PDM_NO_BINARY", "Foo_bar, baz");
        let filter = BinaryFilter::from_env();
        assert!(!filter.allows_wheel("foo-bar"));
        assert!(filter.allows_wheel("requests"));
        std::env::set_var("PDM_NO_BINARY", ":all:");
        let filter = BinaryFilter::from_env();
        assert!(!filter.allows_wheel("anything"));
        std::env::remove_var("PDM_NO_BINARY");
    }
}
