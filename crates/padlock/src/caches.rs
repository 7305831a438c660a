//! On-disk caches owned by the project context: the candidate metadata
//! cache and the artifact hash cache.

use crate::index::{FileStore, Http, HttpError};
use crate::types::{Candidate, Link};
use data_encoding::BASE64URL_NOPAD;
use parking_lot::Mutex;
use rattler_digest::{compute_bytes_digest, Sha256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// The cached dependency information of one candidate: rendered dependency
/// lines, the requires-python constraint, and the summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CandidateInfo {
    /// Dependencies as requirement lines.
    pub dependencies: Vec<String>,
    /// The raw requires-python constraint.
    pub requires_python: String,
    /// The one-line summary.
    pub summary: String,
}

/// A JSON-file cache of candidate metadata, keyed by name, extras, and
/// version (or a URL digest for direct references). Lives across runs so
/// sdists are not rebuilt just to read their dependencies.
#[derive(Debug)]
pub struct CandidateInfoCache {
    cache_file: PathBuf,
    cache: Mutex<HashMap<String, CandidateInfo>>,
}

impl CandidateInfoCache {
    /// Opens the cache at `cache_file`, tolerating a missing or corrupt
    /// file.
    pub fn new(cache_file: PathBuf) -> Self {
        let cache = std::fs::read(&cache_file)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        CandidateInfoCache {
            cache_file,
            cache: Mutex::new(cache),
        }
    }

    /// The cache key for a candidate. Candidates without a name or a version
    /// are not cacheable.
    pub fn key_for(candidate: &Candidate) -> Option<String> {
        let name = candidate.name.as_ref()?;
        let extras = if candidate.req.core().extras.is_empty() {
            String::new()
        } else {
            format!(
                "[{}]",
                candidate
                    .req
                    .core()
                    .extras
                    .iter()
                    .map(|e| e.as_str())
                    .collect::<Vec<_>>()
                    .join(",")
            )
        };
        let version = match &candidate.link {
            Some(link) => BASE64URL_NOPAD.encode(link.url_without_fragment().as_bytes()),
            None => candidate.version.as_ref()?.to_string(),
        };
        Some(format!("{}{}-{}", name.as_str(), extras, version))
    }

    /// Looks up the cached info for a candidate.
    pub fn get(&self, candidate: &Candidate) -> Option<CandidateInfo> {
        let key = Self::key_for(candidate)?;
        self.cache.lock().get(&key).cloned()
    }

    /// Stores info for a candidate and persists the file.
    pub fn set(&self, candidate: &Candidate, info: CandidateInfo) {
        let Some(key) = Self::key_for(candidate) else {
            return;
        };
        let mut cache = self.cache.lock();
        cache.insert(key, info);
        if let Ok(bytes) = serde_json::to_vec(&*cache) {
            if let Err(err) = crate::utils::atomic_replace(&self.cache_file, &bytes) {
                tracing::warn!("failed to persist candidate info cache: {err}");
            }
        }
    }
}

/// Caches artifact hashes so artifacts are not downloaded twice just to be
/// hashed. A hash embedded in the link fragment short-circuits everything.
#[derive(Debug)]
pub struct HashCache {
    store: FileStore,
}

impl HashCache {
    /// The digest recorded when nothing stronger is available.
    pub const FAVORITE_HASH: &'static str = "sha256";

    /// Opens the hash cache in `directory`.
    pub fn new(directory: &Path) -> std::io::Result<Self> {
        Ok(HashCache {
            store: FileStore::new(directory)?,
        })
    }

    fn cache_key(link: &Link) -> Vec<u8> {
        link.url_without_fragment().into_bytes()
    }

    /// Returns the `<algo>:<hex>` hash of the artifact behind `link`,
    /// preferring link-declared hashes, then the cache, then a streaming
    /// download.
    pub async fn get_hash(&self, link: &Link, http: &Http) -> Result<String, HttpError> {
        if let Some(declared) = link.strong_hash() {
            tracing::debug!("using hash declared by the index for {link}");
            return Ok(declared);
        }
        let key = Self::cache_key(link);
        if let Some(mut reader) = self.store.get(&key.as_slice()) {
            let mut value = String::new();
            if reader.read_to_string(&mut value).is_ok() && !value.is_empty() {
                return Ok(value);
            }
        }
        let value = self.compute_hash(link, http).await?;
        // local files are rehashed every time, they may change under us
        if link.file_path().is_none() {
            let lock = self.store.lock(&key.as_slice())?;
            let mut writer = lock.begin()?;
            writer.write_all(value.as_bytes())?;
            writer.commit()?;
        }
        Ok(value)
    }

    async fn compute_hash(&self, link: &Link, http: &Http) -> Result<String, HttpError> {
        tracing::debug!("downloading {link} to compute its hash");
        let digest = if let Some(path) = link.file_path() {
            let bytes = fs_err::read(&path)?;
            compute_bytes_digest::<Sha256>(&bytes)
        } else {
            let mut body = Vec::new();
            http.download(link.url.clone(), &mut body).await?;
            compute_bytes_digest::<Sha256>(&body)
        };
        Ok(format!("{}:{:x}", Self::FAVORITE_HASH, digest))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::parse_line;

    #[test]
    fn test_candidate_info_cache_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache_file = dir.path().join("info.json");
        let cache = CandidateInfoCache::new(cache_file.clone());

        let req = parse_line("demo").unwrap();
        let name = req.name().cloned().unwrap();
        let candidate = Candidate::pinned(req, name, Some("0.0.1".parse().unwrap()));

        assert!(cache.get(&candidate).is_none());
        let info = CandidateInfo {
            dependencies: vec!["idna".to_string()],
            requires_python: ">=3.6".to_string(),
            summary: "A demo".to_string(),
        };
        cache.set(&candidate, info.clone());
        assert_eq!(cache.get(&candidate), Some(info.clone()));

        // a fresh instance reads the persisted file
        let reopened = CandidateInfoCache::new(cache_file);
        assert_eq!(reopened.get(&candidate), Some(info));
    }

    #[test]
    fn test_uncacheable_candidates() {
        let req = parse_line("https://example.org/no-name.zip").unwrap();
        let candidate = Candidate::new(req);
        assert!(CandidateInfoCache::key_for(&candidate).is_none());
    }
}
