use crate::types::{EnvSpec, Link, Requirement};
use serde_json::json;
use sha2::{Digest, Sha224};
use std::path::{Path, PathBuf};

/// A cache of wheels built from source, keyed by the source link and the
/// environment the wheel was built for. Wheels built from immutable sources
/// (hash-pinned links, exact VCS revisions) go to the persistent cache;
/// everything else lands in the per-run ephemeral cache.
#[derive(Debug, Clone)]
pub struct WheelCache {
    root: PathBuf,
}

impl WheelCache {
    /// A cache rooted at `root`.
    pub fn new(root: PathBuf) -> Self {
        WheelCache { root }
    }

    /// The directory holding cached wheels for the given source.
    pub fn cache_dir(
        &self,
        link: &Link,
        env_spec: &EnvSpec,
        subdirectory: Option<&str>,
    ) -> PathBuf {
        let mut key = json!({
            "url": link.url_without_fragment(),
            "env_spec": env_spec.as_dict(),
        });
        if let Some(subdirectory) = subdirectory {
            key["subdirectory"] = json!(subdirectory);
        }
        for algo in ["sha256", "sha384", "sha512"] {
            if let Some(hex) = link.hashes.get(algo) {
                key[algo] = json!(hex);
                break;
            }
        }
        let serialized = serde_json::to_vec(&key).expect("cache keys always serialize");
        let digest = format!("{:x}", Sha224::digest(&serialized));
        // four nested levels keep any single directory small
        self.root
            .join(&digest[..2])
            .join(&digest[2..4])
            .join(&digest[4..6])
            .join(&digest[6..])
    }

    /// Looks up a previously built wheel for the source.
    pub fn get(
        &self,
        link: &Link,
        env_spec: &EnvSpec,
        subdirectory: Option<&str>,
    ) -> Option<PathBuf> {
        let dir = self.cache_dir(link, env_spec, subdirectory);
        let entries = std::fs::read_dir(&dir).ok()?;
        entries
            .flatten()
            .map(|entry| entry.path())
            .find(|path| path.extension().map_or(false, |ext| ext == "whl"))
    }

    /// Stores a built wheel, returning its new location inside the cache.
    pub fn store(
        &self,
        link: &Link,
        env_spec: &EnvSpec,
        subdirectory: Option<&str>,
        wheel: &Path,
    ) -> std::io::Result<PathBuf> {
        let dir = self.cache_dir(link, env_spec, subdirectory);
        fs_err::create_dir_all(&dir)?;
        let filename = wheel
            .file_name()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a file"))?;
        let target = dir.join(filename);
        // rename within one filesystem, copy across
        if fs_err::rename(wheel, &target).is_err() {
            fs_err::copy(wheel, &target)?;
        }
        Ok(target)
    }
}

/// Whether a built wheel for this requirement may outlive the run: the link
/// carries a stable content hash, or the requirement is an immutable VCS
/// revision (a full commit id, not just a ref).
pub fn is_cacheable(requirement: &Requirement, link: &Link) -> bool {
    if link.strong_hash().is_some() {
        return true;
    }
    if let Requirement::Vcs(vcs) = requirement {
        if let Some(revision) = &vcs.revision {
            return looks_like_commit(revision);
        }
        if let Some(ref_name) = &vcs.ref_name {
            return looks_like_commit(ref_name);
        }
    }
    false
}

fn looks_like_commit(rev: &str) -> bool {
    rev.len() >= 40 && rev.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::parse_line;

    fn env() -> EnvSpec {
        EnvSpec::from_requires_python(">=3.8".parse().unwrap())
    }

    #[test]
    fn test_cache_key_layout() {
        let cache = WheelCache::new(PathBuf::from("/cache/wheels"));
        let link = Link::new("https://example.org/demo-1.0.tar.gz".parse().unwrap());
        let dir = cache.cache_dir(&link, &env(), None);
        let relative = dir.strip_prefix("/cache/wheels").unwrap();
        let parts: Vec<_> = relative.components().collect();
        assert_eq!(parts.len(), 4);

        // the key reacts to every input
        assert_ne!(dir, cache.cache_dir(&link, &env(), Some("sub")));
        let other = Link::new("https://example.org/demo-1.1.tar.gz".parse().unwrap());
        assert_ne!(dir, cache.cache_dir(&other, &env(), None));
        let hashed =
            Link::new("https://example.org/demo-1.0.tar.gz#sha256=abc".parse().unwrap());
        assert_ne!(dir, cache.cache_dir(&hashed, &env(), None));
    }

    #[test]
    fn test_store_and_get() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = WheelCache::new(tmp.path().join("wheels"));
        let link = Link::new("https://example.org/demo-1.0.tar.gz#sha256=abc".parse().unwrap());

        assert!(cache.get(&link, &env(), None).is_none());
        let wheel = tmp.path().join("demo-1.0-py3-none-any.whl");
        fs_err::write(&wheel, b"not really a wheel").unwrap();
        cache.store(&link, &env(), None, &wheel).unwrap();
        let cached = cache.get(&link, &env(), None).unwrap();
        assert!(cached.ends_with("demo-1.0-py3-none-any.whl"));
    }

    #[test]
    fn test_cacheable_sources() {
        let hashed = parse_line("demo @ https://example.org/demo-1.0.tar.gz#sha256=abc").unwrap();
        let link = crate::types::link_from_requirement(&hashed, None).unwrap();
        assert!(is_cacheable(&hashed, &link));

        let floating = parse_line("git+https://github.com/acme/demo.git@main").unwrap();
        let link = crate::types::link_from_requirement(&floating, None).unwrap();
        assert!(!is_cacheable(&floating, &link));

        let pinned = parse_line(
            "git+https://github.com/acme/demo.git@0123456789abcdef0123456789abcdef01234567",
        )
        .unwrap();
        let link = crate::types::link_from_requirement(&pinned, None).unwrap();
        assert!(is_cacheable(&pinned, &link));
    }
}
