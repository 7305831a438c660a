use crate::utils::{url_to_path, url_without_fragment};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;

/// The version control systems a requirement may reference.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum VcsKind {
    Git,
    Hg,
    Svn,
    Bzr,
}

impl VcsKind {
    /// All recognized VCS schemes, used for line-form dispatch.
    pub const ALL: [VcsKind; 4] = [VcsKind::Git, VcsKind::Hg, VcsKind::Svn, VcsKind::Bzr];

    /// The scheme prefix, e.g. `git` in `git+https://...`.
    pub fn as_str(&self) -> &'static str {
        match self {
            VcsKind::Git => "git",
            VcsKind::Hg => "hg",
            VcsKind::Svn => "svn",
            VcsKind::Bzr => "bzr",
        }
    }
}

impl Display for VcsKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for VcsKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "git" => Ok(VcsKind::Git),
            "hg" => Ok(VcsKind::Hg),
            "svn" => Ok(VcsKind::Svn),
            "bzr" => Ok(VcsKind::Bzr),
            other => Err(format!("unknown VCS scheme '{other}'")),
        }
    }
}

/// A `<hash_name>:<hex>` pair recorded for an artifact in the lock file,
/// keyed by either the bare filename or the full URL depending on the
/// `static_urls` strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHash {
    /// The artifact filename, absent when URLs are recorded instead.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// The artifact URL, only recorded under the `static_urls` strategy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// The `<algo>:<hexdigest>` value.
    pub hash: String,
}

impl FileHash {
    /// The key the entry is sorted and deduplicated by.
    pub fn sort_key(&self) -> (String, String) {
        (
            self.url
                .clone()
                .or_else(|| self.file.clone())
                .unwrap_or_default(),
            self.hash.clone(),
        )
    }
}

/// A pointer to a distribution artifact: a local file, a remote URL, or a
/// VCS URL with an optional requested revision. Index links additionally
/// carry the attributes of the simple-index anchor they were parsed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// The full URL, including any fragment.
    pub url: Url,

    /// The index page the link was found on, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comes_from: Option<String>,

    /// The `data-requires-python` attribute, verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_python: Option<String>,

    /// Hash values parsed from the URL fragment or index attributes, keyed
    /// by algorithm name.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub hashes: IndexMap<String, String>,

    /// The yank reason; `Some` means the release was yanked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yank_reason: Option<String>,

    /// Whether a PEP 658 metadata file is published next to the artifact.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dist_info_metadata: bool,
}

impl Link {
    /// A plain link with no index attributes.
    pub fn new(url: Url) -> Self {
        let mut link = Link {
            url,
            comes_from: None,
            requires_python: None,
            hashes: IndexMap::new(),
            yank_reason: None,
            dist_info_metadata: false,
        };
        link.absorb_fragment_hash();
        link
    }

    fn absorb_fragment_hash(&mut self) {
        if let Some(fragment) = self.url.fragment() {
            for part in fragment.split('&') {
                if let Some((name, value)) = part.split_once('=') {
                    if matches!(name, "sha256" | "sha384" | "sha512" | "md5") {
                        self.hashes.insert(name.to_string(), value.to_string());
                    }
                }
            }
        }
    }

    /// The URL with the fragment stripped.
    pub fn url_without_fragment(&self) -> String {
        url_without_fragment(self.url.as_str()).to_string()
    }

    /// The last path segment of the URL, i.e. the artifact filename.
    pub fn filename(&self) -> Option<String> {
        self.url
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).next_back())
            .map(|s| {
                percent_decode(s)
            })
    }

    /// Whether the link points at a wheel.
    pub fn is_wheel(&self) -> bool {
        self.filename().map_or(false, |f| f.ends_with(".whl"))
    }

    /// The VCS kind when the URL uses a `vcs+transport` scheme.
    pub fn vcs_kind(&self) -> Option<VcsKind> {
        let scheme = self.url.scheme();
        let (vcs, _) = scheme.split_once('+')?;
        vcs.parse().ok()
    }

    /// The local path for `file://` links.
    pub fn file_path(&self) -> Option<PathBuf> {
        url_to_path(&self.url)
    }

    /// Whether the link points at a local directory.
    pub fn is_local_dir(&self) -> bool {
        self.file_path().map_or(false, |p| p.is_dir())
    }

    /// The value of a fragment key such as `subdirectory` or `egg`.
    pub fn fragment_value(&self, key: &str) -> Option<String> {
        let fragment = self.url.fragment()?;
        fragment.split('&').find_map(|part| {
            let (name, value) = part.split_once('=')?;
            (name == key).then(|| percent_decode(value))
        })
    }

    /// A strong `<algo>:<hex>` hash from the link attributes, if present.
    pub fn strong_hash(&self) -> Option<String> {
        for algo in ["sha256", "sha384", "sha512"] {
            if let Some(hex) = self.hashes.get(algo) {
                return Some(format!("{algo}:{hex}"));
            }
        }
        None
    }
}

impl Display for Link {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.url)
    }
}

fn percent_decode(s: &str) -> String {
    let mut out = Vec::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (
                (bytes[i + 1] as char).to_digit(16),
                (bytes[i + 2] as char).to_digit(16),
            ) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fragment_hash_absorbed() {
        let link = Link::new(
            "https://files.example.org/demo-0.0.1-py3-none-any.whl#sha256=deadbeef"
                .parse()
                .unwrap(),
        );
        assert_eq!(link.hashes.get("sha256").map(String::as_str), Some("deadbeef"));
        assert_eq!(link.strong_hash().as_deref(), Some("sha256:deadbeef"));
        assert_eq!(
            link.url_without_fragment(),
            "https://files.example.org/demo-0.0.1-py3-none-any.whl"
        );
        assert_eq!(link.filename().as_deref(), Some("demo-0.0.1-py3-none-any.whl"));
        assert!(link.is_wheel());
    }

    #[test]
    fn test_vcs_link() {
        let link = Link::new(
            "git+https://github.com/test-root/demo.git#egg=demo&subdirectory=sub"
                .parse()
                .unwrap(),
        );
        assert_eq!(link.vcs_kind(), Some(VcsKind::Git));
        assert_eq!(link.fragment_value("egg").as_deref(), Some("demo"));
        assert_eq!(link.fragment_value("subdirectory").as_deref(), Some("sub"));
    }

    #[test]
    fn test_percent_decoded_filename() {
        let link = Link::new("https://example.org/path/demo%20pkg-1.0.tar.gz".parse().unwrap());
        assert_eq!(link.filename().as_deref(), Some("demo pkg-1.0.tar.gz"));
    }
}
