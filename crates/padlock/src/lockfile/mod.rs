//! The lock-file codec: the native tabular format (read and write) and the
//! read-only PEP 751 `pylock` consumer.

pub mod pylock;

use crate::repository::PackageEntry;
use crate::resolver::{group_sort_key, strategy, Resolution};
use crate::types::{Candidate, FileHash, Marker, PySpecSet, Requirement, Version};
use crate::utils::atomic_replace;
use miette::Diagnostic;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use toml_edit::{Array, ArrayOfTables, DocumentMut, InlineTable, Item, Table, Value};

/// The lock format version this engine writes.
pub const SPEC_VERSION: &str = "4.5.0";

/// The strategy flags the engine understands; anything else in a consumed
/// lock is dropped.
pub const SUPPORTED_FLAGS: &[&str] = &[
    strategy::STATIC_URLS,
    strategy::CROSS_PLATFORM,
    strategy::DIRECT_MINIMAL_VERSIONS,
    strategy::INHERIT_METADATA,
];

/// How a consumed lock file relates to this engine's format version.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Compatibility {
    /// The same version; use silently.
    Same,
    /// An older compatible version; use silently.
    Backward,
    /// A newer minor/patch; usable with a warning.
    Forward,
    /// A different major (or unversioned); refuse.
    None,
}

/// Error raised reading or writing a lock file.
#[derive(Debug, Error, Diagnostic)]
pub enum LockfileError {
    /// The document is not valid TOML.
    #[error("invalid lock file: {0}")]
    InvalidToml(#[from] toml_edit::TomlError),

    /// The lock was produced by an incompatible engine.
    #[error("the lock file format {0} is not compatible with this version ({SPEC_VERSION})")]
    Incompatible(String),

    /// A package entry cannot be reconstructed.
    #[error("broken package entry '{name}': {reason}")]
    BrokenEntry {
        /// The entry's package name.
        name: String,
        /// What is wrong with it.
        reason: String,
    },

    /// `files` entries mix `file`-keyed and `url`-keyed forms.
    #[error("the lock file mixes file-keyed and url-keyed hash entries; regenerate it")]
    MixedFileForms,

    /// URL-keyed hashes without the `static_urls` strategy flag.
    #[error("static URLs are not allowed in the lock file unless enabled by the static_urls strategy")]
    UnexpectedStaticUrls,

    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A lock file on disk: the parsed document plus its location. Reading
/// tolerates a missing file (an empty lock); writing goes through an atomic
/// replace.
#[derive(Debug)]
pub struct Lockfile {
    /// Where the lock lives, `pdm.lock` next to the manifest by default.
    pub path: PathBuf,
    doc: DocumentMut,
    exists: bool,
}

impl Lockfile {
    /// Loads the lock at `path`, treating a missing file as empty.
    pub fn load(path: PathBuf) -> Result<Self, LockfileError> {
        match fs_err::read_to_string(&path) {
            Ok(text) => Ok(Lockfile {
                doc: text.parse()?,
                path,
                exists: true,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Lockfile {
                doc: DocumentMut::new(),
                path,
                exists: false,
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Whether the file was present on disk.
    pub fn exists(&self) -> bool {
        self.exists
    }

    /// Whether the document uses the PEP 751 layout rather than the native
    /// one.
    pub fn is_pylock(&self) -> bool {
        self.doc.get("lock-version").is_some()
    }

    fn metadata(&self) -> Option<&dyn toml_edit::TableLike> {
        self.doc.get("metadata").and_then(Item::as_table_like)
    }

    /// The format version recorded in the lock.
    pub fn file_version(&self) -> String {
        self.metadata()
            .and_then(|m| m.get("lock_version"))
            .and_then(Item::as_str)
            .unwrap_or_default()
            .to_string()
    }

    /// The recorded content hash as `(algorithm, hexdigest)`.
    pub fn content_hash(&self) -> Option<(String, String)> {
        let raw = self
            .metadata()?
            .get("content_hash")
            .and_then(Item::as_str)?;
        let (algo, digest) = raw.split_once(':')?;
        Some((algo.to_string(), digest.to_string()))
    }

    /// The dependency groups this lock covers.
    pub fn groups(&self) -> Option<Vec<String>> {
        let array = self.metadata()?.get("groups").and_then(Item::as_array)?;
        Some(
            array
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        )
    }

    /// The strategy flags, restricted to the supported set.
    pub fn strategy(&self) -> HashSet<String> {
        let recorded: HashSet<String> = self
            .metadata()
            .and_then(|m| m.get("strategy"))
            .and_then(Item::as_array)
            .map(|array| {
                array
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_else(|| HashSet::from([strategy::INHERIT_METADATA.to_string()]));
        recorded
            .into_iter()
            .filter(|flag| SUPPORTED_FLAGS.contains(&flag.as_str()))
            .collect()
    }

    /// Maps the recorded format version against ours. Only `Same` and
    /// `Backward` permit silent use; `Forward` warrants a warning and
    /// `None` a refusal.
    pub fn compatibility(&self) -> Compatibility {
        if !self.exists {
            return Compatibility::Same;
        }
        let file_version = self.file_version();
        if file_version.is_empty() {
            return Compatibility::None;
        }
        let Ok(theirs) = file_version.parse::<Version>() else {
            return Compatibility::None;
        };
        let ours: Version = SPEC_VERSION.parse().expect("the spec version parses");
        if theirs == ours {
            return Compatibility::Same;
        }
        if theirs.bit(0) != ours.bit(0) {
            return Compatibility::None;
        }
        if theirs > ours {
            Compatibility::Forward
        } else {
            Compatibility::Backward
        }
    }

    /// Whether the recorded content hash matches the hash of the given
    /// manifest subset. A mismatch means the manifest changed since locking.
    pub fn matches_content_hash(&self, manifest: &crate::project::Manifest) -> bool {
        let Some((algo, digest)) = self.content_hash() else {
            return false;
        };
        manifest.content_hash(&algo) == format!("{algo}:{digest}")
    }

    /// Reconstructs the pinned entries. `project_root` anchors relative
    /// paths. Mixed `file`/`url` hash forms are rejected, as are URL-keyed
    /// hashes without the `static_urls` flag.
    pub fn packages(&self, _project_root: &Path) -> Result<Vec<PackageEntry>, LockfileError> {
        if self.is_pylock() {
            return pylock::read_packages(&self.doc);
        }
        let strategy = self.strategy();
        let static_urls = strategy.contains(strategy::STATIC_URLS);
        let mut entries = Vec::new();
        let mut seen_forms: (bool, bool) = (false, false);
        let Some(packages) = self.doc.get("package").and_then(Item::as_array_of_tables)
        else {
            return Ok(entries);
        };
        for package in packages {
            let name = package
                .get("name")
                .and_then(Item::as_str)
                .ok_or_else(|| LockfileError::BrokenEntry {
                    name: String::new(),
                    reason: "missing name".to_string(),
                })?
                .to_string();
            let broken = |reason: String| LockfileError::BrokenEntry {
                name: name.clone(),
                reason,
            };

            let version = package.get("version").and_then(Item::as_str);
            // rebuild the requirement from the non-metadata keys
            let mut req_table = Table::new();
            for (key, value) in package.iter() {
                match key {
                    "name" | "version" | "dependencies" | "requires_python" | "summary"
                    | "files" | "groups" | "targets" => {}
                    _ => {
                        req_table.insert(key, value.clone());
                    }
                }
            }
            if let Some(version) = version {
                req_table.insert("version", toml_edit::value(format!("=={version}")));
            }
            let req = crate::types::from_req_dict(&name, &Item::Table(req_table))
                .map_err(|e| broken(e.to_string()))?;
            let package_name = req
                .name()
                .cloned()
                .ok_or_else(|| broken("entry has no usable name".to_string()))?;
            let parsed_version: Option<Version> =
                version.and_then(|v| v.parse().ok());

            let mut candidate = Candidate::pinned(req, package_name, parsed_version);
            candidate.requires_python = package
                .get("requires_python")
                .and_then(Item::as_str)
                .unwrap_or_default()
                .to_string();
            candidate.summary = package
                .get("summary")
                .and_then(Item::as_str)
                .unwrap_or_default()
                .to_string();

            if let Some(files) = package.get("files").and_then(Item::as_array) {
                for file in files.iter() {
                    let Some(table) = file.as_inline_table() else {
                        continue;
                    };
                    let hash = FileHash {
                        file: table.get("file").and_then(Value::as_str).map(str::to_string),
                        url: table.get("url").and_then(Value::as_str).map(str::to_string),
                        hash: table
                            .get("hash")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    };
                    seen_forms.0 |= hash.file.is_some();
                    seen_forms.1 |= hash.url.is_some();
                    if hash.url.is_some() && !static_urls {
                        return Err(LockfileError::UnexpectedStaticUrls);
                    }
                    candidate.hashes.push(hash);
                }
            }

            let groups = package
                .get("groups")
                .and_then(Item::as_array)
                .map(|array| {
                    array
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            let marker = package
                .get("marker")
                .and_then(Item::as_str)
                .map(|m| m.parse::<Marker>())
                .transpose()
                .map_err(|e| broken(e.to_string()))?;
            if let Some(marker) = &marker {
                candidate.req.set_marker(Some(marker.clone()));
            }
            let targets: Vec<PySpecSet> = package
                .get("targets")
                .and_then(Item::as_array)
                .map(|array| {
                    array
                        .iter()
                        .filter_map(|v| v.as_str())
                        .filter_map(|s| s.parse().ok())
                        .collect()
                })
                .unwrap_or_default();

            entries.push(PackageEntry {
                dependencies: package
                    .get("dependencies")
                    .and_then(Item::as_array)
                    .map(|array| {
                        array
                            .iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default(),
                requires_python: candidate.requires_python.clone(),
                summary: candidate.summary.clone(),
                groups,
                marker,
                targets,
                candidate,
            });
        }
        if seen_forms.0 && seen_forms.1 {
            return Err(LockfileError::MixedFileForms);
        }
        Ok(entries)
    }

    /// Renders a resolution into the document, deterministically: packages
    /// sorted by identifier, hashes by `(url_or_file, hash)`, groups with
    /// `default` first.
    pub fn format(
        &mut self,
        resolution: &Resolution,
        groups: &[String],
        strategy_flags: &HashSet<String>,
        content_hash: &str,
    ) {
        let inherit_metadata = strategy_flags.contains(strategy::INHERIT_METADATA);
        let static_urls = strategy_flags.contains(strategy::STATIC_URLS);

        let mut doc = DocumentMut::new();
        let mut metadata = Table::new();
        let mut sorted_groups: Vec<String> = groups.to_vec();
        sorted_groups.sort_by_key(|g| group_sort_key(g));
        metadata.insert(
            "groups",
            toml_edit::value(Array::from_iter(sorted_groups.iter().map(String::as_str))),
        );
        let mut sorted_strategy: Vec<&String> = strategy_flags.iter().collect();
        sorted_strategy.sort();
        metadata.insert(
            "strategy",
            toml_edit::value(Array::from_iter(
                sorted_strategy.iter().map(|s| s.as_str()),
            )),
        );
        metadata.insert("lock_version", toml_edit::value(SPEC_VERSION));
        metadata.insert("content_hash", toml_edit::value(content_hash));
        doc.insert("metadata", Item::Table(metadata));

        let mut sorted: Vec<(&String, &Candidate)> = resolution.mapping.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(b.0));

        let mut packages = ArrayOfTables::new();
        for (identifier, candidate) in sorted {
            let mut entry = Table::new();
            if let Some(name) = &candidate.name {
                entry.insert("name", toml_edit::value(name.as_given_str()));
            }
            if let Some(version) = &candidate.version {
                entry.insert("version", toml_edit::value(version.to_string()));
            }
            let root = self.path.parent().unwrap_or_else(|| Path::new("."));
            append_source_fields(&mut entry, &candidate.req, root);
            if !candidate.requires_python.is_empty() {
                entry.insert(
                    "requires_python",
                    toml_edit::value(candidate.requires_python.as_str()),
                );
            }
            entry.insert("summary", toml_edit::value(candidate.summary.as_str()));
            if inherit_metadata {
                let mut entry_groups = candidate.req.core().groups.clone();
                entry_groups.sort_by_key(|g| group_sort_key(g));
                entry.insert(
                    "groups",
                    toml_edit::value(Array::from_iter(entry_groups.iter().map(String::as_str))),
                );
                if let Some(marker) = candidate.req.marker() {
                    entry.insert("marker", toml_edit::value(marker.to_string()));
                }
            }
            let dep_key = (identifier.clone(), candidate.version.as_ref().map(|v| v.to_string()));
            if let Some(dependencies) = resolution.all_dependencies.get(&dep_key) {
                if !dependencies.is_empty() {
                    let mut lines: Vec<String> =
                        dependencies.iter().map(Requirement::as_line).collect();
                    lines.sort();
                    entry.insert(
                        "dependencies",
                        toml_edit::value(Array::from_iter(lines.iter().map(String::as_str))),
                    );
                }
            }
            if !candidate.hashes.is_empty() {
                let mut hashes = candidate.hashes.clone();
                hashes.sort_by_key(FileHash::sort_key);
                hashes.dedup_by_key(|h| h.sort_key());
                let mut array = Array::new();
                for hash in hashes {
                    let mut row = InlineTable::new();
                    if static_urls {
                        if let Some(url) = &hash.url {
                            row.insert("url", Value::from(url.as_str()));
                        }
                    } else if let Some(file) = &hash.file {
                        row.insert("file", Value::from(file.as_str()));
                    }
                    row.insert("hash", Value::from(hash.hash.as_str()));
                    array.push(Value::InlineTable(row));
                }
                entry.insert("files", toml_edit::value(array));
            }
            packages.push(entry);
        }
        doc.insert("package", Item::ArrayOfTables(packages));
        self.doc = doc;
    }

    /// Writes the document via an atomic replace.
    pub fn save(&mut self) -> Result<(), LockfileError> {
        atomic_replace(&self.path, self.doc.to_string().as_bytes())?;
        self.exists = true;
        Ok(())
    }

    /// The rendered document, mainly for tests.
    pub fn render(&self) -> String {
        self.doc.to_string()
    }
}

/// Writes the requirement's source fields into a package table: path/url
/// with the relocatable `${PROJECT_ROOT}` preserved, VCS kind with ref and
/// resolved revision, editable and subdirectory flags. Absolute paths are
/// relativized against the lock's directory so the file stays relocatable.
fn append_source_fields(entry: &mut Table, req: &Requirement, root: &Path) {
    let core = req.core();
    if !core.extras.is_empty() {
        entry.insert(
            "extras",
            toml_edit::value(Array::from_iter(core.extras.iter().map(|e| e.as_str()))),
        );
    }
    match req {
        Requirement::Named(_) => {}
        Requirement::File(file) => {
            if let Some(path) = &file.path {
                let path = if path.is_absolute() {
                    pathdiff::diff_paths(path, root).unwrap_or_else(|| path.clone())
                } else {
                    path.clone()
                };
                entry.insert("path", toml_edit::value(path.to_string_lossy().as_ref()));
            } else {
                entry.insert("url", toml_edit::value(file.url.as_str()));
            }
            if let Some(subdirectory) = &file.subdirectory {
                entry.insert("subdirectory", toml_edit::value(subdirectory.as_str()));
            }
            if core.editable {
                entry.insert("editable", toml_edit::value(true));
            }
        }
        Requirement::Vcs(vcs) => {
            entry.insert(vcs.vcs.as_str(), toml_edit::value(vcs.repo.as_str()));
            if let Some(ref_name) = &vcs.ref_name {
                entry.insert("ref", toml_edit::value(ref_name.as_str()));
            }
            if let Some(revision) = &vcs.revision {
                entry.insert("revision", toml_edit::value(revision.as_str()));
            }
            if let Some(subdirectory) = &vcs.file.subdirectory {
                entry.insert("subdirectory", toml_edit::value(subdirectory.as_str()));
            }
            if core.editable {
                entry.insert("editable", toml_edit::value(true));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    fn lock_with_version(version: &str) -> Lockfile {
        let text = format!("[metadata]\nlock_version = \"{version}\"\n");
        Lockfile {
            path: PathBuf::from("pdm.lock"),
            doc: text.parse().unwrap(),
            exists: true,
        }
    }

    #[rstest]
    #[case("4.5.0", Compatibility::Same)]
    #[case("4.4.9", Compatibility::Backward)]
    #[case("4.4.0", Compatibility::Backward)]
    #[case("4.6.0", Compatibility::Forward)]
    #[case("4.5.1", Compatibility::Forward)]
    #[case("5.0.0", Compatibility::None)]
    #[case("3.9.9", Compatibility::None)]
    fn test_compatibility(#[case] version: &str, #[case] expected: Compatibility) {
        assert_eq!(lock_with_version(version).compatibility(), expected);
    }

    #[test]
    fn test_missing_lock_is_compatible() {
        let lock = Lockfile::load(PathBuf::from("/definitely/missing/pdm.lock")).unwrap();
        assert!(!lock.exists());
        assert_eq!(lock.compatibility(), Compatibility::Same);
        assert!(lock.packages(Path::new(".")).unwrap().is_empty());
    }

    #[test]
    fn test_unversioned_lock_refused() {
        let lock = Lockfile {
            path: PathBuf::from("pdm.lock"),
            doc: "[metadata]\n".parse().unwrap(),
            exists: true,
        };
        assert_eq!(lock.compatibility(), Compatibility::None);
    }

    const LOCK: &str = r#"
[metadata]
groups = ["default"]
strategy = ["inherit_metadata"]
lock_version = "4.5.0"
content_hash = "sha256:deadbeef"

[[package]]
name = "django"
version = "2.2.9"
requires_python = ">=3.5"
summary = "The web framework"
groups = ["default"]
dependencies = ["sqlparse>=0.3.0"]
files = [
    {file = "Django-2.2.9-py3-none-any.whl", hash = "sha256:aaaa"},
    {file = "Django-2.2.9.tar.gz", hash = "sha256:bbbb"},
]

[[package]]
name = "sqlparse"
version = "0.3.0"
requires_python = ">=3.5"
summary = "SQL parser"
groups = ["default"]
marker = "python_version >= \"3.5\""
files = [
    {file = "sqlparse-0.3.0.tar.gz", hash = "sha256:cccc"},
]
"#;

    #[test]
    fn test_read_packages() {
        let lock = Lockfile {
            path: PathBuf::from("pdm.lock"),
            doc: LOCK.parse().unwrap(),
            exists: true,
        };
        assert_eq!(lock.groups(), Some(vec!["default".to_string()]));
        assert_eq!(
            lock.content_hash(),
            Some(("sha256".to_string(), "deadbeef".to_string()))
        );
        let packages = lock.packages(Path::new(".")).unwrap();
        assert_eq!(packages.len(), 2);
        let django = &packages[0];
        assert_eq!(django.candidate.identify(), "django");
        assert_eq!(
            django.candidate.version,
            Some("2.2.9".parse().unwrap())
        );
        assert!(django.candidate.req.is_pinned());
        assert_eq!(django.dependencies, vec!["sqlparse>=0.3.0"]);
        assert_eq!(django.candidate.hashes.len(), 2);
        let sqlparse = &packages[1];
        assert!(sqlparse.marker.is_some());
    }

    #[test]
    fn test_mixed_file_forms_rejected() {
        let text = LOCK.replace(
            "{file = \"sqlparse-0.3.0.tar.gz\", hash = \"sha256:cccc\"}",
            "{url = \"https://example.org/sqlparse-0.3.0.tar.gz\", hash = \"sha256:cccc\"}",
        );
        let lock = Lockfile {
            path: PathBuf::from("pdm.lock"),
            doc: text.parse().unwrap(),
            exists: true,
        };
        // url-keyed entries demand the static_urls flag first
        assert!(matches!(
            lock.packages(Path::new(".")),
            Err(LockfileError::UnexpectedStaticUrls)
        ));
        let text = text.replace(
            "strategy = [\"inherit_metadata\"]",
            "strategy = [\"inherit_metadata\", \"static_urls\"]",
        );
        let lock = Lockfile {
            path: PathBuf::from("pdm.lock"),
            doc: text.parse().unwrap(),
            exists: true,
        };
        assert!(matches!(
            lock.packages(Path::new(".")),
            Err(LockfileError::MixedFileForms)
        ));
    }
}
