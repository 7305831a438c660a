//! Read-only support for the standardized PEP 751 `pylock.toml` format.
//! The engine consumes these locks but always emits its native format.

use super::LockfileError;
use crate::repository::PackageEntry;
use crate::types::{Candidate, FileHash, Marker, PySpecSet, Version};
use toml_edit::{DocumentMut, Item, Table, Value};

/// The metadata of a pylock document the engine cares about.
#[derive(Debug, Default)]
pub struct PylockMetadata {
    /// The `lock-version` value, "1.0" for the initial revision.
    pub lock_version: String,
    /// The `requires-python` range.
    pub requires_python: Option<PySpecSet>,
    /// The `environments` marker strings; entries that fail to parse are
    /// skipped with a warning.
    pub environments: Vec<Marker>,
    /// The `default-groups` selection.
    pub default_groups: Vec<String>,
}

/// Reads the metadata block of a pylock document.
pub fn read_metadata(doc: &DocumentMut) -> Result<PylockMetadata, LockfileError> {
    let mut metadata = PylockMetadata {
        lock_version: doc
            .get("lock-version")
            .and_then(Item::as_str)
            .unwrap_or_default()
            .to_string(),
        ..Default::default()
    };
    if metadata.lock_version.is_empty() {
        return Err(LockfileError::Incompatible("missing lock-version".into()));
    }
    if !metadata.lock_version.starts_with("1.") {
        return Err(LockfileError::Incompatible(metadata.lock_version));
    }
    metadata.requires_python = doc
        .get("requires-python")
        .and_then(Item::as_str)
        .and_then(|s| s.parse().ok());
    if let Some(environments) = doc.get("environments").and_then(Item::as_array) {
        for value in environments.iter() {
            let Some(text) = value.as_str() else { continue };
            match text.parse::<Marker>() {
                Ok(marker) => metadata.environments.push(marker),
                Err(err) => {
                    tracing::warn!("ignoring unparseable pylock environment '{text}': {err}")
                }
            }
        }
    }
    metadata.default_groups = doc
        .get("default-groups")
        .and_then(Item::as_array)
        .map(|array| {
            array
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    Ok(metadata)
}

fn hashes_from_table(table: &dyn toml_edit::TableLike) -> Vec<FileHash> {
    let mut out = Vec::new();
    let name = table.get("name").and_then(Item::as_str).map(str::to_string);
    let url = table.get("url").and_then(Item::as_str).map(str::to_string);
    if let Some(hashes) = table.get("hashes").and_then(Item::as_table_like) {
        for (algo, value) in hashes.iter() {
            if let Some(hex) = value.as_str() {
                out.push(FileHash {
                    file: name.clone(),
                    url: url.clone(),
                    hash: format!("{algo}:{hex}"),
                });
            }
        }
    }
    out
}

fn requirement_table_for(package: &Table) -> Option<toml_edit::Table> {
    let mut req = Table::new();
    if let Some(vcs) = package.get("vcs").and_then(Item::as_table_like) {
        let kind = vcs.get("type").and_then(Item::as_str)?;
        let url = vcs.get("url").and_then(Item::as_str)?;
        req.insert(kind, toml_edit::value(url));
        if let Some(rev) = vcs.get("requested-revision").and_then(Item::as_str) {
            req.insert("ref", toml_edit::value(rev));
        }
        if let Some(commit) = vcs.get("commit-id").and_then(Item::as_str) {
            req.insert("revision", toml_edit::value(commit));
        }
        if let Some(subdirectory) = vcs.get("subdirectory").and_then(Item::as_str) {
            req.insert("subdirectory", toml_edit::value(subdirectory));
        }
        return Some(req);
    }
    if let Some(directory) = package.get("directory").and_then(Item::as_table_like) {
        let path = directory.get("path").and_then(Item::as_str)?;
        req.insert("path", toml_edit::value(path));
        if let Some(editable) = directory.get("editable").and_then(Item::as_bool) {
            if editable {
                req.insert("editable", toml_edit::value(true));
            }
        }
        if let Some(subdirectory) = directory.get("subdirectory").and_then(Item::as_str) {
            req.insert("subdirectory", toml_edit::value(subdirectory));
        }
        return Some(req);
    }
    if let Some(archive) = package.get("archive").and_then(Item::as_table_like) {
        if let Some(url) = archive.get("url").and_then(Item::as_str) {
            req.insert("url", toml_edit::value(url));
        } else if let Some(path) = archive.get("path").and_then(Item::as_str) {
            req.insert("path", toml_edit::value(path));
        }
        return Some(req);
    }
    Some(req)
}

/// Converts pylock package tables into the engine's entries.
pub fn read_packages(doc: &DocumentMut) -> Result<Vec<PackageEntry>, LockfileError> {
    let metadata = read_metadata(doc)?;
    let mut entries = Vec::new();
    let Some(packages) = doc.get("packages").and_then(Item::as_array_of_tables) else {
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

        let mut req_table = requirement_table_for(package)
            .ok_or_else(|| broken("unusable source table".to_string()))?;
        if let Some(version) = version {
            req_table.insert("version", toml_edit::value(format!("=={version}")));
        }
        if let Some(marker) = package.get("marker").and_then(Item::as_str) {
            req_table.insert("marker", toml_edit::value(marker));
        }
        let req = crate::types::from_req_dict(&name, &Item::Table(req_table))
            .map_err(|e| broken(e.to_string()))?;
        let package_name = req
            .name()
            .cloned()
            .ok_or_else(|| broken("entry has no usable name".to_string()))?;
        let parsed_version: Option<Version> = version.and_then(|v| v.parse().ok());
        let mut candidate = Candidate::pinned(req, package_name, parsed_version);

        candidate.requires_python = package
            .get("requires-python")
            .and_then(Item::as_str)
            .unwrap_or_default()
            .to_string();

        // hashes come from whichever artifact tables are present
        for key in ["sdist", "archive"] {
            if let Some(table) = package.get(key).and_then(Item::as_table_like) {
                candidate.hashes.extend(hashes_from_table(table));
            }
        }
        if let Some(wheels) = package.get("wheels").and_then(Item::as_array_of_tables) {
            for wheel in wheels {
                candidate.hashes.extend(hashes_from_table(wheel));
            }
        }

        let dependencies = package
            .get("dependencies")
            .and_then(Item::as_array)
            .map(|array| {
                array
                    .iter()
                    .filter_map(|v| v.as_inline_table())
                    .filter_map(|t| t.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let marker = candidate.req.marker().cloned();
        let groups = if metadata.default_groups.is_empty() {
            vec![crate::project::DEFAULT_GROUP.to_string()]
        } else {
            metadata.default_groups.clone()
        };
        entries.push(PackageEntry {
            dependencies,
            requires_python: candidate.requires_python.clone(),
            summary: String::new(),
            groups,
            marker,
            targets: Vec::new(),
            candidate,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod test {
    use super::*;

    const PYLOCK: &str = r#"
lock-version = "1.0"
requires-python = ">=3.9"
environments = ["sys_platform == 'linux'", "sys_platform == 'win32'"]
default-groups = ["default"]

[[packages]]
name = "attrs"
version = "25.1.0"
requires-python = ">=3.8"

[packages.sdist]
name = "attrs-25.1.0.tar.gz"
url = "https://files.example.org/attrs-25.1.0.tar.gz"

[packages.sdist.hashes]
sha256 = "abcd"

[[packages]]
name = "demo"

[packages.vcs]
type = "git"
url = "https://github.com/test-root/demo.git"
requested-revision = "main"
commit-id = "0123456789abcdef0123456789abcdef01234567"
"#;

    #[test]
    fn test_read_pylock() {
        let doc: DocumentMut = PYLOCK.parse().unwrap();
        let metadata = read_metadata(&doc).unwrap();
        assert_eq!(metadata.lock_version, "1.0");
        assert_eq!(metadata.environments.len(), 2);
        assert_eq!(metadata.requires_python.unwrap().to_string(), ">=3.9");

        let packages = read_packages(&doc).unwrap();
        assert_eq!(packages.len(), 2);
        let attrs = &packages[0];
        assert_eq!(attrs.candidate.identify(), "attrs");
        assert_eq!(attrs.candidate.hashes.len(), 1);
        assert_eq!(attrs.candidate.hashes[0].hash, "sha256:abcd");

        let demo = &packages[1];
        assert!(demo.candidate.req.is_vcs());
        if let crate::types::Requirement::Vcs(vcs) = &demo.candidate.req {
            assert_eq!(vcs.ref_name.as_deref(), Some("main"));
            assert!(vcs.revision.as_deref().unwrap().starts_with("01234567"));
        }
    }

    #[test]
    fn test_future_pylock_rejected() {
        let doc: DocumentMut = PYLOCK
            .replace("lock-version = \"1.0\"", "lock-version = \"2.0\"")
            .parse()
            .unwrap();
        assert!(matches!(
            read_metadata(&doc),
            Err(LockfileError::Incompatible(_))
        ));
    }
}
