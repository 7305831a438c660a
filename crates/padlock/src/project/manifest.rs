use crate::repository::{RepositoryConfig, SOURCE_KEYS};
use crate::types::{
    parse_requirement, PackageName, ParsePySpecError, PySpecSet, Requirement, RequirementError,
};
use indexmap::IndexMap;
use miette::Diagnostic;
use rattler_digest::{compute_bytes_digest, Sha256};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;
use toml_edit::{DocumentMut, Item};

/// The name of the implicit group holding `project.dependencies`.
pub const DEFAULT_GROUP: &str = "default";

/// Error raised for a missing or malformed project manifest.
#[derive(Debug, Error, Diagnostic)]
pub enum ManifestError {
    /// The document is not valid TOML.
    #[error("invalid project manifest: {0}")]
    InvalidToml(#[from] toml_edit::TomlError),

    /// `project.requires-python` does not parse.
    #[error("invalid requires-python: {0}")]
    InvalidRequiresPython(#[from] ParsePySpecError),

    /// A dependency line does not parse.
    #[error("invalid dependency in group '{group}': {source}")]
    InvalidDependency {
        /// The group the line belongs to.
        group: String,
        /// The parse failure.
        #[source]
        source: RequirementError,
    },

    /// A specifier string somewhere in the manifest does not parse.
    #[error(transparent)]
    InvalidSpecifier(#[from] crate::types::ParseSpecifierError),
}

/// The subset of the project manifest the engine consumes: project metadata,
/// dependency groups, and the `tool.pdm` settings tables.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    /// The project name, if declared.
    pub name: Option<PackageName>,
    /// The declared version, verbatim.
    pub version: Option<String>,
    /// The interpreter range the project supports.
    pub requires_python: PySpecSet,
    /// `project.dependencies`, verbatim lines.
    pub dependencies: Vec<String>,
    /// `project.optional-dependencies`, per extra group.
    pub optional_dependencies: IndexMap<String, Vec<String>>,
    /// `tool.pdm.dev-dependencies`, per dev group; never published.
    pub dev_dependencies: IndexMap<String, Vec<String>>,
    /// The configured package sources, in order.
    pub sources: Vec<RepositoryConfig>,
    /// `tool.pdm.resolution.overrides`: name to version or URL.
    pub overrides: IndexMap<String, String>,
    /// Whether hashes are only collected from the source a candidate came
    /// from.
    pub respect_source_order: bool,
    /// Globs silencing package warnings.
    pub ignore_package_warnings: Vec<String>,
    /// The project-wide pre-release policy, unset to let specifiers decide.
    pub allow_prereleases: Option<bool>,
    /// Whether the project is a library that is itself installed.
    pub is_distribution: bool,
}

fn string_array(item: Option<&Item>) -> Vec<String> {
    item.and_then(Item::as_array)
        .map(|array| {
            array
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn table_of_string_arrays(item: Option<&Item>) -> IndexMap<String, Vec<String>> {
    let mut out = IndexMap::new();
    if let Some(table) = item.and_then(Item::as_table_like) {
        for (key, value) in table.iter() {
            out.insert(key.to_string(), string_array(Some(value)));
        }
    }
    out
}

impl Manifest {
    /// Parses the manifest from a `pyproject.toml` document.
    pub fn from_toml(text: &str) -> Result<Self, ManifestError> {
        let doc: DocumentMut = text.parse()?;
        let mut manifest = Manifest::default();

        if let Some(project) = doc.get("project").and_then(Item::as_table_like) {
            manifest.name = project
                .get("name")
                .and_then(Item::as_str)
                .and_then(|name| name.parse().ok());
            manifest.version = project
                .get("version")
                .and_then(Item::as_str)
                .map(str::to_string);
            if let Some(requires) = project.get("requires-python").and_then(Item::as_str) {
                manifest.requires_python = requires.parse()?;
            }
            manifest.dependencies = string_array(project.get("dependencies"));
            manifest.optional_dependencies =
                table_of_string_arrays(project.get("optional-dependencies"));
            manifest.is_distribution = manifest.name.is_some();
        }

        let tool = doc
            .get("tool")
            .and_then(Item::as_table_like)
            .and_then(|tool| tool.get("pdm"))
            .and_then(Item::as_table_like);
        if let Some(tool) = tool {
            manifest.dev_dependencies = table_of_string_arrays(tool.get("dev-dependencies"));
            manifest.ignore_package_warnings = string_array(tool.get("ignore_package_warnings"));
            manifest.allow_prereleases = tool
                .get("allow_prereleases")
                .and_then(Item::as_bool);

            if let Some(sources) = tool.get("source").and_then(Item::as_array_of_tables) {
                for source in sources {
                    // sealed record: unknown keys are warned about, never kept
                    for (key, _) in source.iter() {
                        if !SOURCE_KEYS.contains(&key) {
                            tracing::warn!("ignoring unknown key '{key}' in [[tool.pdm.source]]");
                        }
                    }
                    match toml_edit::de::from_str::<RepositoryConfig>(&source.to_string()) {
                        Ok(config) => manifest.sources.push(config),
                        Err(err) => {
                            tracing::warn!("skipping malformed [[tool.pdm.source]] entry: {err}")
                        }
                    }
                }
            }

            if let Some(resolution) = tool.get("resolution").and_then(Item::as_table_like) {
                manifest.respect_source_order = resolution
                    .get("respect-source-order")
                    .and_then(Item::as_bool)
                    .unwrap_or(false);
                if let Some(overrides) =
                    resolution.get("overrides").and_then(Item::as_table_like)
                {
                    for (key, value) in overrides.iter() {
                        if let Some(value) = value.as_str() {
                            manifest
                                .overrides
                                .insert(key.to_string(), value.to_string());
                        }
                    }
                }
            }
        }

        Ok(manifest)
    }

    /// All dependency group names: `default`, then extras, then dev groups.
    pub fn iter_groups(&self) -> Vec<String> {
        let mut groups = vec![DEFAULT_GROUP.to_string()];
        groups.extend(self.optional_dependencies.keys().cloned());
        for key in self.dev_dependencies.keys() {
            if !groups.contains(key) {
                groups.push(key.clone());
            }
        }
        groups
    }

    /// The parsed requirements of one group, each tagged with the group
    /// name. Lines starting with `-e ` become editable requirements.
    pub fn group_dependencies(&self, group: &str) -> Result<Vec<Requirement>, ManifestError> {
        let lines = if group == DEFAULT_GROUP {
            Some(&self.dependencies)
        } else {
            self.optional_dependencies
                .get(group)
                .or_else(|| self.dev_dependencies.get(group))
        };
        let mut out = Vec::new();
        for line in lines.into_iter().flatten() {
            let req = if let Some(stripped) = line.strip_prefix("-e ") {
                parse_requirement(stripped.trim(), true)
            } else {
                parse_requirement(line, false)
            };
            let mut req = req.map_err(|source| ManifestError::InvalidDependency {
                group: group.to_string(),
                source,
            })?;
            req.core_mut().groups = vec![group.to_string()];
            out.push(req);
        }
        Ok(out)
    }

    /// The canonical content hash of the resolution-relevant subset of the
    /// manifest: sources, dependency groups, requires-python, and overrides.
    /// When any of these change the lock file no longer applies.
    pub fn content_hash(&self, algo: &str) -> String {
        #[derive(Serialize)]
        struct SourceDigest<'a> {
            name: &'a str,
            url: &'a str,
            verify_ssl: bool,
        }

        let mut sorted_deps = self.dependencies.clone();
        sorted_deps.sort();
        let sort_groups = |groups: &IndexMap<String, Vec<String>>| -> BTreeMap<String, Vec<String>> {
            groups
                .iter()
                .map(|(k, v)| {
                    let mut v = v.clone();
                    v.sort();
                    (k.clone(), v)
                })
                .collect()
        };

        let digest_input = serde_json::json!({
            "sources": self
                .sources
                .iter()
                .map(|s| SourceDigest {
                    name: &s.name,
                    url: &s.url,
                    verify_ssl: s.verify_ssl,
                })
                .collect::<Vec<_>>(),
            "dependencies": sorted_deps,
            "dev-dependencies": sort_groups(&self.dev_dependencies),
            "optional-dependencies": sort_groups(&self.optional_dependencies),
            "requires-python": self.requires_python.to_string(),
            "overrides": self.overrides.iter().collect::<BTreeMap<_, _>>(),
        });
        let serialized =
            serde_json::to_vec(&digest_input).expect("manifest digest input always serializes");
        let digest = compute_bytes_digest::<Sha256>(&serialized);
        format!("{algo}:{digest:x}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const MANIFEST: &str = r#"
[project]
name = "demo-app"
version = "0.1.0"
requires-python = ">=3.8"
dependencies = ["requests>=2.20", "click"]

[project.optional-dependencies]
socks = ["pysocks"]

[tool.pdm.dev-dependencies]
test = ["pytest", "-e git+https://github.com/acme/local-plugin.git#egg=local-plugin"]

[[tool.pdm.source]]
name = "private"
url = "https://private.example.org/simple"
verify_ssl = false
include_packages = ["acme-*"]
shady_extra_key = 1

[tool.pdm.resolution]
respect-source-order = true

[tool.pdm.resolution.overrides]
hoho = "2.1"
"#;

    #[test]
    fn test_parse_manifest() {
        let manifest = Manifest::from_toml(MANIFEST).unwrap();
        assert_eq!(manifest.name.as_ref().unwrap().as_str(), "demo-app");
        assert_eq!(manifest.requires_python.to_string(), ">=3.8");
        assert_eq!(manifest.dependencies.len(), 2);
        assert_eq!(manifest.sources.len(), 1);
        assert!(!manifest.sources[0].verify_ssl);
        assert!(manifest.respect_source_order);
        assert_eq!(manifest.overrides.get("hoho").map(String::as_str), Some("2.1"));
        assert_eq!(
            manifest.iter_groups(),
            vec!["default".to_string(), "socks".to_string(), "test".to_string()]
        );
    }

    #[test]
    fn test_group_dependencies() {
        let manifest = Manifest::from_toml(MANIFEST).unwrap();
        let default = manifest.group_dependencies(DEFAULT_GROUP).unwrap();
        assert_eq!(default.len(), 2);
        assert_eq!(default[0].core().groups, vec!["default"]);

        let test = manifest.group_dependencies("test").unwrap();
        assert_eq!(test.len(), 2);
        assert!(test[1].is_vcs());
        assert!(test[1].core().editable);
    }

    #[test]
    fn test_content_hash_changes_with_inputs() {
        let a = Manifest::from_toml(MANIFEST).unwrap();
        let mut b = a.clone();
        assert_eq!(a.content_hash("sha256"), b.content_hash("sha256"));
        b.overrides.insert("hoho".to_string(), "2.2".to_string());
        assert_ne!(a.content_hash("sha256"), b.content_hash("sha256"));
        assert!(a.content_hash("sha256").starts_with("sha256:"));
    }
}
