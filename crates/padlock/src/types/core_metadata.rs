use super::extra::{Extra, ParseExtraError};
use super::package_name::{PackageName, ParsePackageNameError};
use super::requirement::Requirement;
use super::rfc822ish::{Rfc822ish, Rfc822ishError};
use super::specifier::Specifiers;
use super::version::Version;
use indexmap::IndexSet;
use std::str::FromStr;
use thiserror::Error;

/// The core metadata of a built distribution, extracted from a wheel's
/// `METADATA` or a source distribution's `PKG-INFO`.
#[derive(Debug, Clone)]
pub struct CoreMetadata {
    /// The distribution name.
    pub name: PackageName,
    /// The distribution version.
    pub version: Version,
    /// The `Metadata-Version` of the file.
    pub metadata_version: Version,
    /// The `Requires-Dist` dependency lines, parsed.
    pub requires_dist: Vec<Requirement>,
    /// The raw `Requires-Python` specifier, if declared.
    pub requires_python: Option<Specifiers>,
    /// The extras declared via `Provides-Extra`.
    pub extras: IndexSet<Extra>,
    /// The one-line `Summary`.
    pub summary: Option<String>,
    /// The `Dynamic` fields (PEP 643); non-empty means some fields are only
    /// known after a build.
    pub dynamic: Vec<String>,
}

/// Error raised when metadata bytes cannot be turned into [`CoreMetadata`].
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum CoreMetadataError {
    #[error(transparent)]
    Format(#[from] Rfc822ishError),

    #[error("invalid Metadata-Version: {0}")]
    InvalidMetadataVersion(String),

    #[error("unsupported METADATA version {0}")]
    UnsupportedVersion(Version),

    #[error("invalid Version: {0}")]
    InvalidVersion(String),

    #[error(transparent)]
    InvalidPackageName(#[from] ParsePackageNameError),

    #[error("invalid extra identifier '{0}'")]
    InvalidExtra(String, #[source] ParseExtraError),

    #[error("invalid Requires-Python: {0}")]
    InvalidRequiresPython(#[source] crate::types::specifier::ParseSpecifierError),
}

impl CoreMetadata {
    /// Whether the metadata version implements PEP 643, i.e. the `Dynamic`
    /// field is trustworthy. 2.2 and later qualify.
    pub fn implements_pep643(&self) -> bool {
        static MIN: once_cell::sync::Lazy<Version> =
            once_cell::sync::Lazy::new(|| "2.2".parse().unwrap());
        self.metadata_version >= *MIN
    }

    /// Whether any of the fields the resolver relies on is dynamic. Static
    /// metadata from an sdist can then be trusted without building.
    pub fn core_fields_are_dynamic(&self) -> bool {
        const CORE: &[&str] = &[
            "name",
            "version",
            "requires-dist",
            "provides-extra",
            "requires-python",
        ];
        self.dynamic
            .iter()
            .any(|field| CORE.contains(&field.to_ascii_lowercase().as_str()))
    }
}

impl TryFrom<&[u8]> for CoreMetadata {
    type Error = CoreMetadataError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let text = String::from_utf8_lossy(value);
        let mut parsed = Rfc822ish::parse(&text)?;

        // "Automated tools consuming metadata SHOULD warn if metadata_version
        // is greater than the highest version they support, and MUST fail if
        // metadata_version has a greater major version than the highest
        // version they support."
        let metadata_version: Version = parsed
            .take("Metadata-Version")?
            .parse()
            .map_err(|e: super::version::ParseVersionError| {
                CoreMetadataError::InvalidMetadataVersion(e.to_string())
            })?;
        if metadata_version.bit(0).unwrap_or(0) >= 3 {
            return Err(CoreMetadataError::UnsupportedVersion(metadata_version));
        }

        let name: PackageName = parsed.take("Name")?.parse()?;
        let version_str = parsed.take("Version")?;
        let version: Version = version_str
            .parse()
            .map_err(|_| CoreMetadataError::InvalidVersion(version_str.clone()))?;

        let mut requires_dist = Vec::new();
        for line in parsed.take_all("Requires-Dist") {
            match Requirement::from_str(&line) {
                Ok(req) => requires_dist.push(req),
                Err(err) => {
                    tracing::warn!("ignoring Requires-Dist: {line}, failed to parse: {err}");
                }
            }
        }

        let requires_python = parsed
            .maybe_take("Requires-Python")?
            .as_deref()
            .map(Specifiers::from_str)
            .transpose()
            .map_err(CoreMetadataError::InvalidRequiresPython)?;

        let mut extras = IndexSet::new();
        for extra in parsed.take_all("Provides-Extra") {
            extras.insert(
                extra
                    .parse()
                    .map_err(|e| CoreMetadataError::InvalidExtra(extra.clone(), e))?,
            );
        }

        let summary = parsed.maybe_take("Summary")?;
        let dynamic = parsed.take_all("Dynamic");

        Ok(CoreMetadata {
            name,
            version,
            metadata_version,
            requires_dist,
            requires_python,
            extras,
            summary,
            dynamic,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const METADATA: &str = "\
Metadata-Version: 2.1
Name: demo
Version: 0.0.1
Summary: A demo package
Requires-Python: >=3.6
Provides-Extra: enc
Requires-Dist: idna
Requires-Dist: chardet; extra == 'enc'
";

    #[test]
    fn test_parse_metadata() {
        let parsed = CoreMetadata::try_from(METADATA.as_bytes()).unwrap();
        assert_eq!(parsed.name.as_str(), "demo");
        assert_eq!(parsed.version, "0.0.1".parse().unwrap());
        assert_eq!(parsed.requires_dist.len(), 2);
        assert_eq!(parsed.extras.len(), 1);
        assert_eq!(parsed.summary.as_deref(), Some("A demo package"));
        assert!(!parsed.core_fields_are_dynamic());
        assert!(!parsed.implements_pep643());
    }

    #[test]
    fn test_dynamic_fields() {
        let text = format!("{METADATA}Dynamic: Requires-Dist\n");
        let parsed = CoreMetadata::try_from(text.as_bytes()).unwrap();
        assert!(parsed.core_fields_are_dynamic());
    }

    #[test]
    fn test_future_major_rejected() {
        let text = METADATA.replace("2.1", "3.0");
        assert!(matches!(
            CoreMetadata::try_from(text.as_bytes()),
            Err(CoreMetadataError::UnsupportedVersion(_))
        ));
    }
}
