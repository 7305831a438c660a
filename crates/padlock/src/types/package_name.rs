use miette::Diagnostic;
use regex::Regex;
use serde::{Serialize, Serializer};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

/// The name of a Python project. Keeps the spelling it was created from next
/// to the PEP 503 normalized form; comparisons, hashing and ordering all go
/// through the normalized form so `Foo_Bar` and `foo-bar` collate together.
#[derive(Debug, Clone, Eq, DeserializeFromStr)]
pub struct PackageName {
    /// The spelling the name was parsed from.
    given: Box<str>,

    /// The PEP 503 normalization of `given`.
    canonical: Box<str>,
}

impl PackageName {
    /// The spelling this name was created from.
    pub fn as_given_str(&self) -> &str {
        self.given.as_ref()
    }

    /// The normalized name, guaranteed to be a valid project name.
    pub fn as_str(&self) -> &str {
        self.canonical.as_ref()
    }
}

/// Error raised for a string that is not a valid project name.
#[derive(Debug, Clone, Error, Diagnostic)]
#[error("invalid project name '{0}'")]
pub struct ParsePackageNameError(pub String);

impl FromStr for PackageName {
    type Err = ParsePackageNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        static VALID_NAME: OnceLock<Regex> = OnceLock::new();
        let valid_name = VALID_NAME.get_or_init(|| {
            // https://packaging.python.org/specifications/core-metadata/#name
            Regex::new(r"(?i-u)^([A-Z0-9]|[A-Z0-9][A-Z0-9._-]*[A-Z0-9])$").unwrap()
        });

        if !valid_name.is_match(s) {
            return Err(ParsePackageNameError(s.into()));
        }

        // https://peps.python.org/pep-0503/#normalized-names
        let mut canonical = s.replace(['-', '_', '.'], "-");
        canonical.make_ascii_lowercase();

        Ok(PackageName {
            given: s.to_owned().into_boxed_str(),
            canonical: canonical.into_boxed_str(),
        })
    }
}

impl Display for PackageName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.given)
    }
}

impl Hash for PackageName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state)
    }
}

impl PartialEq for PackageName {
    fn eq(&self, other: &Self) -> bool {
        self.canonical.eq(&other.canonical)
    }
}

impl PartialOrd for PackageName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PackageName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl Serialize for PackageName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.given.as_ref().serialize(serializer)
    }
}

/// A project key: the PEP 503 normalized name on its own. This is the form
/// requirements and candidates are collated by.
#[repr(transparent)]
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, SerializeDisplay, DeserializeFromStr,
)]
pub struct ProjectKey(Box<str>);

impl From<PackageName> for ProjectKey {
    fn from(value: PackageName) -> Self {
        Self(value.canonical)
    }
}

impl From<ProjectKey> for PackageName {
    fn from(value: ProjectKey) -> Self {
        Self {
            given: value.0.clone(),
            canonical: value.0,
        }
    }
}

impl Display for ProjectKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ProjectKey {
    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_ref()
    }
}

impl FromStr for ProjectKey {
    type Err = ParsePackageNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PackageName::from_str(s)?.into())
    }
}

impl Borrow<str> for ProjectKey {
    fn borrow(&self) -> &str {
        self.0.as_ref()
    }
}

/// Normalizes an arbitrary name the way PEP 503 does, without validating it.
/// Used for glob matching against `include_packages`/`exclude_packages`
/// patterns that may themselves carry wildcards.
pub fn normalize_name(name: &str) -> String {
    static RUNS: OnceLock<Regex> = OnceLock::new();
    let runs = RUNS.get_or_init(|| Regex::new(r"[-_.]+").unwrap());
    runs.replace_all(name, "-").to_lowercase()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_normalization() {
        let name1: PackageName = "Sphinx-RTD_theme".parse().unwrap();
        assert_eq!(name1.as_given_str(), "Sphinx-RTD_theme");
        assert_eq!(name1.as_str(), "sphinx-rtd-theme");

        let name2: PackageName = "sphinx_rtd.theme".parse().unwrap();
        assert_eq!(name1, name2);

        let key: ProjectKey = name1.into();
        assert_eq!(key.as_str(), "sphinx-rtd-theme");
    }

    #[test]
    fn test_rejects_bad_names() {
        assert!("".parse::<PackageName>().is_err());
        assert!("-leading".parse::<PackageName>().is_err());
        assert!("has space".parse::<PackageName>().is_err());
    }

    #[test]
    fn test_normalize_name_runs() {
        assert_eq!(normalize_name("a_-_b"), "a-b");
        assert_eq!(normalize_name("Foo.*"), "foo-*");
    }
}
