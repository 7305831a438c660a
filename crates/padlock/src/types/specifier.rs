use super::version::{ParseVersionError, Version};
use miette::Diagnostic;
use serde_with::{DeserializeFromStr, SerializeDisplay};
use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;

/// A comparison operator in a version specifier.
/// See [PEP 440](https://peps.python.org/pep-0440/#version-specifiers).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum CompareOp {
    LessThanEqual,
    StrictlyLessThan,
    NotEqual,
    Equal,
    GreaterThanEqual,
    StrictlyGreaterThan,
    Compatible,
    ArbitraryEqual,
}

impl Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use CompareOp::*;
        write!(
            f,
            "{}",
            match self {
                LessThanEqual => "<=",
                StrictlyLessThan => "<",
                NotEqual => "!=",
                Equal => "==",
                GreaterThanEqual => ">=",
                StrictlyGreaterThan => ">",
                Compatible => "~=",
                ArbitraryEqual => "===",
            }
        )
    }
}

impl FromStr for CompareOp {
    type Err = ParseSpecifierError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        use CompareOp::*;
        Ok(match value {
            "==" => Equal,
            "!=" => NotEqual,
            "<=" => LessThanEqual,
            "<" => StrictlyLessThan,
            ">=" => GreaterThanEqual,
            ">" => StrictlyGreaterThan,
            "~=" => Compatible,
            "===" => ArbitraryEqual,
            _ => return Err(ParseSpecifierError::UnknownOperator(value.into())),
        })
    }
}

/// Error raised when a specifier fails to parse or validate.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum ParseSpecifierError {
    /// The operator is not one of the eight recognized ones.
    #[error("unrecognized operator '{0}'")]
    UnknownOperator(String),

    /// The version part does not parse.
    #[error("invalid version in specifier: {0}")]
    InvalidVersion(#[from] ParseVersionError),

    /// A wildcard version with an operator other than `==`/`!=`.
    #[error("cannot use wildcard version with operator '{0}'")]
    WildcardNotAllowed(CompareOp),

    /// `~=` needs at least a major and a minor component.
    #[error("operator ~= requires a version with two segments (X.Y)")]
    CompatibleNeedsTwoSegments,

    /// The overall specifier list is malformed.
    #[error("failed to parse version specifiers from '{0}'")]
    InvalidSpecifiers(String),
}

/// A single comparison clause: an operator and a version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Specifier {
    /// The comparison operator.
    pub op: CompareOp,
    /// The parsed version, absent only for `===` clauses whose right-hand
    /// side is not a version at all.
    pub version: Option<Version>,
    /// The right-hand side exactly as written.
    pub raw: Box<str>,
}

impl Specifier {
    /// Validates and builds a clause from an operator and version text.
    pub fn new(op: CompareOp, raw: &str) -> Result<Self, ParseSpecifierError> {
        let raw = raw.trim();
        let version = match Version::from_str(raw) {
            Ok(version) => Some(version),
            Err(err) => {
                if op == CompareOp::ArbitraryEqual {
                    None
                } else {
                    return Err(err.into());
                }
            }
        };
        if let Some(version) = &version {
            if version.is_wildcard()
                && !matches!(op, CompareOp::Equal | CompareOp::NotEqual | CompareOp::ArbitraryEqual)
            {
                return Err(ParseSpecifierError::WildcardNotAllowed(op));
            }
            if op == CompareOp::Compatible && version.len() < 2 {
                return Err(ParseSpecifierError::CompatibleNeedsTwoSegments);
            }
        }
        Ok(Specifier {
            op,
            version,
            raw: raw.into(),
        })
    }

    /// Whether the clause's version carries a pre-release suffix. Drives the
    /// automatic pre-release admission rule.
    pub fn mentions_prerelease(&self) -> bool {
        self.version.as_ref().map_or(false, Version::is_prerelease)
    }

    /// Whether `candidate` satisfies this single clause, pre-release gating
    /// aside.
    pub fn matches(&self, candidate: &Version) -> bool {
        use CompareOp::*;
        let Some(version) = &self.version else {
            // a non-version `===` clause can only match textually
            return candidate.to_string() == self.raw.as_ref();
        };
        if version.is_wildcard() {
            let prefix = version.truncated(version.len() - 1);
            let matched = wildcard_match(candidate, &prefix);
            return match self.op {
                Equal | ArbitraryEqual => matched,
                NotEqual => !matched,
                _ => unreachable!("validated at parse time"),
            };
        }
        let width = version.len().max(candidate.len()).max(3);
        let lhs = candidate.complete_with(0, width);
        let rhs = version.complete_with(0, width);
        match self.op {
            Equal => lhs == rhs,
            ArbitraryEqual => candidate.to_string() == self.raw.as_ref(),
            NotEqual => lhs != rhs,
            LessThanEqual => lhs <= rhs,
            GreaterThanEqual => lhs >= rhs,
            // The exclusive comparison `<V` must not admit a pre-release of V
            // itself unless V is a pre-release.
            StrictlyLessThan => {
                if candidate.is_prerelease()
                    && !version.is_prerelease()
                    && lhs.truncated(width) == rhs.truncated(width)
                {
                    false
                } else {
                    lhs < rhs
                }
            }
            StrictlyGreaterThan => lhs > rhs,
            Compatible => {
                let lower = version.complete();
                let upper = version.bump(-2);
                let lhs = candidate.complete_with(0, 3.max(candidate.len()));
                lhs >= lower && lhs < upper
            }
        }
    }
}

fn wildcard_match(candidate: &Version, prefix: &Version) -> bool {
    let width = prefix.len().max(candidate.len());
    candidate.complete_with(0, width).startswith(prefix)
}

impl Display for Specifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.op, self.raw)
    }
}

/// A comma-separated collection of [`Specifier`] clauses. A version is
/// contained iff every clause admits it. The empty set admits everything.
#[derive(Debug, Clone, Default, SerializeDisplay, DeserializeFromStr)]
pub struct Specifiers(pub Vec<Specifier>);

impl Specifiers {
    /// Whether the set has no clauses and therefore admits every version.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The number of clauses.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether any clause mentions a pre-release version.
    pub fn has_prereleases(&self) -> bool {
        self.0.iter().any(Specifier::mentions_prerelease)
    }

    /// Whether the set pins a single exact version (`==` without wildcard, or
    /// `===`).
    pub fn is_pinned(&self) -> bool {
        if self.0.len() != 1 {
            return false;
        }
        let spec = &self.0[0];
        match spec.op {
            CompareOp::ArbitraryEqual => true,
            CompareOp::Equal => !spec.raw.contains('*'),
            _ => false,
        }
    }

    /// Whether `version` is admitted. `prereleases` controls the admission of
    /// pre-release versions: `Some(flag)` forces a decision, `None` applies
    /// the conventional rule that pre-releases are only admitted when some
    /// clause itself mentions one.
    pub fn contains(&self, version: &Version, prereleases: Option<bool>) -> bool {
        if version.is_prerelease() {
            let allowed = prereleases.unwrap_or_else(|| self.has_prereleases());
            if !allowed {
                return false;
            }
        }
        self.0.iter().all(|spec| spec.matches(version))
    }

    fn normalized_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .0
            .iter()
            .map(|s| (s.raw.to_string(), s.op.to_string()))
            .collect();
        pairs.sort();
        pairs
    }
}

impl PartialEq for Specifiers {
    fn eq(&self, other: &Self) -> bool {
        self.normalized_pairs() == other.normalized_pairs()
    }
}

impl Eq for Specifiers {}

impl std::hash::Hash for Specifiers {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.normalized_pairs().hash(state)
    }
}

impl Display for Specifiers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut clauses: Vec<&Specifier> = self.0.iter().collect();
        clauses.sort_by(|a, b| (a.raw.as_ref(), a.op.to_string()).cmp(&(b.raw.as_ref(), b.op.to_string())));
        let mut first = true;
        for spec in clauses {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{spec}")?;
        }
        Ok(())
    }
}

impl FromStr for Specifiers {
    type Err = ParseSpecifierError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if input.trim().is_empty() || input.trim() == "*" {
            return Ok(Specifiers::default());
        }
        super::reqparse::versionspec(input.trim())
            .map_err(|_| ParseSpecifierError::InvalidSpecifiers(input.to_string()))?
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    fn specs(s: &str) -> Specifiers {
        s.parse().unwrap()
    }

    #[test]
    fn test_simple_containment() {
        let s = specs(">=1.0,<2.0");
        assert!(s.contains(&v("1.5"), None));
        assert!(s.contains(&v("1.0"), None));
        assert!(!s.contains(&v("2.0"), None));
        assert!(!s.contains(&v("0.9"), None));
    }

    #[test]
    fn test_wildcard() {
        let s = specs("==2.2.*");
        assert!(s.contains(&v("2.2"), None));
        assert!(s.contains(&v("2.2.9"), None));
        assert!(!s.contains(&v("2.3"), None));

        let s = specs("!=2.2.*");
        assert!(!s.contains(&v("2.2.9"), None));
        assert!(s.contains(&v("2.3"), None));

        assert!("<2.2.*".parse::<Specifiers>().is_err());
    }

    #[test]
    fn test_compatible_release() {
        let s = specs("~=1.1");
        assert!(s.contains(&v("1.1"), None));
        assert!(s.contains(&v("1.5"), None));
        assert!(!s.contains(&v("2.0"), None));

        let s = specs("~=1.4.2");
        assert!(s.contains(&v("1.4.3"), None));
        assert!(!s.contains(&v("1.5"), None));

        assert!("~=2".parse::<Specifiers>().is_err());
    }

    #[test]
    fn test_prerelease_gating() {
        let s = specs(">=1.0");
        assert!(!s.contains(&v("1.1a1"), None));
        assert!(s.contains(&v("1.1a1"), Some(true)));

        // a clause mentioning a pre-release opts in automatically
        let s = specs(">=2.20.0b0");
        assert!(s.contains(&v("2.20.0b1"), None));

        // `<2.0` does not admit a pre-release of 2.0 itself
        let s = specs("<2.0");
        assert!(!s.contains(&v("2.0a1"), Some(true)));
        assert!(s.contains(&v("1.9a1"), Some(true)));
    }

    #[test]
    fn test_exact_pin() {
        assert!(specs("==1.4.2").is_pinned());
        assert!(!specs("==1.4.*").is_pinned());
        assert!(!specs(">=1.4").is_pinned());
        let s = specs("==1.1.0a0");
        assert!(s.contains(&v("1.1.0a0"), None));
    }

    #[test]
    fn test_roundtrip() {
        for text in [">=1.0,<2.0", "==2.2.*", "~=3.1", "!=1.1,!=1.2,>=1.0"] {
            let parsed = specs(text);
            assert_eq!(parsed, specs(&parsed.to_string()));
        }
        assert_eq!(specs("").to_string(), "");
    }
}
