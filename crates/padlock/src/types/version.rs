use miette::Diagnostic;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_with::{DeserializeFromStr, SerializeDisplay};
use smallvec::{smallvec, SmallVec};
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// One release component of a [`Version`]: either a concrete number or the
/// trailing `*` wildcard. The wildcard is only valid as the last component.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum VersionBit {
    /// A concrete release number. Signed so the `MIN` sentinel can sit below
    /// every real version.
    Int(i64),
    /// The trailing `*` of specifiers like `3.7.*`.
    Wildcard,
}

impl Display for VersionBit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionBit::Int(n) => write!(f, "{n}"),
            VersionBit::Wildcard => write!(f, "*"),
        }
    }
}

/// Pre-release phase tag. Ordering follows the first letter of the spelling,
/// so `a < b < rc`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PreTag {
    /// `aN` alpha pre-releases.
    Alpha,
    /// `bN` beta pre-releases.
    Beta,
    /// `rcN` release candidates.
    Rc,
}

impl PreTag {
    fn as_str(self) -> &'static str {
        match self {
            PreTag::Alpha => "a",
            PreTag::Beta => "b",
            PreTag::Rc => "rc",
        }
    }
}

/// A loose version with at most three release components, an optional
/// pre-release suffix and an optional trailing wildcard. This is the version
/// model used for specifier arithmetic; it intentionally rejects post- and
/// dev-release notation.
#[derive(Debug, Clone, Eq, PartialEq, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct Version {
    bits: SmallVec<[VersionBit; 3]>,
    pre: Option<(PreTag, u64)>,
}

/// The smallest sentinel version, below every real release.
pub static VERSION_MIN: Lazy<Version> = Lazy::new(|| Version::from_bits([-1, -1, -1]));

/// The largest sentinel version, above every real release.
pub static VERSION_MAX: Lazy<Version> = Lazy::new(|| Version::from_bits([99, 99, 99]));

/// Error raised when parsing a version string fails.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum ParseVersionError {
    /// Post-releases and dev-releases are outside this model.
    #[error("{0}: postreleases are not supported for python version specifiers")]
    UnsupportedSegment(String),
    /// The string is empty or otherwise malformed.
    #[error("invalid version '{0}'")]
    Invalid(String),
}

static PRE_SEGMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?P<digit>\d+)(?P<tag>a|b|rc)(?P<n>\d*)$").unwrap());

impl Version {
    /// Builds a version from concrete release numbers.
    pub fn from_bits(bits: impl IntoIterator<Item = i64>) -> Self {
        Self {
            bits: bits.into_iter().map(VersionBit::Int).collect(),
            pre: None,
        }
    }

    /// The release components.
    pub fn bits(&self) -> &[VersionBit] {
        &self.bits
    }

    /// The number of release components present.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// Whether the version has no release components.
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// The pre-release suffix, if any.
    pub fn pre(&self) -> Option<(PreTag, u64)> {
        self.pre
    }

    /// The component at `idx` as a concrete number, or `None` for a wildcard
    /// or out-of-range index.
    pub fn bit(&self, idx: usize) -> Option<i64> {
        match self.bits.get(idx) {
            Some(VersionBit::Int(n)) => Some(*n),
            _ => None,
        }
    }

    /// Whether the version ends in the `*` wildcard.
    pub fn is_wildcard(&self) -> bool {
        matches!(self.bits.last(), Some(VersionBit::Wildcard))
    }

    /// Whether the version carries a pre-release suffix.
    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some()
    }

    /// Whether the major component is 2.
    pub fn is_py2(&self) -> bool {
        self.bit(0) == Some(2)
    }

    /// Pads the version with `fill` until it has `max_bits` components. The
    /// pre-release suffix is preserved.
    pub fn complete_with(&self, fill: i64, max_bits: usize) -> Version {
        debug_assert!(self.bits.len() <= max_bits, "{self} has too many bits");
        let mut bits = self.bits.clone();
        while bits.len() < max_bits {
            bits.push(VersionBit::Int(fill));
        }
        Version { bits, pre: self.pre }
    }

    /// Pads the version with zeros to three components.
    pub fn complete(&self) -> Version {
        self.complete_with(0, 3)
    }

    /// Increments the component at `idx` (Python-style, negative counts from
    /// the end), truncates everything after it and completes with zeros. With
    /// the default index of `-1` a pre-release version instead bumps its
    /// pre-release number.
    pub fn bump(&self, idx: isize) -> Version {
        if idx == -1 {
            if let Some((tag, n)) = self.pre {
                let mut ret = self.complete();
                ret.pre = Some((tag, n + 1));
                return ret;
            }
        }
        let len = self.bits.len();
        let at = if idx < 0 {
            len.checked_sub(idx.unsigned_abs())
                .expect("bump index out of range")
        } else {
            idx as usize
        };
        let value = match self.bits[at] {
            VersionBit::Int(n) => n,
            VersionBit::Wildcard => panic!("cannot bump a wildcard bit"),
        };
        let mut bits: SmallVec<[VersionBit; 3]> = self.bits[..at].into();
        bits.push(VersionBit::Int(value + 1));
        Version { bits, pre: None }.complete()
    }

    /// Whether this version begins with all components of `other`.
    pub fn startswith(&self, other: &Version) -> bool {
        other.bits.len() <= self.bits.len() && self.bits[..other.bits.len()] == other.bits[..]
    }

    /// The first `n` components as a new version.
    pub fn truncated(&self, n: usize) -> Version {
        Version {
            bits: self.bits[..n.min(self.bits.len())].into(),
            pre: None,
        }
    }

    fn comp_key(&self) -> impl Iterator<Item = KeyElem> + '_ {
        let tail: SmallVec<[KeyElem; 2]> = match self.pre {
            Some((tag, n)) => {
                let ch = tag.as_str().as_bytes()[0] as i64;
                smallvec![KeyElem::Int(ch), KeyElem::Int(n as i64)]
            }
            None => smallvec![KeyElem::Inf],
        };
        self.bits
            .iter()
            .map(|bit| match bit {
                VersionBit::Int(n) => KeyElem::Int(*n),
                VersionBit::Wildcard => KeyElem::Int(-1),
            })
            .chain(tail)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum KeyElem {
    Int(i64),
    Inf,
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.comp_key().cmp(other.comp_key())
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for Version {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(ParseVersionError::Invalid(s.into()));
        }
        // `3.7*` is accepted as a sloppy spelling of `3.7.*`
        let mut normalized = String::with_capacity(s.len() + 1);
        let mut prev = None;
        for ch in s.trim().chars() {
            if ch == '*' && prev != Some('.') && prev.is_some() {
                normalized.push('.');
            }
            normalized.push(ch);
            prev = Some(ch);
        }

        let mut bits: SmallVec<[VersionBit; 3]> = SmallVec::new();
        let mut pre = None;
        for part in normalized.split('.').take(3) {
            if let Ok(n) = part.parse::<i64>() {
                bits.push(VersionBit::Int(n));
            } else if part == "*" {
                // `.*` is only allowed at the end, per PEP 440
                bits.push(VersionBit::Wildcard);
                break;
            } else if let Some(m) = PRE_SEGMENT_RE.captures(part) {
                bits.push(VersionBit::Int(
                    m.name("digit").unwrap().as_str().parse().unwrap(),
                ));
                let tag = match m.name("tag").unwrap().as_str().to_ascii_lowercase().as_str() {
                    "a" => PreTag::Alpha,
                    "b" => PreTag::Beta,
                    _ => PreTag::Rc,
                };
                let n = m.name("n").unwrap().as_str();
                pre = Some((tag, if n.is_empty() { 0 } else { n.parse().unwrap() }));
                break; // a pre-release segment terminates the version
            } else {
                return Err(ParseVersionError::UnsupportedSegment(normalized.clone()));
            }
        }
        if bits.is_empty() {
            return Err(ParseVersionError::Invalid(s.into()));
        }
        Ok(Version { bits, pre })
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for bit in &self.bits {
            if !first {
                write!(f, ".")?;
            }
            first = false;
            write!(f, "{bit}")?;
        }
        if let Some((tag, n)) = self.pre {
            write!(f, "{}{}", tag.as_str(), n)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!(v("3.7").to_string(), "3.7");
        assert_eq!(v("3.7.*").to_string(), "3.7.*");
        assert_eq!(v("3.7*").to_string(), "3.7.*");
        assert_eq!(v("3.10.0rc1").to_string(), "3.10.0rc1");
        assert_eq!(v("1.1.0A1").to_string(), "1.1.0a1");
        assert_eq!(v("1.1.0b").to_string(), "1.1.0b0");
        assert!("3.8.post1".parse::<Version>().is_err());
        assert!("".parse::<Version>().is_err());
    }

    #[test]
    fn test_ordering() {
        assert!(v("2.7.15") < v("3"));
        assert!(v("3.6") < v("3.7"));
        assert!(v("3.6.*") < v("3.6.0"));
        assert!(v("3.7.0a1") < v("3.7.0"));
        assert!(v("3.7.0a2") < v("3.7.0b1"));
        assert!(v("3.7.0b2") < v("3.7.0rc1"));
        assert!(*VERSION_MIN < v("0"));
        assert!(v("42") < *VERSION_MAX);
        // an incomplete version sorts above its completed form
        assert!(v("3.6.0") < v("3.6"));
    }

    #[test]
    fn test_complete_and_bump() {
        assert_eq!(v("3.7").complete(), v("3.7.0"));
        assert_eq!(v("3.7.1").bump(-1), v("3.7.2"));
        assert_eq!(v("3.7.1").bump(-2), v("3.8.0"));
        assert_eq!(v("3.7.1").bump(0), v("4.0.0"));
        let pre = v("3.7.0a1").bump(-1);
        assert_eq!(pre.to_string(), "3.7.0a2");
    }

    #[test]
    fn test_startswith() {
        assert!(v("3.7.2").startswith(&v("3.7")));
        assert!(!v("3.17").startswith(&v("3.1")));
        assert!(v("3.7.*").startswith(&v("3.7")));
    }
}
