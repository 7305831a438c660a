use super::specifier::{CompareOp, ParseSpecifierError, Specifiers};
use super::version::{Version, VERSION_MAX, VERSION_MIN};
use miette::Diagnostic;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::ops::{BitAnd, BitOr};
use std::str::FromStr;
use thiserror::Error;

/// The last patch release published for each historic interpreter series.
/// Used to materialize the gap when two disjoint ranges are unioned.
static MAX_PY_VERSIONS: Lazy<HashMap<(i64, Option<i64>), i64>> = Lazy::new(|| {
    HashMap::from([
        ((2, None), 7),
        ((2, Some(0)), 1),
        ((2, Some(1)), 3),
        ((2, Some(2)), 3),
        ((2, Some(3)), 7),
        ((2, Some(4)), 6),
        ((2, Some(5)), 6),
        ((2, Some(6)), 9),
        ((2, Some(7)), 18),
        ((3, Some(0)), 1),
        ((3, Some(1)), 5),
        ((3, Some(2)), 6),
        ((3, Some(3)), 7),
        ((3, Some(4)), 10),
        ((3, Some(5)), 10),
        ((3, Some(6)), 10),
        ((3, Some(7)), 6),
    ])
});

fn max_patch(major: i64, minor: i64) -> Option<i64> {
    MAX_PY_VERSIONS.get(&(major, Some(minor))).copied()
}

fn max_minor(major: i64) -> Option<i64> {
    MAX_PY_VERSIONS.get(&(major, None)).copied()
}

/// Error raised when a python version specifier cannot be analyzed.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum ParsePySpecError {
    /// Not a valid specifier list at all.
    #[error(transparent)]
    InvalidSpecifier(#[from] ParseSpecifierError),

    /// Pre-releases cannot appear in python version constraints.
    #[error("{0}: prereleases are not supported for python version specifiers")]
    PrereleaseNotAllowed(String),
}

/// A normalized set of python interpreter versions: an inclusive lower bound,
/// an exclusive upper bound, and a list of excluded versions, each possibly a
/// wildcard. The algebra supports intersection, union, and subset/superset
/// tests, and the set can be rendered back into a PEP 508 marker expression.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    serde_with::SerializeDisplay,
    serde_with::DeserializeFromStr,
)]
pub struct PySpecSet {
    lower: Version,
    upper: Version,
    excludes: Vec<Version>,
    impossible: bool,
}

impl Default for PySpecSet {
    fn default() -> Self {
        Self::allow_all()
    }
}

impl PySpecSet {
    /// The universal set.
    pub fn allow_all() -> Self {
        PySpecSet {
            lower: VERSION_MIN.clone(),
            upper: VERSION_MAX.clone(),
            excludes: Vec::new(),
            impossible: false,
        }
    }

    /// The empty set.
    pub fn impossible() -> Self {
        PySpecSet {
            lower: VERSION_MAX.clone(),
            upper: VERSION_MIN.clone(),
            excludes: Vec::new(),
            impossible: true,
        }
    }

    /// Whether no version at all is contained.
    pub fn is_impossible(&self) -> bool {
        self.impossible
    }

    /// Whether every version is contained.
    pub fn is_allow_all(&self) -> bool {
        !self.impossible
            && self.lower == *VERSION_MIN
            && self.upper == *VERSION_MAX
            && self.excludes.is_empty()
    }

    /// The inclusive lower bound.
    pub fn lower(&self) -> &Version {
        &self.lower
    }

    /// The exclusive upper bound.
    pub fn upper(&self) -> &Version {
        &self.upper
    }

    /// Builds a set from an already-parsed specifier list.
    pub fn from_specifiers(specifiers: &Specifiers) -> Result<Self, ParsePySpecError> {
        let mut lower = VERSION_MIN.clone();
        let mut upper = VERSION_MAX.clone();
        let mut excludes: Vec<Version> = Vec::new();

        for spec in &specifiers.0 {
            let Some(version) = spec.version.clone() else {
                continue;
            };
            if version.is_prerelease() {
                return Err(ParsePySpecError::PrereleaseNotAllowed(spec.to_string()));
            }
            let mut op = spec.op;
            let mut version = version;
            if version.is_wildcard() {
                match op {
                    CompareOp::Equal | CompareOp::ArbitraryEqual => {
                        // ==X.Y.* is the same as ~=X.Y.0
                        op = CompareOp::Compatible;
                        let mut prefix = version.truncated(version.len() - 1);
                        prefix = prefix.complete_with(0, prefix.len() + 1);
                        version = prefix;
                    }
                    CompareOp::NotEqual => {
                        push_unique(&mut excludes, version);
                        continue;
                    }
                    _ => unreachable!("validated by the specifier parser"),
                }
            }
            match op {
                CompareOp::Equal | CompareOp::ArbitraryEqual => {
                    // ==X.Y admits the whole X.Y series
                    lower = version.complete();
                    upper = version.bump(-1);
                    break;
                }
                CompareOp::NotEqual => push_unique(&mut excludes, version.complete()),
                CompareOp::GreaterThanEqual => {
                    lower = lower.max(version.complete());
                }
                CompareOp::StrictlyGreaterThan => {
                    lower = lower.max(version.complete().bump(-1));
                }
                CompareOp::LessThanEqual => {
                    upper = upper.min(version.complete().bump(-1));
                }
                CompareOp::StrictlyLessThan => {
                    upper = upper.min(version.complete());
                }
                CompareOp::Compatible => {
                    lower = lower.max(version.complete());
                    upper = upper.min(version.bump(-2));
                }
            }
        }

        let mut ret = PySpecSet {
            lower: VERSION_MIN.clone(),
            upper: VERSION_MAX.clone(),
            excludes: Vec::new(),
            impossible: false,
        };
        ret.merge_bounds_and_excludes(lower, upper, excludes);
        Ok(ret)
    }

    /// Normalizes bounds and exclusions: wildcard excludes are folded before
    /// concrete ones, excludes outside `[lower, upper)` are dropped, and
    /// excludes touching a bound move the bound instead.
    fn merge_bounds_and_excludes(
        &mut self,
        mut lower: Version,
        mut upper: Version,
        excludes: Vec<Version>,
    ) {
        let mut sorted_excludes = excludes;
        // wildcard constraints sort before concrete ones
        sorted_excludes.sort();
        sorted_excludes.dedup();

        if lower == *VERSION_MIN && upper == *VERSION_MAX {
            // unbounded on both sides, nothing to normalize against
            self.lower = lower;
            self.upper = upper;
            self.excludes = sorted_excludes;
            self.impossible = false;
            return;
        }

        let mut kept: Vec<Version> = Vec::new();
        let mut wildcard_prefixes: Vec<Version> = Vec::new();
        for version in sorted_excludes {
            if wildcard_prefixes.iter().any(|w| version.startswith(w)) {
                continue;
            }
            if version.is_wildcard() {
                let prefix = version.truncated(version.len() - 1);
                let plen = prefix.len();
                wildcard_prefixes.push(prefix.clone());
                let cmp_lower = lower.truncated(plen);
                let cmp_upper = upper.truncated(plen);
                if prefix < cmp_lower || prefix > cmp_upper {
                    // outside the bounds entirely
                    continue;
                } else if lower.startswith(&prefix) {
                    lower = version.bump(-2);
                } else if upper.startswith(&prefix) {
                    upper = prefix.complete();
                } else {
                    kept.push(version);
                }
            } else if version < lower || version >= upper {
                continue;
            } else if version == lower {
                lower = version.bump(-1);
            } else {
                kept.push(version);
            }
        }

        self.impossible =
            lower != *VERSION_MIN && upper != *VERSION_MAX && lower >= upper;
        self.lower = lower;
        self.upper = upper;
        self.excludes = if self.impossible { Vec::new() } else { kept };
    }

    /// Whether `version` (a python version string) is contained.
    pub fn contains(&self, version: &Version, include_prereleases: bool) -> bool {
        if self.impossible {
            return false;
        }
        if version.is_prerelease() && !include_prereleases {
            return false;
        }
        let completed = version.complete_with(0, 3.max(version.len()));
        if completed < self.lower || completed >= self.upper {
            return false;
        }
        !self.excludes.iter().any(|exclude| {
            if exclude.is_wildcard() {
                completed.startswith(&exclude.truncated(exclude.len() - 1))
            } else {
                completed == *exclude
            }
        })
    }

    /// Whether `self` contains every version of `other`.
    pub fn is_superset(&self, other: &PySpecSet) -> bool {
        if self.impossible {
            return false;
        }
        if self.is_allow_all() {
            return true;
        }
        if other.impossible {
            return false;
        }
        if self.lower > other.lower || self.upper < other.upper {
            return false;
        }
        restrict_to_range(&self.excludes, &other.lower, &other.upper)
            .all(|v| other.excludes.contains(v))
    }

    /// Whether every version of `self` is contained in `other`.
    pub fn is_subset(&self, other: &PySpecSet) -> bool {
        if self.impossible {
            return false;
        }
        if other.is_allow_all() {
            return true;
        }
        if other.impossible {
            return false;
        }
        if self.lower < other.lower || self.upper > other.upper {
            return false;
        }
        restrict_to_range(&other.excludes, &self.lower, &self.upper)
            .all(|v| self.excludes.contains(v))
    }

    /// The highest `(major, minor)` admitted, or `None` when unbounded.
    pub fn max_major_minor(&self) -> Option<(i64, i64)> {
        if self.upper == *VERSION_MAX {
            return None;
        }
        let major = self.upper.bit(0)?;
        let minor = self.upper.bit(1)?;
        if self.upper.bit(2) == Some(0) {
            Some((major, minor - 1))
        } else {
            Some((major, minor))
        }
    }

    /// Whether any 2.x interpreter is admitted.
    pub fn supports_py2(&self) -> bool {
        !self.impossible && self.lower.bit(0).map_or(true, |major| major < 3)
    }

    /// The `(op, version)` clauses equivalent to the normalized set, in the
    /// order they are displayed.
    fn clauses(&self) -> Vec<(CompareOp, String)> {
        let mut out = Vec::new();
        if self.lower != *VERSION_MIN {
            out.push((CompareOp::GreaterThanEqual, trim_zero(&self.lower)));
        }
        if self.upper != *VERSION_MAX {
            out.push((CompareOp::StrictlyLessThan, trim_zero(&self.upper)));
        }
        for exclude in &self.excludes {
            out.push((CompareOp::NotEqual, exclude.to_string()));
        }
        out
    }

    /// Renders the set as a PEP 508 marker expression over `python_version`
    /// and `python_full_version`, using `not in` lists for exclusions.
    pub fn as_marker_string(&self) -> String {
        if self.is_allow_all() || self.impossible {
            return String::new();
        }
        let mut parts: Vec<String> = Vec::new();
        let mut excludes: Vec<String> = Vec::new();
        let mut full_excludes: Vec<String> = Vec::new();
        let mut clauses = self.clauses();
        clauses.sort_by(|a, b| a.1.cmp(&b.1));
        for (op, version) in clauses {
            let (key, version) = if version.split('.').count() < 3 {
                ("python_version", version)
            } else if let Some(stripped) = version.strip_suffix(".*") {
                ("python_version", stripped.to_string())
            } else {
                ("python_full_version", version)
            };
            if op == CompareOp::NotEqual {
                if key == "python_version" {
                    excludes.push(version);
                } else {
                    full_excludes.push(version);
                }
            } else {
                parts.push(format!("{key}{op}'{version}'"));
            }
        }
        if !excludes.is_empty() {
            excludes.sort();
            parts.push(format!("python_version not in '{}'", excludes.join(", ")));
        }
        if !full_excludes.is_empty() {
            full_excludes.sort();
            parts.push(format!(
                "python_full_version not in '{}'",
                full_excludes.join(", ")
            ));
        }
        parts.join(" and ")
    }

    /// Yields the versions filling the gap `[lower, upper)`, preferring
    /// wildcards where a whole series is covered and falling back to the
    /// max-patch table for partial series.
    fn populate_version_range(lower: &Version, upper: &Version) -> Vec<Version> {
        debug_assert!(lower < upper);
        let mut out = Vec::new();
        let mut prev = lower.clone();
        while &prev < upper {
            let (major, minor, patch) = (
                prev.bit(0).unwrap_or(0),
                prev.bit(1).unwrap_or(0),
                prev.bit(2).unwrap_or(0),
            );
            if minor == 0 && patch == 0 {
                let cur = prev.bump(0);
                if &cur <= upper {
                    // the whole X series is gone
                    out.push(wildcard(&[major]));
                    prev = cur;
                    continue;
                }
            }
            if patch == 0 {
                let cur = prev.bump(-2);
                if &cur <= upper {
                    // the whole X.Y series is gone
                    out.push(wildcard(&[major, minor]));
                    prev = advance_series(&prev, cur);
                    continue;
                }
                while &prev < upper {
                    out.push(prev.clone());
                    prev = prev.bump(-1);
                }
                break;
            }
            // a partial X.Y series, no wildcard available
            let cur = prev.bump(-2);
            if &cur <= upper {
                let last = max_patch(major, minor).unwrap_or(patch);
                for z in patch..=last {
                    out.push(Version::from_bits([major, minor, z]));
                }
                prev = advance_series(&prev, cur);
            } else {
                while &prev < upper {
                    out.push(prev.clone());
                    prev = prev.bump(-1);
                }
                break;
            }
        }
        out
    }
}

/// Moves to the next series after `prev`, skipping from 2.7 straight to 3.0.
fn advance_series(prev: &Version, cur: Version) -> Version {
    let major = cur.bit(0).unwrap_or(0);
    let minor = cur.bit(1).unwrap_or(0);
    if major < 3 && max_minor(major).map_or(false, |m| minor > m) {
        prev.bump(0)
    } else {
        cur
    }
}

fn wildcard(bits: &[i64]) -> Version {
    format!(
        "{}.*",
        bits.iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join(".")
    )
    .parse()
    .expect("wildcard versions always parse")
}

fn push_unique(excludes: &mut Vec<Version>, version: Version) {
    if !excludes.contains(&version) {
        excludes.push(version);
    }
}

fn trim_zero(version: &Version) -> String {
    if version.bit(version.len() - 1) == Some(0) {
        version.truncated(version.len() - 1).to_string()
    } else {
        version.to_string()
    }
}

fn restrict_to_range<'a>(
    versions: &'a [Version],
    lower: &'a Version,
    upper: &'a Version,
) -> impl Iterator<Item = &'a Version> {
    versions.iter().filter(move |v| {
        // wildcard matches always count as inside the range
        v.is_wildcard() || (*v >= lower && *v < upper)
    })
}

impl BitAnd for &PySpecSet {
    type Output = PySpecSet;

    fn bitand(self, other: &PySpecSet) -> PySpecSet {
        if self.impossible || other.impossible {
            return PySpecSet::impossible();
        }
        if self.is_allow_all() {
            return other.clone();
        }
        if other.is_allow_all() {
            return self.clone();
        }
        let mut excludes = self.excludes.clone();
        for e in &other.excludes {
            push_unique(&mut excludes, e.clone());
        }
        let lower = self.lower.clone().max(other.lower.clone());
        let upper = self.upper.clone().min(other.upper.clone());
        let mut ret = PySpecSet::allow_all();
        ret.merge_bounds_and_excludes(lower, upper, excludes);
        ret
    }
}

impl BitOr for &PySpecSet {
    type Output = PySpecSet;

    fn bitor(self, other: &PySpecSet) -> PySpecSet {
        if self.impossible {
            return other.clone();
        }
        if other.impossible {
            return self.clone();
        }
        if self.is_allow_all() || other.is_allow_all() {
            return PySpecSet::allow_all();
        }
        let (left, right) = if self.lower <= other.lower {
            (self, other)
        } else {
            (other, self)
        };
        let mut excludes: Vec<Version> = left
            .excludes
            .iter()
            .filter(|e| right.excludes.contains(e))
            .cloned()
            .collect();
        let lower = left.lower.clone();
        let upper = left.upper.clone().max(right.upper.clone());
        if right.lower > left.upper {
            // disjoint ranges: the gap becomes explicit exclusions
            for v in PySpecSet::populate_version_range(&left.upper, &right.lower) {
                push_unique(&mut excludes, v);
            }
        }
        let mut ret = PySpecSet::allow_all();
        ret.merge_bounds_and_excludes(lower, upper, excludes);
        ret
    }
}

impl FromStr for PySpecSet {
    type Err = ParsePySpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let specifiers: Specifiers = s.parse().map_err(ParsePySpecError::InvalidSpecifier)?;
        Self::from_specifiers(&specifiers)
    }
}

impl Display for PySpecSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.impossible {
            return write!(f, "impossible");
        }
        if self.is_allow_all() {
            return Ok(());
        }
        let mut first = true;
        for (op, version) in self.clauses() {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{op}{version}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    fn pyspec(s: &str) -> PySpecSet {
        s.parse().unwrap()
    }

    #[rstest]
    #[case(">=3.6", ">=3.6")]
    #[case(">=3.6,<4.0", ">=3.6,<4.0")]
    #[case("", "")]
    #[case("==3.8", ">=3.8,<3.9")]
    #[case("~=3.7", ">=3.7,<4.0")]
    #[case("==3.7.*", ">=3.7,<3.8")]
    #[case(">3.7", ">=3.7.1")]
    #[case("<=3.8", "<3.8.1")]
    #[case(">=3.6,!=3.8.*", ">=3.6,!=3.8.*")]
    #[case(">=3.6,>=3.7", ">=3.7")]
    fn test_normalization(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(pyspec(input).to_string(), expected);
    }

    #[test]
    fn test_exclude_folds_into_bound() {
        // an exclusion covering the lower bound bumps the bound past it
        assert_eq!(pyspec(">=3.6,!=3.6.*").to_string(), ">=3.7");
        assert_eq!(pyspec(">=3.6.0,!=3.6.0").to_string(), ">=3.6.1");
        // exclusions outside the range disappear
        assert_eq!(pyspec(">=3.7,!=3.6.2").to_string(), ">=3.7");
    }

    #[test]
    fn test_impossible() {
        assert!(pyspec(">=3.7,<3.6").is_impossible());
        assert!(!pyspec(">=3.6").is_impossible());
        assert!(!PySpecSet::allow_all().is_impossible());
        assert_eq!(pyspec(">=3.7,<3.6").to_string(), "impossible");
    }

    #[test]
    fn test_intersection() {
        let a = pyspec(">=3.6");
        let b = pyspec("<3.8");
        assert_eq!((&a & &b).to_string(), ">=3.6,<3.8");

        let c = pyspec(">=3.8");
        assert!((&b & &c).is_impossible());

        assert_eq!((&a & &PySpecSet::allow_all()), a);
    }

    #[test]
    fn test_union_overlapping() {
        let a = pyspec(">=3.6,<3.8");
        let b = pyspec(">=3.7,<3.10");
        assert_eq!((&a | &b).to_string(), ">=3.6,<3.10");
    }

    #[test]
    fn test_union_gap_populates_excludes() {
        // the gap between 3.6.5 and 3.7 becomes explicit patch exclusions
        let a = pyspec("<3.6.5");
        let b = pyspec(">=3.7");
        let merged = &a | &b;
        assert_eq!(
            merged.to_string(),
            "!=3.6.5,!=3.6.6,!=3.6.7,!=3.6.8,!=3.6.9,!=3.6.10"
        );
        // whole series collapse into wildcards
        let a = pyspec("<3.6");
        let b = pyspec(">=3.8");
        assert_eq!((&a | &b).to_string(), "!=3.6.*,!=3.7.*");
    }

    #[test]
    fn test_subset_superset() {
        let wide = pyspec(">=3.6");
        let narrow = pyspec(">=3.7,<3.10");
        assert!(wide.is_superset(&narrow));
        assert!(narrow.is_subset(&wide));
        assert!(!narrow.is_superset(&wide));
        assert!(PySpecSet::allow_all().is_superset(&narrow));
        assert!(!pyspec(">=3.6,!=3.8.*").is_superset(&narrow));
    }

    #[test]
    fn test_contains() {
        let s = pyspec(">=3.6,!=3.8.*");
        assert!(s.contains(&"3.7.4".parse().unwrap(), true));
        assert!(s.contains(&"3.6".parse().unwrap(), true));
        assert!(!s.contains(&"3.8.2".parse().unwrap(), true));
        assert!(!s.contains(&"2.7".parse().unwrap(), true));
        assert!(s.contains(&"3.10.0rc1".parse().unwrap(), true));
        assert!(!s.contains(&"3.10.0rc1".parse().unwrap(), false));
    }

    #[test]
    fn test_as_marker_string() {
        assert_eq!(pyspec(">=3.6").as_marker_string(), "python_version>='3.6'");
        assert_eq!(
            pyspec(">=3.6.1").as_marker_string(),
            "python_full_version>='3.6.1'"
        );
        assert_eq!(
            pyspec(">=3.6,!=3.8.*").as_marker_string(),
            "python_version>='3.6' and python_version not in '3.8'"
        );
        assert_eq!(PySpecSet::allow_all().as_marker_string(), "");
    }

    #[test]
    fn test_max_major_minor() {
        assert_eq!(pyspec("<3.11").max_major_minor(), Some((3, 10)));
        assert_eq!(pyspec("<=3.11").max_major_minor(), Some((3, 11)));
        assert_eq!(pyspec(">=3.6").max_major_minor(), None);
        assert!(pyspec("<3.0").supports_py2());
        assert!(!pyspec(">=3.6").supports_py2());
    }

    #[test]
    fn test_partition_identity() {
        // (a ∩ b) ∪ (a ∩ ¬b) == a, with ¬b expressed through exclusions
        let a = pyspec(">=3.6,<3.10");
        let b = pyspec(">=3.6,<3.8");
        let not_b = pyspec(">=3.8");
        let merged = &(&a & &b) | &(&a & &not_b);
        assert_eq!(merged, a);
    }
}
