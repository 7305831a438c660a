use miette::Diagnostic;
use regex::Regex;
use serde::{Serialize, Serializer};
use serde_with::DeserializeFromStr;
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

/// The name of an "extra": an optional feature of a distribution that pulls
/// in additional dependencies. Stores the given spelling together with the
/// normalized form (PEP 685), which drives equality and ordering.
#[derive(Debug, Clone, Eq, DeserializeFromStr)]
pub struct Extra {
    given: Box<str>,
    canonical: Box<str>,
}

impl Extra {
    /// The spelling this extra was created from.
    pub fn as_given_str(&self) -> &str {
        self.given.as_ref()
    }

    /// The normalized extra name.
    pub fn as_str(&self) -> &str {
        self.canonical.as_ref()
    }
}

/// Error raised for a string that is not a valid extra name.
#[derive(Debug, Clone, Error, Diagnostic)]
#[error("invalid extra name '{0}'")]
pub struct ParseExtraError(pub String);

impl FromStr for Extra {
    type Err = ParseExtraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        static VALID_EXTRA: OnceLock<Regex> = OnceLock::new();
        let valid_extra = VALID_EXTRA.get_or_init(|| {
            Regex::new(r"(?i-u)^([A-Z0-9]|[A-Z0-9][A-Z0-9._-]*[A-Z0-9])$").unwrap()
        });
        if !valid_extra.is_match(s) {
            return Err(ParseExtraError(s.into()));
        }

        let mut canonical = s.replace(['-', '_', '.'], "-");
        canonical.make_ascii_lowercase();

        Ok(Extra {
            given: s.to_owned().into_boxed_str(),
            canonical: canonical.into_boxed_str(),
        })
    }
}

impl Display for Extra {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.given)
    }
}

impl Hash for Extra {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state)
    }
}

impl PartialEq for Extra {
    fn eq(&self, other: &Self) -> bool {
        self.canonical.eq(&other.canonical)
    }
}

impl PartialOrd for Extra {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Extra {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl Serialize for Extra {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.given.as_ref().serialize(serializer)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_extra_normalization() {
        let a: Extra = "Socks_Proxy".parse().unwrap();
        let b: Extra = "socks-proxy".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "socks-proxy");
        assert_eq!(a.as_given_str(), "Socks_Proxy");
    }
}
