use super::artifact_name::{WheelFilename, WheelTag};
use super::marker::Marker;
use super::pyspec::PySpecSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

/// Describes a target resolution environment: the admitted interpreter
/// versions, the platform tags, and the ABI tags. Wheel compatibility is
/// scored against this; `None` means the wheel cannot run there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvSpec {
    /// The interpreter versions the resolution targets.
    pub requires_python: PySpecSet,

    /// Platform tags in preference order, most specific first. Empty means
    /// any platform (a cross-platform lock).
    #[serde(default)]
    pub platforms: Vec<String>,

    /// ABI tags in preference order. Empty means any ABI.
    #[serde(default)]
    pub abis: Vec<String>,

    /// The implementation tag prefix, e.g. `cp` for CPython.
    #[serde(default = "default_implementation")]
    pub implementation: String,
}

fn default_implementation() -> String {
    "cp".to_string()
}

impl EnvSpec {
    /// A spec admitting every environment, for cross-platform locks.
    pub fn allow_all() -> Self {
        EnvSpec {
            requires_python: PySpecSet::allow_all(),
            platforms: Vec::new(),
            abis: Vec::new(),
            implementation: default_implementation(),
        }
    }

    /// A spec constrained only by interpreter versions.
    pub fn from_requires_python(requires_python: PySpecSet) -> Self {
        EnvSpec {
            requires_python,
            ..EnvSpec::allow_all()
        }
    }

    /// Whether the interpreter tag (e.g. `py3`, `cp311`) can match an
    /// interpreter in our range. Returns a specificity score: generic major
    /// tags score lowest, exact `cp` tags highest.
    fn interpreter_score(&self, tag: &str) -> Option<i32> {
        let alpha_len = tag.find(|c: char| c.is_ascii_digit())?;
        let (prefix, digits) = tag.split_at(alpha_len);
        if digits.is_empty() {
            return None;
        }
        let major: i64 = digits[..1].parse().ok()?;
        let minor: Option<i64> = if digits.len() > 1 {
            digits[1..].parse().ok()
        } else {
            None
        };
        let admitted = match minor {
            Some(minor) => {
                let series: PySpecSet = format!("=={major}.{minor}.*").parse().ok()?;
                !(&series & &self.requires_python).is_impossible()
            }
            None => {
                let series: PySpecSet = format!("=={major}.*").parse().ok()?;
                !(&series & &self.requires_python).is_impossible()
            }
        };
        if !admitted {
            return None;
        }
        match (prefix, minor) {
            ("py", None) => Some(1),
            ("py", Some(_)) => Some(2),
            (p, Some(_)) if p == self.implementation => Some(3),
            _ => None,
        }
    }

    fn abi_score(&self, tag: &str) -> Option<i32> {
        if tag == "none" {
            return Some(0);
        }
        if self.abis.is_empty() {
            return Some(1);
        }
        self.abis
            .iter()
            .position(|abi| abi == tag)
            .map(|pos| (self.abis.len() - pos) as i32)
    }

    fn platform_score(&self, tag: &str) -> Option<i32> {
        if tag == "any" {
            return Some(0);
        }
        if self.platforms.is_empty() {
            return Some(1);
        }
        self.platforms
            .iter()
            .position(|platform| platform == tag)
            .map(|pos| (self.platforms.len() - pos) as i32)
    }

    /// Scores one tag triple. Higher is more specific to this environment.
    pub fn tag_compatibility(&self, tag: &WheelTag) -> Option<i32> {
        let interpreter = self.interpreter_score(&tag.interpreter)?;
        let abi = self.abi_score(&tag.abi)?;
        let platform = self.platform_score(&tag.platform)?;
        Some(interpreter * 10_000 + platform * 100 + abi)
    }

    /// Scores a whole wheel: the best score among its tag triples, or `None`
    /// when no triple is compatible.
    pub fn wheel_compatibility(&self, filename: &WheelFilename) -> Option<i32> {
        filename
            .all_tags()
            .filter_map(|tag| self.tag_compatibility(&tag))
            .max()
    }

    /// Whether a candidate guarded by `marker` can apply to some environment
    /// in this spec. Only the python part is decidable from a version range;
    /// other atoms are admitted conservatively.
    pub fn allows_marker(&self, marker: &Marker) -> bool {
        match marker.split_pyspec() {
            Ok((_, pyspec)) => !(&pyspec & &self.requires_python).is_impossible(),
            Err(_) => true,
        }
    }

    /// A stable dictionary form used inside cache keys.
    pub fn as_dict(&self) -> BTreeMap<String, Value> {
        BTreeMap::from([
            (
                "requires_python".to_string(),
                Value::String(self.requires_python.to_string()),
            ),
            (
                "platforms".to_string(),
                Value::Array(self.platforms.iter().cloned().map(Value::String).collect()),
            ),
            (
                "abis".to_string(),
                Value::Array(self.abis.iter().cloned().map(Value::String).collect()),
            ),
            (
                "implementation".to_string(),
                Value::String(self.implementation.clone()),
            ),
        ])
    }
}

impl Display for EnvSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "python{}", self.requires_python)?;
        if !self.platforms.is_empty() {
            write!(f, " on {}", self.platforms.join("|"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::package_name::ProjectKey;

    fn spec(requires_python: &str) -> EnvSpec {
        EnvSpec {
            requires_python: requires_python.parse().unwrap(),
            platforms: vec![
                "manylinux_2_17_x86_64".to_string(),
                "linux_x86_64".to_string(),
            ],
            abis: vec!["cp311".to_string(), "abi3".to_string()],
            implementation: "cp".to_string(),
        }
    }

    fn wheel(filename: &str, project: &str) -> WheelFilename {
        let key: ProjectKey = project.parse().unwrap();
        WheelFilename::from_filename(filename, &key).unwrap()
    }

    #[test]
    fn test_universal_wheel_matches() {
        let spec = spec(">=3.11,<3.12");
        let score = spec
            .wheel_compatibility(&wheel("demo-1.0-py3-none-any.whl", "demo"))
            .unwrap();
        assert!(score > 0);
    }

    #[test]
    fn test_specific_beats_generic() {
        let spec = spec(">=3.11,<3.12");
        let generic = spec
            .wheel_compatibility(&wheel("demo-1.0-py3-none-any.whl", "demo"))
            .unwrap();
        let specific = spec
            .wheel_compatibility(&wheel(
                "demo-1.0-cp311-cp311-manylinux_2_17_x86_64.whl",
                "demo",
            ))
            .unwrap();
        assert!(specific > generic);
    }

    #[test]
    fn test_incompatible_wheels() {
        let spec = spec(">=3.11,<3.12");
        assert!(spec
            .wheel_compatibility(&wheel("demo-1.0-py2-none-any.whl", "demo"))
            .is_none());
        assert!(spec
            .wheel_compatibility(&wheel("demo-1.0-cp311-cp311-win_amd64.whl", "demo"))
            .is_none());
        assert!(spec
            .wheel_compatibility(&wheel("demo-1.0-cp39-cp39-linux_x86_64.whl", "demo"))
            .is_none());
    }

    #[test]
    fn test_allows_marker() {
        let spec = EnvSpec::from_requires_python(">=3.6".parse().unwrap());
        assert!(spec.allows_marker(&"os_name == 'nt'".parse().unwrap()));
        assert!(spec.allows_marker(&"python_version >= '3.7'".parse().unwrap()));
        assert!(!spec.allows_marker(&"python_version < '3'".parse().unwrap()));
    }
}
