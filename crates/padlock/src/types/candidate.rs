use super::link::{FileHash, Link};
use super::package_name::{PackageName, ProjectKey};
use super::requirement::Requirement;
use super::version::Version;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

/// A concrete package release that may satisfy a requirement: a name, a
/// version and the link it can be fetched from. Metadata fields are filled
/// in as they become known (from the index, a cache, or preparation).
#[derive(Debug, Clone)]
pub struct Candidate {
    /// The requirement this candidate was found for.
    pub req: Requirement,
    /// The package name, once known.
    pub name: Option<PackageName>,
    /// The version, absent for unbuilt local/VCS sources.
    pub version: Option<Version>,
    /// Where the artifact lives, absent for bare reuse pins.
    pub link: Option<Link>,
    /// Artifact hashes collected for the lock file.
    pub hashes: Vec<FileHash>,
    /// The raw `requires-python` constraint of the release.
    pub requires_python: String,
    /// The one-line summary recorded into the lock.
    pub summary: String,
    /// Whether this candidate was injected as a preferred pin by a reuse
    /// strategy.
    pub preferred: bool,
}

impl Candidate {
    /// A bare candidate carrying only its requirement; name and version are
    /// discovered during preparation.
    pub fn new(req: Requirement) -> Self {
        let name = req.name().cloned();
        Candidate {
            req,
            name,
            version: None,
            link: None,
            hashes: Vec::new(),
            requires_python: String::new(),
            summary: String::new(),
            preferred: false,
        }
    }

    /// A candidate pinned to a name and version, as read from a lock file or
    /// a working set.
    pub fn pinned(req: Requirement, name: PackageName, version: Option<Version>) -> Self {
        Candidate {
            name: Some(name),
            version,
            ..Candidate::new(req)
        }
    }

    /// A candidate enumerated from an index link.
    pub fn from_link(req: Requirement, name: PackageName, version: Version, link: Link) -> Self {
        let requires_python = link.requires_python.clone().unwrap_or_default();
        Candidate {
            name: Some(name),
            version: Some(version),
            link: Some(link),
            requires_python,
            ..Candidate::new(req)
        }
    }

    /// The merge key of the candidate, shared with its requirement.
    pub fn identify(&self) -> String {
        if self.req.name().is_none() {
            if let Some(name) = &self.name {
                // the name was discovered after the requirement was written
                let mut req = self.req.clone();
                req.core_mut().name = Some(name.clone());
                return req.identify();
            }
        }
        self.req.identify()
    }

    /// The normalized project key, if known.
    pub fn key(&self) -> Option<ProjectKey> {
        self.name.clone().map(ProjectKey::from)
    }

    /// The key the fetched-dependency map is indexed by.
    pub fn dep_key(&self) -> (String, Option<String>) {
        (self.identify(), self.version.as_ref().map(Version::to_string))
    }

    /// A copy of this candidate tied to another requirement. Used when the
    /// resolver picks a candidate found via the bare identifier but needs the
    /// extras-bearing requirement for dependency extraction.
    pub fn copy_with(&self, req: Requirement) -> Candidate {
        Candidate {
            req,
            ..self.clone()
        }
    }

    /// Fills the requirement name in after preparation discovered it.
    pub fn fill_name(&mut self, name: PackageName) {
        if self.name.is_none() {
            self.name = Some(name.clone());
        }
        if self.req.name().is_none() {
            self.req.core_mut().name = Some(name);
        }
    }

    fn comparison_key(&self) -> (Option<String>, Option<String>, Option<String>) {
        let url = if self.req.is_named() {
            None
        } else {
            self.link.as_ref().map(Link::url_without_fragment)
        };
        (
            self.key().map(|k| k.to_string()),
            self.version.as_ref().map(Version::to_string),
            url,
        )
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.comparison_key() == other.comparison_key()
    }
}

impl Eq for Candidate {}

impl Hash for Candidate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.comparison_key().hash(state)
    }
}

impl Display for Candidate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (&self.name, &self.version) {
            (Some(name), Some(version)) => write!(f, "{}@{}", name.as_str(), version),
            (Some(name), None) => write!(f, "{}", name.as_str()),
            _ => write!(f, "{}", self.req.identify()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::requirement::parse_line;

    fn named(line: &str, version: &str) -> Candidate {
        let req = parse_line(line).unwrap();
        let name = req.name().cloned().unwrap();
        Candidate::pinned(req, name, Some(version.parse().unwrap()))
    }

    #[test]
    fn test_equality_for_named() {
        let a = named("demo>=0.1", "0.2.0");
        let b = named("demo", "0.2.0");
        assert_eq!(a, b);
        assert_ne!(a, named("demo", "0.3.0"));
    }

    #[test]
    fn test_equality_considers_link_for_files() {
        let req_a = parse_line("demo @ https://example.org/demo-0.2.0.tar.gz#sha256=aa").unwrap();
        let req_b = parse_line("demo @ https://example.org/demo-0.2.0.tar.gz#sha256=bb").unwrap();
        let req_c = parse_line("demo @ https://mirror.example.org/demo-0.2.0.tar.gz").unwrap();
        let make = |req: &Requirement| {
            let mut can = Candidate::new(req.clone());
            can.version = Some("0.2.0".parse().unwrap());
            can.link = crate::types::requirement::link_from_requirement(req, None);
            can
        };
        // fragments are ignored, distinct hosts are not
        assert_eq!(make(&req_a), make(&req_b));
        assert_ne!(make(&req_a), make(&req_c));
    }

    #[test]
    fn test_identify_after_name_discovery() {
        let req = parse_line("https://example.org/dist/archive.zip").unwrap();
        let mut can = Candidate::new(req);
        assert!(crate::types::requirement::is_unnamed_identifier(&can.identify()));
        can.fill_name("archive-proj".parse().unwrap());
        assert_eq!(can.identify(), "archive-proj");
    }
}
