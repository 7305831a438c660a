use super::extra::Extra;
use super::link::{Link, VcsKind};
use super::marker::{Marker, ParseMarkerError};
use super::package_name::{PackageName, ProjectKey};
use super::pyspec::{ParsePySpecError, PySpecSet};
use super::reqparse::{self, ParseExtra, ParsedLine};
use super::specifier::{ParseSpecifierError, Specifiers};
use super::version::Version;
use crate::utils::{is_url, path_to_url, url_without_fragment};
use miette::Diagnostic;
use once_cell::sync::Lazy;
use rattler_digest::{compute_bytes_digest, Sha256};
use regex::Regex;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use url::Url;

/// Error raised when a requirement line cannot be parsed or validated.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum RequirementError {
    /// The line matches none of the recognized forms.
    #[error("invalid requirement '{0}'")]
    Invalid(String),

    /// The version specifier part is malformed.
    #[error(transparent)]
    InvalidSpecifier(#[from] ParseSpecifierError),

    /// The environment marker part is malformed.
    #[error(transparent)]
    InvalidMarker(#[from] ParseMarkerError),

    /// The marker's python constraint cannot be analyzed.
    #[error(transparent)]
    InvalidPyVersion(#[from] ParsePySpecError),

    /// Editable installs only make sense for VCS links and local
    /// directories.
    #[error("editable requirement is only supported for VCS link or local directory")]
    EditableNotSupported,

    /// A URL requirement with an unparseable URL.
    #[error("invalid URL in requirement: {0}")]
    InvalidUrl(String),
}

/// Fields shared by every requirement variant.
#[derive(Debug, Clone, Default)]
pub struct RequirementCore {
    /// The project name, absent for file requirements whose name is only
    /// discovered during preparation.
    pub name: Option<PackageName>,
    /// Requested extras, sorted and deduplicated.
    pub extras: Vec<Extra>,
    /// The version constraint.
    pub specifier: Specifiers,
    /// The environment marker guarding this requirement.
    pub marker: Option<Marker>,
    /// The python constraint carried by the marker, kept in sync with it and
    /// refined further during resolution.
    pub requires_python: PySpecSet,
    /// The dependency groups that demanded this requirement.
    pub groups: Vec<String>,
    /// Whether pre-releases are explicitly acceptable for this requirement.
    pub prerelease: bool,
    /// Whether the target is installed in editable mode. Only meaningful on
    /// VCS and local-directory requirements.
    pub editable: bool,
}

impl RequirementCore {
    fn with_marker(mut self, marker: Option<Marker>) -> Result<Self, RequirementError> {
        self.requires_python = match &marker {
            Some(marker) => marker.split_pyspec()?.1,
            None => PySpecSet::allow_all(),
        };
        self.marker = marker.filter(|m| !m.is_any());
        Ok(self)
    }

    fn sort_extras(&mut self) {
        self.extras.sort();
        self.extras.dedup();
    }
}

/// A requirement referring to a package on an index by name.
#[derive(Debug, Clone, Default)]
pub struct NamedRequirement {
    /// The shared requirement fields.
    pub core: RequirementCore,
}

/// A requirement referring to a local path or a direct URL.
#[derive(Debug, Clone, Default)]
pub struct FileRequirement {
    /// The shared requirement fields.
    pub core: RequirementCore,
    /// The URL, possibly containing a literal `${PROJECT_ROOT}` token.
    pub url: String,
    /// The local path when the URL points into the filesystem.
    pub path: Option<PathBuf>,
    /// The sub-directory holding the project inside the checkout/archive.
    pub subdirectory: Option<String>,
}

/// A requirement referring to a version control checkout.
#[derive(Debug, Clone)]
pub struct VcsRequirement {
    /// The file-requirement fields the checkout shares.
    pub file: FileRequirement,
    /// Which VCS the URL addresses.
    pub vcs: VcsKind,
    /// The repository URL without the VCS prefix and without any ref.
    pub repo: String,
    /// The requested branch, tag, or revision name.
    pub ref_name: Option<String>,
    /// The immutable revision resolved during preparation.
    pub revision: Option<String>,
}

/// A package requirement: one of the three concrete forms.
#[derive(Debug, Clone)]
pub enum Requirement {
    /// A named, index-resolved requirement.
    Named(NamedRequirement),
    /// A local path or direct URL requirement.
    File(FileRequirement),
    /// A VCS checkout requirement.
    Vcs(VcsRequirement),
}

static VCS_REQ_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?P<url>(?P<vcs>git|hg|svn|bzr)\+[^\s;]+)(?:[\t ]*;(?P<marker>[^\n]+))?$")
        .unwrap()
});

static FILE_REQ_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^(?:(?P<url>\S+://[^\s\[\];]+)|(?P<path>(?:[^\s;\[\]]|\\ )*))(?P<extras>\[[^\[\]]+\])?(?:[\t ]*;(?P<marker>[^\n]+))?$"#,
    )
    .unwrap()
});

static EGG_INFO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^([a-z0-9_.]+)-([a-z0-9_.!+-]+)$").unwrap());

impl Requirement {
    /// The shared fields.
    pub fn core(&self) -> &RequirementCore {
        match self {
            Requirement::Named(r) => &r.core,
            Requirement::File(r) => &r.core,
            Requirement::Vcs(r) => &r.file.core,
        }
    }

    /// The shared fields, mutably.
    pub fn core_mut(&mut self) -> &mut RequirementCore {
        match self {
            Requirement::Named(r) => &mut r.core,
            Requirement::File(r) => &mut r.core,
            Requirement::Vcs(r) => &mut r.file.core,
        }
    }

    /// The project name, if known.
    pub fn name(&self) -> Option<&PackageName> {
        self.core().name.as_ref()
    }

    /// The normalized project key, if the name is known.
    pub fn key(&self) -> Option<ProjectKey> {
        self.core().name.clone().map(ProjectKey::from)
    }

    /// The requirement's marker.
    pub fn marker(&self) -> Option<&Marker> {
        self.core().marker.as_ref()
    }

    /// Replaces the marker and recomputes the python constraint from it.
    pub fn set_marker(&mut self, marker: Option<Marker>) {
        let requires_python = match &marker {
            Some(m) => m.split_pyspec().map(|(_, p)| p).unwrap_or_default(),
            None => PySpecSet::allow_all(),
        };
        let core = self.core_mut();
        core.marker = marker.filter(|m| !m.is_any());
        core.requires_python = requires_python;
    }

    /// Whether this is a named requirement.
    pub fn is_named(&self) -> bool {
        matches!(self, Requirement::Named(_))
    }

    /// Whether this is a plain file/URL requirement.
    pub fn is_file_or_url(&self) -> bool {
        matches!(self, Requirement::File(_))
    }

    /// Whether this is a VCS requirement.
    pub fn is_vcs(&self) -> bool {
        matches!(self, Requirement::Vcs(_))
    }

    /// Whether this requirement points at a local directory.
    pub fn is_local_dir(&self) -> bool {
        match self {
            Requirement::File(r) => r.path.as_deref().map_or(false, |p| p.is_dir()),
            _ => false,
        }
    }

    /// Whether the specifier pins one exact version.
    pub fn is_pinned(&self) -> bool {
        self.core().specifier.is_pinned()
    }

    /// A copy pinned to the given version, unless already pinned.
    pub fn as_pinned_version(&self, version: Option<&Version>) -> Requirement {
        let Some(version) = version else {
            return self.clone();
        };
        if self.is_pinned() {
            return self.clone();
        }
        let mut ret = self.clone();
        ret.core_mut().specifier = format!("=={version}")
            .parse()
            .expect("a rendered version always parses back");
        ret
    }

    /// The identity key the resolver collates this requirement by: the
    /// project key plus sorted extras, or a stable placeholder for unnamed
    /// file requirements.
    pub fn identify(&self) -> String {
        let core = self.core();
        let Some(name) = &core.name else {
            let url = match self {
                Requirement::File(r) => r.url.as_str(),
                Requirement::Vcs(r) => r.file.url.as_str(),
                Requirement::Named(_) => "",
            };
            let digest = format!("{:x}", compute_bytes_digest::<Sha256>(url.as_bytes()));
            return format!("{}{}", UNNAMED_PREFIX, &digest[..8]);
        };
        let key = ProjectKey::from(name.clone());
        if core.extras.is_empty() {
            key.to_string()
        } else {
            let extras: Vec<&str> = core.extras.iter().map(Extra::as_str).collect();
            format!("{key}[{}]", extras.join(","))
        }
    }

    /// Whether `line`, parsed as a requirement, refers to the same project.
    pub fn matches(&self, line: &str) -> bool {
        let parsed = if let Some(stripped) = line.trim().strip_prefix("-e ") {
            parse_requirement(stripped.trim(), true)
        } else {
            parse_requirement(line.trim(), false)
        };
        parsed.map_or(false, |req| req.key() == self.key())
    }

    /// The URL of a file/VCS requirement, fragments stripped, revisions and
    /// refs included for VCS ones.
    pub fn full_url(&self) -> Option<String> {
        match self {
            Requirement::Named(_) => None,
            Requirement::File(r) => Some(url_without_fragment(&r.url).to_string()),
            Requirement::Vcs(r) => {
                let base = url_without_fragment(&r.file.url);
                if let Some(revision) = r.revision.as_ref().filter(|_| !r.file.core.editable) {
                    Some(format!("{base}@{revision}"))
                } else if let Some(ref_name) = &r.ref_name {
                    Some(format!("{base}@{ref_name}"))
                } else {
                    Some(base.to_string())
                }
            }
        }
    }

    /// Renders the requirement back into a line the parser accepts.
    pub fn as_line(&self) -> String {
        let core = self.core();
        let name = core
            .name
            .as_ref()
            .map(|n| n.as_given_str().to_string())
            .unwrap_or_default();
        let extras = if !core.extras.is_empty() && !name.is_empty() {
            format!(
                "[{}]",
                core.extras
                    .iter()
                    .map(Extra::as_str)
                    .collect::<Vec<_>>()
                    .join(",")
            )
        } else {
            String::new()
        };
        let marker = core
            .marker
            .as_ref()
            .map(|m| format!("; {m}"))
            .unwrap_or_default();
        match self {
            Requirement::Named(_) => format!("{name}{extras}{}{marker}", core.specifier),
            Requirement::File(_) | Requirement::Vcs(_) => {
                let url = self.full_url().expect("file and VCS requirements carry a URL");
                let mut fragments: Vec<String> = Vec::new();
                let subdirectory = match self {
                    Requirement::File(r) => r.subdirectory.as_ref(),
                    Requirement::Vcs(r) => r.file.subdirectory.as_ref(),
                    Requirement::Named(_) => None,
                };
                if core.editable {
                    if !name.is_empty() {
                        fragments.push(format!("egg={name}{extras}"));
                    }
                    if let Some(sub) = subdirectory {
                        fragments.push(format!("subdirectory={sub}"));
                    }
                    let fragment = if fragments.is_empty() {
                        String::new()
                    } else {
                        format!("#{}", fragments.join("&"))
                    };
                    let marker = if marker.is_empty() {
                        String::new()
                    } else {
                        format!(" {}", marker.trim_start())
                    };
                    format!("-e {url}{fragment}{marker}")
                } else {
                    if let Some(sub) = subdirectory {
                        fragments.push(format!("subdirectory={sub}"));
                    }
                    let fragment = if fragments.is_empty() {
                        String::new()
                    } else {
                        format!("#{}", fragments.join("&"))
                    };
                    let delimiter = if name.is_empty() { "" } else { " @ " };
                    let marker = if marker.is_empty() {
                        String::new()
                    } else {
                        format!(" {marker}")
                    };
                    format!("{name}{extras}{delimiter}{url}{fragment}{marker}")
                }
            }
        }
    }

    fn hash_key(&self) -> (Option<String>, Vec<String>, Option<String>, Option<String>, bool) {
        let core = self.core();
        (
            self.key().map(|k| k.to_string()),
            core.extras.iter().map(|e| e.as_str().to_string()).collect(),
            core.marker.as_ref().map(|m| m.to_string()),
            self.full_url(),
            core.editable,
        )
    }
}

const UNNAMED_PREFIX: &str = ":empty:";

/// Whether an identifier belongs to a requirement whose name is not known
/// yet.
pub fn is_unnamed_identifier(identifier: &str) -> bool {
    identifier.starts_with(UNNAMED_PREFIX)
}

/// Splits an identifier into its bare project key and the extras part.
pub fn strip_extras(identifier: &str) -> (&str, Option<Vec<&str>>) {
    match identifier.split_once('[') {
        Some((bare, extras)) => (
            bare,
            Some(
                extras
                    .trim_end_matches(']')
                    .split(',')
                    .map(str::trim)
                    .collect(),
            ),
        ),
        None => (identifier, None),
    }
}

impl PartialEq for Requirement {
    fn eq(&self, other: &Self) -> bool {
        self.hash_key() == other.hash_key()
    }
}

impl Eq for Requirement {}

impl Hash for Requirement {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash_key().hash(state)
    }
}

impl Display for Requirement {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_line())
    }
}

impl FromStr for Requirement {
    type Err = RequirementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_requirement(s, false)
    }
}

impl NamedRequirement {
    /// A named requirement from its parts.
    pub fn create(
        name: PackageName,
        specifier: Specifiers,
        marker: Option<Marker>,
    ) -> Result<Requirement, RequirementError> {
        let mut core = RequirementCore {
            name: Some(name),
            specifier,
            ..Default::default()
        }
        .with_marker(marker)?;
        core.sort_extras();
        Ok(Requirement::Named(NamedRequirement { core }))
    }
}

impl FileRequirement {
    /// Builds a file requirement from a URL or local path, deriving the
    /// missing counterpart and guessing the name from the URL when possible.
    pub fn create(
        url: Option<String>,
        path: Option<PathBuf>,
        core: RequirementCore,
    ) -> Result<Requirement, RequirementError> {
        let mut req = FileRequirement {
            core,
            url: url.unwrap_or_default(),
            path,
            subdirectory: None,
        };
        req.parse_url()?;
        req.core.sort_extras();
        Ok(Requirement::File(req))
    }

    fn parse_url(&mut self) -> Result<(), RequirementError> {
        if self.url.is_empty() {
            if let Some(path) = &self.path {
                if path.is_absolute() {
                    self.url = path_to_url(path)
                        .map_err(|e| RequirementError::InvalidUrl(e.to_string()))?
                        .to_string();
                } else {
                    // keep the lock file relocatable
                    self.url = format!(
                        "file:///${{PROJECT_ROOT}}/{}",
                        path.to_string_lossy().trim_start_matches("./")
                    );
                }
            }
        }
        if self.path.is_none() {
            if let Some(rest) = self.url.strip_prefix("file:///${PROJECT_ROOT}/") {
                self.path = Some(PathBuf::from(
                    url_without_fragment(rest).replace("%20", " "),
                ));
            } else if let Ok(url) = Url::parse(&self.url) {
                if url.scheme() == "file" {
                    self.path = url.to_file_path().ok();
                }
            }
        }
        if !self.url.is_empty() {
            if let Some(fragment) = self.url.split_once('#').map(|(_, f)| f) {
                for part in fragment.split('&') {
                    if let Some(value) = part.strip_prefix("subdirectory=") {
                        self.subdirectory = Some(value.to_string());
                    } else if let Some(value) = part.strip_prefix("egg=") {
                        let (name, extras) = strip_extras(value);
                        if self.core.name.is_none() {
                            self.core.name = name.parse().ok();
                        }
                        if self.core.extras.is_empty() {
                            if let Some(extras) = extras {
                                self.core.extras =
                                    extras.iter().filter_map(|e| e.parse().ok()).collect();
                            }
                        }
                    }
                }
            }
            if self.core.name.is_none() {
                self.guess_name_from_filename();
            }
        }
        Ok(())
    }

    /// Tries to read the project name out of the artifact filename. A plain
    /// `<name>-<version>.tar.gz` leaves the version to be discovered from
    /// metadata.
    fn guess_name_from_filename(&mut self) {
        let without_fragment = url_without_fragment(&self.url);
        let Some(filename) = without_fragment.rsplit('/').next().filter(|s| !s.is_empty())
        else {
            return;
        };
        let filename = filename.replace("%20", " ");
        if let Some(stem) = filename
            .strip_suffix(".whl")
            .and_then(|s| s.split('-').next())
        {
            self.core.name = stem.parse().ok();
        } else {
            let stem = filename
                .strip_suffix(".tar.gz")
                .or_else(|| filename.strip_suffix(".zip"))
                .or_else(|| filename.strip_suffix(".tar.bz2"))
                .unwrap_or(&filename);
            // `<name>-<version>` with a parseable version wins; otherwise the
            // name is whatever sits before the first dash and the version is
            // left to be discovered from metadata
            if let Some((name_part, version_part)) = stem.rsplit_once('-') {
                if version_part.parse::<Version>().is_ok() {
                    self.core.name = name_part.parse().ok();
                    return;
                }
            }
            if let Some(captures) = EGG_INFO_RE.captures(stem) {
                self.core.name = captures.get(1).and_then(|m| m.as_str().parse().ok());
            }
        }
    }
}

impl VcsRequirement {
    /// Builds a VCS requirement from a `<vcs>+<url>` line.
    pub fn create(
        url: &str,
        core: RequirementCore,
        ref_name: Option<String>,
        revision: Option<String>,
    ) -> Result<Requirement, RequirementError> {
        let Some((vcs, rest)) = url.split_once('+') else {
            return Err(RequirementError::InvalidUrl(url.to_string()));
        };
        let vcs: VcsKind = vcs
            .parse()
            .map_err(|_| RequirementError::InvalidUrl(url.to_string()))?;
        let mut file = FileRequirement {
            core,
            url: url.to_string(),
            path: None,
            subdirectory: None,
        };
        // fragments carry egg/subdirectory information, the path may carry a
        // trailing @ref
        let mut ref_name = ref_name;
        let (without_fragment, fragment) = match rest.split_once('#') {
            Some((head, fragment)) => (head.to_string(), Some(fragment.to_string())),
            None => (rest.to_string(), None),
        };
        let repo = match without_fragment.rsplit_once('@') {
            // a userinfo `@` always has the host path after it, a ref does not
            Some((head, tail)) if !tail.contains('/') && !tail.is_empty() => {
                if ref_name.is_none() {
                    ref_name = Some(tail.to_string());
                }
                head.to_string()
            }
            _ => without_fragment.clone(),
        };
        if let Some(fragment) = fragment {
            for part in fragment.split('&') {
                if let Some(value) = part.strip_prefix("subdirectory=") {
                    file.subdirectory = Some(value.to_string());
                } else if let Some(value) = part.strip_prefix("egg=") {
                    let (name, extras) = strip_extras(value);
                    if file.core.name.is_none() {
                        file.core.name = name.parse().ok();
                    }
                    if file.core.extras.is_empty() {
                        if let Some(extras) = extras {
                            file.core.extras =
                                extras.iter().filter_map(|e| e.parse().ok()).collect();
                        }
                    }
                }
            }
        }
        file.url = format!("{vcs}+{repo}");
        file.core.sort_extras();
        Ok(Requirement::Vcs(VcsRequirement {
            file,
            vcs,
            repo,
            ref_name,
            revision,
        }))
    }
}

fn from_parsed_line(line: ParsedLine, editable: bool) -> Result<Requirement, RequirementError> {
    let marker = line.marker.map(Marker::from_expr);
    let mut core = RequirementCore {
        name: Some(line.name),
        extras: line.extras,
        specifier: line.specifiers,
        ..Default::default()
    }
    .with_marker(marker)?;
    core.sort_extras();
    core.editable = editable;
    match line.url {
        None => Ok(Requirement::Named(NamedRequirement { core })),
        Some(url) => {
            if VcsKind::ALL
                .iter()
                .any(|vcs| url.starts_with(&format!("{vcs}+")))
            {
                VcsRequirement::create(&url, core, None, None)
            } else {
                FileRequirement::create(Some(url), None, core)
            }
        }
    }
}

/// Parses a requirement line, trying the VCS form, then PEP 508, then a bare
/// path or URL.
pub fn parse_line(line: &str) -> Result<Requirement, RequirementError> {
    let line = line.trim();
    if let Some(captures) = VCS_REQ_RE.captures(line) {
        let marker = captures
            .name("marker")
            .map(|m| m.as_str().trim().parse::<Marker>())
            .transpose()?;
        let core = RequirementCore::default().with_marker(marker)?;
        return VcsRequirement::create(&captures["url"], core, None, None);
    }
    match reqparse::requirement(line, ParseExtra::Allowed) {
        Ok(parsed) => from_parsed_line(parsed?, false),
        Err(_) => {
            let captures = FILE_REQ_RE
                .captures(line)
                .ok_or_else(|| RequirementError::Invalid(line.to_string()))?;
            let marker = captures
                .name("marker")
                .map(|m| m.as_str().trim().parse::<Marker>())
                .transpose()?;
            let mut core = RequirementCore::default().with_marker(marker)?;
            if let Some(extras) = captures.name("extras") {
                core.extras = extras
                    .as_str()
                    .trim_matches(&['[', ']'][..])
                    .split(',')
                    .filter_map(|e| e.trim().parse().ok())
                    .collect();
            }
            let url = captures.name("url").map(|m| m.as_str().to_string());
            let path = captures
                .name("path")
                .map(|m| m.as_str())
                .filter(|p| !p.is_empty())
                .map(|p| PathBuf::from(p.replace("\\ ", " ")));
            if url.is_none() && path.is_none() {
                return Err(RequirementError::Invalid(line.to_string()));
            }
            FileRequirement::create(url, path, core)
        }
    }
}

/// Parses a requirement line, optionally marking it editable. Editable is
/// only accepted for VCS requirements and local directories.
pub fn parse_requirement(line: &str, editable: bool) -> Result<Requirement, RequirementError> {
    let mut req = parse_line(line)?;
    if editable {
        if req.is_vcs() || req.is_local_dir() {
            req.core_mut().editable = true;
        } else {
            return Err(RequirementError::EditableNotSupported);
        }
    }
    Ok(req)
}

/// Builds a requirement from a lock-file table entry: either a bare
/// specifier string or a table of fields.
pub fn from_req_dict(
    name: &str,
    entry: &toml_edit::Item,
) -> Result<Requirement, RequirementError> {
    let name: PackageName = name
        .parse()
        .map_err(|_| RequirementError::Invalid(name.to_string()))?;
    if let Some(version) = entry.as_str() {
        let specifier: Specifiers = version.parse()?;
        return NamedRequirement::create(name, specifier, None);
    }
    let Some(table) = entry.as_table_like() else {
        return Err(RequirementError::Invalid(name.to_string()));
    };
    let get_str = |key: &str| -> Option<String> {
        table.get(key).and_then(|v| v.as_str()).map(str::to_string)
    };
    let marker = get_str("marker").map(|m| m.parse::<Marker>()).transpose()?;
    let mut core = RequirementCore {
        name: Some(name),
        editable: table
            .get("editable")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        ..Default::default()
    }
    .with_marker(marker)?;
    if let Some(extras) = table.get("extras").and_then(|v| v.as_array()) {
        core.extras = extras
            .iter()
            .filter_map(|e| e.as_str().and_then(|s| s.parse().ok()))
            .collect();
        core.sort_extras();
    }
    if let Some(version) = get_str("version") {
        core.specifier = version.parse()?;
    }
    let vcs_entry = VcsKind::ALL
        .iter()
        .find_map(|vcs| get_str(vcs.as_str()).map(|repo| (*vcs, repo)));
    if let Some((vcs, repo)) = vcs_entry {
        let url = format!("{vcs}+{repo}");
        let mut req = VcsRequirement::create(&url, core, get_str("ref"), get_str("revision"))?;
        if let Requirement::Vcs(r) = &mut req {
            r.file.subdirectory = get_str("subdirectory").or(r.file.subdirectory.take());
        }
        return Ok(req);
    }
    if get_str("path").is_some() || get_str("url").is_some() {
        let mut req = FileRequirement::create(
            get_str("url"),
            get_str("path").map(PathBuf::from),
            core,
        )?;
        if let Requirement::File(r) = &mut req {
            r.subdirectory = get_str("subdirectory").or(r.subdirectory.take());
        }
        return Ok(req);
    }
    Ok(Requirement::Named(NamedRequirement { core }))
}

/// Keeps the metadata dependency lines that apply to the requested extras,
/// stripping the `extra == ...` part from their markers. Lines without an
/// extra marker are kept only when no extras were requested. Requested
/// extras that never appear in the metadata are reported back.
pub fn filter_requirements_with_extras(
    requirement_lines: &[String],
    extras: &[Extra],
) -> Result<(Vec<Requirement>, Vec<Extra>), RequirementError> {
    let mut result = Vec::new();
    let mut extras_in_meta: Vec<Extra> = Vec::new();
    for line in requirement_lines {
        let mut req = parse_line(line)?;
        let (req_extras, rest) = match req.marker() {
            Some(marker) => marker.split_extras(),
            None => (Vec::new(), None),
        };
        if !req_extras.is_empty() {
            extras_in_meta.extend(req_extras.iter().cloned());
            req.set_marker(rest);
        }
        let applies = if req_extras.is_empty() {
            extras.is_empty()
        } else {
            req_extras.iter().any(|e| extras.contains(e))
        };
        if applies {
            result.push(req);
        }
    }
    let missing: Vec<Extra> = extras
        .iter()
        .filter(|e| !extras_in_meta.contains(e))
        .cloned()
        .collect();
    Ok((result, missing))
}

/// Builds the artifact link a file/VCS requirement points at, expanding
/// `${VAR}` and the relocatable `${PROJECT_ROOT}` token.
pub fn link_from_requirement(req: &Requirement, project_root: Option<&std::path::Path>) -> Option<Link> {
    // the raw URL keeps its fragment so hash pins survive into the link
    let url = match req {
        Requirement::Named(_) => return None,
        Requirement::File(r) => r.url.clone(),
        Requirement::Vcs(_) => req.full_url()?,
    };
    let expanded = crate::utils::expand_env_vars(&url);
    let root = project_root
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".".to_string());
    let resolved = expanded.replace("file:///${PROJECT_ROOT}", &format!("file://{}", root.trim_start_matches("file://")))
        .replace("${PROJECT_ROOT}", &root);
    let url = if is_url(&resolved) {
        Url::parse(&resolved).ok()?
    } else {
        path_to_url(&PathBuf::from(&resolved)).ok()?
    };
    Some(Link::new(url))
}

/// Whether `name_or_url` in an override table is a URL or a bare version or
/// specifier, rendering the requirement line accordingly.
pub fn requirement_from_override(identifier: &str, requested: &str) -> Result<Requirement, RequirementError> {
    let (bare, _) = strip_extras(identifier);
    let line = if is_url(requested) {
        format!("{bare} @ {requested}")
    } else if requested.parse::<Specifiers>().is_ok() && requested.starts_with(['=', '<', '>', '!', '~']) {
        format!("{bare}{requested}")
    } else {
        // a bare version pin
        format!("{bare}=={requested}")
    };
    parse_line(&line)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_named_requirement_roundtrip() {
        let lines = [
            "requests",
            "django>=2.2,<3.0",
            "requests[security,socks]>=2.8.1",
            "foo; os_name == \"nt\"",
        ];
        for line in lines {
            let req = parse_line(line).unwrap();
            let rendered = req.as_line();
            let reparsed = parse_line(&rendered).unwrap();
            assert_eq!(req.identify(), reparsed.identify());
            assert_eq!(req, reparsed, "{line} did not round-trip");
        }
    }

    #[test]
    fn test_rendered_lines() {
        let req = parse_line("Requests[security,socks]>=2.8.1, ==2.8.*; python_version >= '3'")
            .unwrap();
        insta::assert_snapshot!(
            req.as_line(),
            @r###"Requests[security,socks]==2.8.*,>=2.8.1; python_version >= "3""###
        );
        let req = parse_requirement("git+https://github.com/test-root/demo.git#egg=demo", true)
            .unwrap();
        insta::assert_snapshot!(
            req.as_line(),
            @"-e git+https://github.com/test-root/demo.git#egg=demo"
        );
    }

    #[test]
    fn test_identity_key() {
        let req = parse_line("Requests[Socks,security]>=2.8").unwrap();
        assert_eq!(req.identify(), "requests[security,socks]");
        let bare = parse_line("requests").unwrap();
        assert_eq!(bare.identify(), "requests");
        assert_eq!(strip_extras("requests[security,socks]").0, "requests");
    }

    #[test]
    fn test_vcs_requirement() {
        let req = parse_line(
            "git+https://github.com/test-root/demo.git@main#egg=demo&subdirectory=sub",
        )
        .unwrap();
        let Requirement::Vcs(vcs) = &req else {
            panic!("expected a VCS requirement");
        };
        assert_eq!(vcs.vcs, VcsKind::Git);
        assert_eq!(vcs.repo, "https://github.com/test-root/demo.git");
        assert_eq!(vcs.ref_name.as_deref(), Some("main"));
        assert_eq!(vcs.file.subdirectory.as_deref(), Some("sub"));
        assert_eq!(req.identify(), "demo");
        assert_eq!(
            req.as_line(),
            "demo @ git+https://github.com/test-root/demo.git@main#subdirectory=sub"
        );
    }

    #[test]
    fn test_direct_reference() {
        let req = parse_line("demo @ https://example.org/demo-0.0.1-py2.py3-none-any.whl").unwrap();
        assert!(req.is_file_or_url());
        assert_eq!(req.identify(), "demo");
    }

    #[test]
    fn test_unnamed_url_requirement() {
        let req = parse_line("https://example.org/dist/archive.zip").unwrap();
        assert!(req.name().is_none());
        assert!(is_unnamed_identifier(&req.identify()));
        // the placeholder is stable across parses
        let again = parse_line("https://example.org/dist/archive.zip").unwrap();
        assert_eq!(req.identify(), again.identify());
    }

    #[test]
    fn test_name_from_url_filename() {
        let req = parse_line("https://example.org/demo-0.0.1-py2.py3-none-any.whl").unwrap();
        assert_eq!(req.name().unwrap().as_str(), "demo");
        let req = parse_line("https://example.org/python-dateutil-2.8.1.tar.gz").unwrap();
        assert_eq!(req.name().unwrap().as_str(), "python-dateutil");
    }

    #[test]
    fn test_editable_validation() {
        assert!(parse_requirement("git+https://github.com/test-root/demo.git", true).is_ok());
        assert!(matches!(
            parse_requirement("requests", true),
            Err(RequirementError::EditableNotSupported)
        ));
        let req =
            parse_requirement("git+https://github.com/test-root/demo.git#egg=demo", true).unwrap();
        assert!(req.as_line().starts_with("-e git+"));
    }

    #[test]
    fn test_requires_python_from_marker() {
        let req = parse_line("django; python_version >= '3.6'").unwrap();
        assert_eq!(req.core().requires_python.to_string(), ">=3.6");
        let req = parse_line("django").unwrap();
        assert!(req.core().requires_python.is_allow_all());
    }

    #[test]
    fn test_as_pinned_version() {
        let req = parse_line("django>=2.0").unwrap();
        let pinned = req.as_pinned_version(Some(&"2.2.9".parse().unwrap()));
        assert!(pinned.is_pinned());
        assert_eq!(pinned.as_line(), "django==2.2.9");
    }

    #[test]
    fn test_project_root_token_preserved() {
        let req = parse_line("./sub/demo").unwrap();
        let Requirement::File(file) = &req else {
            panic!("expected file requirement")
        };
        assert_eq!(file.url, "file:///${PROJECT_ROOT}/sub/demo");
        assert_eq!(file.path.as_deref(), Some(std::path::Path::new("sub/demo")));
    }

    #[test]
    fn test_override_requirements() {
        assert_eq!(
            requirement_from_override("hoho", "2.1").unwrap().as_line(),
            "hoho==2.1"
        );
        assert_eq!(
            requirement_from_override("hoho", ">=1.8").unwrap().as_line(),
            "hoho>=1.8"
        );
        assert!(requirement_from_override("hoho", "https://example.org/hoho-2.1.tar.gz")
            .unwrap()
            .is_file_or_url());
    }

    #[test]
    fn test_filter_requirements_with_extras() {
        let lines = vec![
            "idna".to_string(),
            "chardet; extra == 'enc'".to_string(),
            "pysocks; extra == 'socks' and os_name == 'nt'".to_string(),
        ];
        let (reqs, missing) = filter_requirements_with_extras(&lines, &[]).unwrap();
        assert_eq!(reqs.len(), 1);
        assert!(missing.is_empty());

        let enc: Extra = "enc".parse().unwrap();
        let (reqs, missing) = filter_requirements_with_extras(&lines, &[enc]).unwrap();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].identify(), "chardet");
        assert!(missing.is_empty());

        let unknown: Extra = "nope".parse().unwrap();
        let (_, missing) = filter_requirements_with_extras(&lines, &[unknown.clone()]).unwrap();
        assert_eq!(missing, vec![unknown]);

        // the extra marker is stripped, other marker parts survive
        let socks: Extra = "socks".parse().unwrap();
        let (reqs, _) = filter_requirements_with_extras(&lines, &[socks]).unwrap();
        assert_eq!(reqs[0].marker().unwrap().to_string(), "os_name == \"nt\"");
    }
}
