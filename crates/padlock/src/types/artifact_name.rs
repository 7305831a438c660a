use super::package_name::{PackageName, ParsePackageNameError, ProjectKey};
use super::version::Version;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// A wheel platform compatibility tag triple.
#[derive(Debug, Clone, Hash, Eq, PartialEq, SerializeDisplay, DeserializeFromStr)]
pub struct WheelTag {
    /// The interpreter tag, e.g. `py3` or `cp311`.
    pub interpreter: String,
    /// The ABI tag, e.g. `cp311`, `abi3` or `none`.
    pub abi: String,
    /// The platform tag, e.g. `manylinux_2_17_x86_64` or `any`.
    pub platform: String,
}

impl FromStr for WheelTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((interpreter, abi, platform)) = s.split('-').map(ToOwned::to_owned).collect_tuple()
        else {
            return Err(String::from("expected three '-' separated parts"));
        };
        Ok(Self {
            interpreter,
            abi,
            platform,
        })
    }
}

impl Display for WheelTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.interpreter, self.abi, self.platform)
    }
}

/// The parts of a wheel filename per the PEP 427 convention:
/// `{distribution}-{version}[-{build}]-{python}-{abi}-{platform}.whl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WheelFilename {
    /// The distribution name as spelled in the filename.
    pub distribution: PackageName,
    /// The distribution version.
    pub version: Version,
    /// The optional build tag, used only as a tie-breaker.
    pub build_tag: Option<String>,
    /// Dot-separated interpreter tags.
    pub py_tags: Vec<String>,
    /// Dot-separated ABI tags.
    pub abi_tags: Vec<String>,
    /// Dot-separated platform tags.
    pub arch_tags: Vec<String>,
}

impl WheelFilename {
    /// All tag triples encoded in the filename. May contain duplicates when
    /// the tag lists overlap.
    pub fn all_tags(&self) -> impl Iterator<Item = WheelTag> + '_ {
        self.py_tags
            .iter()
            .cartesian_product(self.abi_tags.iter())
            .cartesian_product(self.arch_tags.iter())
            .map(|((py, abi), arch)| WheelTag {
                interpreter: py.clone(),
                abi: abi.clone(),
                platform: arch.clone(),
            })
    }

    /// Parses a wheel filename, verifying the distribution part against the
    /// expected project.
    pub fn from_filename(
        filename: &str,
        expected: &ProjectKey,
    ) -> Result<Self, ParseArtifactNameError> {
        let Some(stem) = filename.strip_suffix(".whl") else {
            return Err(ParseArtifactNameError::InvalidExtension(filename.into()));
        };
        let parts: Vec<&str> = stem.split('-').collect();
        let (name_part, version_part, build_tag, tags): (&str, &str, Option<String>, &[&str]) =
            match parts.len() {
                5 => (parts[0], parts[1], None, &parts[2..]),
                6 => (parts[0], parts[1], Some(parts[2].to_string()), &parts[3..]),
                _ => return Err(ParseArtifactNameError::InvalidName(filename.into())),
            };
        if let Some(build) = &build_tag {
            if !build.starts_with(|c: char| c.is_ascii_digit()) {
                return Err(ParseArtifactNameError::InvalidBuildTag(build.clone()));
            }
        }
        let distribution: PackageName = name_part.parse()?;
        if ProjectKey::from(distribution.clone()) != *expected {
            return Err(ParseArtifactNameError::PackageNameMismatch(
                expected.clone(),
                filename.into(),
            ));
        }
        let version = version_part
            .parse()
            .map_err(|_| ParseArtifactNameError::InvalidVersion(version_part.into()))?;
        let split = |s: &str| s.split('.').map(ToOwned::to_owned).collect::<Vec<_>>();
        Ok(WheelFilename {
            distribution,
            version,
            build_tag,
            py_tags: split(tags[0]),
            abi_tags: split(tags[1]),
            arch_tags: split(tags[2]),
        })
    }
}

impl Display for WheelFilename {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{dist}-{version}{build}-{py}-{abi}-{arch}.whl",
            dist = self.distribution.as_given_str(),
            version = self.version,
            build = self
                .build_tag
                .as_ref()
                .map_or_else(String::new, |tag| format!("-{tag}")),
            py = self.py_tags.join("."),
            abi = self.abi_tags.join("."),
            arch = self.arch_tags.join("."),
        )
    }
}

/// The compressed formats a source distribution can be shipped in.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum SDistFormat {
    Zip,
    TarGz,
    TarBz2,
    TarXz,
    TarZ,
    Tar,
}

impl SDistFormat {
    /// Whether this crate can unpack the format.
    pub fn is_supported(&self) -> bool {
        matches!(self, Self::TarGz | Self::Tar | Self::Zip)
    }

    /// Determines the format from a file name or path.
    pub fn from_filename(path: &str) -> Result<SDistFormat, ParseArtifactNameError> {
        let format = if path.ends_with(".zip") {
            SDistFormat::Zip
        } else if path.ends_with(".tar.gz") || path.ends_with(".tgz") {
            SDistFormat::TarGz
        } else if path.ends_with(".tar.bz2") {
            SDistFormat::TarBz2
        } else if path.ends_with(".tar.xz") {
            SDistFormat::TarXz
        } else if path.ends_with(".tar.Z") {
            SDistFormat::TarZ
        } else if path.ends_with(".tar") {
            SDistFormat::Tar
        } else {
            return Err(ParseArtifactNameError::InvalidExtension(path.into()));
        };
        Ok(format)
    }

    /// The filename suffix of the format.
    pub fn extension(&self) -> &'static str {
        match self {
            SDistFormat::Zip => ".zip",
            SDistFormat::TarGz => ".tar.gz",
            SDistFormat::TarBz2 => ".tar.bz2",
            SDistFormat::TarXz => ".tar.xz",
            SDistFormat::TarZ => ".tar.Z",
            SDistFormat::Tar => ".tar",
        }
    }
}

/// The parts of a source distribution filename: `{name}-{version}{ext}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SDistFilename {
    /// The distribution name as spelled in the filename.
    pub distribution: PackageName,
    /// The distribution version.
    pub version: Version,
    /// The archive format.
    pub format: SDistFormat,
}

impl SDistFilename {
    /// Parses an sdist filename, verifying the distribution part against the
    /// expected project. The name may itself contain dashes, so the split
    /// point is searched from the right.
    pub fn from_filename(
        filename: &str,
        expected: &ProjectKey,
    ) -> Result<Self, ParseArtifactNameError> {
        let format = SDistFormat::from_filename(filename)?;
        let stem = &filename[..filename.len() - format.extension().len()];
        let Some((name_part, version_part)) = stem.rsplit_once('-') else {
            return Err(ParseArtifactNameError::InvalidName(filename.into()));
        };
        let distribution: PackageName = name_part.parse()?;
        if ProjectKey::from(distribution.clone()) != *expected {
            return Err(ParseArtifactNameError::PackageNameMismatch(
                expected.clone(),
                filename.into(),
            ));
        }
        let version = version_part
            .parse()
            .map_err(|_| ParseArtifactNameError::InvalidVersion(version_part.into()))?;
        Ok(SDistFilename {
            distribution,
            version,
            format,
        })
    }
}

impl Display for SDistFilename {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}{}",
            self.distribution.as_given_str(),
            self.version,
            self.format.extension()
        )
    }
}

/// A classified artifact filename: either a wheel or a source distribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactName {
    /// A binary wheel.
    Wheel(WheelFilename),
    /// A source distribution archive.
    SDist(SDistFilename),
}

impl ArtifactName {
    /// The version encoded in the filename.
    pub fn version(&self) -> &Version {
        match self {
            ArtifactName::Wheel(name) => &name.version,
            ArtifactName::SDist(name) => &name.version,
        }
    }

    /// This name as a wheel filename, if it is one.
    pub fn as_wheel(&self) -> Option<&WheelFilename> {
        match self {
            ArtifactName::Wheel(wheel) => Some(wheel),
            ArtifactName::SDist(_) => None,
        }
    }

    /// This name as an sdist filename, if it is one.
    pub fn as_sdist(&self) -> Option<&SDistFilename> {
        match self {
            ArtifactName::Wheel(_) => None,
            ArtifactName::SDist(sdist) => Some(sdist),
        }
    }

    /// Whether the artifact is a wheel.
    pub fn is_wheel(&self) -> bool {
        matches!(self, ArtifactName::Wheel(_))
    }

    /// Parses either artifact form, dispatching on the extension.
    pub fn from_filename(
        filename: &str,
        expected: &ProjectKey,
    ) -> Result<Self, ParseArtifactNameError> {
        if filename.ends_with(".whl") {
            WheelFilename::from_filename(filename, expected).map(ArtifactName::Wheel)
        } else {
            SDistFilename::from_filename(filename, expected).map(ArtifactName::SDist)
        }
    }
}

impl Display for ArtifactName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactName::Wheel(name) => write!(f, "{name}"),
            ArtifactName::SDist(name) => write!(f, "{name}"),
        }
    }
}

/// Error raised when an artifact filename cannot be parsed.
#[derive(Debug, Clone, Error)]
#[allow(missing_docs)]
pub enum ParseArtifactNameError {
    #[error("invalid artifact name '{0}'")]
    InvalidName(String),

    #[error("expected project '{0}' in filename '{1}'")]
    PackageNameMismatch(ProjectKey, String),

    #[error("unrecognized artifact extension in '{0}'")]
    InvalidExtension(String),

    #[error(transparent)]
    InvalidPackageName(#[from] ParsePackageNameError),

    #[error("invalid version '{0}' in artifact name")]
    InvalidVersion(String),

    #[error("build tag '{0}' must start with a digit")]
    InvalidBuildTag(String),
}

#[cfg(test)]
mod test {
    use super::*;

    fn key(name: &str) -> ProjectKey {
        name.parse().unwrap()
    }

    #[test]
    fn test_wheel_filename() {
        let name =
            WheelFilename::from_filename("Django-2.2.9-py3-none-any.whl", &key("django")).unwrap();
        assert_eq!(name.version, "2.2.9".parse().unwrap());
        assert_eq!(name.py_tags, vec!["py3"]);
        assert_eq!(name.to_string(), "Django-2.2.9-py3-none-any.whl");

        let name = WheelFilename::from_filename(
            "cryptography-41.0.0-1-cp37-abi3-manylinux_2_17_x86_64.manylinux2014_x86_64.whl",
            &key("cryptography"),
        )
        .unwrap();
        assert_eq!(name.build_tag.as_deref(), Some("1"));
        assert_eq!(name.arch_tags.len(), 2);
        assert_eq!(name.all_tags().count(), 2);

        assert!(WheelFilename::from_filename("Django-2.2.9-py3-none-any.whl", &key("flask"))
            .is_err());
    }

    #[test]
    fn test_sdist_filename() {
        let name = SDistFilename::from_filename("python-dateutil-2.8.1.tar.gz", &key("python-dateutil"))
            .unwrap();
        assert_eq!(name.version, "2.8.1".parse().unwrap());
        assert_eq!(name.format, SDistFormat::TarGz);
        assert_eq!(name.to_string(), "python-dateutil-2.8.1.tar.gz");

        let name = ArtifactName::from_filename("demo-0.0.1.zip", &key("demo")).unwrap();
        assert!(!name.is_wheel());
    }
}
