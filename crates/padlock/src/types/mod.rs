//! The data model shared across the crate: names, versions, specifiers,
//! markers, requirements, candidates and environment descriptions.

mod artifact_name;
mod candidate;
mod core_metadata;
mod env_spec;
mod extra;
mod link;
mod marker;
mod package_name;
mod pyspec;
mod reqparse;
mod requirement;
mod rfc822ish;
mod specifier;
mod version;

pub use artifact_name::{
    ArtifactName, ParseArtifactNameError, SDistFilename, SDistFormat, WheelFilename, WheelTag,
};
pub use candidate::Candidate;
pub use core_metadata::{CoreMetadata, CoreMetadataError};
pub use env_spec::EnvSpec;
pub use extra::{Extra, ParseExtraError};
pub use link::{FileHash, Link, VcsKind};
pub use marker::{Env, EvalMarkerError, Marker, MarkerExpr, MarkerOp, MarkerValue, ParseMarkerError};
pub use package_name::{normalize_name, PackageName, ParsePackageNameError, ProjectKey};
pub use pyspec::{ParsePySpecError, PySpecSet};
pub use requirement::{
    filter_requirements_with_extras, from_req_dict, is_unnamed_identifier, link_from_requirement,
    parse_line, parse_requirement, requirement_from_override, strip_extras, FileRequirement,
    NamedRequirement, Requirement, RequirementCore, RequirementError, VcsRequirement,
};
pub use rfc822ish::{Rfc822ish, Rfc822ishError};
pub use specifier::{CompareOp, ParseSpecifierError, Specifier, Specifiers};
pub use version::{ParseVersionError, PreTag, Version, VersionBit, VERSION_MAX, VERSION_MIN};
