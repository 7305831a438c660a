//! The candidate preparation pipeline: fetch, unpack, build, and extract
//! distribution metadata for candidates whose information is not served by
//! an index.

mod unpack;

pub use unpack::{unpack_sdist, wheel_metadata_bytes};

use crate::project::ProjectContext;
use crate::types::{
    link_from_requirement, Candidate, CoreMetadata, EnvSpec, Link, Requirement, SDistFormat,
    VcsKind,
};
use crate::wheel_builder::{is_cacheable, WheelBuilder, WheelCache};
use miette::Diagnostic;
use std::path::{Path, PathBuf};
use thiserror::Error;
use toml_edit::{DocumentMut, Item};

/// Error raised while preparing a candidate.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum PrepareError {
    #[error("candidate has no usable link")]
    NoLink,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] crate::index::HttpError),

    #[error("failed to check out {url}: {reason}")]
    Vcs {
        url: String,
        reason: String,
    },

    #[error(transparent)]
    Build(#[from] crate::wheel_builder::WheelBuildError),

    #[error("invalid metadata: {0}")]
    Metadata(#[from] crate::types::CoreMetadataError),

    #[error("unsupported sdist format: {0}")]
    UnsupportedFormat(String),
}

/// The outcome of preparing one candidate.
#[derive(Debug)]
pub struct Prepared {
    /// The raw `METADATA` bytes, for the metadata cache.
    pub blob: Vec<u8>,
    /// The parsed metadata.
    pub metadata: CoreMetadata,
    /// The wheel that was downloaded or built, when one was produced.
    pub wheel: Option<PathBuf>,
    /// The immutable VCS revision the checkout resolved to.
    pub revision: Option<String>,
}

/// Prepares a candidate far enough to know its metadata: downloads wheels,
/// unpacks sdists, checks out VCS sources, and falls back to a PEP 517 build
/// when no static metadata can be trusted.
pub async fn prepare(
    context: &ProjectContext,
    candidate: &Candidate,
    env_spec: &EnvSpec,
    builder: Option<&WheelBuilder>,
) -> Result<Prepared, PrepareError> {
    let link = candidate
        .link
        .clone()
        .or_else(|| link_from_requirement(&candidate.req, Some(&context.root)))
        .ok_or(PrepareError::NoLink)?;

    let identifier = candidate.identify();
    let scratch = context.scratch_dir(&sanitize_label(&identifier))?;

    // wheels carry their metadata, nothing to build
    if link.is_wheel() {
        let wheel_cache = if is_cacheable(&candidate.req, &link) {
            WheelCache::new(context.wheel_cache_root())
        } else {
            WheelCache::new(context.ephemeral_wheel_root().join("wheels"))
        };
        let wheel = match wheel_cache.get(&link, env_spec, None) {
            Some(cached) => cached,
            None => {
                let fetched = fetch_artifact(context, &link, &scratch).await?;
                if link.file_path().is_some() {
                    // local wheels are used in place
                    fetched
                } else {
                    wheel_cache.store(&link, env_spec, None, &fetched)?
                }
            }
        };
        let blob = wheel_metadata_bytes(fs_err::File::open(&wheel)?.into_parts().0)?;
        let metadata = CoreMetadata::try_from(blob.as_slice())?;
        return Ok(Prepared {
            blob,
            metadata,
            wheel: Some(wheel),
            revision: None,
        });
    }

    // everything else needs a source tree on disk
    let (source_dir, revision) = obtain_source_tree(context, candidate, &link, &scratch).await?;
    let source_dir = match subdirectory(&candidate.req) {
        Some(sub) => source_dir.join(sub),
        None => source_dir,
    };

    // static metadata wins over running a build backend
    if let Some((blob, metadata)) = static_metadata(&source_dir)? {
        tracing::debug!("using static metadata for {identifier}");
        return Ok(Prepared {
            blob,
            metadata,
            wheel: None,
            revision,
        });
    }

    let builder = builder.ok_or_else(|| {
        PrepareError::Build(crate::wheel_builder::WheelBuildError::Environment(
            "no build backend driver is configured for this resolution".to_string(),
        ))
    })?;

    // the persistent cache only holds wheels from immutable sources
    let wheel_cache = if is_cacheable(&candidate.req, &link) {
        WheelCache::new(context.wheel_cache_root())
    } else {
        WheelCache::new(context.ephemeral_wheel_root().join("wheels"))
    };
    if let Some(wheel) = wheel_cache.get(&link, env_spec, subdirectory(&candidate.req).as_deref()) {
        tracing::debug!("reusing cached wheel {}", wheel.display());
        let blob = wheel_metadata_bytes(fs_err::File::open(&wheel)?.into_parts().0)?;
        let metadata = CoreMetadata::try_from(blob.as_slice())?;
        return Ok(Prepared {
            blob,
            metadata,
            wheel: Some(wheel),
            revision,
        });
    }

    let overlay_root = context.scratch_dir(&format!("{}-env", sanitize_label(&identifier)))?;
    let editable = candidate.req.core().editable;
    let (blob, metadata, wheel) = tokio::task::block_in_place(|| {
        if editable {
            // editable installs always produce a wheel (PEP 660 or the
            // setuptools_pep660 fallback inside the frontend)
            let wheel = builder.build_wheel(&source_dir, &overlay_root, true)?;
            let blob = wheel_metadata_bytes(fs_err::File::open(&wheel)?.into_parts().0)?;
            let metadata = CoreMetadata::try_from(blob.as_slice())?;
            Ok::<_, PrepareError>((blob, metadata, Some(wheel)))
        } else {
            let (blob, metadata) = builder.get_metadata(&source_dir, &overlay_root)?;
            Ok((blob, metadata, None))
        }
    })?;
    if let Some(wheel) = &wheel {
        let stored =
            wheel_cache.store(&link, env_spec, subdirectory(&candidate.req).as_deref(), wheel)?;
        return Ok(Prepared {
            blob,
            metadata,
            wheel: Some(stored),
            revision,
        });
    }
    Ok(Prepared {
        blob,
        metadata,
        wheel,
        revision,
    })
}

fn subdirectory(req: &Requirement) -> Option<String> {
    match req {
        Requirement::File(r) => r.subdirectory.clone(),
        Requirement::Vcs(r) => r.file.subdirectory.clone(),
        Requirement::Named(_) => None,
    }
}

fn sanitize_label(identifier: &str) -> String {
    identifier
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// Downloads (or locates) the artifact behind `link`, returning a local
/// path.
async fn fetch_artifact(
    context: &ProjectContext,
    link: &Link,
    scratch: &Path,
) -> Result<PathBuf, PrepareError> {
    if let Some(path) = link.file_path() {
        return Ok(path);
    }
    let filename = link
        .filename()
        .unwrap_or_else(|| "artifact.bin".to_string());
    let target = scratch.join(filename);
    if !target.exists() {
        let mut file = fs_err::File::create(&target)?;
        context.http.download(link.url.clone(), &mut file).await?;
    }
    Ok(target)
}

/// Turns the link into a source tree on disk: VCS sources are checked out
/// (persistently for editable requirements), local directories are used in
/// place, and archives are fetched and unpacked.
async fn obtain_source_tree(
    context: &ProjectContext,
    candidate: &Candidate,
    link: &Link,
    scratch: &Path,
) -> Result<(PathBuf, Option<String>), PrepareError> {
    if let Requirement::Vcs(vcs) = &candidate.req {
        let target = if candidate.req.core().editable {
            // editable checkouts persist under the project's src directory
            let name = candidate
                .req
                .key()
                .map(|k| k.to_string())
                .unwrap_or_else(|| sanitize_label(&candidate.identify()));
            context.src_root().join(name)
        } else {
            scratch.join("checkout")
        };
        let revision = checkout(vcs.vcs, &vcs.repo, vcs.ref_name.as_deref(), &target).await?;
        return Ok((target, Some(revision)));
    }
    if link.is_local_dir() {
        let dir = link.file_path().ok_or(PrepareError::NoLink)?;
        return Ok((dir, None));
    }
    let archive = fetch_artifact(context, link, scratch).await?;
    let name = archive.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let format = SDistFormat::from_filename(name)
        .map_err(|e| PrepareError::UnsupportedFormat(e.to_string()))?;
    let unpacked = scratch.join("unpacked");
    let source_dir = unpack_sdist(&archive, format, &unpacked)?;
    Ok((source_dir, None))
}

/// Clones/updates a VCS source at the requested ref and reports the resolved
/// immutable revision.
async fn checkout(
    vcs: VcsKind,
    repo: &str,
    ref_name: Option<&str>,
    target: &Path,
) -> Result<String, PrepareError> {
    let vcs_error = |reason: String| PrepareError::Vcs {
        url: repo.to_string(),
        reason,
    };
    let run = |mut command: tokio::process::Command| async move {
        let output = command
            .output()
            .await
            .map_err(|e| vcs_error(e.to_string()))?;
        if !output.status.success() {
            return Err(vcs_error(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    };

    let program = vcs.as_str();
    if !target.join(source_marker(vcs)).exists() {
        if let Some(parent) = target.parent() {
            fs_err::create_dir_all(parent)?;
        }
        let mut clone = tokio::process::Command::new(program);
        match vcs {
            VcsKind::Git | VcsKind::Hg => {
                clone.arg("clone").arg(repo).arg(target);
            }
            VcsKind::Svn => {
                clone.arg("checkout").arg(repo).arg(target);
            }
            VcsKind::Bzr => {
                clone.arg("branch").arg(repo).arg(target);
            }
        }
        run(clone).await?;
    }
    if let Some(ref_name) = ref_name {
        let mut switch = tokio::process::Command::new(program);
        switch.current_dir(target);
        match vcs {
            VcsKind::Git => {
                switch.arg("checkout").arg(ref_name);
            }
            VcsKind::Hg => {
                switch.arg("update").arg(ref_name);
            }
            VcsKind::Svn | VcsKind::Bzr => {
                switch.arg("update").arg("-r").arg(ref_name);
            }
        }
        run(switch).await?;
    }
    // resolve the revision actually checked out
    let mut resolve = tokio::process::Command::new(program);
    resolve.current_dir(target);
    match vcs {
        VcsKind::Git => {
            resolve.arg("rev-parse").arg("HEAD");
        }
        VcsKind::Hg => {
            resolve.arg("id").arg("-i");
        }
        VcsKind::Svn => {
            resolve.arg("info").arg("--show-item").arg("revision");
        }
        VcsKind::Bzr => {
            resolve.arg("revno");
        }
    }
    run(resolve).await
}

fn source_marker(vcs: VcsKind) -> &'static str {
    match vcs {
        VcsKind::Git => ".git",
        VcsKind::Hg => ".hg",
        VcsKind::Svn => ".svn",
        VcsKind::Bzr => ".bzr",
    }
}

/// Extracts metadata from the source tree without building, when it can be
/// trusted: a PEP 643 `PKG-INFO` without dynamic core fields, or a
/// `pyproject.toml` whose `[project]` table declares none of the fields the
/// resolver needs as dynamic.
fn static_metadata(source_dir: &Path) -> Result<Option<(Vec<u8>, CoreMetadata)>, PrepareError> {
    if let Ok(blob) = fs_err::read(source_dir.join("PKG-INFO")) {
        if let Ok(metadata) = CoreMetadata::try_from(blob.as_slice()) {
            if metadata.implements_pep643() && !metadata.core_fields_are_dynamic() {
                return Ok(Some((blob, metadata)));
            }
        }
    }
    let Ok(text) = fs_err::read_to_string(source_dir.join("pyproject.toml")) else {
        return Ok(None);
    };
    Ok(pyproject_metadata(&text))
}

/// The `[project]` table as core metadata, `None` when any resolver-relevant
/// field is dynamic or required parts are missing.
fn pyproject_metadata(text: &str) -> Option<(Vec<u8>, CoreMetadata)> {
    let doc: DocumentMut = text.parse().ok()?;
    let project = doc.get("project")?.as_table_like()?;

    const CORE_FIELDS: &[&str] = &[
        "name",
        "version",
        "dependencies",
        "optional-dependencies",
        "requires-python",
    ];
    if let Some(dynamic) = project.get("dynamic").and_then(Item::as_array) {
        let any_core_dynamic = dynamic
            .iter()
            .filter_map(|v| v.as_str())
            .any(|field| CORE_FIELDS.contains(&field));
        if any_core_dynamic {
            return None;
        }
    }

    let name = project.get("name")?.as_str()?;
    let version = project.get("version")?.as_str()?;

    // synthesize a METADATA document so one parser serves every source
    let mut lines = vec![
        "Metadata-Version: 2.1".to_string(),
        format!("Name: {name}"),
        format!("Version: {version}"),
    ];
    if let Some(requires_python) = project.get("requires-python").and_then(Item::as_str) {
        lines.push(format!("Requires-Python: {requires_python}"));
    }
    if let Some(deps) = project.get("dependencies").and_then(Item::as_array) {
        for dep in deps.iter().filter_map(|v| v.as_str()) {
            lines.push(format!("Requires-Dist: {dep}"));
        }
    }
    if let Some(optional) = project
        .get("optional-dependencies")
        .and_then(Item::as_table_like)
    {
        for (extra, deps) in optional.iter() {
            lines.push(format!("Provides-Extra: {extra}"));
            if let Some(deps) = deps.as_array() {
                for dep in deps.iter().filter_map(|v| v.as_str()) {
                    let line = match dep.split_once(';') {
                        Some((req, marker)) => format!(
                            "Requires-Dist: {}; ({}) and extra == \"{extra}\"",
                            req.trim(),
                            marker.trim()
                        ),
                        None => format!("Requires-Dist: {dep}; extra == \"{extra}\""),
                    };
                    lines.push(line);
                }
            }
        }
    }
    let blob = format!("{}\n", lines.join("\n")).into_bytes();
    let metadata = CoreMetadata::try_from(blob.as_slice()).ok()?;
    Some((blob, metadata))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pyproject_static_metadata() {
        let text = r#"
[project]
name = "demo"
version = "0.0.1"
requires-python = ">=3.6"
dependencies = ["idna"]

[project.optional-dependencies]
enc = ["chardet"]
"#;
        let (_, metadata) = pyproject_metadata(text).unwrap();
        assert_eq!(metadata.name.as_str(), "demo");
        assert_eq!(metadata.requires_dist.len(), 2);
        assert_eq!(metadata.extras.len(), 1);

        // a dynamic core field disables the static path
        let dynamic = text.replace(
            "version = \"0.0.1\"",
            "dynamic = [\"version\"]",
        );
        assert!(pyproject_metadata(&dynamic).is_none());
    }

    #[test]
    fn test_static_metadata_prefers_pkg_info() {
        let dir = tempfile::tempdir().unwrap();
        fs_err::write(
            dir.path().join("PKG-INFO"),
            "Metadata-Version: 2.2\nName: demo\nVersion: 0.0.2\n",
        )
        .unwrap();
        let (_, metadata) = static_metadata(dir.path()).unwrap().unwrap();
        assert_eq!(metadata.version, "0.0.2".parse().unwrap());

        // a PKG-INFO predating PEP 643 cannot be trusted
        fs_err::write(
            dir.path().join("PKG-INFO"),
            "Metadata-Version: 2.1\nName: demo\nVersion: 0.0.2\n",
        )
        .unwrap();
        assert!(static_metadata(dir.path()).unwrap().is_none());
    }
}
