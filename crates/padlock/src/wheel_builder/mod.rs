//! Building wheels (and extracting metadata) from source trees via the
//! PEP 517 hook protocol, inside an isolated build environment.

mod build_environment;
mod wheel_cache;

pub use build_environment::{BuildEnvInstaller, BuildEnvironment, PipInstaller};
pub use wheel_cache::{is_cacheable, WheelCache};

use crate::python_env::PythonInterpreter;
use crate::types::{CoreMetadata, CoreMetadataError, Requirement};
use miette::Diagnostic;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use toml_edit::DocumentMut;

// the python half of the PEP 517 driver, written next to each build
const BUILD_FRONTEND_PY: &str = include_str!("./build_frontend.py");

const DEFAULT_BUILD_BACKEND: &str = "setuptools.build_meta:__legacy__";
const DEFAULT_BUILD_REQUIREMENTS: &[&str] = &["setuptools", "wheel"];

/// Error raised while building a wheel or extracting metadata from source.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum WheelBuildError {
    #[error("build backend raised an error:\n{0}")]
    BackendFailed(String),

    #[error("could not run command {0}: {1}")]
    CouldNotRunCommand(String, #[source] std::io::Error),

    #[error("could not set up the build environment: {0}")]
    Environment(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid extra_requirements.json: {0}")]
    InvalidExtraRequirements(#[from] serde_json::Error),

    #[error("the generated metadata is invalid: {0}")]
    InvalidMetadata(#[from] CoreMetadataError),

    #[error("the built wheel is invalid: {0}")]
    InvalidWheel(String),
}

impl WheelBuildError {
    /// Shapes a backend failure out of the captured log tail, attaching a
    /// hint when the final line points at a missing build dependency.
    pub(crate) fn backend_failure(tail: Vec<String>) -> Self {
        let mut lines: Vec<String> = Vec::new();
        if let Some(last) = tail.last() {
            if last.trim_start().starts_with("ModuleNotFoundError") {
                let module = last.trim().rsplit(' ').next().unwrap_or_default();
                lines.push(format!(
                    "Module {module} is missing, please make sure it is specified in the \
                     'build-system.requires' section."
                ));
            }
        }
        lines.push(format!("Showing the last {} lines of the build output:", tail.len()));
        lines.extend(tail);
        WheelBuildError::BackendFailed(lines.join("\n"))
    }
}

/// The `[build-system]` table of a source tree.
#[derive(Debug, Clone)]
pub struct BuildSystem {
    /// The declared build requirements.
    pub requires: Vec<Requirement>,
    /// The backend entry point.
    pub build_backend: String,
}

impl BuildSystem {
    /// Reads `pyproject.toml` in `source_dir`, falling back to the legacy
    /// setuptools backend when absent or incomplete.
    pub fn from_source_dir(source_dir: &Path) -> Self {
        let fallback = || BuildSystem {
            requires: DEFAULT_BUILD_REQUIREMENTS
                .iter()
                .map(|line| line.parse().expect("static requirement lines parse"))
                .collect(),
            build_backend: DEFAULT_BUILD_BACKEND.to_string(),
        };
        let Ok(text) = fs_err::read_to_string(source_dir.join("pyproject.toml")) else {
            return fallback();
        };
        let Ok(doc) = text.parse::<DocumentMut>() else {
            return fallback();
        };
        let Some(table) = doc.get("build-system").and_then(toml_edit::Item::as_table_like)
        else {
            return fallback();
        };
        let requires: Vec<Requirement> = table
            .get("requires")
            .and_then(toml_edit::Item::as_array)
            .map(|array| {
                array
                    .iter()
                    .filter_map(|v| v.as_str())
                    .filter_map(|line| line.parse().ok())
                    .collect()
            })
            .unwrap_or_default();
        let build_backend = table
            .get("build-backend")
            .and_then(toml_edit::Item::as_str)
            .unwrap_or(DEFAULT_BUILD_BACKEND)
            .to_string();
        BuildSystem {
            requires: if requires.is_empty() {
                fallback().requires
            } else {
                requires
            },
            build_backend,
        }
    }
}

/// Drives PEP 517 builds for source trees, caching build environments per
/// source so metadata extraction and the subsequent wheel build reuse the
/// same environment.
pub struct WheelBuilder {
    interpreter: PythonInterpreter,
    installer: Arc<dyn BuildEnvInstaller>,
    shared_env_root: PathBuf,
    env_cache: Mutex<HashMap<PathBuf, Arc<BuildEnvironment>>>,
}

impl WheelBuilder {
    /// A builder for the given interpreter. Shared build environments are
    /// cached under `shared_env_root`.
    pub fn new(
        interpreter: PythonInterpreter,
        installer: Arc<dyn BuildEnvInstaller>,
        shared_env_root: PathBuf,
    ) -> Self {
        WheelBuilder {
            interpreter,
            installer,
            shared_env_root,
            env_cache: Mutex::new(HashMap::new()),
        }
    }

    fn environment_for(
        &self,
        source_dir: &Path,
        overlay_root: &Path,
        build_system: &BuildSystem,
    ) -> Result<Arc<BuildEnvironment>, WheelBuildError> {
        if let Some(env) = self.env_cache.lock().get(source_dir) {
            tracing::debug!("reusing build environment for {}", source_dir.display());
            return Ok(Arc::clone(env));
        }
        let env = Arc::new(BuildEnvironment::setup(
            &self.interpreter,
            &build_system.requires,
            self.installer.as_ref(),
            &self.shared_env_root,
            overlay_root,
        )?);
        self.collect_extra_requirements(source_dir, overlay_root, build_system, &env)?;
        self.env_cache
            .lock()
            .insert(source_dir.to_path_buf(), Arc::clone(&env));
        Ok(env)
    }

    /// Asks the backend for dynamic build requirements and installs them
    /// into the overlay.
    fn collect_extra_requirements(
        &self,
        source_dir: &Path,
        overlay_root: &Path,
        build_system: &BuildSystem,
        env: &BuildEnvironment,
    ) -> Result<(), WheelBuildError> {
        let frontend = self.write_frontend(overlay_root)?;
        let (status, tail) = env.run_stage(
            source_dir,
            &frontend,
            &build_system.build_backend,
            "GetRequiresForBuildWheel",
        )?;
        if !status.success() {
            return Err(WheelBuildError::backend_failure(tail));
        }
        let raw = fs_err::read_to_string(source_dir.join("extra_requirements.json"))?;
        let lines: Vec<String> = serde_json::from_str(&raw)?;
        let extra: Vec<Requirement> = lines
            .iter()
            .filter_map(|line| line.parse().ok())
            .filter(|req: &Requirement| {
                !build_system.requires.iter().any(|have| have == req)
            })
            .collect();
        if !extra.is_empty() {
            tracing::info!(
                "installing extra build requirements: {:?}",
                extra.iter().map(|r| r.as_line()).collect::<Vec<_>>()
            );
            env.install_extra_requirements(&extra, self.installer.as_ref())?;
        }
        Ok(())
    }

    fn write_frontend(&self, overlay_root: &Path) -> Result<PathBuf, WheelBuildError> {
        let path = overlay_root.join("build_frontend.py");
        if !path.exists() {
            fs_err::write(&path, BUILD_FRONTEND_PY)?;
        }
        Ok(path)
    }

    /// Extracts core metadata from a source tree via the
    /// `prepare_metadata_for_build_wheel` hook, building a full wheel when
    /// the backend does not implement it.
    #[tracing::instrument(skip_all, fields(source = %source_dir.display()))]
    pub fn get_metadata(
        &self,
        source_dir: &Path,
        overlay_root: &Path,
    ) -> Result<(Vec<u8>, CoreMetadata), WheelBuildError> {
        let build_system = BuildSystem::from_source_dir(source_dir);
        let env = self.environment_for(source_dir, overlay_root, &build_system)?;
        let frontend = self.write_frontend(overlay_root)?;
        let (status, tail) = env.run_stage(
            source_dir,
            &frontend,
            &build_system.build_backend,
            "WheelMetadata",
        )?;
        if !status.success() {
            if status.code() == Some(50) {
                tracing::warn!("build backend cannot prepare metadata, building a wheel instead");
                let wheel = self.build_wheel(source_dir, overlay_root, false)?;
                return read_wheel_metadata(&wheel);
            }
            return Err(WheelBuildError::backend_failure(tail));
        }
        let result = fs_err::read_to_string(source_dir.join("metadata_result"))?;
        let metadata_path = PathBuf::from(result.trim()).join("METADATA");
        let blob = fs_err::read(&metadata_path)?;
        let metadata = CoreMetadata::try_from(blob.as_slice())?;
        Ok((blob, metadata))
    }

    /// Builds a wheel from a source tree. Editable builds use the PEP 660
    /// hook, with the frontend falling back to `setuptools_pep660` for
    /// backends that predate it.
    #[tracing::instrument(skip_all, fields(source = %source_dir.display(), editable))]
    pub fn build_wheel(
        &self,
        source_dir: &Path,
        overlay_root: &Path,
        editable: bool,
    ) -> Result<PathBuf, WheelBuildError> {
        let build_system = BuildSystem::from_source_dir(source_dir);
        let env = self.environment_for(source_dir, overlay_root, &build_system)?;
        let frontend = self.write_frontend(overlay_root)?;
        let stage = if editable { "EditableWheel" } else { "Wheel" };
        let (status, tail) =
            env.run_stage(source_dir, &frontend, &build_system.build_backend, stage)?;
        if !status.success() {
            return Err(WheelBuildError::backend_failure(tail));
        }
        let result = fs_err::read_to_string(source_dir.join("wheel_result"))?;
        Ok(PathBuf::from(result.trim()))
    }
}

/// Reads the `METADATA` file out of a wheel archive.
pub fn read_wheel_metadata(wheel: &Path) -> Result<(Vec<u8>, CoreMetadata), WheelBuildError> {
    let file = fs_err::File::open(wheel)?;
    let mut archive = zip::ZipArchive::new(file.into_parts().0)
        .map_err(|e| WheelBuildError::InvalidWheel(e.to_string()))?;
    let metadata_entry = archive
        .file_names()
        .filter(|name| name.ends_with(".dist-info/METADATA") && name.matches('/').count() == 1)
        .map(|name| name.to_string())
        .next()
        .ok_or_else(|| WheelBuildError::InvalidWheel("no .dist-info/METADATA entry".into()))?;
    let mut entry = archive
        .by_name(&metadata_entry)
        .map_err(|e| WheelBuildError::InvalidWheel(e.to_string()))?;
    let mut blob = Vec::new();
    entry.read_to_end(&mut blob)?;
    let metadata = CoreMetadata::try_from(blob.as_slice())?;
    Ok((blob, metadata))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_build_system_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let system = BuildSystem::from_source_dir(dir.path());
        assert_eq!(system.build_backend, DEFAULT_BUILD_BACKEND);
        assert_eq!(system.requires.len(), 2);

        fs_err::write(
            dir.path().join("pyproject.toml"),
            "[build-system]\nrequires = [\"hatchling\"]\nbuild-backend = \"hatchling.build\"\n",
        )
        .unwrap();
        let system = BuildSystem::from_source_dir(dir.path());
        assert_eq!(system.build_backend, "hatchling.build");
        assert_eq!(system.requires[0].identify(), "hatchling");
    }

    #[test]
    fn test_backend_failure_hint() {
        let err = WheelBuildError::backend_failure(vec![
            "Traceback (most recent call last):".to_string(),
            "ModuleNotFoundError: No module named 'setuptools'".to_string(),
        ]);
        let message = err.to_string();
        assert!(message.contains("'setuptools'"));
        assert!(message.contains("build-system.requires"));
        assert!(message.contains("last 2 lines"));
    }
}
