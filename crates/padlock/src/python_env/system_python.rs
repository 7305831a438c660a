use crate::types::Version;
use miette::Diagnostic;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// A target python interpreter: its executable and interpreter version.
#[derive(Debug, Clone)]
pub struct PythonInterpreter {
    /// The path of the python executable.
    pub executable: PathBuf,
    /// The interpreter version, three release components.
    pub version: Version,
}

/// Error raised when no usable interpreter can be located or probed.
#[derive(Debug, Error, Diagnostic)]
pub enum PythonLookupError {
    /// Nothing that looks like python was found.
    #[error("could not find a python interpreter")]
    NotFound,

    /// The candidate executable could not be run.
    #[error("failed to execute {0}: {1}")]
    FailedToExecute(PathBuf, #[source] std::io::Error),

    /// The probe script did not produce what we expect.
    #[error("failed to interrogate {0}: {1}")]
    BadProbeOutput(PathBuf, String),
}

const VERSION_PROBE: &str =
    "import sys, json; json.dump({'version': '%d.%d.%d' % sys.version_info[:3]}, sys.stdout)";

#[derive(Deserialize)]
struct VersionProbe {
    version: String,
}

impl PythonInterpreter {
    /// Probes `executable` for its version.
    pub fn from_executable(executable: PathBuf) -> Result<Self, PythonLookupError> {
        let output = std::process::Command::new(&executable)
            .arg("-c")
            .arg(VERSION_PROBE)
            .output()
            .map_err(|e| PythonLookupError::FailedToExecute(executable.clone(), e))?;
        if !output.status.success() {
            return Err(PythonLookupError::BadProbeOutput(
                executable,
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        let probe: VersionProbe = serde_json::from_slice(&output.stdout)
            .map_err(|e| PythonLookupError::BadProbeOutput(executable.clone(), e.to_string()))?;
        let version = probe
            .version
            .parse()
            .map_err(|e: crate::types::ParseVersionError| {
                PythonLookupError::BadProbeOutput(executable.clone(), e.to_string())
            })?;
        Ok(PythonInterpreter {
            executable,
            version,
        })
    }

    /// The `X.Y` form used in path names.
    pub fn major_minor(&self) -> String {
        format!(
            "{}.{}",
            self.version.bit(0).unwrap_or(3),
            self.version.bit(1).unwrap_or(0)
        )
    }
}

fn interpreter_in_prefix(prefix: &Path) -> Option<PathBuf> {
    let candidates = if cfg!(windows) {
        vec![prefix.join("Scripts").join("python.exe"), prefix.join("python.exe")]
    } else {
        vec![prefix.join("bin").join("python3"), prefix.join("bin").join("python")]
    };
    candidates.into_iter().find(|p| p.is_file())
}

/// Finds the target interpreter: an activated virtual environment or conda
/// prefix wins, then the first `python3`/`python` on PATH. Setting
/// `PDM_IGNORE_SAVED_PYTHON` skips any environment-provided interpreter and
/// forces PATH discovery.
pub fn find_interpreter() -> Result<PythonInterpreter, PythonLookupError> {
    let ignore_saved = std::env::var_os("PDM_IGNORE_SAVED_PYTHON").is_some();
    if !ignore_saved {
        for var in ["VIRTUAL_ENV", "CONDA_PREFIX"] {
            if let Some(prefix) = std::env::var_os(var) {
                if let Some(executable) = interpreter_in_prefix(Path::new(&prefix)) {
                    tracing::debug!("using interpreter from ${var}: {}", executable.display());
                    return PythonInterpreter::from_executable(executable);
                }
            }
        }
    }
    for name in ["python3", "python"] {
        if let Ok(executable) = which::which(name) {
            return PythonInterpreter::from_executable(executable);
        }
    }
    Err(PythonLookupError::NotFound)
}

/// The sysconfig install scheme of a prefix, as reported by the target
/// interpreter.
#[derive(Debug, Clone, Deserialize)]
pub struct SysconfigPaths {
    /// The scripts directory (`bin` on posix).
    pub scripts: PathBuf,
    /// Platform-specific libraries.
    pub platlib: PathBuf,
    /// Pure python libraries.
    pub purelib: PathBuf,
}

/// Asks the interpreter for the install paths of a prefix, the same way the
/// build frontend will see them.
pub fn sysconfig_paths(
    interpreter: &PythonInterpreter,
    prefix: &Path,
) -> Result<SysconfigPaths, PythonLookupError> {
    const PROBE: &str = r#"
import json, sys, sysconfig
prefix = sys.argv[1]
vars = {"base": prefix, "platbase": prefix, "installed_base": prefix, "installed_platbase": prefix}
scheme = "nt" if sysconfig.get_platform().startswith("win") else "posix_prefix"
paths = sysconfig.get_paths(scheme, vars=vars)
json.dump({"scripts": paths["scripts"], "platlib": paths["platlib"], "purelib": paths["purelib"]}, sys.stdout)
"#;
    let output = std::process::Command::new(&interpreter.executable)
        .arg("-c")
        .arg(PROBE)
        .arg(prefix)
        .output()
        .map_err(|e| PythonLookupError::FailedToExecute(interpreter.executable.clone(), e))?;
    if !output.status.success() {
        return Err(PythonLookupError::BadProbeOutput(
            interpreter.executable.clone(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }
    serde_json::from_slice(&output.stdout).map_err(|e| {
        PythonLookupError::BadProbeOutput(interpreter.executable.clone(), e.to_string())
    })
}

/// Queries the full PEP 508 marker environment of the interpreter.
pub fn marker_environment(
    interpreter: &PythonInterpreter,
) -> Result<HashMap<String, String>, PythonLookupError> {
    const PROBE: &str = r#"
import json, os, platform, sys
def format_full_version(info):
    version = "{0.major}.{0.minor}.{0.micro}".format(info)
    kind = info.releaselevel
    if kind != "final":
        version += kind[0] + str(info.serial)
    return version
env = {
    "implementation_name": sys.implementation.name,
    "implementation_version": format_full_version(sys.implementation.version),
    "os_name": os.name,
    "platform_machine": platform.machine(),
    "platform_release": platform.release(),
    "platform_system": platform.system(),
    "platform_version": platform.version(),
    "python_full_version": platform.python_version(),
    "platform_python_implementation": platform.python_implementation(),
    "python_version": ".".join(platform.python_version_tuple()[:2]),
    "sys_platform": sys.platform,
}
json.dump(env, sys.stdout)
"#;
    let output = std::process::Command::new(&interpreter.executable)
        .arg("-c")
        .arg(PROBE)
        .output()
        .map_err(|e| PythonLookupError::FailedToExecute(interpreter.executable.clone(), e))?;
    if !output.status.success() {
        return Err(PythonLookupError::BadProbeOutput(
            interpreter.executable.clone(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }
    serde_json::from_slice(&output.stdout).map_err(|e| {
        PythonLookupError::BadProbeOutput(interpreter.executable.clone(), e.to_string())
    })
}
