use super::WheelBuildError;
use crate::python_env::{sysconfig_paths, PythonInterpreter, SysconfigPaths};
use crate::types::Requirement;
use parking_lot::Mutex;
use rattler_digest::{compute_bytes_digest, Sha256};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

/// How many trailing output lines are kept for the build error report.
const LOG_TAIL_LINES: usize = 10;

/// Populates a prefix environment with resolved requirements. Installing
/// wheels into an environment is outside this crate; the embedding
/// application supplies the implementation (the default shells out to pip).
pub trait BuildEnvInstaller: Send + Sync {
    /// Installs `requirements` into the prefix at `prefix`.
    fn install(&self, requirements: &[Requirement], prefix: &Path) -> Result<(), WheelBuildError>;
}

/// The default installer: `python -m pip install --prefix`.
pub struct PipInstaller {
    interpreter: PythonInterpreter,
}

impl PipInstaller {
    /// An installer driving the given interpreter's pip.
    pub fn new(interpreter: PythonInterpreter) -> Self {
        PipInstaller { interpreter }
    }
}

impl BuildEnvInstaller for PipInstaller {
    fn install(&self, requirements: &[Requirement], prefix: &Path) -> Result<(), WheelBuildError> {
        if requirements.is_empty() {
            return Ok(());
        }
        let mut command = Command::new(&self.interpreter.executable);
        command
            .args(["-m", "pip", "install", "--no-warn-script-location", "--prefix"])
            .arg(prefix);
        for requirement in requirements {
            command.arg(requirement.as_line());
        }
        let (status, tail) = run_with_tail(command)?;
        if !status.success() {
            return Err(WheelBuildError::backend_failure(tail));
        }
        Ok(())
    }
}

/// Runs a command with stdout and stderr merged, draining the pipe
/// line-by-line on a reader thread into a bounded tail buffer. Returns the
/// exit status together with the last lines of output.
pub(crate) fn run_with_tail(
    mut command: Command,
) -> Result<(std::process::ExitStatus, Vec<String>), WheelBuildError> {
    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = command
        .spawn()
        .map_err(|e| WheelBuildError::CouldNotRunCommand(format!("{command:?}"), e))?;

    let tail: Arc<Mutex<VecDeque<String>>> = Arc::new(Mutex::new(VecDeque::new()));
    let mut readers = Vec::new();
    for pipe in [
        child.stdout.take().map(|p| Box::new(p) as Box<dyn std::io::Read + Send>),
        child.stderr.take().map(|p| Box::new(p) as Box<dyn std::io::Read + Send>),
    ]
    .into_iter()
    .flatten()
    {
        let tail = Arc::clone(&tail);
        readers.push(std::thread::spawn(move || {
            for line in BufReader::new(pipe).lines() {
                let Ok(line) = line else { break };
                tracing::debug!(target: "padlock::build", "{line}");
                let mut tail = tail.lock();
                tail.push_back(line);
                while tail.len() > LOG_TAIL_LINES {
                    tail.pop_front();
                }
            }
        }));
    }
    let status = child
        .wait()
        .map_err(|e| WheelBuildError::CouldNotRunCommand(format!("{command:?}"), e))?;
    for reader in readers {
        let _ = reader.join();
    }
    let tail = tail.lock().iter().cloned().collect();
    Ok((status, tail))
}

/// An isolated PEP 517 build environment: a shared base prefix holding the
/// declared build requirements (reused between sdists with the same
/// requirement set) and a per-source overlay prefix for extra requirements
/// reported by the backend. A synthesized `sitecustomize.py` strips user and
/// system site-packages and re-adds the two prefixes.
#[derive(Debug)]
pub struct BuildEnvironment {
    interpreter: PythonInterpreter,
    shared_prefix: PathBuf,
    overlay_prefix: PathBuf,
    site_dir: PathBuf,
    shared_paths: SysconfigPaths,
    overlay_paths: SysconfigPaths,
}

impl BuildEnvironment {
    /// Creates (or reuses) the environment for the given build requirements.
    /// The shared base lives under `shared_root`, keyed by the requirement
    /// set; the overlay lives under the per-run `overlay_root`.
    pub fn setup(
        interpreter: &PythonInterpreter,
        build_requirements: &[Requirement],
        installer: &dyn BuildEnvInstaller,
        shared_root: &Path,
        overlay_root: &Path,
    ) -> Result<Self, WheelBuildError> {
        let shared_prefix = shared_root.join(shared_env_key(build_requirements));
        let fresh_shared = !shared_prefix.exists();
        fs_err::create_dir_all(&shared_prefix)?;
        let overlay_prefix = overlay_root.join("overlay");
        fs_err::create_dir_all(&overlay_prefix)?;

        let shared_paths = sysconfig_paths(interpreter, &shared_prefix)
            .map_err(|e| WheelBuildError::Environment(e.to_string()))?;
        let overlay_paths = sysconfig_paths(interpreter, &overlay_prefix)
            .map_err(|e| WheelBuildError::Environment(e.to_string()))?;

        if fresh_shared {
            tracing::info!(
                "populating shared build environment with {:?}",
                build_requirements
                    .iter()
                    .map(|r| r.as_line())
                    .collect::<Vec<_>>()
            );
            installer.install(build_requirements, &shared_prefix)?;
        } else {
            tracing::debug!("reusing shared build environment {}", shared_prefix.display());
        }

        let site_dir = overlay_root.join("site");
        if site_dir.is_dir() {
            // stale .pyc files may shadow the fresh site configuration
            fs_err::remove_dir_all(&site_dir)?;
        }
        fs_err::create_dir_all(&site_dir)?;
        let env = BuildEnvironment {
            interpreter: interpreter.clone(),
            shared_prefix,
            overlay_prefix,
            site_dir,
            shared_paths,
            overlay_paths,
        };
        env.write_sitecustomize()?;
        Ok(env)
    }

    fn lib_dirs(&self) -> Vec<&Path> {
        vec![
            self.overlay_paths.platlib.as_path(),
            self.overlay_paths.purelib.as_path(),
            self.shared_paths.platlib.as_path(),
            self.shared_paths.purelib.as_path(),
        ]
    }

    fn write_sitecustomize(&self) -> Result<(), WheelBuildError> {
        let lib_dirs: Vec<String> = self
            .lib_dirs()
            .iter()
            .map(|p| format!("{:?}", p.to_string_lossy()))
            .collect();
        let script = format!(
            r#"import sys, os, site

original_sys_path = sys.path[:]
known_paths = set()
site.addusersitepackages(known_paths)
site.addsitepackages(known_paths)
known_paths = {{os.path.normcase(p) for p in known_paths}}
original_sys_path = [
    p for p in original_sys_path
    if os.path.normcase(p) not in known_paths]
sys.path[:] = original_sys_path
for lib_path in [{lib_dirs}]:
    site.addsitedir(lib_path)
"#,
            lib_dirs = lib_dirs.join(", ")
        );
        let mut file = fs_err::File::create(self.site_dir.join("sitecustomize.py"))?;
        file.write_all(script.as_bytes())?;
        Ok(())
    }

    /// Installs extra requirements reported by the backend into the overlay.
    pub fn install_extra_requirements(
        &self,
        requirements: &[Requirement],
        installer: &dyn BuildEnvInstaller,
    ) -> Result<(), WheelBuildError> {
        installer.install(requirements, &self.overlay_prefix)
    }

    /// Runs one frontend stage inside the environment. The last output lines
    /// are returned alongside the status for error reporting.
    pub fn run_stage(
        &self,
        work_dir: &Path,
        frontend: &Path,
        entry_point: &str,
        stage: &str,
    ) -> Result<(std::process::ExitStatus, Vec<String>), WheelBuildError> {
        let mut scripts_path = vec![
            self.overlay_paths.scripts.clone(),
            self.shared_paths.scripts.clone(),
        ];
        if let Some(path) = std::env::var_os("PATH") {
            scripts_path.extend(std::env::split_paths(&path));
        }
        let path_var = std::env::join_paths(scripts_path)
            .map_err(|e| WheelBuildError::Environment(e.to_string()))?;

        let mut command = Command::new(&self.interpreter.executable);
        command
            .current_dir(work_dir)
            .env("PATH", path_var)
            // the site dir must win so sitecustomize rewrites sys.path
            .env("PYTHONPATH", &self.site_dir)
            .arg(frontend)
            .arg(work_dir)
            .arg(entry_point)
            .arg(stage);
        run_with_tail(command)
    }
}

/// The shared environments are deduplicated by the hash of the sorted
/// requirement set.
fn shared_env_key(build_requirements: &[Requirement]) -> String {
    let mut lines: Vec<String> = build_requirements.iter().map(|r| r.as_line()).collect();
    lines.sort();
    lines.dedup();
    let digest = compute_bytes_digest::<Sha256>(lines.join("\n").as_bytes());
    format!("{:x}", digest)[..16].to_string()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::parse_line;

    #[test]
    fn test_shared_env_key_is_order_independent() {
        let a = vec![
            parse_line("setuptools>=40.8.0").unwrap(),
            parse_line("wheel").unwrap(),
        ];
        let b = vec![
            parse_line("wheel").unwrap(),
            parse_line("setuptools>=40.8.0").unwrap(),
        ];
        assert_eq!(shared_env_key(&a), shared_env_key(&b));
        let c = vec![parse_line("hatchling").unwrap()];
        assert_ne!(shared_env_key(&a), shared_env_key(&c));
    }
}
