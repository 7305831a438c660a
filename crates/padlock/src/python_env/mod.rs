//! Target interpreter discovery and interrogation. The engine never runs
//! against the interpreter it is embedded in; everything about the target
//! comes from probing a real python executable in a subprocess.

mod system_python;

pub use system_python::{
    find_interpreter, marker_environment, sysconfig_paths, PythonInterpreter, PythonLookupError,
    SysconfigPaths,
};

use crate::types::Env;
use std::collections::HashMap;

/// A concrete set of PEP 508 marker values, as reported by a target
/// interpreter or loaded from a recorded snapshot.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct MarkerEnvironment {
    /// The raw variable values.
    pub values: HashMap<String, String>,
}

impl Env for MarkerEnvironment {
    fn get_marker_var(&self, var: &str) -> Option<&str> {
        self.values.get(var).map(String::as_str)
    }
}
