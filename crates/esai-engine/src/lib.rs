mod python;

use thiserror::Error;

pub use python::PythonEngine;

/// Host-facing modules denied by default. The interpreter's own internals are
/// denied on top of whatever list is configured.
pub const DEFAULT_DENIED_MODULES: &[&str] = &[
    "os",
    "subprocess",
    "socket",
    "shutil",
    "ctypes",
    "signal",
    "threading",
    "multiprocessing",
    "pathlib",
    "tempfile",
];

/// A script raised while running. The message is `<ExceptionType>: <text>`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ExecutionError {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("interpreter bootstrap failed: {0}")]
    Bootstrap(String),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("output capture failed: {0}")]
    Capture(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Modules imported into the session scope during bootstrap.
    pub preload: Vec<String>,
    /// Top-level modules user code may not import.
    pub denied_modules: Vec<String>,
    pub allow_file_access: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            preload: Vec::new(),
            denied_modules: DEFAULT_DENIED_MODULES
                .iter()
                .map(|name| (*name).to_string())
                .collect(),
            allow_file_access: false,
        }
    }
}

/// An embedded interpreter with a rebindable output sink.
///
/// `rebind_output` and `drain_output` must bracket every `execute` so that
/// output from one run never shows up in the next.
pub trait ScriptEngine {
    fn rebind_output(&mut self) -> Result<(), EngineError>;
    fn execute(&mut self, source: &str, source_name: &str) -> Result<(), EngineError>;
    fn drain_output(&mut self) -> Result<String, EngineError>;
}
