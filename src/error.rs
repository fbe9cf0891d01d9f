use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ForgeError>;

/// Various error types
#[derive(Debug, Error)]
pub enum ForgeError {
    /// Malformed `deps.json` or a schema violation within it.
    #[error("invalid manifest \"{}\": {detail}", .path.display())]
    Manifest { path: PathBuf, detail: String },
    /// Inconsistent workspace discovered while walking dependencies.
    #[error("{0}")]
    Discovery(String),
    /// Back-edge found on the builder-dep subgraph, modules in stack order.
    #[error("detected cycle in builder dependencies:\n{}", render_cycle(.0))]
    BuilderDepCycle(Vec<String>),
    /// A toolchain subprocess exited with a non-zero status.
    #[error("failed to produce \"{}\", command exited with code {status}", .output.display())]
    Toolchain { output: PathBuf, status: i32 },
    /// A toolchain subprocess was killed by a signal.
    #[error("failed to produce \"{}\", command terminated by signal {signal}", .output.display())]
    ToolchainSignal { output: PathBuf, signal: i32 },
    /// Errors related to a builder plugin shared object.
    #[error("plugin \"{}\": {detail}", .path.display())]
    Plugin { path: PathBuf, detail: String },
    /// A phase was entered while its in-progress marker is still present.
    #[error("re-entry detected for phase {phase} of module '{module}'")]
    Reentry { module: String, phase: &'static str },
    /// Violated path containment invariant.
    #[error("{0}")]
    Path(String),
    /// Spawn, wait or exec failure.
    #[error("{0}")]
    Process(String),
    /// Deserialization error
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    /// Filesystem IO error
    #[error(transparent)]
    Io(#[from] ForgeIoError),
    /// An error scoped to one module of the workspace.
    #[error("module '{module}': {source}")]
    Module {
        module: String,
        #[source]
        source: Box<ForgeError>,
    },
    /// General purpose message.
    #[error("{0}")]
    Message(String),
}

impl ForgeError {
    pub(crate) fn io(err: io::Error, path: impl AsRef<Path>) -> Self {
        ForgeIoError::new(err, path).into()
    }

    /// General purpose message.
    pub fn msg(msg: impl std::fmt::Display) -> Self {
        ForgeError::Message(msg.to_string())
    }

    /// Scopes the error to the given module, unless it already is.
    pub fn for_module(self, module: impl Into<String>) -> Self {
        match self {
            err @ ForgeError::Module { .. } => err,
            err => ForgeError::Module { module: module.into(), source: Box::new(err) },
        }
    }

    /// Returns the module name this error is scoped to, if any.
    pub fn module(&self) -> Option<&str> {
        match self {
            ForgeError::Module { module, .. } => Some(module),
            _ => None,
        }
    }
}

fn render_cycle(modules: &[String]) -> String {
    modules.iter().map(|name| format!("  module '{name}'")).collect::<Vec<_>>().join("\n")
}

macro_rules! _format_err {
    ($($tt:tt)*) => {
        $crate::error::ForgeError::msg(format!($($tt)*))
    };
}
#[allow(unused)]
pub(crate) use _format_err as format_err;

macro_rules! _bail {
    ($($tt:tt)*) => { return Err($crate::error::format_err!($($tt)*)) };
}
#[allow(unused)]
pub(crate) use _bail as bail;

#[derive(Debug, Error)]
#[error("\"{}\": {io}", self.path.display())]
pub struct ForgeIoError {
    io: io::Error,
    path: PathBuf,
}

impl ForgeIoError {
    pub fn new(io: io::Error, path: impl AsRef<Path>) -> Self {
        Self { io, path: path.as_ref().to_path_buf() }
    }

    /// The path at which the error occurred
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The underlying `io::Error`
    pub fn source(&self) -> &io::Error {
        &self.io
    }
}

impl From<ForgeIoError> for io::Error {
    fn from(err: ForgeIoError) -> Self {
        err.io
    }
}
