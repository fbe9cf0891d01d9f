//! Subprocess spawning.
//!
//! Two operations: [`spawn_and_wait`] forks a command and blocks on it, [`exec`]
//! replaces the current process image. Argument vectors mix plain strings and checked
//! paths; both are logged verbatim before the syscall.

use crate::{path::AbsPath, ForgeError, Result};
use std::{fmt, os::unix::process::CommandExt, process::Command};

/// One element of an argument vector.
#[derive(Clone, Debug)]
pub enum Arg {
    Str(String),
    Path(AbsPath),
}

impl Arg {
    fn as_os_str(&self) -> &std::ffi::OsStr {
        match self {
            Arg::Str(s) => s.as_ref(),
            Arg::Path(p) => p.as_std_path().as_os_str(),
        }
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Str(s) => f.write_str(s),
            Arg::Path(p) => write!(f, "{p}"),
        }
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Str(s.to_string())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::Str(s)
    }
}

impl From<AbsPath> for Arg {
    fn from(p: AbsPath) -> Self {
        Arg::Path(p)
    }
}

impl From<&AbsPath> for Arg {
    fn from(p: &AbsPath) -> Self {
        Arg::Path(p.clone())
    }
}

fn render(args: &[Arg]) -> String {
    args.iter().map(ToString::to_string).collect::<Vec<_>>().join(" ")
}

/// Spawns `args[0]` with the remaining arguments and waits for it.
///
/// Returns the exit status when the process exits, or the negated signal number when
/// it is terminated by a signal.
pub fn spawn_and_wait(args: &[Arg]) -> Result<i32> {
    let (program, rest) = args
        .split_first()
        .ok_or_else(|| ForgeError::Process("empty argument vector".to_string()))?;
    info!("{}", render(args));

    let status = Command::new(program.as_os_str())
        .args(rest.iter().map(Arg::as_os_str))
        .status()
        .map_err(|err| ForgeError::Process(format!("failed to spawn '{program}': {err}")))?;

    if let Some(code) = status.code() {
        return Ok(code)
    }
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(signal) => Ok(-signal),
        None => Err(ForgeError::Process(format!(
            "'{program}' neither exited nor was signalled: {status}"
        ))),
    }
}

/// Replaces the current process image with `args[0]`, inheriting the environment.
///
/// Only returns on failure; the returned error describes why the replacement did not
/// happen.
pub fn exec(args: &[Arg]) -> ForgeError {
    let (program, rest) = match args.split_first() {
        Some(split) => split,
        None => return ForgeError::Process("empty argument vector".to_string()),
    };
    info!("{}", render(args));

    let err = Command::new(program.as_os_str()).args(rest.iter().map(Arg::as_os_str)).exec();
    ForgeError::Process(format!("failed to exec '{program}': {err}"))
}
