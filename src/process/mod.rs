//! Managed subprocess supervision: spawn the throughput tool with its
//! stdout/stderr redirected into a pair of named pipes, drain both pipes
//! concurrently, and deliver an ordered finish notification.

#[cfg(test)]
pub(crate) mod fake;
pub mod pipe;
pub mod supervisor;
pub mod unix;

use std::io;
use std::path::{Path, PathBuf};

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use thiserror::Error;

pub use self::supervisor::{OutputHandlers, ProcessSupervisor, SupervisorState};
pub use self::unix::{init, UnixProcessControl};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("could not delete stale {kind} {} to create named pipe", .path.display())]
    StalePipe {
        path: PathBuf,
        kind: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("could not create named pipe {} for redirecting {purpose} (status {})", .path.display(), status(.source))]
    PipeCreation {
        path: PathBuf,
        purpose: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("could not open named pipe {} for reading", .path.display())]
    PipeOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not fork/exec (status {})", status(.source))]
    Spawn {
        #[source]
        source: io::Error,
    },

    #[error("could not send {signal} to a process with pid {pid} (status {})", status(.source))]
    Signal {
        signal: Signal,
        pid: i32,
        #[source]
        source: io::Error,
    },

    #[error("could not start {name} thread")]
    Thread {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("throughput tool {tool} not found")]
    ToolNotFound { tool: String },

    #[error("process control has not been initialized")]
    NotInitialized,
}

fn status(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(-1)
}

/// How a reaped child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(Signal),
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exited with code {}", code),
            ExitStatus::Signaled(sig) => write!(f, "killed by {}", sig),
        }
    }
}

/// OS-level capability the supervisor is built on.
///
/// Every call reports failure as an `io::Error` carrying the raw OS code.
pub trait ProcessControl: Send + Sync + 'static {
    /// Create a named pipe at `path`. The path must not exist.
    fn make_fifo(&self, path: &Path) -> io::Result<()>;

    /// Launch the tool with `argv` (argv[0] excluded), its stdout and stderr
    /// writing into the given named pipes.
    fn spawn(&self, argv: &[String], stdout_pipe: &Path, stderr_pipe: &Path) -> io::Result<Pid>;

    fn signal(&self, pid: Pid, signal: Signal) -> io::Result<()>;

    /// Block until `pid` has exited, leaving it unreaped so the pid cannot be
    /// recycled while signals may still target it.
    fn wait_for_exit(&self, pid: Pid) -> io::Result<()>;

    /// Collect the exit status of an exited child.
    fn reap(&self, pid: Pid) -> io::Result<ExitStatus>;
}

/// Split an argument string on runs of whitespace, dropping empty tokens.
pub fn split_args(args: &str) -> Vec<String> {
    args.split_whitespace().map(str::to_string).collect()
}
