//! `ProcessControl` backed by fork/exec, mkfifo, kill and waitid.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;

use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitid, waitpid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::{self, Pid};
use tracing::{debug, info};

use super::{ExitStatus, ProcessControl, ProcessError};

static TOOL: OnceLock<PathBuf> = OnceLock::new();

/// Resolve the throughput tool once per process.
///
/// Idempotent: after the first successful call every later call returns the
/// path resolved then and ignores its argument. A bare command name is
/// looked up on `$PATH`.
pub fn init(tool: &Path) -> Result<&'static Path, ProcessError> {
    if let Some(path) = TOOL.get() {
        return Ok(path.as_path());
    }
    let resolved = resolve_tool(tool).ok_or_else(|| ProcessError::ToolNotFound {
        tool: tool.display().to_string(),
    })?;
    info!(tool = %resolved.display(), "throughput tool resolved");
    Ok(TOOL.get_or_init(|| resolved).as_path())
}

fn resolve_tool(tool: &Path) -> Option<PathBuf> {
    if tool.components().count() > 1 {
        return tool.is_file().then(|| tool.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(tool))
        .find(|candidate| candidate.is_file())
}

/// Real process control for Unix hosts.
#[derive(Debug, Clone)]
pub struct UnixProcessControl {
    tool: PathBuf,
}

impl UnixProcessControl {
    pub fn new(tool: impl Into<PathBuf>) -> Self {
        Self { tool: tool.into() }
    }

    /// Use the tool resolved by [`init`].
    pub fn from_init() -> Result<Self, ProcessError> {
        TOOL.get()
            .map(|tool| Self::new(tool.clone()))
            .ok_or(ProcessError::NotInitialized)
    }

    pub fn tool(&self) -> &Path {
        &self.tool
    }
}

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Open `path` for writing and move it onto `target_fd`.
///
/// Runs between fork and exec, so it only makes raw syscalls on
/// pre-allocated data.
fn redirect_into_pipe(path: &CString, target_fd: libc::c_int) -> io::Result<()> {
    // SAFETY: open/dup2/close are async-signal-safe and `path` was allocated
    // before the fork.
    unsafe {
        let fd = libc::open(path.as_ptr(), libc::O_WRONLY);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::dup2(fd, target_fd) < 0 {
            return Err(io::Error::last_os_error());
        }
        libc::close(fd);
    }
    Ok(())
}

impl ProcessControl for UnixProcessControl {
    fn make_fifo(&self, path: &Path) -> io::Result<()> {
        unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)?;
        debug!(path = %path.display(), "named pipe created");
        Ok(())
    }

    fn spawn(&self, argv: &[String], stdout_pipe: &Path, stderr_pipe: &Path) -> io::Result<Pid> {
        let stdout_path = c_path(stdout_pipe)?;
        let stderr_path = c_path(stderr_pipe)?;

        let mut command = Command::new(&self.tool);
        command.args(argv).stdin(Stdio::null());
        // SAFETY: the hook only calls redirect_into_pipe.
        unsafe {
            command.pre_exec(move || {
                redirect_into_pipe(&stdout_path, libc::STDOUT_FILENO)?;
                redirect_into_pipe(&stderr_path, libc::STDERR_FILENO)
            });
        }

        let child = command.spawn()?;
        let pid = Pid::from_raw(child.id() as i32);
        // The Child handle is dropped without waiting; reaping goes through
        // wait_for_exit/reap on the raw pid.
        drop(child);
        Ok(pid)
    }

    fn signal(&self, pid: Pid, sig: Signal) -> io::Result<()> {
        signal::kill(pid, sig)?;
        Ok(())
    }

    fn wait_for_exit(&self, pid: Pid) -> io::Result<()> {
        loop {
            match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn reap(&self, pid: Pid) -> io::Result<ExitStatus> {
        loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(ExitStatus::Exited(code)),
                Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(ExitStatus::Signaled(sig)),
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}
