//! Lifecycle of one throughput-tool subprocess.
//!
//! A run goes `Idle -> Running -> Finishing -> Idle`. The waiter thread owns
//! the transition out of `Running` and performs the finish protocol:
//!
//! 1. reap the child,
//! 2. wait until both pipe readers have delivered their last chunk,
//! 3. call the finish handler,
//! 4. clear the run and wake every thread blocked in [`ProcessSupervisor::kill_and_wait`].
//!
//! All run bookkeeping lives in one `Mutex` paired with one `Condvar`.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use super::pipe;
use super::{split_args, ProcessControl, ProcessError};

const STDOUT_PIPE_NAME: &str = "iperfStdout";
const STDERR_PIPE_NAME: &str = "iperfStderr";

type TextHandler = Box<dyn Fn(&str) + Send + Sync>;
type FinishHandler = Box<dyn Fn() + Send + Sync>;

/// Callbacks registered with the supervisor.
///
/// Handlers run on the reader and waiter threads. They must not call
/// [`ProcessSupervisor::kill_and_wait`] or [`ProcessSupervisor::start`],
/// which wait for the very thread the handler is running on.
pub struct OutputHandlers {
    pub stdout: TextHandler,
    pub stderr: TextHandler,
    pub on_finish: FinishHandler,
}

impl Default for OutputHandlers {
    fn default() -> Self {
        Self {
            stdout: Box::new(|_| {}),
            stderr: Box::new(|_| {}),
            on_finish: Box::new(|| {}),
        }
    }
}

/// Externally visible lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Running { pid: Pid },
    Finishing { pid: Pid },
}

#[derive(Debug, Clone, Copy)]
struct ProcessHandle {
    pid: Pid,
    run_id: u64,
    finishing: bool,
}

#[derive(Debug, Default)]
struct RunState {
    active: Option<ProcessHandle>,
    next_run_id: u64,
}

struct Shared {
    control: Arc<dyn ProcessControl>,
    stdout_pipe: PathBuf,
    stderr_pipe: PathBuf,
    handlers: OutputHandlers,
    run: Mutex<RunState>,
    finished: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, RunState>) -> MutexGuard<'a, RunState> {
        self.finished
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Supervises at most one running subprocess at a time.
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
}

impl ProcessSupervisor {
    /// Create a supervisor whose pipe pair lives in `writable_dir`.
    pub fn new(
        control: Arc<dyn ProcessControl>,
        writable_dir: &Path,
        handlers: OutputHandlers,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                control,
                stdout_pipe: writable_dir.join(STDOUT_PIPE_NAME),
                stderr_pipe: writable_dir.join(STDERR_PIPE_NAME),
                handlers,
                run: Mutex::new(RunState::default()),
                finished: Condvar::new(),
            }),
        }
    }

    pub fn pipe_paths(&self) -> (&Path, &Path) {
        (&self.shared.stdout_pipe, &self.shared.stderr_pipe)
    }

    pub fn state(&self) -> SupervisorState {
        match self.shared.lock().active {
            None => SupervisorState::Idle,
            Some(h) if h.finishing => SupervisorState::Finishing { pid: h.pid },
            Some(h) => SupervisorState::Running { pid: h.pid },
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().active.is_some()
    }

    /// Launch the tool with whitespace-separated `args`.
    ///
    /// A run that is still active is killed and fully finished (reaped,
    /// drained, finish handler called) before the pipes are recreated.
    pub fn start(&self, args: &str) -> Result<Pid, ProcessError> {
        let shared = &self.shared;
        let mut run = shared.lock();

        if let Some(prev) = run.active {
            info!(pid = prev.pid.as_raw(), "terminating previous run before start");
            if !prev.finishing {
                send(shared, prev.pid, Signal::SIGKILL)?;
            }
            while run.active.is_some() {
                run = shared.wait(run);
            }
        }

        force_mkfifo(shared.control.as_ref(), &shared.stdout_pipe, "stdout")?;
        force_mkfifo(shared.control.as_ref(), &shared.stderr_pipe, "stderr")?;

        let stdout = open_pipe(&shared.stdout_pipe)?;
        let stderr = open_pipe(&shared.stderr_pipe)?;

        let argv = split_args(args);
        let pid = shared
            .control
            .spawn(&argv, &shared.stdout_pipe, &shared.stderr_pipe)
            .map_err(|source| ProcessError::Spawn { source })?;
        info!(pid = pid.as_raw(), ?argv, "throughput tool started");

        let run_id = run.next_run_id;
        run.next_run_id += 1;
        run.active = Some(ProcessHandle {
            pid,
            run_id,
            finishing: false,
        });

        if let Err(e) = launch_threads(shared, pid, stdout, stderr) {
            // Without a waiter nobody would ever reap the child.
            let _ = shared.control.signal(pid, Signal::SIGKILL);
            let _ = shared.control.reap(pid);
            run.active = None;
            shared.finished.notify_all();
            return Err(e);
        }

        Ok(pid)
    }

    /// Ask the running process to exit gracefully. No-op when idle.
    pub fn send_sig_int(&self) -> Result<(), ProcessError> {
        self.send_signal(Signal::SIGINT)
    }

    /// Kill the running process immediately. No-op when idle.
    pub fn send_sig_kill(&self) -> Result<(), ProcessError> {
        self.send_signal(Signal::SIGKILL)
    }

    fn send_signal(&self, signal: Signal) -> Result<(), ProcessError> {
        let run = self.shared.lock();
        match run.active {
            Some(h) if !h.finishing => send(&self.shared, h.pid, signal),
            _ => Ok(()),
        }
    }

    /// Send SIGINT and block until the finish protocol of the current run
    /// has completed. Returns immediately when idle.
    pub fn kill_and_wait(&self) -> Result<(), ProcessError> {
        let shared = &self.shared;
        let mut run = shared.lock();
        let Some(current) = run.active else {
            return Ok(());
        };

        if !current.finishing {
            send(shared, current.pid, Signal::SIGINT)?;
        }
        while run.active.map(|h| h.run_id) == Some(current.run_id) {
            run = shared.wait(run);
        }
        Ok(())
    }
}

fn send(shared: &Shared, pid: Pid, signal: Signal) -> Result<(), ProcessError> {
    debug!(pid = pid.as_raw(), %signal, "sending signal");
    shared
        .control
        .signal(pid, signal)
        .map_err(|source| ProcessError::Signal {
            signal,
            pid: pid.as_raw(),
            source,
        })
}

/// Delete whatever sits at `path` and create a fresh named pipe there.
fn force_mkfifo(
    control: &dyn ProcessControl,
    path: &Path,
    purpose: &'static str,
) -> Result<(), ProcessError> {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            let kind = if path.is_dir() { "directory" } else { "file" };
            return Err(ProcessError::StalePipe {
                path: path.to_path_buf(),
                kind,
                source,
            });
        }
    }

    control
        .make_fifo(path)
        .map_err(|source| ProcessError::PipeCreation {
            path: path.to_path_buf(),
            purpose,
            source,
        })
}

fn open_pipe(path: &Path) -> Result<File, ProcessError> {
    pipe::open_reader(path).map_err(|source| ProcessError::PipeOpen {
        path: path.to_path_buf(),
        source,
    })
}

fn launch_threads(
    shared: &Arc<Shared>,
    pid: Pid,
    stdout: File,
    stderr: File,
) -> Result<(), ProcessError> {
    // Each reader holds a sender; the channel disconnects once both are done.
    let (done_tx, done_rx) = mpsc::channel::<()>();

    let readers = [
        ("stdout", stdout, "iperf-stdout"),
        ("stderr", stderr, "iperf-stderr"),
    ];
    for (name, file, thread_name) in readers {
        let shared = Arc::clone(shared);
        let done = done_tx.clone();
        thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || {
                let on_chunk: &TextHandler = if name == "stdout" {
                    &shared.handlers.stdout
                } else {
                    &shared.handlers.stderr
                };
                pipe::drain(
                    file,
                    name,
                    |chunk| on_chunk(chunk),
                    |failure| (shared.handlers.stderr)(failure),
                );
                drop(done);
            })
            .map_err(|source| ProcessError::Thread { name: thread_name, source })?;
    }
    drop(done_tx);

    let waiter = Arc::clone(shared);
    thread::Builder::new()
        .name("iperf-waiter".to_string())
        .spawn(move || finish(&waiter, pid, done_rx))
        .map_err(|source| ProcessError::Thread {
            name: "iperf-waiter",
            source,
        })?;
    Ok(())
}

fn finish(shared: &Shared, pid: Pid, readers_done: mpsc::Receiver<()>) {
    if let Err(e) = shared.control.wait_for_exit(pid) {
        warn!(pid = pid.as_raw(), error = %e, "waiting for process exit failed");
    }

    {
        let mut run = shared.lock();
        if let Some(h) = run.active.as_mut() {
            h.finishing = true;
        }
        match shared.control.reap(pid) {
            Ok(status) => info!(pid = pid.as_raw(), %status, "throughput tool finished"),
            Err(e) => warn!(pid = pid.as_raw(), error = %e, "could not reap process"),
        }
    }

    // Blocks until both readers dropped their sender.
    while readers_done.recv().is_ok() {}
    debug!(pid = pid.as_raw(), "pipe readers drained");

    (shared.handlers.on_finish)();

    let mut run = shared.lock();
    run.active = None;
    shared.finished.notify_all();
}
