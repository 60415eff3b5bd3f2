//! In-memory `ProcessControl` used by tests. Spawned "processes" are
//! threads that write a scripted output into the real named pipes.

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::stat::Mode;
use nix::unistd::{self, Pid};

use super::{ExitStatus, ProcessControl};

/// Output a single fake run produces.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    /// Pause before each stdout chunk.
    pub delay: Duration,
    /// Keep running after the script until a signal arrives.
    pub hold_open: bool,
}

impl Script {
    pub fn lines(lines: &[&str]) -> Self {
        Self {
            stdout: lines.iter().map(|l| format!("{}\n", l)).collect(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct FakeProc {
    signal: Option<Signal>,
    exited: bool,
    reaped: bool,
}

#[derive(Debug, Default)]
struct State {
    procs: HashMap<i32, FakeProc>,
    next_pid: i32,
    scripts: VecDeque<Script>,
    spawned: Vec<Vec<String>>,
    signals: Vec<Signal>,
    reaped: Vec<i32>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    changed: Condvar,
}

/// Errno each call fails with, when set.
#[derive(Debug, Default, Clone, Copy)]
struct Failures {
    mkfifo: Option<i32>,
    spawn: Option<i32>,
    signal: Option<i32>,
}

#[derive(Default)]
pub struct FakeControl {
    inner: Arc<Inner>,
    failures: Mutex<Failures>,
}

impl FakeControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_scripts(scripts: Vec<Script>) -> Arc<Self> {
        let control = Self::default();
        control.inner.state.lock().unwrap().scripts = scripts.into();
        Arc::new(control)
    }

    pub fn fail_mkfifo(&self, errno: Option<i32>) {
        self.failures.lock().unwrap().mkfifo = errno;
    }

    pub fn fail_spawn(&self, errno: Option<i32>) {
        self.failures.lock().unwrap().spawn = errno;
    }

    pub fn fail_signal(&self, errno: Option<i32>) {
        self.failures.lock().unwrap().signal = errno;
    }

    fn failures(&self) -> Failures {
        *self.failures.lock().unwrap()
    }

    pub fn push_script(&self, script: Script) {
        self.inner.state.lock().unwrap().scripts.push_back(script);
    }

    pub fn spawned(&self) -> Vec<Vec<String>> {
        self.inner.state.lock().unwrap().spawned.clone()
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.inner.state.lock().unwrap().signals.clone()
    }

    pub fn reaped(&self) -> Vec<i32> {
        self.inner.state.lock().unwrap().reaped.clone()
    }
}

impl Inner {
    /// Whether the process has been signalled; writers poll this.
    fn interrupted(&self, pid: i32) -> bool {
        let state = self.state.lock().unwrap();
        state.procs.get(&pid).map_or(true, |p| p.signal.is_some())
    }

    fn run(&self, pid: i32, script: Script, mut out: File, mut err: File) {
        for chunk in &script.stderr {
            let _ = err.write_all(chunk.as_bytes());
        }
        for chunk in &script.stdout {
            if !script.delay.is_zero() {
                thread::sleep(script.delay);
            }
            if self.interrupted(pid) {
                break;
            }
            if out.write_all(chunk.as_bytes()).is_err() {
                break;
            }
        }

        let mut state = self.state.lock().unwrap();
        if script.hold_open {
            while state.procs.get(&pid).map_or(false, |p| p.signal.is_none()) {
                state = self.changed.wait(state).unwrap();
            }
        }
        drop(out);
        drop(err);
        if let Some(p) = state.procs.get_mut(&pid) {
            p.exited = true;
        }
        self.changed.notify_all();
    }
}

fn open_writer(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).open(path)
}

impl ProcessControl for FakeControl {
    fn make_fifo(&self, path: &Path) -> io::Result<()> {
        if let Some(code) = self.failures().mkfifo {
            return Err(io::Error::from_raw_os_error(code));
        }
        unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)?;
        Ok(())
    }

    fn spawn(&self, argv: &[String], stdout_pipe: &Path, stderr_pipe: &Path) -> io::Result<Pid> {
        if let Some(code) = self.failures().spawn {
            return Err(io::Error::from_raw_os_error(code));
        }
        let out = open_writer(stdout_pipe)?;
        let err = open_writer(stderr_pipe)?;

        let (pid, script) = {
            let mut state = self.inner.state.lock().unwrap();
            state.next_pid += 1;
            let pid = 40_000 + state.next_pid;
            state.procs.insert(pid, FakeProc::default());
            state.spawned.push(argv.to_vec());
            (pid, state.scripts.pop_front().unwrap_or_default())
        };

        let inner = Arc::clone(&self.inner);
        thread::spawn(move || inner.run(pid, script, out, err));
        Ok(Pid::from_raw(pid))
    }

    fn signal(&self, pid: Pid, signal: Signal) -> io::Result<()> {
        if let Some(code) = self.failures().signal {
            return Err(io::Error::from_raw_os_error(code));
        }
        let mut state = self.inner.state.lock().unwrap();
        state.signals.push(signal);
        match state.procs.get_mut(&pid.as_raw()) {
            Some(p) if !p.reaped => {
                p.signal.get_or_insert(signal);
                self.inner.changed.notify_all();
                Ok(())
            }
            _ => Err(Errno::ESRCH.into()),
        }
    }

    fn wait_for_exit(&self, pid: Pid) -> io::Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            match state.procs.get(&pid.as_raw()) {
                None => return Err(Errno::ECHILD.into()),
                Some(p) if p.exited => return Ok(()),
                Some(_) => state = self.inner.changed.wait(state).unwrap(),
            }
        }
    }

    fn reap(&self, pid: Pid) -> io::Result<ExitStatus> {
        let mut state = self.inner.state.lock().unwrap();
        let status = match state.procs.get_mut(&pid.as_raw()) {
            Some(p) if p.exited && !p.reaped => {
                p.reaped = true;
                match p.signal {
                    Some(sig) => ExitStatus::Signaled(sig),
                    None => ExitStatus::Exited(0),
                }
            }
            _ => return Err(Errno::ECHILD.into()),
        };
        state.reaped.push(pid.as_raw());
        Ok(status)
    }
}
