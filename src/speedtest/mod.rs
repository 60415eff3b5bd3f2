//! Two-phase speed test: pick the closest server, arm the peer, run the
//! download, wait, run the upload.
//!
//! The manager sits on top of one [`ProcessSupervisor`]. Samples arrive on
//! the supervisor's reader threads, phase transitions are driven by its
//! finish notification, and network calls (server selection, remote
//! start/stop, the inter-phase delay) run as tokio tasks.
//!
//! Every `start()` opens a new session. Deferred work belonging to an older
//! session (a pending delay or remote response) is dropped when it resumes.

pub mod args;
pub mod callbacks;
pub mod sample;
pub mod server;
pub mod stats;

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{IperfConfig, SpeedCheckConfig};
use crate::probes::PingProbe;
use crate::process::{OutputHandlers, ProcessControl, ProcessError, ProcessSupervisor, SupervisorState};
use crate::remote::{self, RemoteControl, RequestKind};

pub use self::args::{IperfArgs, Phase};
pub use self::callbacks::Callbacks;
pub use self::sample::{parse_speed, LineBuffer, SampleError};
pub use self::server::{
    pick_fastest, ping_all, select_fastest, ServerAddress, ServerDirectory, StaticServers,
};
pub use self::stats::{format_speed, SpeedStatistics};

const NO_SERVERS: &str = "No servers are available right now";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestState {
    #[default]
    None,
    Download,
    Upload,
    Stopped,
    Error,
}

impl From<Phase> for TestState {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Download => TestState::Download,
            Phase::Upload => TestState::Upload,
        }
    }
}

/// The capabilities a manager drives.
pub struct Collaborators {
    pub control: Arc<dyn ProcessControl>,
    pub remote: Arc<dyn RemoteControl>,
    pub ping: Arc<dyn PingProbe>,
    pub servers: Arc<dyn ServerDirectory>,
}

#[derive(Debug, Default)]
struct Session {
    generation: u64,
    state: TestState,
    download: SpeedStatistics,
    upload: SpeedStatistics,
    server: Option<ServerAddress>,
    lines: LineBuffer,
    stopped_reported: bool,
    /// Client launches between entering a phase and the spawn returning.
    launches: usize,
}

struct Inner {
    session: Mutex<Session>,
    launched: Condvar,
    supervisor: ProcessSupervisor,
    callbacks: Callbacks,
    remote: Arc<dyn RemoteControl>,
    ping: Arc<dyn PingProbe>,
    servers: Arc<dyn ServerDirectory>,
    iperf: IperfConfig,
    control_timeout: Duration,
    runtime: Handle,
}

/// Runs speed tests; cheap to clone.
#[derive(Clone)]
pub struct SpeedTestManager {
    inner: Arc<Inner>,
}

impl SpeedTestManager {
    /// Must be called from within a tokio runtime; deferred work is spawned
    /// onto it.
    pub fn new(
        config: &SpeedCheckConfig,
        collaborators: Collaborators,
        callbacks: Callbacks,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .context("speed test manager must be created inside a tokio runtime")?;
        let Collaborators {
            control,
            remote,
            ping,
            servers,
        } = collaborators;

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let (stdout, stderr, finish) = (weak.clone(), weak.clone(), weak.clone());
            let handlers = OutputHandlers {
                stdout: Box::new(move |chunk| {
                    if let Some(inner) = stdout.upgrade() {
                        inner.handle_stdout(chunk);
                    }
                }),
                stderr: Box::new(move |text| {
                    if let Some(inner) = stderr.upgrade() {
                        inner.handle_stderr(text);
                    }
                }),
                on_finish: Box::new(move || {
                    if let Some(inner) = finish.upgrade() {
                        inner.handle_finish();
                    }
                }),
            };

            Inner {
                session: Mutex::new(Session::default()),
                launched: Condvar::new(),
                supervisor: ProcessSupervisor::new(control, &config.iperf.work_dir, handlers),
                callbacks,
                remote,
                ping,
                servers,
                iperf: config.iperf.clone(),
                control_timeout: config.control.timeout(),
                runtime,
            }
        });

        Ok(Self { inner })
    }

    /// Begin a new test. Progress is reported through the callbacks; the
    /// returned handle completes once the download has been launched (or the
    /// run has failed before that).
    pub fn start(&self) -> JoinHandle<()> {
        let generation = {
            let mut session = self.inner.lock();
            let generation = session.generation + 1;
            *session = Session {
                generation,
                launches: session.launches,
                ..Session::default()
            };
            generation
        };
        info!(generation, "speed test started");

        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move { inner.run(generation).await })
    }

    /// Abort the current test and block until the tool has been reaped and
    /// drained. Results in exactly one `on_stopped`. A launch already under
    /// way is let through and then killed.
    ///
    /// Blocks the calling thread; from async code use `spawn_blocking`.
    /// Must not be called from a callback.
    pub fn stop(&self) -> Result<(), ProcessError> {
        let inner = &self.inner;
        let (generation, server) = {
            let mut session = inner.lock();
            session.state = TestState::Stopped;
            while session.launches > 0 {
                debug!("waiting for client launch before stopping");
                session = inner.wait_launched(session);
            }
            (session.generation, session.server.clone())
        };
        info!(generation, "stopping speed test");

        if let Some(server) = server {
            inner.request_remote_stop(server);
        }
        inner.supervisor.send_sig_kill()?;
        inner.supervisor.kill_and_wait()?;

        let mut session = inner.lock();
        if session.generation == generation && session.state == TestState::Stopped {
            inner.report_stopped(&mut session);
        }
        Ok(())
    }

    pub fn state(&self) -> TestState {
        self.inner.lock().state
    }

    pub fn download_statistics(&self) -> SpeedStatistics {
        self.inner.lock().download
    }

    pub fn upload_statistics(&self) -> SpeedStatistics {
        self.inner.lock().upload
    }

    /// The server selected for the current session, once known.
    pub fn server(&self) -> Option<ServerAddress> {
        self.inner.lock().server.clone()
    }

    pub fn supervisor_state(&self) -> SupervisorState {
        self.inner.supervisor.state()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_launched<'a>(&self, session: MutexGuard<'a, Session>) -> MutexGuard<'a, Session> {
        self.launched
            .wait(session)
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(self: Arc<Self>, generation: u64) {
        let candidates = match self.servers.candidates().await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "could not obtain candidate servers");
                Vec::new()
            }
        };
        debug!(count = candidates.len(), "probing candidate servers");

        let Some((server, ping_ms)) = select_fastest(&candidates, self.ping.as_ref()).await else {
            self.fatal(generation, NO_SERVERS);
            return;
        };

        {
            let mut session = self.lock();
            if session.generation != generation {
                return;
            }
            if session.state == TestState::Stopped {
                self.report_stopped(&mut session);
                return;
            }
            info!(server = %server, ping_ms, "server selected");
            (self.callbacks.on_ping_update)(ping_ms);
            session.server = Some(server);
        }

        self.start_phase(generation, Phase::Download).await;
    }

    /// The session's server if `generation` is still current and not stopped.
    fn proceed(&self, generation: u64) -> Option<ServerAddress> {
        let mut session = self.lock();
        if session.generation != generation {
            debug!(generation, current = session.generation, "dropping work of an old session");
            return None;
        }
        if session.state == TestState::Stopped {
            self.report_stopped(&mut session);
            return None;
        }
        session.server.clone()
    }

    async fn start_phase(self: &Arc<Self>, generation: u64, phase: Phase) {
        let Some(server) = self.proceed(generation) else {
            return;
        };
        let args = IperfArgs::new(&self.iperf);

        let response = self
            .remote
            .request(&server, RequestKind::Start, self.control_timeout, args.server())
            .await;
        if remote::is_failure(&response) {
            let message = format!("Could not start the iperf server on {} for the {}", server, phase);
            self.fatal(generation, &message);
            return;
        }
        debug!(%phase, response = %response.trim(), "peer armed");

        // Retire a run an earlier session left behind so its finish is not
        // taken for this phase's.
        let retiring = Arc::clone(self);
        let retired = tokio::task::spawn_blocking(move || {
            retiring.supervisor.send_sig_kill()?;
            retiring.supervisor.kill_and_wait()
        })
        .await;
        if let Ok(Err(e)) = retired {
            warn!(error = %e, "could not retire previous run");
        }

        {
            let mut session = self.lock();
            if session.generation != generation {
                return;
            }
            if session.state == TestState::Stopped {
                self.report_stopped(&mut session);
                return;
            }
            session.state = phase.into();
            session.lines.clear();
            session.launches += 1;
            info!(%phase, server = %server, "phase started");
            match phase {
                Phase::Download => (self.callbacks.on_download_start)(),
                Phase::Upload => (self.callbacks.on_upload_start)(),
            }
        }

        let client_args = args.client(&server, phase);
        let launching = Arc::clone(self);
        let launched =
            tokio::task::spawn_blocking(move || launching.supervisor.start(&client_args)).await;
        {
            let mut session = self.lock();
            session.launches -= 1;
            self.launched.notify_all();
        }
        match launched {
            Ok(Ok(pid)) => debug!(pid = pid.as_raw(), %phase, "client launched"),
            Ok(Err(e)) => {
                self.fatal(generation, &format!("Could not launch iperf: {}", e));
                return;
            }
            Err(e) => {
                self.fatal(generation, &format!("Could not launch iperf: {}", e));
                return;
            }
        }
    }

    fn handle_stdout(&self, chunk: &str) {
        let mut session = self.lock();
        let lines = session.lines.push(chunk);
        for line in lines {
            self.route_line(&mut session, &line);
        }
    }

    fn route_line(&self, session: &mut Session, line: &str) {
        let speed = match sample::parse_speed(line) {
            Ok(speed) => speed,
            Err(e) => {
                warn!(error = %e, "unparseable iperf output");
                if session.state != TestState::Stopped {
                    (self.callbacks.on_log)(&e.to_string());
                }
                return;
            }
        };

        match session.state {
            TestState::Download => {
                (self.callbacks.on_download_speed_update)(speed);
                session.download.accept(speed);
            }
            TestState::Upload => {
                (self.callbacks.on_upload_speed_update)(speed);
                session.upload.accept(speed);
            }
            state => debug!(speed, ?state, "discarding sample outside a phase"),
        }
    }

    fn handle_stderr(&self, text: &str) {
        warn!(text = %text.trim_end(), "iperf stderr");
        let session = self.lock();
        if session.state != TestState::Stopped {
            (self.callbacks.on_log)(text);
        }
    }

    fn handle_finish(self: &Arc<Self>) {
        let mut session = self.lock();

        if let Some(rest) = session.lines.take_partial() {
            let in_phase = matches!(session.state, TestState::Download | TestState::Upload);
            if in_phase && sample::parse_speed(&rest).is_ok() {
                self.route_line(&mut session, &rest);
            } else {
                debug!(line = %rest, "dropping truncated trailing record");
            }
        }

        let state = session.state;
        match state {
            TestState::Download => {
                info!(summary = %session.download, "download finished");
                let delay = (self.callbacks.on_download_finish)(&session.download);
                let generation = session.generation;
                drop(session);

                debug!(delay_ms = delay.as_millis() as u64, "waiting before upload");
                let inner = Arc::clone(self);
                self.runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    inner.start_phase(generation, Phase::Upload).await;
                });
            }
            TestState::Upload => {
                info!(summary = %session.upload, "upload finished");
                (self.callbacks.on_upload_finish)(&session.upload);
                (self.callbacks.on_finish)();
            }
            TestState::Stopped => self.report_stopped(&mut session),
            TestState::None | TestState::Error => {}
        }
    }

    fn report_stopped(&self, session: &mut Session) {
        if !session.stopped_reported {
            session.stopped_reported = true;
            info!(generation = session.generation, "speed test stopped");
            (self.callbacks.on_stopped)();
        }
    }

    fn fatal(&self, generation: u64, message: &str) {
        let mut session = self.lock();
        if session.generation != generation || session.state == TestState::Stopped {
            debug!(message, "suppressing error of a stopped or old session");
            return;
        }
        session.state = TestState::Error;
        error!(message, "speed test aborted");
        (self.callbacks.on_fatal_error)(message);
    }

    fn request_remote_stop(&self, server: ServerAddress) {
        let remote = Arc::clone(&self.remote);
        let timeout = self.control_timeout;
        self.runtime.spawn(async move {
            let response = remote.request(&server, RequestKind::Stop, timeout, "").await;
            if remote::is_failure(&response) {
                warn!(server = %server, "peer did not acknowledge stop");
            } else {
                debug!(server = %server, "peer stopped");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probes::fake::FakePing;
    use crate::process::fake::{FakeControl, Script};
    use crate::remote::fake::FakeRemote;
    use crate::remote::HttpRemoteControl;
    use nix::sys::signal::Signal;
    use std::time::Instant;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Ping(u64),
        DownloadStart,
        DownloadSpeed(u64),
        DownloadFinish(SpeedStatistics),
        UploadStart,
        UploadSpeed(u64),
        UploadFinish(SpeedStatistics),
        Finish,
        Stopped,
        Log(String),
        Fatal(String),
    }

    type Events = Arc<Mutex<Vec<Event>>>;

    fn recording_callbacks(events: &Events, delay: Duration) -> Callbacks {
        let record = {
            let events = Arc::clone(events);
            move |event: Event| events.lock().unwrap().push(event)
        };
        Callbacks {
            on_ping_update: Box::new({
                let r = record.clone();
                move |ms| r(Event::Ping(ms))
            }),
            on_download_start: Box::new({
                let r = record.clone();
                move || r(Event::DownloadStart)
            }),
            on_download_speed_update: Box::new({
                let r = record.clone();
                move |bps| r(Event::DownloadSpeed(bps))
            }),
            on_download_finish: Box::new({
                let r = record.clone();
                move |stats| {
                    r(Event::DownloadFinish(*stats));
                    delay
                }
            }),
            on_upload_start: Box::new({
                let r = record.clone();
                move || r(Event::UploadStart)
            }),
            on_upload_speed_update: Box::new({
                let r = record.clone();
                move |bps| r(Event::UploadSpeed(bps))
            }),
            on_upload_finish: Box::new({
                let r = record.clone();
                move |stats| r(Event::UploadFinish(*stats))
            }),
            on_finish: Box::new({
                let r = record.clone();
                move || r(Event::Finish)
            }),
            on_stopped: Box::new({
                let r = record.clone();
                move || r(Event::Stopped)
            }),
            on_log: Box::new({
                let r = record.clone();
                move |text| r(Event::Log(text.to_string()))
            }),
            on_fatal_error: Box::new(move |text| record(Event::Fatal(text.to_string()))),
        }
    }

    struct Harness {
        manager: SpeedTestManager,
        events: Events,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn new(
            control: &Arc<FakeControl>,
            remote: Arc<dyn RemoteControl>,
            ping: FakePing,
            servers: Vec<ServerAddress>,
            delay: Duration,
        ) -> Self {
            Self::with_callbacks(control, remote, ping, servers, |events| {
                recording_callbacks(events, delay)
            })
        }

        fn with_callbacks(
            control: &Arc<FakeControl>,
            remote: Arc<dyn RemoteControl>,
            ping: FakePing,
            servers: Vec<ServerAddress>,
            callbacks: impl FnOnce(&Events) -> Callbacks,
        ) -> Self {
            let dir = tempfile::TempDir::new().unwrap();
            let mut config = SpeedCheckConfig::default();
            config.iperf.work_dir = dir.path().to_path_buf();
            config.control.timeout_ms = 200;

            let events: Events = Arc::default();
            let manager = SpeedTestManager::new(
                &config,
                Collaborators {
                    control: Arc::clone(control) as Arc<dyn ProcessControl>,
                    remote,
                    ping: Arc::new(ping),
                    servers: Arc::new(StaticServers(servers)),
                },
                callbacks(&events),
            )
            .unwrap();

            Self {
                manager,
                events,
                _dir: dir,
            }
        }

        fn local(control: &Arc<FakeControl>, remote: &Arc<FakeRemote>, delay: Duration) -> Self {
            Self::new(
                control,
                Arc::clone(remote) as Arc<dyn RemoteControl>,
                FakePing::new(&[("localhost", 12.6)]),
                vec![ServerAddress::new("localhost", 5000, 5201)],
                delay,
            )
        }

        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn count(&self, event: &Event) -> usize {
            self.events().iter().filter(|e| *e == event).count()
        }

        async fn wait_for(&self, event: Event) {
            let deadline = Instant::now() + Duration::from_secs(10);
            while !self.events.lock().unwrap().contains(&event) {
                assert!(
                    Instant::now() < deadline,
                    "timed out waiting for {:?}; events: {:?}",
                    event,
                    self.events()
                );
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        async fn stop(&self) {
            let manager = self.manager.clone();
            tokio::task::spawn_blocking(move || manager.stop())
                .await
                .unwrap()
                .unwrap();
        }
    }

    fn record(speed: u64) -> String {
        format!("20240101120000,10.0.0.2,5001,10.0.0.1,41234,3,0.0-0.1,1470000,{}", speed)
    }

    fn script(speeds: &[u64]) -> Script {
        let lines: Vec<String> = speeds.iter().map(|s| record(*s)).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        Script::lines(&refs)
    }

    fn stats(samples: &[u64]) -> SpeedStatistics {
        let mut stats = SpeedStatistics::default();
        for s in samples {
            stats.accept(*s);
        }
        stats
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_run_reports_every_phase_in_order() {
        let control = FakeControl::with_scripts(vec![script(&[100, 200, 150]), script(&[300])]);
        let remote = Arc::new(FakeRemote::answering("ok"));
        let h = Harness::local(&control, &remote, Duration::from_millis(10));

        h.manager.start();
        h.wait_for(Event::Finish).await;

        assert_eq!(
            h.events(),
            vec![
                Event::Ping(13),
                Event::DownloadStart,
                Event::DownloadSpeed(100),
                Event::DownloadSpeed(200),
                Event::DownloadSpeed(150),
                Event::DownloadFinish(SpeedStatistics {
                    count: 3,
                    min: Some(100),
                    max: Some(200),
                    sum: 450,
                }),
                Event::UploadStart,
                Event::UploadSpeed(300),
                Event::UploadFinish(stats(&[300])),
                Event::Finish,
            ]
        );

        let spawned = control.spawned();
        assert_eq!(spawned.len(), 2);
        assert_eq!(spawned[0].last().map(String::as_str), Some("-R"));
        assert!(!spawned[1].contains(&"-R".to_string()));
        assert!(spawned[1].contains(&"localhost".to_string()));

        let requests = remote.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests
            .iter()
            .all(|(host, kind, args)| host == "localhost" && *kind == RequestKind::Start && args == "-s -u"));
        assert_eq!(h.manager.download_statistics(), stats(&[100, 200, 150]));
        assert_eq!(h.manager.state(), TestState::Upload);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_mid_download_reports_stopped_once() {
        let mut download = script(&[100]);
        download.hold_open = true;
        let control = FakeControl::with_scripts(vec![download]);
        let remote = Arc::new(FakeRemote::answering("ok"));
        let h = Harness::local(&control, &remote, Duration::ZERO);

        h.manager.start();
        h.wait_for(Event::DownloadSpeed(100)).await;
        h.stop().await;

        assert_eq!(h.count(&Event::Stopped), 1);
        assert_eq!(control.signals().first(), Some(&Signal::SIGKILL));
        assert_eq!(control.reaped().len(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = h.events();
        assert!(!events.iter().any(|e| matches!(e, Event::DownloadFinish(_) | Event::UploadStart)));
        assert_eq!(h.count(&Event::Stopped), 1);
        assert_eq!(control.spawned().len(), 1);
        assert!(remote.requests().iter().any(|(_, kind, _)| *kind == RequestKind::Stop));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_waits_for_launch_in_flight() {
        let mut download = script(&[]);
        download.hold_open = true;
        let control = FakeControl::with_scripts(vec![download]);
        let remote = Arc::new(FakeRemote::answering("ok"));
        let h = Harness::with_callbacks(
            &control,
            Arc::clone(&remote) as Arc<dyn RemoteControl>,
            FakePing::new(&[("localhost", 12.6)]),
            vec![ServerAddress::new("localhost", 5000, 5201)],
            |events| {
                let mut callbacks = recording_callbacks(events, Duration::ZERO);
                let events = Arc::clone(events);
                // Holds the session lock, so stop() lands between the phase
                // change and the spawn.
                callbacks.on_download_start = Box::new(move || {
                    events.lock().unwrap().push(Event::DownloadStart);
                    std::thread::sleep(Duration::from_millis(200));
                });
                callbacks
            },
        );

        h.manager.start();
        h.wait_for(Event::DownloadStart).await;
        h.stop().await;

        assert_eq!(control.spawned().len(), 1);
        assert_eq!(control.reaped().len(), 1);
        assert_eq!(control.signals().first(), Some(&Signal::SIGKILL));
        assert_eq!(h.count(&Event::Stopped), 1);
        assert_eq!(h.manager.supervisor_state(), SupervisorState::Idle);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(control.spawned().len(), 1);
        assert_eq!(control.reaped().len(), 1);
        assert_eq!(h.count(&Event::Stopped), 1);
        assert!(!h.events().iter().any(|e| matches!(e, Event::DownloadFinish(_) | Event::Fatal(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_during_delay_never_starts_upload() {
        let control = FakeControl::with_scripts(vec![script(&[100]), script(&[200])]);
        let remote = Arc::new(FakeRemote::answering("ok"));
        let h = Harness::local(&control, &remote, Duration::from_millis(200));

        h.manager.start();
        h.wait_for(Event::DownloadFinish(stats(&[100]))).await;
        h.stop().await;
        assert_eq!(h.count(&Event::Stopped), 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(h.count(&Event::Stopped), 1);
        assert_eq!(h.count(&Event::UploadStart), 0);
        assert_eq!(control.spawned().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_remote_failure_is_fatal_without_launch() {
        let control = FakeControl::new();
        let remote = Arc::new(FakeRemote::answering(remote::FAILURE_SENTINEL));
        let h = Harness::local(&control, &remote, Duration::ZERO);

        h.manager.start().await.unwrap();

        let events = h.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], Event::Ping(13));
        assert!(matches!(&events[1], Event::Fatal(msg) if msg.contains("download")));
        assert!(control.spawned().is_empty());
        assert_eq!(h.manager.state(), TestState::Error);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_reachable_server_is_fatal() {
        let control = FakeControl::new();
        let remote = Arc::new(FakeRemote::answering("ok"));
        let h = Harness::new(
            &control,
            Arc::clone(&remote) as Arc<dyn RemoteControl>,
            FakePing::new(&[]),
            vec![ServerAddress::new("localhost", 5000, 5201)],
            Duration::ZERO,
        );

        h.manager.start().await.unwrap();

        assert_eq!(h.events(), vec![Event::Fatal(NO_SERVERS.to_string())]);
        assert!(remote.requests().is_empty());
        assert!(control.spawned().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_lowest_latency_server_is_used() {
        let control = FakeControl::new();
        let remote = Arc::new(FakeRemote::answering(remote::FAILURE_SENTINEL));
        let h = Harness::new(
            &control,
            Arc::clone(&remote) as Arc<dyn RemoteControl>,
            FakePing::new(&[("far", 40.0), ("near", 12.6)]),
            vec![
                ServerAddress::new("far", 5000, 5201),
                ServerAddress::new("near", 5000, 5201),
            ],
            Duration::ZERO,
        );

        h.manager.start().await.unwrap();

        assert_eq!(h.events()[0], Event::Ping(13));
        assert_eq!(remote.requests()[0].0, "near");
        assert_eq!(h.manager.server().map(|s| s.host), Some("near".to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_remote_timeout_is_fatal_without_launch() {
        // Accepts connections but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let control = FakeControl::new();
        let h = Harness::new(
            &control,
            Arc::new(HttpRemoteControl::default()),
            FakePing::new(&[("127.0.0.1", 1.0)]),
            vec![ServerAddress::new("127.0.0.1", port, 5201)],
            Duration::ZERO,
        );

        h.manager.start().await.unwrap();

        assert!(matches!(h.events().last(), Some(Event::Fatal(_))));
        assert!(control.spawned().is_empty());
        assert_eq!(h.manager.supervisor_state(), SupervisorState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_truncated_trailing_record() {
        let mut download = script(&[100]);
        download.stdout.push(record(200));
        let mut upload = script(&[300]);
        upload.stdout.push("20240101120000,10.0.0.2,50".to_string());
        let control = FakeControl::with_scripts(vec![download, upload]);
        let remote = Arc::new(FakeRemote::answering("ok"));
        let h = Harness::local(&control, &remote, Duration::ZERO);

        h.manager.start();
        h.wait_for(Event::Finish).await;

        assert_eq!(h.count(&Event::DownloadFinish(stats(&[100, 200]))), 1);
        assert_eq!(h.count(&Event::UploadFinish(stats(&[300]))), 1);
        assert!(!h.events().iter().any(|e| matches!(e, Event::Log(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_new_session_discards_pending_upload_of_old_one() {
        let control =
            FakeControl::with_scripts(vec![script(&[100]), script(&[110]), script(&[120])]);
        let remote = Arc::new(FakeRemote::answering("ok"));
        let h = Harness::local(&control, &remote, Duration::from_millis(200));

        h.manager.start();
        h.wait_for(Event::DownloadFinish(stats(&[100]))).await;
        h.manager.start();
        h.wait_for(Event::Finish).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(h.count(&Event::UploadStart), 1);
        assert_eq!(h.count(&Event::UploadFinish(stats(&[120]))), 1);
        assert_eq!(control.spawned().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stderr_is_suppressed_after_stop() {
        let control = FakeControl::new();
        let remote = Arc::new(FakeRemote::answering("ok"));
        let h = Harness::local(&control, &remote, Duration::ZERO);

        h.manager.inner.handle_stderr("iperf: connection refused");
        h.stop().await;
        h.manager.inner.handle_stderr("iperf: interrupted");

        assert_eq!(
            h.events(),
            vec![
                Event::Log("iperf: connection refused".to_string()),
                Event::Stopped,
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sample_routing_by_state() {
        let control = FakeControl::new();
        let remote = Arc::new(FakeRemote::answering("ok"));
        let h = Harness::local(&control, &remote, Duration::ZERO);
        let inner = &h.manager.inner;

        inner.handle_stdout(&format!("{}\n", record(50)));
        assert!(h.events().is_empty());

        inner.lock().state = TestState::Download;
        inner.handle_stdout(&format!("a,b,c\n{}\n", record(500)));
        let events = h.events();
        assert!(matches!(&events[0], Event::Log(msg) if msg.contains("expected at least 9 fields")));
        assert_eq!(events[1], Event::DownloadSpeed(500));

        inner.lock().state = TestState::Upload;
        inner.handle_stdout(&record(700));
        inner.handle_stdout("\n");
        assert_eq!(h.events().last(), Some(&Event::UploadSpeed(700)));
        assert_eq!(h.manager.download_statistics(), stats(&[500]));
        assert_eq!(h.manager.upload_statistics(), stats(&[700]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_when_idle_reports_stopped() {
        let control = FakeControl::new();
        let remote = Arc::new(FakeRemote::answering("ok"));
        let h = Harness::local(&control, &remote, Duration::ZERO);

        h.stop().await;

        assert_eq!(h.events(), vec![Event::Stopped]);
        assert!(control.signals().is_empty());
        assert!(remote.requests().is_empty());
    }
}
