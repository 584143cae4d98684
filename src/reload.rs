//! Boss-side generation lifecycle and live reload.
//!
//! The boss never serves requests and never forks workers. It holds the pid
//! of the active manager and, on `SIGUSR1`, hands service over to a new
//! manager generation:
//!
//! 1. reset the shared handshake flag and record `Reloading`
//! 2. fork the new manager
//! 3. poll until the new manager sets the handshake flag, or exits
//! 4. on handshake: `SIGTERM` + reap the old manager, adopt the new pid,
//!    record `Succeeded`
//! 5. otherwise record `Failed`; the old generation keeps serving
//!
//! Both generations are alive during the handshake window, so the server is
//! never without a manager. A manager that dies on its own is replaced
//! through the same path, with exponential backoff between attempts.
//!
//! The handshake flag is shared by every generation. A reload is therefore
//! held back until the current manager has set it: otherwise that manager's
//! late confirmation would be taken for the new generation's.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::logging;
use crate::process::{ChildStatus, ForkOutcome, ProcessOps};
use crate::shm::Handshake;
use crate::signals::Flags;

/// Outcome of the most recent reload, as seen by external tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadStatus {
    None,
    Reloading,
    Succeeded,
    Failed,
}

impl ReloadStatus {
    /// Numeric code written to the status file.
    pub fn code(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Reloading => 1,
            Self::Succeeded => 2,
            Self::Failed => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::Reloading),
            2 => Some(Self::Succeeded),
            3 => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for ReloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Reloading => "reloading",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Where reload transitions are published.
pub trait StatusSink: Send + Sync {
    fn record(&self, status: ReloadStatus);
}

/// Discards every status.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl StatusSink for NullSink {
    fn record(&self, _status: ReloadStatus) {}
}

/// Writes the status code to a file, replacing its contents.
#[derive(Debug, Clone)]
pub struct FileStatusSink {
    path: PathBuf,
}

impl FileStatusSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StatusSink for FileStatusSink {
    fn record(&self, status: ReloadStatus) {
        if let Err(e) = std::fs::write(&self.path, status.code().to_string()) {
            warn!("failed to write status file {}: {e}", self.path.display());
        }
    }
}

/// Read a status file written by [`FileStatusSink`].
pub fn read_status(path: &Path) -> io::Result<ReloadStatus> {
    let content = std::fs::read_to_string(path)?;
    content
        .trim()
        .parse::<u8>()
        .ok()
        .and_then(ReloadStatus::from_code)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unrecognized reload status {:?}", content.trim()),
            )
        })
}

/// Timing policy for a [`ReloadCoordinator`].
#[derive(Debug, Clone)]
pub struct BossSettings {
    pub poll_interval: Duration,
    /// `None` waits until the new manager either confirms or exits.
    pub reload_timeout: Option<Duration>,
    pub max_backoff: Duration,
    /// How long a stopped manager gets to drain its workers before `SIGKILL`.
    pub stop_grace: Duration,
}

impl Default for BossSettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for BossSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            reload_timeout: config.reload_timeout(),
            max_backoff: Duration::from_secs(config.max_backoff_secs),
            stop_grace: config.drain_grace() + config.poll_interval() * 2,
        }
    }
}

/// Generation lifecycle points reported to the boss's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationEvent {
    /// A new generation is about to be forked.
    Forking,
    /// The generation forked last has confirmed and replaced its predecessor.
    Confirmed,
}

/// How the boss loop ended for this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BossExit {
    /// Exit was requested; the manager has been stopped.
    Shutdown,
    /// This process is a freshly forked manager generation.
    BecameManager,
}

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// The boss supervision loop.
pub struct ReloadCoordinator<'a> {
    ops: Arc<dyn ProcessOps>,
    handshake: &'a dyn Handshake,
    sink: &'a dyn StatusSink,
    flags: &'a dyn Flags,
    settings: BossSettings,
    on_generation: Option<Box<dyn FnMut(GenerationEvent) + 'a>>,
    manager: Option<Pid>,
    /// Whether `manager` has set the handshake flag.
    confirmed: bool,
    manager_since: Instant,
    abandoned: Vec<Pid>,
    backoff: Duration,
    respawn_at: Option<Instant>,
}

impl<'a> ReloadCoordinator<'a> {
    /// `manager` is the generation forked at startup, or `None` if that
    /// fork failed and a generation should be started on the first tick.
    /// Records [`ReloadStatus::None`].
    pub fn new(
        ops: Arc<dyn ProcessOps>,
        handshake: &'a dyn Handshake,
        sink: &'a dyn StatusSink,
        flags: &'a dyn Flags,
        settings: BossSettings,
        manager: Option<Pid>,
    ) -> Self {
        sink.record(ReloadStatus::None);
        let backoff = INITIAL_BACKOFF.min(settings.max_backoff);
        Self {
            ops,
            handshake,
            sink,
            flags,
            settings,
            on_generation: None,
            manager,
            confirmed: false,
            manager_since: Instant::now(),
            abandoned: Vec::new(),
            backoff,
            respawn_at: manager.is_none().then(Instant::now),
        }
    }

    /// Run `hook` right before every new generation is forked, and again
    /// when that generation takes over.
    #[must_use]
    pub fn on_generation(mut self, hook: impl FnMut(GenerationEvent) + 'a) -> Self {
        self.on_generation = Some(Box::new(hook));
        self
    }

    fn notify(&mut self, event: GenerationEvent) {
        if let Some(hook) = self.on_generation.as_mut() {
            hook(event);
        }
    }

    /// The manager currently considered authoritative.
    pub fn manager(&self) -> Option<Pid> {
        self.manager
    }

    /// Poll until exit is requested or this process becomes a manager.
    pub fn run(&mut self) -> BossExit {
        loop {
            if self.flags.exit_requested() {
                self.stop_generations();
                return BossExit::Shutdown;
            }
            thread::sleep(self.settings.poll_interval);
            logging::apply_requested_level(self.flags);
            if let Some(exit) = self.tick() {
                return exit;
            }
        }
    }

    /// One boss poll. Returns `Some` only in a newly forked manager.
    pub fn tick(&mut self) -> Option<BossExit> {
        if self.flags.exit_requested() {
            return None;
        }
        self.reap_abandoned();
        self.check_manager();
        if self.manager.is_some() && !self.confirmed && self.handshake.is_finished() {
            debug!("current generation confirmed");
            self.confirmed = true;
        }

        if self.flags.reload_requested() {
            if self.manager.is_some() && !self.confirmed {
                debug!("reload deferred until the current generation confirms");
                return None;
            }
            info!("reload requested");
            let exit = self.reload();
            self.flags.clear_reload();
            return exit;
        }

        let respawn_due =
            self.manager.is_none() && self.respawn_at.is_some_and(|at| Instant::now() >= at);
        if respawn_due {
            info!("starting a new manager generation");
            return self.reload();
        }
        None
    }

    fn check_manager(&mut self) {
        let Some(pid) = self.manager else {
            return;
        };
        if let ChildStatus::Exited(reason) = self.ops.try_reap(pid) {
            if self.manager_since.elapsed() >= self.settings.max_backoff {
                self.backoff = INITIAL_BACKOFF.min(self.settings.max_backoff);
            }
            error!(
                %pid,
                "manager {reason}, starting a new generation in {:?}",
                self.backoff
            );
            self.manager = None;
            self.confirmed = false;
            self.respawn_at = Some(Instant::now() + self.backoff);
            self.backoff = (self.backoff * 2).min(self.settings.max_backoff);
        }
    }

    fn reap_abandoned(&mut self) {
        let ops = &self.ops;
        self.abandoned.retain(|&pid| match ops.try_reap(pid) {
            ChildStatus::Running => true,
            ChildStatus::Exited(reason) => {
                debug!(%pid, "abandoned manager {reason}");
                false
            }
        });
    }

    /// Fork a new generation and hand over to it once it confirms.
    fn reload(&mut self) -> Option<BossExit> {
        self.handshake.reset();
        self.sink.record(ReloadStatus::Reloading);
        self.notify(GenerationEvent::Forking);

        let new = match self.ops.fork() {
            Ok(ForkOutcome::Child) => {
                self.flags.clear_reload();
                return Some(BossExit::BecameManager);
            }
            Ok(ForkOutcome::Parent(pid)) => pid,
            Err(e) => {
                error!("failed to fork new manager: {e}");
                self.sink.record(ReloadStatus::Failed);
                self.schedule_retry();
                return None;
            }
        };
        info!(%new, "new manager forked, waiting for its workers");

        if self.await_handshake(new) {
            if let Some(old) = self.manager.replace(new) {
                info!(%old, "stopping previous manager");
                self.ops.terminate(old);
                self.reap_within(old, Instant::now() + self.settings.stop_grace);
            }
            self.manager_since = Instant::now();
            self.confirmed = true;
            self.respawn_at = None;
            self.notify(GenerationEvent::Confirmed);
            self.sink.record(ReloadStatus::Succeeded);
            info!(manager = %new, "reload succeeded");
        } else {
            self.sink.record(ReloadStatus::Failed);
            warn!(
                current = ?self.manager.map(Pid::as_raw),
                "reload failed, previous generation stays active"
            );
            self.schedule_retry();
        }
        None
    }

    fn schedule_retry(&mut self) {
        if self.manager.is_none() {
            self.respawn_at = Some(Instant::now() + self.backoff);
            self.backoff = (self.backoff * 2).min(self.settings.max_backoff);
        }
    }

    /// `true` once `new` has confirmed its workers are up.
    fn await_handshake(&mut self, new: Pid) -> bool {
        let started = Instant::now();
        loop {
            if self.handshake.is_finished() {
                return true;
            }
            if let ChildStatus::Exited(reason) = self.ops.try_reap(new) {
                warn!(%new, "new manager {reason} before finishing startup");
                return false;
            }
            if self.flags.exit_requested() {
                self.abandon(new);
                return false;
            }
            if let Some(limit) = self.settings.reload_timeout {
                if started.elapsed() >= limit {
                    warn!(%new, "new manager did not confirm within {limit:?}, terminating it");
                    self.abandon(new);
                    return false;
                }
            }
            thread::sleep(self.settings.poll_interval);
        }
    }

    fn abandon(&mut self, pid: Pid) {
        self.ops.terminate(pid);
        self.abandoned.push(pid);
    }

    /// Stop the active manager and any abandoned ones, then reap them.
    fn stop_generations(&mut self) {
        let pids: Vec<Pid> = self
            .manager
            .take()
            .into_iter()
            .chain(self.abandoned.drain(..))
            .collect();
        for &pid in &pids {
            info!(%pid, "stopping manager");
            self.ops.terminate(pid);
        }
        let deadline = Instant::now() + self.settings.stop_grace;
        for &pid in &pids {
            self.reap_within(pid, deadline);
        }
    }

    /// Reap `pid`, killing it if it is still running at `deadline`.
    fn reap_within(&self, pid: Pid, deadline: Instant) {
        loop {
            if let ChildStatus::Exited(reason) = self.ops.try_reap(pid) {
                debug!(%pid, "manager {reason}");
                return;
            }
            if Instant::now() >= deadline {
                warn!(%pid, "manager did not stop in time, killing it");
                self.ops.kill(pid);
                self.ops.wait(pid);
                return;
            }
            thread::sleep(self.settings.poll_interval.min(deadline - Instant::now()));
        }
    }
}
