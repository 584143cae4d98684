//! In-process fakes for the supervision seams.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::process::{ChildStatus, ForkOutcome, ProcessOps, TerminationReason};
use crate::reload::{ReloadStatus, StatusSink};
use crate::shm::Handshake;
use crate::signals::Flags;

type ForkHook = Box<dyn Fn(Pid) + Send + Sync>;

#[derive(Default)]
struct FakeState {
    next_pid: i32,
    alive: HashSet<Pid>,
    zombies: HashMap<Pid, TerminationReason>,
    ignore_term: HashSet<Pid>,
    forked: Vec<Pid>,
    terminated: Vec<Pid>,
    killed: Vec<Pid>,
    reaped: Vec<Pid>,
    fail_forks: u32,
    child_countdown: Option<u32>,
}

/// A process table that lives in memory.
///
/// Forked children are "alive" until they are terminated, killed or told to
/// [`die`](FakeProcess::die). Waiting on a child that would never exit panics
/// instead of hanging the test.
pub struct FakeProcess {
    state: Mutex<FakeState>,
    on_fork: Mutex<Option<ForkHook>>,
}

impl FakeProcess {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_pid: 1000,
                ..FakeState::default()
            }),
            on_fork: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// The next `n` forks fail with `EAGAIN`.
    pub fn fail_forks(&self, n: u32) {
        self.lock().fail_forks = n;
    }

    /// The `n`-th fork from now returns [`ForkOutcome::Child`].
    pub fn child_on_fork(&self, n: u32) {
        self.lock().child_countdown = Some(n);
    }

    /// Run `hook` with the pid of every successfully forked child.
    pub fn on_fork(&self, hook: impl Fn(Pid) + Send + Sync + 'static) {
        *self.on_fork.lock().unwrap() = Some(Box::new(hook));
    }

    /// `pid` ignores `SIGTERM`.
    pub fn ignore_term(&self, pid: Pid) {
        self.lock().ignore_term.insert(pid);
    }

    /// `pid` exits on its own with `code`.
    pub fn die(&self, pid: Pid, code: i32) {
        let mut state = self.lock();
        if state.alive.remove(&pid) {
            state.zombies.insert(pid, TerminationReason::Exited(code));
        }
    }

    pub fn is_alive(&self, pid: Pid) -> bool {
        self.lock().alive.contains(&pid)
    }

    pub fn alive_count(&self) -> usize {
        self.lock().alive.len()
    }

    pub fn forked(&self) -> Vec<Pid> {
        self.lock().forked.clone()
    }

    pub fn terminated(&self) -> Vec<Pid> {
        self.lock().terminated.clone()
    }

    pub fn killed(&self) -> Vec<Pid> {
        self.lock().killed.clone()
    }

    pub fn reaped(&self) -> Vec<Pid> {
        self.lock().reaped.clone()
    }
}

impl ProcessOps for FakeProcess {
    fn fork(&self) -> nix::Result<ForkOutcome> {
        let pid = {
            let mut state = self.lock();
            if state.fail_forks > 0 {
                state.fail_forks -= 1;
                return Err(Errno::EAGAIN);
            }
            if let Some(n) = state.child_countdown {
                if n <= 1 {
                    state.child_countdown = None;
                    return Ok(ForkOutcome::Child);
                }
                state.child_countdown = Some(n - 1);
            }
            state.next_pid += 1;
            let pid = Pid::from_raw(state.next_pid);
            state.alive.insert(pid);
            state.forked.push(pid);
            pid
        };
        if let Some(hook) = self.on_fork.lock().unwrap().as_ref() {
            hook(pid);
        }
        Ok(ForkOutcome::Parent(pid))
    }

    fn try_reap(&self, pid: Pid) -> ChildStatus {
        let mut state = self.lock();
        if state.alive.contains(&pid) {
            return ChildStatus::Running;
        }
        match state.zombies.remove(&pid) {
            Some(reason) => {
                state.reaped.push(pid);
                ChildStatus::Exited(reason)
            }
            None => ChildStatus::Exited(TerminationReason::Lost(Errno::ECHILD)),
        }
    }

    fn terminate(&self, pid: Pid) {
        let mut state = self.lock();
        state.terminated.push(pid);
        if !state.ignore_term.contains(&pid) && state.alive.remove(&pid) {
            state
                .zombies
                .insert(pid, TerminationReason::Signaled(Signal::SIGTERM));
        }
    }

    fn kill(&self, pid: Pid) {
        let mut state = self.lock();
        state.killed.push(pid);
        if state.alive.remove(&pid) {
            state
                .zombies
                .insert(pid, TerminationReason::Signaled(Signal::SIGKILL));
        }
    }

    fn wait(&self, pid: Pid) {
        let mut state = self.lock();
        assert!(
            !state.alive.contains(&pid),
            "wait({pid}) on a live fake process would block forever"
        );
        if state.zombies.remove(&pid).is_some() {
            state.reaped.push(pid);
        }
    }
}

/// Handshake flag in ordinary memory.
#[derive(Debug, Default)]
pub struct MemoryHandshake(AtomicBool);

impl Handshake for MemoryHandshake {
    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    fn mark_finished(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_finished(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Status sink that remembers every transition.
#[derive(Debug, Default)]
pub struct RecordingSink(Mutex<Vec<ReloadStatus>>);

impl RecordingSink {
    pub fn history(&self) -> Vec<ReloadStatus> {
        self.0.lock().unwrap().clone()
    }
}

impl StatusSink for RecordingSink {
    fn record(&self, status: ReloadStatus) {
        self.0.lock().unwrap().push(status);
    }
}

/// Flags whose shutdown-pending bit does not follow the exit flag, as with
/// [`ProcessFlags`](crate::signals::ProcessFlags) when exit is requested
/// without the worker signal handler.
#[derive(Debug, Default)]
pub struct SplitFlags {
    exit: AtomicBool,
    shutdown: AtomicBool,
}

impl Flags for SplitFlags {
    fn exit_requested(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }

    fn request_exit(&self) {
        self.exit.store(true, Ordering::SeqCst);
    }

    fn reload_requested(&self) -> bool {
        false
    }

    fn clear_reload(&self) {}

    fn shutdown_pending(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}
