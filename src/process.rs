//! OS process primitives used by the supervision loops.
//!
//! Everything that forks, signals, or reaps goes through [`ProcessOps`], so
//! the pool and the reload coordinator can be driven by a fake process table
//! in tests. [`UnixProcess`] is the real implementation on top of `nix`.

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{debug, warn};

/// Which side of a fork the caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkOutcome {
    /// Still the original process; the new child has this pid.
    Parent(Pid),
    /// The newly created process.
    Child,
}

/// Reason why a child process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// `waitpid` failed, e.g. the pid is not (or no longer) our child.
    Lost(Errno),
}

impl TerminationReason {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(sig) => write!(f, "killed by signal {sig:?}"),
            Self::Lost(errno) => write!(f, "lost ({errno})"),
        }
    }
}

/// Result of a non-blocking reap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Running,
    Exited(TerminationReason),
}

/// Map a `WaitStatus` to a termination reason; `None` while still running.
pub fn analyze_wait_status(status: WaitStatus) -> Option<TerminationReason> {
    match status {
        WaitStatus::Exited(_, code) => Some(TerminationReason::Exited(code)),
        WaitStatus::Signaled(_, sig, _) => Some(TerminationReason::Signaled(sig)),
        _ => None,
    }
}

/// Fork, signal and reap.
///
/// Implementations must be usable from the drain watcher thread.
pub trait ProcessOps: Send + Sync {
    fn fork(&self) -> nix::Result<ForkOutcome>;
    /// Reap `pid` if it has exited, without blocking.
    fn try_reap(&self, pid: Pid) -> ChildStatus;
    /// Ask `pid` to exit (`SIGTERM`).
    fn terminate(&self, pid: Pid);
    /// Force `pid` to exit (`SIGKILL`).
    fn kill(&self, pid: Pid);
    /// Block until `pid` is reaped.
    fn wait(&self, pid: Pid);
}

/// [`ProcessOps`] backed by real `fork`/`kill`/`waitpid`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixProcess;

impl ProcessOps for UnixProcess {
    fn fork(&self) -> nix::Result<ForkOutcome> {
        // SAFETY: the child branch only continues into worker or manager code
        // of this same single-threaded supervision flow; it never touches
        // locks that other threads of the parent may hold.
        match unsafe { fork() }? {
            ForkResult::Parent { child } => Ok(ForkOutcome::Parent(child)),
            ForkResult::Child => Ok(ForkOutcome::Child),
        }
    }

    fn try_reap(&self, pid: Pid) -> ChildStatus {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::EINTR) => ChildStatus::Running,
            Ok(status) => match analyze_wait_status(status) {
                Some(reason) => ChildStatus::Exited(reason),
                None => ChildStatus::Running,
            },
            Err(errno) => ChildStatus::Exited(TerminationReason::Lost(errno)),
        }
    }

    fn terminate(&self, pid: Pid) {
        if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
            debug!("SIGTERM to {pid} failed: {e}");
        }
    }

    fn kill(&self, pid: Pid) {
        if let Err(e) = signal::kill(pid, Signal::SIGKILL) {
            debug!("SIGKILL to {pid} failed: {e}");
        }
    }

    fn wait(&self, pid: Pid) {
        loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) => return,
                Ok(_) | Err(Errno::EINTR) => {}
                Err(Errno::ECHILD) => return,
                Err(e) => {
                    warn!("waitpid({pid}) failed: {e}");
                    return;
                }
            }
        }
    }
}
