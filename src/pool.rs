//! Manager-side worker supervision.
//!
//! The manager forks `worker_count` workers, then polls them on a fixed
//! cadence. Each tick walks a snapshot of the [`ChildRegistry`]:
//!
//! | Slot state         | Action                                              |
//! |--------------------|-----------------------------------------------------|
//! | `WaitingForReload` | fork a replacement, then `SIGTERM` the old worker   |
//! | `Living`           | non-blocking reap; fork a replacement if it exited  |
//! | `Invalid`          | fork a replacement                                  |
//!
//! Replaced workers are drained by a detached watcher thread that sleeps for
//! the grace period and then `SIGKILL`s whatever is still running, so a slow
//! worker never stalls the next tick.
//!
//! A fork failure leaves the slot `Invalid` for the next tick. After
//! `fork_failure_limit` consecutive failures the manager gives up supervising
//! and becomes a worker itself, so the generation keeps serving at reduced
//! capacity instead of supervising nothing.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::logging;
use crate::process::{ChildStatus, ProcessOps};
use crate::registry::{ChildRegistry, ChildState};
use crate::signals::Flags;
use crate::spawner::{spawn_into, SpawnOutcome};

/// Timing and failure policy for a [`ProcessPool`].
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub poll_interval: Duration,
    pub drain_grace: Duration,
    pub fork_failure_limit: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for PoolSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            drain_grace: config.drain_grace(),
            fork_failure_limit: config.fork_failure_limit.max(1),
        }
    }
}

/// What the current process should do after a pool operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Supervision {
    /// Still the manager.
    Continue,
    /// This process is a freshly forked worker.
    BecameWorker,
    /// Forking kept failing; the manager serves requests itself from now on.
    Demoted,
}

/// Worker pool of one manager generation.
pub struct ProcessPool {
    ops: Arc<dyn ProcessOps>,
    registry: Arc<ChildRegistry>,
    settings: PoolSettings,
    fork_failures: u32,
    drains: Vec<JoinHandle<()>>,
}

impl ProcessPool {
    /// `registry` must already be sized for this generation.
    pub fn new(
        ops: Arc<dyn ProcessOps>,
        registry: Arc<ChildRegistry>,
        settings: PoolSettings,
    ) -> Self {
        Self {
            ops,
            registry,
            settings,
            fork_failures: 0,
            drains: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ChildRegistry> {
        &self.registry
    }

    /// Fork the initial set of workers, one per slot.
    pub fn fork_children(&mut self) -> Supervision {
        for index in 0..self.registry.len() {
            match spawn_into(self.ops.as_ref(), &self.registry, index) {
                SpawnOutcome::InChild => return Supervision::BecameWorker,
                SpawnOutcome::Spawned(_) => self.fork_failures = 0,
                SpawnOutcome::Failed => {
                    if self.note_fork_failure() {
                        return Supervision::Demoted;
                    }
                }
            }
        }
        info!(
            workers = self.registry.living_count(),
            slots = self.registry.len(),
            "workers forked"
        );
        Supervision::Continue
    }

    /// Poll until exit is requested or this process stops being the manager.
    pub fn supervise(&mut self, flags: &dyn Flags) -> Supervision {
        while !flags.exit_requested() {
            thread::sleep(self.settings.poll_interval);
            logging::apply_requested_level(flags);
            match self.tick(flags) {
                Supervision::Continue => {}
                other => return other,
            }
        }
        Supervision::Continue
    }

    /// One supervision pass over every slot.
    pub fn tick(&mut self, flags: &dyn Flags) -> Supervision {
        self.drains.retain(|h| !h.is_finished());

        let mut drained = Vec::new();
        let mut outcome = Supervision::Continue;

        for (index, slot) in self.registry.snapshot().into_iter().enumerate() {
            if flags.exit_requested() {
                break;
            }

            let needs_fork = match (slot.state, slot.pid) {
                (ChildState::Living, Some(pid)) => match self.ops.try_reap(pid) {
                    ChildStatus::Running => false,
                    ChildStatus::Exited(reason) => {
                        warn!(slot = index, %pid, "worker {reason}, respawning");
                        true
                    }
                },
                (ChildState::WaitingForReload, _)
                | (ChildState::Invalid, _)
                | (ChildState::Living, None) => true,
            };
            if !needs_fork {
                continue;
            }

            match spawn_into(self.ops.as_ref(), &self.registry, index) {
                SpawnOutcome::InChild => return Supervision::BecameWorker,
                SpawnOutcome::Spawned(pid) => {
                    self.fork_failures = 0;
                    if slot.state == ChildState::WaitingForReload {
                        if let Some(old) = slot.pid {
                            debug!(slot = index, %old, new = %pid, "replacing worker");
                            self.ops.terminate(old);
                            drained.push(old);
                        }
                    }
                }
                SpawnOutcome::Failed => {
                    if slot.state == ChildState::WaitingForReload && slot.pid.is_some() {
                        // The old worker keeps serving until a replacement exists.
                        self.registry
                            .set_slot(index, slot.pid, ChildState::WaitingForReload);
                    }
                    if self.note_fork_failure() {
                        outcome = Supervision::Demoted;
                        break;
                    }
                }
            }
        }

        if !drained.is_empty() {
            self.spawn_drain_watcher(drained);
        }
        outcome
    }

    /// Record a fork failure; `true` once the demotion limit is reached.
    fn note_fork_failure(&mut self) -> bool {
        self.fork_failures += 1;
        if self.fork_failures >= self.settings.fork_failure_limit {
            error!(
                failures = self.fork_failures,
                "fork keeps failing, manager demoting itself to worker"
            );
            true
        } else {
            false
        }
    }

    fn spawn_drain_watcher(&mut self, pids: Vec<Pid>) {
        let ops = Arc::clone(&self.ops);
        let grace = self.settings.drain_grace;
        let spawned = thread::Builder::new()
            .name("drain-watcher".to_string())
            .spawn(move || drain(ops.as_ref(), &pids, grace));
        match spawned {
            Ok(handle) => self.drains.push(handle),
            Err(e) => error!("failed to start drain watcher: {e}"),
        }
    }

    /// Block until every drain watcher started so far has finished.
    pub fn join_drains(&mut self) {
        for handle in self.drains.drain(..) {
            let _ = handle.join();
        }
    }

    /// Forget drain watchers in a freshly forked worker. `fork` only copies
    /// the calling thread, so their handles refer to threads of the parent.
    pub fn abandon_drains(&mut self) {
        for handle in self.drains.drain(..) {
            std::mem::forget(handle);
        }
    }

    /// `SIGTERM` every worker of this generation and reap them all.
    pub fn shutdown(&self) {
        let pids = self.registry.live_pids();
        info!(workers = pids.len(), "stopping workers");
        for &pid in &pids {
            self.ops.terminate(pid);
        }
        for &pid in &pids {
            self.ops.wait(pid);
        }
        for index in 0..self.registry.len() {
            self.registry.set_slot(index, None, ChildState::Invalid);
        }
    }
}

/// Give `pids` `grace` to exit after `SIGTERM`, then kill and reap the rest.
pub fn drain(ops: &dyn ProcessOps, pids: &[Pid], grace: Duration) {
    thread::sleep(grace);
    for &pid in pids {
        match ops.try_reap(pid) {
            ChildStatus::Running => {
                warn!(%pid, "drained worker still running after {grace:?}, killing");
                ops.kill(pid);
                ops.wait(pid);
            }
            ChildStatus::Exited(reason) => debug!(%pid, "drained worker {reason}"),
        }
    }
}
