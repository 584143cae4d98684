//! Fork one worker into a registry slot.

use nix::unistd::Pid;
use tracing::{debug, error};

use crate::process::{ForkOutcome, ProcessOps};
use crate::registry::{ChildRegistry, ChildState};

/// Result of [`spawn_into`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnOutcome {
    /// Parent side: slot now holds the new worker.
    Spawned(Pid),
    /// Parent side: fork failed, slot is `Invalid`.
    Failed,
    /// This process is the new worker. The caller must leave every
    /// supervision loop and start serving.
    InChild,
}

/// Fork a worker for slot `index`.
///
/// Never retries; the poll loop owns the retry cadence.
pub fn spawn_into(ops: &dyn ProcessOps, registry: &ChildRegistry, index: usize) -> SpawnOutcome {
    match ops.fork() {
        Ok(ForkOutcome::Child) => SpawnOutcome::InChild,
        Ok(ForkOutcome::Parent(pid)) => {
            registry.set_slot(index, Some(pid), ChildState::Living);
            debug!(slot = index, %pid, "worker spawned");
            SpawnOutcome::Spawned(pid)
        }
        Err(e) => {
            registry.set_slot(index, None, ChildState::Invalid);
            error!(slot = index, "fork failed: {e}");
            SpawnOutcome::Failed
        }
    }
}
