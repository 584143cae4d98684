//! Worker slot table owned by a manager generation.
//!
//! One slot per configured worker. Slots are written as `{pid, state}` pairs
//! under a single mutex, so the monitor loop and embedder threads (which may
//! request a refork through [`ServerHandle`](crate::server::ServerHandle)) never
//! observe a torn pair. The monitor loop iterates over a [`snapshot`] so the
//! lock is never held across `fork`, `kill` or `waitpid`.
//!
//! [`snapshot`]: ChildRegistry::snapshot

use std::sync::{Mutex, MutexGuard};

use nix::unistd::Pid;

/// Lifecycle state of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChildState {
    /// No live worker; the next poll tick forks one.
    #[default]
    Invalid,
    /// A worker with the slot's pid is believed to be running.
    Living,
    /// The worker should be replaced on the next poll tick.
    WaitingForReload,
}

/// One worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildSlot {
    /// `None` when the slot has no process.
    pub pid: Option<Pid>,
    pub state: ChildState,
}

impl ChildSlot {
    pub const EMPTY: ChildSlot = ChildSlot {
        pid: None,
        state: ChildState::Invalid,
    };
}

/// Mutex-guarded table of worker slots.
#[derive(Debug, Default)]
pub struct ChildRegistry {
    slots: Mutex<Vec<ChildSlot>>,
}

impl ChildRegistry {
    /// An unsized registry; [`ChildRegistry::reset`] sizes it per generation.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(worker_count: usize) -> Self {
        let registry = Self::new();
        registry.reset(worker_count);
        registry
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ChildSlot>> {
        // A panic while holding the lock cannot leave a torn pair behind:
        // every write replaces whole slots.
        self.slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Size the table to `worker_count` empty slots.
    ///
    /// Called once when a manager generation starts; the table is never
    /// resized while that generation supervises.
    pub fn reset(&self, worker_count: usize) {
        let mut slots = self.lock();
        slots.clear();
        slots.resize(worker_count, ChildSlot::EMPTY);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Write `pid` and `state` for slot `index` as one unit.
    ///
    /// Out-of-range indices are ignored.
    pub fn set_slot(&self, index: usize, pid: Option<Pid>, state: ChildState) {
        if let Some(slot) = self.lock().get_mut(index) {
            *slot = ChildSlot { pid, state };
        }
    }

    /// Flag slot `index` for replacement on the next tick, keeping its pid.
    ///
    /// Repeated calls before that tick still yield a single respawn.
    pub fn mark_for_reload(&self, index: usize) {
        if let Some(slot) = self.lock().get_mut(index) {
            slot.state = ChildState::WaitingForReload;
        }
    }

    /// Flag every slot for replacement.
    pub fn mark_all_for_reload(&self) {
        for slot in self.lock().iter_mut() {
            slot.state = ChildState::WaitingForReload;
        }
    }

    pub fn get(&self, index: usize) -> Option<ChildSlot> {
        self.lock().get(index).copied()
    }

    /// Point-in-time copy of all slots.
    pub fn snapshot(&self) -> Vec<ChildSlot> {
        self.lock().clone()
    }

    pub fn living_count(&self) -> usize {
        self.lock()
            .iter()
            .filter(|s| s.state == ChildState::Living)
            .count()
    }

    /// Pids of every slot that still holds a process.
    pub fn live_pids(&self) -> Vec<Pid> {
        self.lock().iter().filter_map(|s| s.pid).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_registry_is_unsized() {
        let registry = ChildRegistry::new();
        assert!(registry.is_empty());
        registry.mark_all_for_reload();
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_reset_creates_invalid_slots() {
        let registry = ChildRegistry::with_capacity(3);
        assert_eq!(registry.len(), 3);
        assert!(registry.snapshot().iter().all(|s| *s == ChildSlot::EMPTY));
        assert_eq!(registry.living_count(), 0);
    }

    #[test]
    fn test_set_slot_writes_pair() {
        let registry = ChildRegistry::with_capacity(2);
        registry.set_slot(1, Some(Pid::from_raw(42)), ChildState::Living);
        assert_eq!(
            registry.get(1),
            Some(ChildSlot {
                pid: Some(Pid::from_raw(42)),
                state: ChildState::Living
            })
        );
        assert_eq!(registry.living_count(), 1);
        assert_eq!(registry.live_pids(), vec![Pid::from_raw(42)]);
    }

    #[test]
    fn test_set_slot_out_of_range_is_ignored() {
        let registry = ChildRegistry::with_capacity(1);
        registry.set_slot(5, Some(Pid::from_raw(1)), ChildState::Living);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(5), None);
    }

    #[test]
    fn test_mark_for_reload_keeps_pid() {
        let registry = ChildRegistry::with_capacity(1);
        registry.set_slot(0, Some(Pid::from_raw(9)), ChildState::Living);
        registry.mark_for_reload(0);
        let slot = registry.get(0).unwrap();
        assert_eq!(slot.pid, Some(Pid::from_raw(9)));
        assert_eq!(slot.state, ChildState::WaitingForReload);
    }

    #[test]
    fn test_mark_for_reload_is_idempotent() {
        let registry = ChildRegistry::with_capacity(1);
        registry.set_slot(0, Some(Pid::from_raw(9)), ChildState::Living);
        registry.mark_for_reload(0);
        let once = registry.snapshot();
        registry.mark_for_reload(0);
        registry.mark_all_for_reload();
        assert_eq!(registry.snapshot(), once);
    }

    #[test]
    fn test_concurrent_marking() {
        let registry = std::sync::Arc::new(ChildRegistry::with_capacity(8));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.mark_all_for_reload())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(registry
            .snapshot()
            .iter()
            .all(|s| s.state == ChildState::WaitingForReload));
    }
}
