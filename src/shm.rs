//! Cross-process handshake flag.
//!
//! The boss maps one anonymous shared page before its first fork; every
//! manager generation inherits the mapping. The active manager sets the flag
//! once its workers are forked, and the boss resets it right before forking a
//! new generation. Each access is an explicit acquire load or release store on
//! the shared word, so neither side caches a stale value.

use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

/// The "new generation's workers are up" signal between boss and manager.
pub trait Handshake: Send + Sync {
    /// Boss only, immediately before forking a new manager generation.
    fn reset(&self);
    /// Active manager only, after its workers are forked.
    fn mark_finished(&self);
    fn is_finished(&self) -> bool;
}

/// A single boolean in a `MAP_SHARED | MAP_ANONYMOUS` mapping.
pub struct SharedFlag {
    ptr: NonNull<libc::c_void>,
    len: usize,
}

// SAFETY: the mapping is only accessed through `AtomicBool` operations.
unsafe impl Send for SharedFlag {}
// SAFETY: as above.
unsafe impl Sync for SharedFlag {}

impl SharedFlag {
    /// Map the shared region. Fresh anonymous mappings are zeroed, so the
    /// flag starts out `false`.
    pub fn new() -> nix::Result<Self> {
        let len = std::mem::size_of::<AtomicBool>();
        let length = NonZeroUsize::new(len).ok_or(nix::errno::Errno::EINVAL)?;
        // SAFETY: a new anonymous mapping aliases no existing Rust memory.
        let ptr = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }?;
        Ok(Self { ptr, len })
    }

    fn flag(&self) -> &AtomicBool {
        // SAFETY: the mapping is page aligned, at least one byte long, zero
        // initialized, and lives as long as `self`.
        unsafe { &*self.ptr.as_ptr().cast::<AtomicBool>() }
    }
}

impl Handshake for SharedFlag {
    fn reset(&self) {
        self.flag().store(false, Ordering::Release);
    }

    fn mark_finished(&self) {
        self.flag().store(true, Ordering::Release);
    }

    fn is_finished(&self) -> bool {
        self.flag().load(Ordering::Acquire)
    }
}

impl Drop for SharedFlag {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` come from the mmap in `new` and are unmapped once.
        let _ = unsafe { munmap(self.ptr, self.len) };
    }
}

impl std::fmt::Debug for SharedFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFlag")
            .field("finished", &self.is_finished())
            .finish()
    }
}
