//! Signal handlers that turn asynchronous signals into poll-observable flags.
//!
//! Handlers only store to process-wide atomics. All shutdown and reload work
//! happens later in whichever loop owns the process (boss, manager, worker),
//! which reads the flags through the [`Flags`] trait. Tests substitute
//! [`ManualFlags`] so supervision logic never depends on real signal delivery.
//!
//! | Signal          | Boss / Manager        | Worker                              |
//! |-----------------|-----------------------|-------------------------------------|
//! | `SIGINT/SIGTERM`| exit flag             | exit flag + FastCGI shutdown pending |
//! | `SIGUSR1`       | reload flag (boss)    | ignored                             |
//! | `SIGRTMIN+1..8` | log level request     | log level request                   |
//!
//! Handlers are installed with `sigaction` and without `SA_RESETHAND`, so they
//! stay armed after delivery. `SA_RESTART` is not set: a worker blocked in
//! `accept` must see `EINTR` to notice the exit flag.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

static EXIT_REQUESTED: AtomicBool = AtomicBool::new(false);
static RELOAD_REQUESTED: AtomicBool = AtomicBool::new(false);
static SHUTDOWN_PENDING: AtomicBool = AtomicBool::new(false);
/// Offset from `SIGRTMIN` of the last log level signal; 0 when none.
static LOG_LEVEL_REQUEST: AtomicI32 = AtomicI32::new(0);

/// Log level signals are `SIGRTMIN + 1` through `SIGRTMIN + LOG_LEVEL_SIGNALS`.
pub const LOG_LEVEL_SIGNALS: i32 = 8;

/// Read side of the exit/reload flags.
///
/// Flags are polled, never blocked on.
pub trait Flags: Send + Sync {
    fn exit_requested(&self) -> bool;
    fn request_exit(&self);
    fn reload_requested(&self) -> bool;
    fn clear_reload(&self);

    /// Whether a worker should stop taking new requests on its current
    /// connection.
    fn shutdown_pending(&self) -> bool {
        self.exit_requested()
    }

    /// Take the pending log level request, as an offset from `SIGRTMIN`.
    fn take_log_level_request(&self) -> Option<i32> {
        None
    }
}

/// The real, signal-driven flags of this process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessFlags;

impl Flags for ProcessFlags {
    fn exit_requested(&self) -> bool {
        EXIT_REQUESTED.load(Ordering::SeqCst)
    }

    fn request_exit(&self) {
        EXIT_REQUESTED.store(true, Ordering::SeqCst);
    }

    fn reload_requested(&self) -> bool {
        RELOAD_REQUESTED.load(Ordering::SeqCst)
    }

    fn clear_reload(&self) {
        RELOAD_REQUESTED.store(false, Ordering::SeqCst);
    }

    /// Only set by the worker exit handler.
    fn shutdown_pending(&self) -> bool {
        SHUTDOWN_PENDING.load(Ordering::SeqCst)
    }

    fn take_log_level_request(&self) -> Option<i32> {
        match LOG_LEVEL_REQUEST.swap(0, Ordering::SeqCst) {
            0 => None,
            offset => Some(offset),
        }
    }
}

/// Flags driven by hand, for tests and embedders that supervise in-process.
#[derive(Debug, Default)]
pub struct ManualFlags {
    exit: AtomicBool,
    reload: AtomicBool,
    log_level: AtomicI32,
}

impl ManualFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_reload(&self) {
        self.reload.store(true, Ordering::SeqCst);
    }

    /// Act as if `SIGRTMIN + offset` had been delivered.
    pub fn request_log_level(&self, offset: i32) {
        self.log_level.store(offset, Ordering::SeqCst);
    }
}

impl Flags for ManualFlags {
    fn exit_requested(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }

    fn request_exit(&self) {
        self.exit.store(true, Ordering::SeqCst);
    }

    fn reload_requested(&self) -> bool {
        self.reload.load(Ordering::SeqCst)
    }

    fn clear_reload(&self) {
        self.reload.store(false, Ordering::SeqCst);
    }

    fn take_log_level_request(&self) -> Option<i32> {
        match self.log_level.swap(0, Ordering::SeqCst) {
            0 => None,
            offset => Some(offset),
        }
    }
}

extern "C" fn handle_exit(_sig: libc::c_int) {
    EXIT_REQUESTED.store(true, Ordering::SeqCst);
}

extern "C" fn handle_worker_exit(_sig: libc::c_int) {
    EXIT_REQUESTED.store(true, Ordering::SeqCst);
    SHUTDOWN_PENDING.store(true, Ordering::SeqCst);
}

extern "C" fn handle_reload(_sig: libc::c_int) {
    RELOAD_REQUESTED.store(true, Ordering::SeqCst);
}

#[cfg(any(target_os = "linux", target_os = "android"))]
extern "C" fn handle_log_level(sig: libc::c_int) {
    LOG_LEVEL_REQUEST.store(sig - libc::SIGRTMIN(), Ordering::SeqCst);
}

fn install(sig: Signal, handler: SigHandler) -> nix::Result<()> {
    let action = SigAction::new(handler, SaFlags::empty(), SigSet::empty());
    // SAFETY: every handler passed here only performs atomic stores, which
    // are async-signal-safe.
    unsafe { signal::sigaction(sig, &action) }.map(|_| ())
}

/// Install the boss/manager exit handler on `SIGINT` and `SIGTERM`.
pub fn install_exit_handler() -> nix::Result<()> {
    install(Signal::SIGINT, SigHandler::Handler(handle_exit))?;
    install(Signal::SIGTERM, SigHandler::Handler(handle_exit))
}

/// Install the worker exit handler on `SIGINT` and `SIGTERM`.
///
/// Besides the exit flag it marks FastCGI shutdown as pending so the accept
/// loop stops cooperatively instead of the process calling `exit()`.
pub fn install_worker_exit_handler() -> nix::Result<()> {
    install(Signal::SIGINT, SigHandler::Handler(handle_worker_exit))?;
    install(Signal::SIGTERM, SigHandler::Handler(handle_worker_exit))
}

/// Install the boss-only reload handler on `SIGUSR1`.
pub fn install_reload_handler() -> nix::Result<()> {
    install(Signal::SIGUSR1, SigHandler::Handler(handle_reload))
}

/// Install the log level handler on `SIGRTMIN+1` through `SIGRTMIN+8`.
///
/// Realtime signals are not part of [`Signal`], so this goes through
/// `libc::sigaction` directly.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn install_log_level_handler() -> nix::Result<()> {
    for offset in 1..=LOG_LEVEL_SIGNALS {
        // SAFETY: an all-zero sigaction is a valid value (no flags, empty
        // mask) that is filled in before use.
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = handle_log_level as extern "C" fn(libc::c_int) as libc::sighandler_t;
        // SAFETY: the handler only performs an atomic store; `action` and
        // its mask are valid for the duration of both calls.
        let rc = unsafe {
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(libc::SIGRTMIN() + offset, &action, std::ptr::null_mut())
        };
        nix::errno::Errno::result(rc)?;
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn install_log_level_handler() -> nix::Result<()> {
    Ok(())
}

/// Drop the inherited reload handler in a freshly forked manager.
///
/// `SIGUSR1` is ignored rather than reset to its default action, which would
/// terminate the process.
pub fn disable_reload_handler() -> nix::Result<()> {
    install(Signal::SIGUSR1, SigHandler::SigIgn)
}
