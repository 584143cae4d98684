//! tracing subscriber setup.
//!
//! Every process in the tree inherits the subscriber installed by the boss;
//! role spans (`boss`, `manager`, `worker`) carry the pid so interleaved
//! output on the shared stderr stays attributable.
//!
//! The level can be changed at runtime with `SIGRTMIN+1` (debug) through
//! `SIGRTMIN+8`. The signal handler only records the request; each process
//! applies it from its own poll loop, so a signal changes the level of the
//! process it was sent to. Use `kill -- -PGID` to change a whole tree.

use std::sync::OnceLock;

use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use crate::signals::Flags;

static FILTER: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

/// `RUST_LOG` wins over the configured level.
fn filter_directive(rust_log: Option<String>, level: &str) -> String {
    rust_log
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| level.to_string())
}

/// Install the global fmt subscriber writing to stderr.
///
/// An unparsable filter falls back to `info`. Calling this twice is a no-op.
pub fn init(level: &str) {
    FILTER.get_or_init(|| {
        let directive = filter_directive(std::env::var("RUST_LOG").ok(), level);
        let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));
        let (filter, handle) = reload::Layer::new(filter);
        // If another subscriber is already global, the handle stays detached
        // and `set_level` reports false.
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
        handle
    });
}

/// Level selected by `SIGRTMIN + offset`.
///
/// Offsets follow the syslog severities: debug, info, notice, warning, err,
/// crit, alert, emerg. tracing has no levels above error, so notice maps to
/// info and everything from err up maps to error.
pub fn level_for_signal(offset: i32) -> Option<LevelFilter> {
    match offset {
        1 => Some(LevelFilter::DEBUG),
        2 | 3 => Some(LevelFilter::INFO),
        4 => Some(LevelFilter::WARN),
        5..=8 => Some(LevelFilter::ERROR),
        _ => None,
    }
}

/// Replace the active filter. `false` when [`init`] has not installed the
/// subscriber.
pub fn set_level(level: LevelFilter) -> bool {
    FILTER
        .get()
        .is_some_and(|handle| handle.reload(EnvFilter::new(level.to_string())).is_ok())
}

/// Apply a pending log level signal, if any.
pub fn apply_requested_level(flags: &dyn Flags) {
    let Some(offset) = flags.take_log_level_request() else {
        return;
    };
    match level_for_signal(offset) {
        Some(level) => {
            if set_level(level) {
                info!(%level, "log level changed");
            }
        }
        None => warn!(offset, "ignoring unknown log level signal"),
    }
}
