#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

//! forkserve library: a pre-fork FastCGI server core.
//!
//! One binary, three roles decided at fork points:
//!
//! - **boss**: long-lived parent; owns live reload (`SIGUSR1`) and never
//!   serves requests
//! - **manager**: supervises one generation of workers; demotes itself to a
//!   worker when it cannot fork
//! - **worker**: accepts FastCGI connections and calls [`Service::query`]
//!
//! Modules:
//! - `server`: [`Server::run_and_fork`], the [`Service`] hooks, [`ServerHandle`]
//! - `reload`: boss-side generation handoff and status file
//! - `pool`: manager-side worker supervision and drains
//! - `registry` / `spawner`: worker slot table and single-slot fork
//! - `process`: fork/reap/kill behind the [`ProcessOps`] trait
//! - `signals`: async-signal-safe flag handlers
//! - `shm`: the cross-process handshake flag
//! - `fcgi`: listener, record codec, request and response I/O
//! - `config` / `logging` / `error`: YAML config, tracing setup, exit states

pub mod config;
pub mod error;
pub mod fcgi;
pub mod logging;
pub mod pool;
pub mod process;
pub mod registry;
pub mod reload;
pub mod server;
pub mod shm;
pub mod signals;
pub mod spawner;

#[cfg(test)]
mod testing;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::ServerState;
pub use fcgi::{BufferServiceIo, ListenAddr, Request, ServiceIo};
pub use process::ProcessOps;
pub use server::{HookResult, Server, ServerHandle, Service};
