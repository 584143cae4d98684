#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # forkserve
//!
//! Pre-fork FastCGI server with zero-downtime reload.
//!
//! The boss process forks a manager, the manager forks `worker_count`
//! workers, and every worker accepts FastCGI connections on the shared
//! listening socket. `SIGUSR1` to the boss starts a new generation with a
//! freshly loaded config; the old generation is stopped only after the new
//! one reports that all its workers are up.
//!
//! ## Subcommands
//!
//! - `forkserve serve` (default): run the echo service
//! - `forkserve reload`: send `SIGUSR1` to the boss named in the pid file
//! - `forkserve status`: print the outcome of the last reload
//!
//! ## Status file codes
//!
//! | Code | Meaning   |
//! |------|-----------|
//! | 0    | none      |
//! | 1    | reloading |
//! | 2    | succeeded |
//! | 3    | failed    |

use std::path::Path;

use clap::{Parser, Subcommand};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{error, info, warn};

use forkserve::config::Config;
use forkserve::reload::read_status;
use forkserve::{logging, ListenAddr, Request, Server, Service, ServiceIo};

/// Pre-fork FastCGI server with live reload.
#[derive(Parser)]
#[command(name = "forkserve", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the echo service (default when no subcommand given).
    Serve {
        /// Path to YAML config file.
        #[arg(long)]
        config: Option<String>,
        /// Listen address: host:port, unix:PATH or fd:N.
        #[arg(long)]
        listen: Option<ListenAddr>,
    },
    /// Ask a running boss to start a new generation.
    Reload {
        /// Path to YAML config file.
        #[arg(long)]
        config: Option<String>,
        /// Pid file written by the boss (defaults to `server.pid_file`).
        #[arg(long)]
        pid_file: Option<String>,
    },
    /// Print the last reload status.
    Status {
        /// Path to YAML config file.
        #[arg(long)]
        config: Option<String>,
        /// Status file written by the boss (defaults to `server.status_file`).
        #[arg(long)]
        status_file: Option<String>,
    },
}

/// Echoes the request method, query string, query parameters and POST body.
struct Echo;

impl Service for Echo {
    fn query(&mut self, io: &mut dyn ServiceIo, request: &Request) {
        io.add_header_field("Content-type: text/plain; charset=utf-8");
        io.end_header_field();
        io.print(format_args!(
            "Request-Method: {}\n",
            request.request_method().unwrap_or("")
        ));
        io.print(format_args!("Query String: {}\n", request.query_string()));
        for (name, value) in request.parameters() {
            io.print(format_args!("{name}: {value}\n"));
        }
        if request.is_post() {
            let mut buf = [0u8; 4096];
            loop {
                let n = io.read(&mut buf);
                if n == 0 {
                    break;
                }
                io.write(&buf[..n]);
            }
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        Some(Commands::Serve { config, listen }) => run_server(config, listen),
        Some(Commands::Reload { config, pid_file }) => send_reload(config.as_deref(), pid_file),
        Some(Commands::Status {
            config,
            status_file,
        }) => print_status(config.as_deref(), status_file),
        None => run_server(None, None),
    };
    std::process::exit(code);
}

/// Load config and initialize tracing from it.
fn load_config(path: Option<&str>) -> Config {
    match Config::load(path) {
        Ok(config) => {
            logging::init(&config.logging.level);
            config
        }
        Err(e) => {
            let config = Config::default();
            logging::init(&config.logging.level);
            warn!("{e}; using defaults");
            config
        }
    }
}

fn run_server(config_path: Option<String>, listen: Option<ListenAddr>) -> i32 {
    let config = load_config(config_path.as_deref());
    info!("forkserve v{} starting", env!("CARGO_PKG_VERSION"));
    info!(workers = config.server.worker_count, "pre-forking");

    let mut server = Server::new(Echo).config_path(config_path);
    if let Some(addr) = listen {
        server = server.listen(addr);
    }
    let state = server.run_and_fork();
    if !state.is_success() {
        error!("exiting: {state}");
    }
    state.exit_code()
}

fn send_reload(config_path: Option<&str>, pid_file: Option<String>) -> i32 {
    let config = load_config(config_path);
    let Some(path) = pid_file.or(config.server.pid_file) else {
        error!("no pid file: pass --pid-file or set server.pid_file");
        return 1;
    };
    let pid = match std::fs::read_to_string(&path) {
        Ok(content) => match content.trim().parse::<i32>() {
            Ok(pid) if pid > 0 => pid,
            _ => {
                error!("{path} does not contain a pid");
                return 1;
            }
        },
        Err(e) => {
            error!("cannot read {path}: {e}");
            return 1;
        }
    };
    match kill(Pid::from_raw(pid), Signal::SIGUSR1) {
        Ok(()) => {
            info!(pid, "reload requested");
            0
        }
        Err(e) => {
            error!(pid, "failed to signal boss: {e}");
            1
        }
    }
}

fn print_status(config_path: Option<&str>, status_file: Option<String>) -> i32 {
    let config = load_config(config_path);
    let Some(path) = status_file.or(config.server.status_file) else {
        error!("no status file: pass --status-file or set server.status_file");
        return 1;
    };
    match read_status(Path::new(&path)) {
        Ok(status) => {
            println!("{status}");
            0
        }
        Err(e) => {
            error!("cannot read {path}: {e}");
            1
        }
    }
}
