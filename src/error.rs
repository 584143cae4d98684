//! Process exit states and configuration errors.

use std::fmt;

/// Terminal state of a server process, returned by
/// [`Server::run_and_fork`](crate::server::Server::run_and_fork).
///
/// Every process in the tree (boss, manager, worker) eventually returns one of
/// these. Only [`ServerState::Success`] maps to exit code 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Success,
    PrepareProcessError,
    InitUnforkableResourcesError,
    StartServiceError,
    StopServiceError,
    CleanupUnforkableResourcesError,
    FinalizeProcessError,
    /// The FastCGI layer failed (bind, accept, or the accept loop ended
    /// without an exit request).
    ProtocolError,
    /// The shared handshake region could not be mapped.
    MemoryError,
    UnknownError,
}

impl ServerState {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// Process exit code for this state.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::PrepareProcessError => 1,
            Self::InitUnforkableResourcesError => 2,
            Self::StartServiceError => 3,
            Self::StopServiceError => 4,
            Self::CleanupUnforkableResourcesError => 5,
            Self::FinalizeProcessError => 6,
            Self::ProtocolError => 7,
            Self::MemoryError => 8,
            Self::UnknownError => 9,
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::PrepareProcessError => "prepare_process hook failed",
            Self::InitUnforkableResourcesError => "init_unforkable_resources hook failed",
            Self::StartServiceError => "start_service hook failed",
            Self::StopServiceError => "stop_service hook failed",
            Self::CleanupUnforkableResourcesError => "cleanup_unforkable_resources hook failed",
            Self::FinalizeProcessError => "finalize_process hook failed",
            Self::ProtocolError => "FastCGI protocol error",
            Self::MemoryError => "shared memory allocation failed",
            Self::UnknownError => "unknown error",
        };
        f.write_str(s)
    }
}

/// Errors raised while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    Read(String, std::io::Error),
    /// The file is not valid YAML for [`Config`](crate::config::Config).
    Parse(String, serde_yaml::Error),
    /// The file parsed but a value is out of range.
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read(path, e) => write!(f, "Failed to read config file {path}: {e}"),
            ConfigError::Parse(path, e) => write!(f, "Failed to parse config file {path}: {e}"),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read(_, e) => Some(e),
            ConfigError::Parse(_, e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}
