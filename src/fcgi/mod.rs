//! FastCGI responder plumbing: listening socket, record codec and the
//! request/response surface given to a service.

pub mod record;
mod request;
mod responder;
mod service_io;

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::TcpListener;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::str::FromStr;

use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::socket::accept;
use tracing::{info, warn};

pub use request::{url_decode, Request, URL_MAX_LENGTH};
pub use responder::serve_connection;
pub use service_io::{BufferServiceIo, ResponseIo, ServiceIo};

/// Where the server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// `host:port`, resolved when the socket is opened.
    Tcp(String),
    /// `unix:/path/to/socket`
    Unix(PathBuf),
    /// `fd:N`, a socket inherited from the parent (e.g. a web server that
    /// spawned us with the listener on fd 0).
    Fd(RawFd),
}

impl FromStr for ListenAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err("unix socket path is empty".into());
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if let Some(fd) = s.strip_prefix("fd:") {
            return fd
                .parse::<RawFd>()
                .ok()
                .filter(|fd| *fd >= 0)
                .map(Self::Fd)
                .ok_or_else(|| format!("invalid file descriptor {fd:?}"));
        }
        let tcp = s
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
        if tcp {
            return Ok(Self::Tcp(s.to_string()));
        }
        Err(format!("expected host:port, unix:PATH or fd:N, got {s:?}"))
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => f.write_str(addr),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Fd(fd) => write!(f, "fd:{fd}"),
        }
    }
}

/// The listening socket shared by every worker of every generation.
#[derive(Debug)]
pub struct Listener {
    fd: OwnedFd,
    addr: ListenAddr,
}

impl Listener {
    pub fn open(addr: &ListenAddr) -> io::Result<Self> {
        let fd = match addr {
            ListenAddr::Tcp(host) => OwnedFd::from(TcpListener::bind(host.as_str())?),
            ListenAddr::Unix(path) => {
                if std::fs::symlink_metadata(path).is_ok_and(|m| m.file_type().is_socket()) {
                    warn!("removing stale socket {}", path.display());
                    std::fs::remove_file(path)?;
                }
                OwnedFd::from(UnixListener::bind(path)?)
            }
            ListenAddr::Fd(raw) => {
                fcntl(*raw, FcntlArg::F_GETFD)?;
                // SAFETY: the descriptor is open and handed to us by our
                // parent; nothing else in this process owns it.
                unsafe { OwnedFd::from_raw_fd(*raw) }
            }
        };
        info!("listening on {addr}");
        Ok(Self {
            fd,
            addr: addr.clone(),
        })
    }

    pub fn addr(&self) -> &ListenAddr {
        &self.addr
    }

    /// Block until a client connects.
    ///
    /// Unlike `std`, a signal interrupting the wait surfaces as
    /// [`io::ErrorKind::Interrupted`] so the caller can check its exit flag.
    pub fn accept(&self) -> io::Result<Connection> {
        let raw = accept(self.fd.as_raw_fd())?;
        // SAFETY: accept returned a fresh descriptor that nothing else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(Connection(File::from(fd)))
    }

    /// Remove the socket file of a Unix listener.
    pub fn cleanup(&self) {
        if let ListenAddr::Unix(path) = &self.addr {
            if let Err(e) = std::fs::remove_file(path) {
                warn!("failed to remove socket {}: {e}", path.display());
            }
        }
    }
}

/// One accepted connection.
///
/// Reads and writes are plain `read(2)`/`write(2)`; `EINTR` is returned to
/// the caller.
#[derive(Debug)]
pub struct Connection(File);

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
