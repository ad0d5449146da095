use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Error type for the dispatch daemon.
///
/// Configuration variants are fatal at start-up. Everything raised while
/// handling a single connection stays local to that connection.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Standard IO errors (socket options, descriptor duplication, etc.)
    #[error("IO Error: {0}")]
    Io(#[from] io::Error),

    /// Two options were requested that cannot be honoured together.
    #[error("Cannot use --{first} and --{second} at the same time")]
    IncompatibleOptions {
        first: &'static str,
        second: &'static str,
    },

    /// No handler program was supplied.
    #[error("The script path is missing")]
    MissingScript,

    /// A handler path or argument cannot be passed to `execv`.
    #[error("Invalid handler argument {0:?}: contains an interior NUL byte")]
    InvalidArgument(String),

    /// The thread ceiling must allow at least one worker.
    #[error("The maximum thread count must be at least 1")]
    InvalidThreadLimit,

    #[error("Failed to resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("No addresses resolved for {host}:{port}")]
    ResolveEmpty { host: String, port: u16 },

    #[error("Failed to bind listener at {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Installing signal handlers failed.
    #[error("Failed to install signal handlers: {0}")]
    Signals(#[source] io::Error),

    /// The peer did not complete the attach handshake.
    #[error("Handshake with {peer} failed: {source}")]
    Handshake {
        peer: SocketAddr,
        #[source]
        source: crate::handshake::HandshakeError,
    },

    /// `execv` returned, so the handler never started.
    #[error("execv() of {} failed: {source}", .path.display())]
    Exec {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The handler subprocess could not be started.
    #[error("Failed to spawn {}: {source}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// (Unix) Specific system call failure (fork, dup2, fcntl).
    #[error("Syscall '{call}' failed with errno {errno}")]
    Syscall { call: &'static str, errno: i32 },
}

impl DispatchError {
    /// Captures `errno` for a failed system call.
    pub(crate) fn last_syscall(call: &'static str) -> Self {
        DispatchError::Syscall {
            call,
            errno: io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }
}

/// A specialized Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;
