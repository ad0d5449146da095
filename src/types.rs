use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use crate::options::DispatchOptions;

/// How each accepted connection gets its own execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    /// One forked OS process per connection.
    Fork,
    /// One thread per connection inside the daemon.
    Thread,
}

impl fmt::Display for Concurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Concurrency::Fork => f.write_str("forking"),
            Concurrency::Thread => f.write_str("threaded"),
        }
    }
}

/// Everything a dispatch strategy needs to handle one accepted connection.
///
/// The context owns the client socket. Dropping it closes the daemon's
/// copy of the descriptor.
#[derive(Debug)]
pub struct ConnectionContext {
    pub(crate) stream: TcpStream,
    pub(crate) peer: SocketAddr,
    pub(crate) options: Arc<DispatchOptions>,
}

impl ConnectionContext {
    pub fn new(stream: TcpStream, peer: SocketAddr, options: Arc<DispatchOptions>) -> Self {
        ConnectionContext { stream, peer, options }
    }

    pub fn peer(&self) -> SocketAddr { self.peer }

    pub fn options(&self) -> &DispatchOptions { &self.options }

    pub fn stream(&self) -> &TcpStream { &self.stream }

    /// Raw descriptor of the client socket, as handed to the handler.
    pub fn socket_fd(&self) -> RawFd { self.stream.as_raw_fd() }
}
