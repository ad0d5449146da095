use std::os::unix::io::RawFd;

use crate::error::DispatchResult;
use crate::sys::unix;

/// What a forked handler sees on its standard input and output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stdio {
    /// Keeps the daemon's streams. Default option.
    Keep,
    /// Plugs both streams into the client socket ("hotwire").
    Socket(RawFd),
}

impl Stdio {
    /// Picks the stdio plan for a connection.
    pub fn for_connection(hotwire: bool, socket: RawFd) -> Self {
        if hotwire { Stdio::Socket(socket) } else { Stdio::Keep }
    }

    /// Applies the plan to the current process.
    ///
    /// Meant for a freshly forked child: it only calls `dup2`.
    pub(crate) fn apply(&self) -> DispatchResult<()> {
        match *self {
            Stdio::Socket(fd) => {
                unix::redirect(fd, libc::STDIN_FILENO)?;
                unix::redirect(fd, libc::STDOUT_FILENO)?;
            }
            Stdio::Keep => {}
        }
        Ok(())
    }
}
