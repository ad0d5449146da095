//! Thin wrappers over the libc calls the dispatch engine needs.

use crate::error::{DispatchError, DispatchResult};
use std::ffi::CStr;
use std::io;
use std::os::raw::c_char;
use std::os::unix::io::RawFd;

/// Result of a `fork(2)` call, seen from the calling side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fork {
    Parent(libc::pid_t),
    Child,
}

/// Forks the current process.
///
/// # Safety
/// Only the calling thread survives in the child. The child must not touch
/// locks other threads may have held at fork time (tracing, std's stdio)
/// and must end with [`exit_now`] or a successful `execv`.
pub(crate) unsafe fn fork() -> DispatchResult<Fork> {
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        Err(DispatchError::last_syscall("fork"))
    } else if pid == 0 {
        Ok(Fork::Child)
    } else {
        Ok(Fork::Parent(pid))
    }
}

/// Duplicates `fd` onto `target_fd`, replacing whatever was open there.
pub(crate) fn redirect(fd: RawFd, target_fd: RawFd) -> DispatchResult<()> {
    if unsafe { libc::dup2(fd, target_fd) } < 0 {
        return Err(DispatchError::last_syscall("dup2"));
    }
    Ok(())
}

/// Lets `fd` survive `execve`.
///
/// Rust opens every socket with `FD_CLOEXEC`; the handler needs to inherit
/// this one. Only calls `fcntl`, so it is safe between fork and exec.
pub(crate) fn clear_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Replaces the process image. Only returns on failure.
///
/// `argv` must be null-terminated and point into live `CString`s.
pub(crate) fn execv(path: &CStr, argv: &[*const c_char]) -> io::Error {
    debug_assert!(argv.last().is_some_and(|p| p.is_null()));
    unsafe { libc::execv(path.as_ptr(), argv.as_ptr()) };
    io::Error::last_os_error()
}

/// Restores the default `SIGPIPE` action, which the Rust runtime ignores
/// and `execv` would otherwise pass on to the handler.
pub(crate) fn reset_sigpipe() {
    unsafe { libc::signal(libc::SIGPIPE, libc::SIG_DFL) };
}

/// Terminates the process without running destructors or atexit hooks.
pub(crate) fn exit_now(code: i32) -> ! {
    unsafe { libc::_exit(code) }
}

/// Writes straight to fd 2, bypassing every lock in std and tracing.
pub(crate) fn write_stderr(msg: &str) {
    let bytes = msg.as_bytes();
    let mut written = 0;
    while written < bytes.len() {
        let rest = &bytes[written..];
        let n = unsafe { libc::write(libc::STDERR_FILENO, rest.as_ptr().cast(), rest.len()) };
        if n <= 0 {
            break;
        }
        written += n as usize;
    }
}

/// How a reaped child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExitKind {
    /// Exited normally with this code.
    Code(i32),
    /// Killed by this signal.
    Signal(i32),
    /// Any other `waitpid` status word.
    Other(i32),
}

impl ExitKind {
    pub(crate) fn from_status(status: libc::c_int) -> Self {
        if libc::WIFEXITED(status) {
            ExitKind::Code(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            ExitKind::Signal(libc::WTERMSIG(status))
        } else {
            ExitKind::Other(status)
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitKind::Code(0))
    }
}

/// One non-blocking `waitpid(-1)` step.
///
/// `Ok(None)` means no exited child is waiting (or no children exist).
pub(crate) fn try_wait_any() -> io::Result<Option<(libc::pid_t, ExitKind)>> {
    let mut status: libc::c_int = 0;
    let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
    if pid > 0 {
        return Ok(Some((pid, ExitKind::from_status(status))));
    }
    if pid == 0 {
        return Ok(None);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ECHILD) => Ok(None),
        _ => Err(err),
    }
}
