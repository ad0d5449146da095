//! Reclaims children spawned by fork dispatch.
//!
//! A dedicated thread waits for `SIGCHLD` through signal-hook and drains
//! every exited child with non-blocking `waitpid` calls. The accept loop
//! never waits on children. `errno` is per-thread and signal-hook's own
//! handler restores it, so the interrupted accept loop keeps its error
//! state.

use std::io;
use std::thread::{self, JoinHandle};

use signal_hook::consts::signal::SIGCHLD;
use signal_hook::iterator::{Handle, Signals};
use tracing::{info, warn};

use crate::error::{DispatchError, DispatchResult};
use crate::sys::unix::{self, ExitKind};

const REAPER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::reaper");

/// An exited child observed by the reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub pid: i32,
    pub status: ExitKind,
}

/// Collects every child that has exited so far. Never blocks.
pub fn reap_exited() -> io::Result<Vec<ChildExit>> {
    let mut reaped = Vec::new();
    while let Some((pid, status)) = unix::try_wait_any()? {
        match status {
            ExitKind::Code(code) => {
                info!(target: REAPER_TARGET, pid, code, "child exited");
            }
            ExitKind::Signal(signal) => {
                info!(target: REAPER_TARGET, pid, signal, "child killed by signal");
            }
            ExitKind::Other(raw) => {
                info!(target: REAPER_TARGET, pid, status = raw, "child exited");
            }
        }
        reaped.push(ChildExit { pid, status });
    }
    Ok(reaped)
}

/// Background reaper thread.
pub struct Reaper {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl Reaper {
    /// Installs the `SIGCHLD` listener and starts the reaper thread.
    pub fn spawn() -> DispatchResult<Self> {
        let mut signals = Signals::new([SIGCHLD]).map_err(DispatchError::Signals)?;
        let handle = signals.handle();

        let thread = thread::Builder::new()
            .name("reaper".to_owned())
            .spawn(move || {
                // Children may have exited before the handler was installed.
                drain();
                for _ in signals.forever() {
                    drain();
                }
            })?;

        Ok(Reaper { handle, thread: Some(thread) })
    }

    /// Stops the thread after a final drain.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(target: REAPER_TARGET, "reaper thread panicked");
            }
            drain();
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn drain() {
    if let Err(error) = reap_exited() {
        warn!(target: REAPER_TARGET, %error, "waitpid failed");
    }
}
