use std::sync::Arc;

use tracing::{info, warn};

use crate::handshake::Attach;
use crate::invoker::{HandlerArgs, HandlerInvoker, ReplaceImage};
use crate::stdio::Stdio;
use crate::sys::unix::{self, Fork};
use crate::types::ConnectionContext;

use super::{DISPATCH_TARGET, DispatchStrategy};

/// One forked process per connection.
///
/// The parent closes its copy of the socket right after `fork` and goes
/// back to accepting. The child optionally hotwires its stdio, then
/// replaces itself with the handler and never returns.
pub struct ForkDispatch {
    invoker: HandlerInvoker<ReplaceImage>,
}

impl ForkDispatch {
    pub fn new(attach: Option<Arc<dyn Attach>>) -> Self {
        ForkDispatch {
            invoker: HandlerInvoker::new(attach, ReplaceImage),
        }
    }
}

impl DispatchStrategy for ForkDispatch {
    fn dispatch(&self, conn: ConnectionContext) {
        let peer = conn.peer();
        let args = match HandlerArgs::for_connection(&conn) {
            Ok(args) => args,
            Err(error) => {
                warn!(target: DISPATCH_TARGET, %peer, %error, "connection dropped");
                return;
            }
        };

        // The child runs dup2, the optional handshake and execv, then exits.
        // The handshake and error reporting allocate, which the libc
        // allocator supports after fork. Tracing and std's stdio locks are
        // never touched.
        match unsafe { unix::fork() } {
            Err(error) => {
                warn!(target: DISPATCH_TARGET, %peer, %error, "fork failed, dropping connection");
                drop(conn);
            }
            Ok(Fork::Parent(pid)) => {
                info!(target: DISPATCH_TARGET, %peer, pid, "forked connection handler");
                drop(conn);
            }
            Ok(Fork::Child) => run_child(&self.invoker, conn, &args),
        }
    }
}

/// Body of the forked child. Reports through raw stderr writes: the
/// tracing subscriber's locks may have been held by another thread when
/// the process forked.
fn run_child(invoker: &HandlerInvoker<ReplaceImage>, conn: ConnectionContext, args: &HandlerArgs) -> ! {
    // Silences handshake logging for the rest of the child's life.
    let _quiet = tracing::dispatcher::set_default(&tracing::Dispatch::none());
    let stdio = Stdio::for_connection(conn.options().hotwire(), conn.socket_fd());
    if let Err(error) = stdio.apply() {
        unix::write_stderr(&format!(
            "Failed to hotwire client socket to STDIN/STDOUT: {error}\n"
        ));
        unix::exit_now(1);
    }

    match invoker.invoke_with(conn, args) {
        Ok(_) => unix::exit_now(0),
        Err(error) => {
            unix::write_stderr(&format!("{error}\n"));
            unix::exit_now(1)
        }
    }
}
