//! Connection dispatch strategies.
//!
//! The listener hands every accepted connection to exactly one
//! [`DispatchStrategy`]. [`ForkDispatch`] gives each connection its own
//! process; [`ThreadDispatch`] gives it a thread inside the daemon.

mod fork;
mod thread;

use std::sync::Arc;

use crate::handshake::{Attach, EslAttach};
use crate::options::DispatchOptions;
use crate::types::{Concurrency, ConnectionContext};

pub use self::fork::ForkDispatch;
pub use self::thread::{ThreadBudget, ThreadDispatch};

const DISPATCH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::dispatch");

/// Policy for giving an accepted connection its own execution context.
///
/// Implementations must never block on the handler and must never let a
/// per-connection failure escape back into the accept loop.
pub trait DispatchStrategy: Send + Sync {
    fn dispatch(&self, conn: ConnectionContext);
}

/// Builds the strategy selected by `options`.
pub fn strategy_for(options: &DispatchOptions) -> Arc<dyn DispatchStrategy> {
    let attach = attach_for(options);
    match options.concurrency() {
        Concurrency::Fork => Arc::new(ForkDispatch::new(attach)),
        Concurrency::Thread => Arc::new(ThreadDispatch::new(attach, options.max_threads())),
    }
}

fn attach_for(options: &DispatchOptions) -> Option<Arc<dyn Attach>> {
    options
        .connect()
        .then(|| Arc::new(EslAttach::new(options.handshake_timeout())) as Arc<dyn Attach>)
}
