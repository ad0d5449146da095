//! # ivrd
//!
//! **ivrd** is a connection-dispatch daemon. It listens on one TCP endpoint
//! and hands every accepted connection to an external handler program,
//! passing the connected socket as an inherited file descriptor.
//!
//! Two dispatch strategies are available: fork a process per connection
//! (the handler replaces the child's image, optionally with its stdio
//! hotwired to the socket) or run a thread per connection that spawns the
//! handler and waits for it. An optional event-socket `connect` handshake
//! can run before the handler takes over.
//!
//! Unix only.

#[cfg(not(unix))]
compile_error!("ivrd relies on fork(2), execv(3) and SIGCHLD and only builds on Unix");

pub mod cli;
mod daemon;
pub mod dispatch;
mod error;
pub mod handshake;
pub mod invoker;
pub mod listener;
mod options;
pub mod reaper;
mod stdio;
mod sys;
pub mod telemetry;
mod types;

// Re-export public types to keep the API flat
pub use daemon::run;
pub use error::{DispatchError, DispatchResult};
pub use options::{DispatchOptions, DispatchOptionsBuilder};
pub use stdio::Stdio;
pub use sys::unix::ExitKind;
pub use types::{Concurrency, ConnectionContext};
