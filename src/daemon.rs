use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::flag;
use tracing::{info, warn};

use crate::dispatch::strategy_for;
use crate::error::{DispatchError, DispatchResult};
use crate::listener::Listener;
use crate::options::DispatchOptions;
use crate::reaper::Reaper;
use crate::types::Concurrency;

#[cfg(target_os = "linux")]
use sd_notify::NotifyState;

const DAEMON_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::daemon");

/// Runs the daemon in the foreground until `SIGTERM` or `SIGINT`.
///
/// Binds the endpoint, tells systemd it is ready when started as a
/// `Type=notify` service, reaps forked children in the background and
/// serves connections on the calling thread.
pub fn run(options: DispatchOptions) -> DispatchResult<()> {
    let options = Arc::new(options);
    info!(
        target: DAEMON_TARGET,
        "Starting {} listener on {}.",
        options.concurrency(),
        options.endpoint()
    );

    let listener = Listener::bind(options.hostname(), options.port())?;

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [SIGTERM, SIGINT] {
        flag::register(signal, Arc::clone(&shutdown)).map_err(DispatchError::Signals)?;
    }

    let reaper = match options.concurrency() {
        Concurrency::Fork => Some(Reaper::spawn()?),
        Concurrency::Thread => None,
    };

    notify(Readiness::Ready);
    let strategy = strategy_for(&options);
    let result = listener.serve(Arc::clone(&options), strategy, shutdown);
    notify(Readiness::Stopping);

    if let Some(reaper) = reaper {
        reaper.shutdown();
    }
    info!(target: DAEMON_TARGET, "daemon stopped");
    result
}

enum Readiness {
    Ready,
    Stopping,
}

/// Reports state to systemd when `NOTIFY_SOCKET` is set; otherwise a no-op.
fn notify(state: Readiness) {
    #[cfg(target_os = "linux")]
    {
        if std::env::var_os("NOTIFY_SOCKET").is_none() {
            return;
        }
        let state = match state {
            Readiness::Ready => NotifyState::Ready,
            Readiness::Stopping => NotifyState::Stopping,
        };
        // Leave the variable set: it is needed again for STOPPING=1.
        if let Err(error) = sd_notify::notify(false, &[state]) {
            warn!(target: DAEMON_TARGET, %error, "systemd notification failed");
        }
    }

    #[cfg(not(target_os = "linux"))]
    let _ = state;
}
