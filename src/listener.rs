//! TCP accept loop.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::dispatch::DispatchStrategy;
use crate::error::{DispatchError, DispatchResult};
use crate::options::DispatchOptions;
use crate::types::ConnectionContext;

const LISTENER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::listener");

const ACCEPT_BACKOFF: Duration = Duration::from_millis(25);
const ERROR_BACKOFF: Duration = Duration::from_millis(150);

/// Listener bound to the daemon's single `host:port` endpoint.
#[derive(Debug)]
pub struct Listener {
    listener: TcpListener,
    addr: SocketAddr,
}

impl Listener {
    /// Resolves `host` and binds the first address it yields.
    pub fn bind(host: &str, port: u16) -> DispatchResult<Self> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|source| DispatchError::Resolve {
                host: host.to_owned(),
                port,
                source,
            })?
            .next()
            .ok_or_else(|| DispatchError::ResolveEmpty {
                host: host.to_owned(),
                port,
            })?;
        let listener =
            TcpListener::bind(addr).map_err(|source| DispatchError::Bind { addr, source })?;
        let addr = listener.local_addr()?;
        Ok(Listener { listener, addr })
    }

    /// Address actually bound; differs from the request when port 0 was asked for.
    pub fn local_addr(&self) -> SocketAddr { self.addr }

    /// Accepts connections until `shutdown` is raised, dispatching each one
    /// in acceptance order on the calling thread.
    pub fn serve(
        &self,
        options: Arc<DispatchOptions>,
        strategy: Arc<dyn DispatchStrategy>,
        shutdown: Arc<AtomicBool>,
    ) -> DispatchResult<()> {
        self.listener.set_nonblocking(true)?;
        info!(target: LISTENER_TARGET, addr = %self.addr, "accepting connections");

        let mut last_error = None::<io::ErrorKind>;
        while !shutdown.load(Ordering::SeqCst) {
            match self.accept() {
                Ok(Some((stream, peer))) => {
                    last_error = None;
                    debug!(target: LISTENER_TARGET, %peer, "connection accepted");
                    strategy.dispatch(ConnectionContext::new(stream, peer, Arc::clone(&options)));
                }
                Ok(None) => thread::sleep(ACCEPT_BACKOFF),
                Err(error) => {
                    let kind = error.kind();
                    if last_error != Some(kind) {
                        warn!(target: LISTENER_TARGET, %error, "accept error");
                    }
                    last_error = Some(kind);
                    thread::sleep(ERROR_BACKOFF);
                }
            }
        }

        info!(target: LISTENER_TARGET, addr = %self.addr, "listener stopped");
        Ok(())
    }

    fn accept(&self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                Ok(Some((stream, peer)))
            }
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }
}
