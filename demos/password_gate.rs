//! Threaded listener guarded by a custom attach step.
//!
//! Every client is asked for a password before the handler gets the
//! socket. Try it with:
//!
//! ```text
//! cargo run --example password_gate -- demos/echo.sh
//! nc 127.0.0.1 8085
//! ```

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use ivrd::DispatchOptions;
use ivrd::dispatch::{DispatchStrategy, ThreadDispatch};
use ivrd::handshake::{Attach, HandshakeError, Session};
use ivrd::listener::Listener;
use ivrd::telemetry::{self, LogFormat};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::flag;

const MAX_LINE: usize = 256;

/// Accepts the connection once the peer sends the expected line.
struct PasswordAttach {
    password: String,
}

impl Attach for PasswordAttach {
    fn attach(&self, stream: &TcpStream, peer: SocketAddr) -> Result<Session, HandshakeError> {
        let mut conn = stream.try_clone()?;
        conn.write_all(b"password: ")?;

        // Byte by byte, so whatever follows the line stays for the handler.
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            if conn.read(&mut byte)? == 0 {
                return Err(HandshakeError::Closed);
            }
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
            if line.len() > MAX_LINE {
                return Err(HandshakeError::TooLarge);
            }
        }

        if String::from_utf8_lossy(&line).trim() != self.password {
            return Err(HandshakeError::UnexpectedReply("wrong password".to_owned()));
        }
        Ok(Session::new(conn, vec![("Peer".to_owned(), peer.to_string())]))
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::initialise(LogFormat::Compact)?;

    // 1. Handler program and options
    let script = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("demos/echo.sh"));
    let options = Arc::new(
        DispatchOptions::new(script)
            .port(8085)
            .threaded(true)
            .max_threads(16)
            .build()?,
    );

    // 2. Stop cleanly on SIGTERM / SIGINT
    let shutdown = Arc::new(AtomicBool::new(false));
    flag::register(SIGTERM, Arc::clone(&shutdown))?;
    flag::register(SIGINT, Arc::clone(&shutdown))?;

    // 3. Custom attach step in front of thread dispatch
    let attach: Arc<dyn Attach> = Arc::new(PasswordAttach { password: "open sesame".to_owned() });
    let strategy: Arc<dyn DispatchStrategy> =
        Arc::new(ThreadDispatch::new(Some(attach), options.max_threads()));

    let listener = Listener::bind(options.hostname(), options.port())?;
    println!("Listening on {}, password \"open sesame\"", listener.local_addr());
    listener.serve(options, strategy, shutdown)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn attach_with(input: &'static [u8]) -> Result<Session, HandshakeError> {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).expect("connect");
            stream.write_all(input).expect("send");
            stream
        });
        let (stream, peer) = listener.accept().expect("accept");
        let gate = PasswordAttach { password: "open sesame".to_owned() };
        let result = gate.attach(&stream, peer);
        drop(client.join().expect("client thread"));
        result
    }

    #[test]
    fn right_password_opens_a_session() {
        let session = attach_with(b"open sesame\n").expect("accepted");
        assert!(session.header("peer").is_some());
    }

    #[test]
    fn wrong_password_is_refused() {
        let err = attach_with(b"guess\n").expect_err("refused");
        assert!(matches!(err, HandshakeError::UnexpectedReply(_)));
    }
}
