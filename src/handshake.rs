//! Attach handshake performed on the daemon's behalf before dispatch.
//!
//! The bundled [`EslAttach`] speaks the outbound side of the FreeSWITCH
//! event socket: it sends `connect`, reads back the channel data and hands
//! the handler a socket that is already past the handshake.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use percent_encoding::percent_decode_str;
use thiserror::Error;
use tracing::debug;

const HANDSHAKE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::handshake");

const CONNECT_COMMAND: &[u8] = b"connect\n\n";
const MAX_HEADER_BYTES: usize = 64 * 1024;
const COMMAND_REPLY: &str = "command/reply";

/// Reasons an attach handshake can fail.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("peer closed the connection mid-handshake")]
    Closed,
    #[error("reply exceeded {} bytes", MAX_HEADER_BYTES)]
    TooLarge,
    #[error("malformed header line {0:?}")]
    MalformedHeader(String),
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
    #[error("reply carried no channel data")]
    NoChannelData,
}

/// The attach primitive: validates that the peer speaks the expected
/// protocol and returns a live session.
pub trait Attach: Send + Sync {
    fn attach(&self, stream: &TcpStream, peer: SocketAddr) -> Result<Session, HandshakeError>;
}

/// Handle produced by a successful attach.
///
/// Owns a duplicate of the client descriptor. [`Session::disconnect`] (or
/// dropping the session) closes that duplicate; the connection itself stays
/// open for the handler.
#[derive(Debug)]
pub struct Session {
    stream: Option<TcpStream>,
    headers: Vec<(String, String)>,
}

impl Session {
    pub fn new(stream: TcpStream, headers: Vec<(String, String)>) -> Self {
        Session { stream: Some(stream), headers }
    }

    /// Returns the first header called `name`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Channel data sent by the peer, in arrival order.
    pub fn headers(&self) -> &[(String, String)] { &self.headers }

    /// The channel's `Unique-ID`, if the peer sent one.
    pub fn channel_id(&self) -> Option<&str> { self.header("Unique-ID") }

    pub fn is_connected(&self) -> bool { self.stream.is_some() }

    /// Tears the session down.
    pub fn disconnect(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.stream.take().is_some() {
            debug!(
                target: HANDSHAKE_TARGET,
                channel = self.channel_id().unwrap_or("-"),
                "session released"
            );
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release();
    }
}

/// Event-socket `connect` handshake.
#[derive(Debug, Clone)]
pub struct EslAttach {
    timeout: Duration,
}

impl EslAttach {
    pub fn new(timeout: Duration) -> Self {
        EslAttach { timeout }
    }
}

impl Attach for EslAttach {
    fn attach(&self, stream: &TcpStream, peer: SocketAddr) -> Result<Session, HandshakeError> {
        let mut conn = stream.try_clone()?;
        conn.set_read_timeout(Some(self.timeout))?;
        conn.write_all(CONNECT_COMMAND)?;

        let headers = read_header_block(&mut conn)?;
        if let Some(len) = content_length(&headers)? {
            discard_exact(&mut conn, len)?;
        }
        // The timeout is a socket option shared with the handler's copy.
        conn.set_read_timeout(None)?;

        check_reply(&headers)?;
        debug!(
            target: HANDSHAKE_TARGET,
            %peer,
            headers = headers.len(),
            "attach handshake complete"
        );
        Ok(Session::new(conn, headers))
    }
}

/// Reads one header block, one byte at a time so nothing past the blank
/// line is taken from the handler.
fn read_header_block(reader: &mut impl Read) -> Result<Vec<(String, String)>, HandshakeError> {
    let mut raw = Vec::with_capacity(1024);
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Err(HandshakeError::Closed),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(HandshakeError::Io(e)),
        }
        if byte[0] == b'\r' {
            continue;
        }
        raw.push(byte[0]);
        if raw.ends_with(b"\n\n") {
            break;
        }
        // A leading blank line is a keep-alive, not an empty block.
        if raw == b"\n" {
            raw.clear();
        }
        if raw.len() > MAX_HEADER_BYTES {
            return Err(HandshakeError::TooLarge);
        }
    }
    parse_headers(&String::from_utf8_lossy(&raw))
}

fn parse_headers(block: &str) -> Result<Vec<(String, String)>, HandshakeError> {
    block
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| HandshakeError::MalformedHeader(line.to_owned()))?;
            let value = percent_decode_str(value.trim()).decode_utf8_lossy();
            Ok((key.trim().to_owned(), value.into_owned()))
        })
        .collect()
}

fn content_length(headers: &[(String, String)]) -> Result<Option<usize>, HandshakeError> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("Content-Length"))
        .map(|(_, v)| {
            v.parse::<usize>()
                .map_err(|_| HandshakeError::MalformedHeader(format!("Content-Length: {v}")))
        })
        .transpose()
}

fn discard_exact(reader: &mut impl Read, len: usize) -> Result<(), HandshakeError> {
    if len > MAX_HEADER_BYTES {
        return Err(HandshakeError::TooLarge);
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => HandshakeError::Closed,
        _ => HandshakeError::Io(e),
    })
}

fn check_reply(headers: &[(String, String)]) -> Result<(), HandshakeError> {
    let find = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    };

    match find("Content-Type") {
        Some(COMMAND_REPLY) => {}
        Some(other) => return Err(HandshakeError::UnexpectedReply(format!("content type {other}"))),
        None => return Err(HandshakeError::UnexpectedReply("no content type".to_owned())),
    }
    if let Some(text) = find("Reply-Text")
        && text.starts_with("-ERR")
    {
        return Err(HandshakeError::UnexpectedReply(text.to_owned()));
    }

    let has_channel_data = headers.iter().any(|(k, _)| {
        !["Content-Type", "Reply-Text", "Content-Length"]
            .iter()
            .any(|known| k.eq_ignore_ascii_case(known))
    });
    if !has_channel_data {
        return Err(HandshakeError::NoChannelData);
    }
    Ok(())
}
