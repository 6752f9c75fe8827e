//! Short-lived TCP connections carrying ASCII control messages.
//!
//! A client connects, writes one message, shuts down its write half and
//! reads the reply until the server closes the connection.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use minstant::Instant;
use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream};
use mio::{Events, Interest, Poll, Token};

use super::Endpoint;

const LISTENER: Token = Token(0);
const CONNECTION: Token = Token(1);

/// Largest control message accepted.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// A TCP listener with bounded waits for connections and messages.
pub struct ControlListener {
    listener: MioTcpListener,
    poll: Poll,
    events: Events,
}

/// An accepted control connection.
pub struct ControlConnection {
    stream: MioTcpStream,
    peer: Endpoint,
}

impl ControlConnection {
    #[must_use]
    pub const fn peer(&self) -> Endpoint {
        self.peer
    }
}

impl ControlListener {
    /// Binds the listener.
    ///
    /// # Errors
    ///
    /// Bind failure (e.g. port in use).
    pub fn bind(endpoint: Endpoint) -> io::Result<Self> {
        let mut listener = MioTcpListener::bind(endpoint.into())?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        Ok(Self {
            listener,
            poll,
            events: Events::with_capacity(8),
        })
    }

    /// Returns the local address this listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.listener.local_addr().map(Endpoint::from)
    }

    /// Waits up to `timeout` for a connection.
    ///
    /// # Errors
    ///
    /// Poll or accept failure.
    pub fn accept_timeout(&mut self, timeout: Duration) -> io::Result<Option<ControlConnection>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    return Ok(Some(ControlConnection {
                        stream,
                        peer: Endpoint::from(addr),
                    }));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match self.poll.poll(&mut self.events, Some(remaining)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Reads one message: everything the peer sends until it shuts down its
    /// write half.
    ///
    /// # Errors
    ///
    /// `TimedOut` if the peer is too slow, `InvalidData` if the message is
    /// too large, or any socket failure.
    pub fn read_message(
        &mut self,
        conn: &mut ControlConnection,
        timeout: Duration,
    ) -> io::Result<String> {
        self.poll
            .registry()
            .register(&mut conn.stream, CONNECTION, Interest::READABLE)?;
        let result = self.read_registered(conn, timeout);
        let _ = self.poll.registry().deregister(&mut conn.stream);
        result
    }

    fn read_registered(
        &mut self,
        conn: &mut ControlConnection,
        timeout: Duration,
    ) -> io::Result<String> {
        let deadline = Instant::now() + timeout;
        let mut message = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match conn.stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    message.extend_from_slice(&chunk[..n]);
                    if message.len() > MAX_MESSAGE_SIZE {
                        return Err(io::Error::new(
                            ErrorKind::InvalidData,
                            "control message too large",
                        ));
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(io::Error::new(
                            ErrorKind::TimedOut,
                            "control message incomplete",
                        ));
                    }
                    match self.poll.poll(&mut self.events, Some(remaining)) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::Interrupted => {}
                        Err(e) => return Err(e),
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(String::from_utf8_lossy(&message).into_owned())
    }

    /// Writes a reply and closes the connection.
    ///
    /// # Errors
    ///
    /// Socket failure.
    pub fn reply(&mut self, mut conn: ControlConnection, text: &str) -> io::Result<()> {
        let mut remaining = text.as_bytes();
        let deadline = Instant::now() + Duration::from_secs(1);
        while !remaining.is_empty() {
            match conn.stream.write(remaining) {
                Ok(n) => remaining = &remaining[n..],
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() > deadline {
                        return Err(io::Error::new(ErrorKind::TimedOut, "reply not sent"));
                    }
                    std::thread::yield_now();
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        conn.stream.shutdown(Shutdown::Both)
    }
}

/// Sends one control message and returns the server's reply.
///
/// # Errors
///
/// Connection failure or timeout.
pub fn send_command(endpoint: Endpoint, message: &str, timeout: Duration) -> io::Result<String> {
    let mut stream = TcpStream::connect_timeout(&endpoint.into(), timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    stream.write_all(message.as_bytes())?;
    stream.shutdown(Shutdown::Write)?;
    let mut reply = String::new();
    stream.read_to_string(&mut reply)?;
    Ok(reply)
}
