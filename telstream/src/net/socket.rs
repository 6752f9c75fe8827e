//! UDP socket wrapper for mio-based I/O.
//!
//! mio sockets are always non-blocking at the OS level. Blocking mode is
//! emulated by waiting for readiness on a private [`Poll`] before each
//! receive, so the same socket serves both the spinning capture loops and
//! tools that prefer to sleep until data arrives.

use std::io::{self, ErrorKind};
use std::net::Ipv4Addr;
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use minstant::Instant;
use mio::net::UdpSocket as MioUdpSocket;
use mio::{Events, Interest, Poll, Token};

use super::{DatagramSource, Endpoint};

const SOCKET: Token = Token(0);

/// A UDP socket with optional blocking receive.
pub struct UdpSocket {
    inner: MioUdpSocket,
    poll: Poll,
    events: Events,
    blocking: bool,
    buf: Vec<u8>,
}

impl UdpSocket {
    /// Creates a non-blocking UDP socket bound to the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound (e.g., address in use).
    pub fn open(endpoint: Endpoint) -> io::Result<Self> {
        let mut inner = MioUdpSocket::bind(endpoint.into())?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut inner, SOCKET, Interest::READABLE)?;
        Ok(Self {
            inner,
            poll,
            events: Events::with_capacity(8),
            blocking: false,
            buf: vec![0u8; 9000],
        })
    }

    /// Binds `port` on all interfaces and joins multicast `group` on `interface`.
    ///
    /// # Errors
    ///
    /// Bind failure or the group join is refused.
    pub fn open_multicast(group: Ipv4Addr, interface: Ipv4Addr, port: u16) -> io::Result<Self> {
        let socket = Self::open(Endpoint::any(port))?;
        socket.inner.join_multicast_v4(&group, &interface)?;
        Ok(socket)
    }

    /// Returns the local address this socket is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.inner.local_addr().map(Endpoint::from)
    }

    /// Switches between blocking and non-blocking receives.
    pub fn set_blocking(&mut self, blocking: bool) {
        self.blocking = blocking;
    }

    #[must_use]
    pub const fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Sizes the internal buffer used by [`receive`](Self::receive).
    pub fn resize(&mut self, bytes: usize) {
        self.buf.resize(bytes, 0);
    }

    /// Sends a datagram to the specified endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or if the socket would block.
    pub fn send_to(&self, buf: &[u8], dest: Endpoint) -> io::Result<usize> {
        self.inner.send_to(buf, dest.into())
    }

    /// Attempts to send, returning `Ok(None)` instead of `WouldBlock`.
    pub fn try_send_to(&self, buf: &[u8], dest: Endpoint) -> io::Result<Option<usize>> {
        match self.send_to(buf, dest) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Attempts one receive, returning `Ok(None)` instead of `WouldBlock`.
    pub fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, Endpoint)>> {
        match self.inner.recv_from(buf) {
            Ok((n, addr)) => Ok(Some((n, Endpoint::from(addr)))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Receives one datagram into `dst`.
    ///
    /// With `timeout` set, waits at most that long. Otherwise a blocking
    /// socket waits indefinitely and a non-blocking socket returns at once.
    /// `Ok(None)` means nothing arrived.
    ///
    /// # Errors
    ///
    /// Socket or poll failure.
    pub fn receive_into(
        &mut self,
        dst: &mut [u8],
        timeout: Option<Duration>,
    ) -> io::Result<Option<usize>> {
        if let Some((n, _)) = self.try_recv_from(dst)? {
            return Ok(Some(n));
        }
        if timeout.is_none() && !self.blocking {
            return Ok(None);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let remaining = deadline.map(|dl| dl.saturating_duration_since(Instant::now()));
            match self.poll.poll(&mut self.events, remaining) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
            // Readiness can be stale or spurious; retry until a definite answer.
            if !self.events.is_empty()
                && let Some((n, _)) = self.try_recv_from(dst)?
            {
                return Ok(Some(n));
            }
            if let Some(dl) = deadline
                && Instant::now() >= dl
            {
                return Ok(None);
            }
        }
    }

    /// Receives one datagram into the internal buffer.
    ///
    /// # Errors
    ///
    /// See [`receive_into`](Self::receive_into).
    pub fn receive(&mut self, timeout: Option<Duration>) -> io::Result<Option<&[u8]>> {
        let mut buf = std::mem::take(&mut self.buf);
        let got = self.receive_into(&mut buf, timeout);
        self.buf = buf;
        Ok(got?.map(|n| &self.buf[..n]))
    }

    /// Discards every datagram queued in the kernel, returning how many.
    ///
    /// # Errors
    ///
    /// Socket failure other than `WouldBlock`.
    pub fn clear_buffered(&mut self) -> io::Result<usize> {
        let mut scratch = std::mem::take(&mut self.buf);
        let mut cleared = 0;
        let result = loop {
            match self.try_recv_from(&mut scratch) {
                Ok(Some(_)) => cleared += 1,
                Ok(None) => break Ok(cleared),
                Err(e) => break Err(e),
            }
        };
        self.buf = scratch;
        result
    }

    /// Requests a kernel receive buffer of `bytes`, returning the size granted.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set or read back.
    pub fn resize_kernel_buffer(&self, bytes: usize) -> io::Result<usize> {
        self.set_recv_buffer_size(bytes)?;
        self.recv_buffer_size()
    }

    /// Sets the socket's send buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        // Use rustix for socket options since mio doesn't expose them directly
        rustix::net::sockopt::set_socket_send_buffer_size(self.inner.as_fd(), size)?;
        Ok(())
    }

    /// Sets the socket's receive buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        rustix::net::sockopt::set_socket_recv_buffer_size(self.inner.as_fd(), size)?;
        Ok(())
    }

    /// Gets the socket's send buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be retrieved.
    pub fn send_buffer_size(&self) -> io::Result<usize> {
        Ok(rustix::net::sockopt::socket_send_buffer_size(
            self.inner.as_fd(),
        )?)
    }

    /// Gets the socket's receive buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be retrieved.
    pub fn recv_buffer_size(&self) -> io::Result<usize> {
        Ok(rustix::net::sockopt::socket_recv_buffer_size(
            self.inner.as_fd(),
        )?)
    }
}

impl DatagramSource for UdpSocket {
    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        self.receive_into(buf, None)
    }
}

impl AsFd for UdpSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl std::fmt::Debug for UdpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSocket")
            .field("local", &self.inner.local_addr().ok())
            .field("blocking", &self.blocking)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_bind_and_local_addr() {
        let socket = UdpSocket::open(Endpoint::localhost(0)).unwrap();
        let addr = socket.local_addr().unwrap();
        assert_eq!(
            addr.ip(),
            std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
        );
        assert_ne!(addr.port(), 0); // OS assigned a port
    }

    #[test]
    fn socket_send_receive_loopback() {
        let sender = UdpSocket::open(Endpoint::localhost(0)).unwrap();
        let mut receiver = UdpSocket::open(Endpoint::localhost(0)).unwrap();
        let receiver_addr = receiver.local_addr().unwrap();

        let msg = b"hello";
        assert_eq!(sender.send_to(msg, receiver_addr).unwrap(), msg.len());

        let got = receiver
            .receive(Some(Duration::from_secs(1)))
            .unwrap()
            .unwrap();
        assert_eq!(got, msg);
    }

    #[test]
    fn socket_nonblocking_receive_empty() {
        let mut socket = UdpSocket::open(Endpoint::localhost(0)).unwrap();
        let mut buf = [0u8; 64];
        assert!(socket.recv_datagram(&mut buf).unwrap().is_none());
    }

    #[test]
    fn socket_receive_timeout_expires() {
        let mut socket = UdpSocket::open(Endpoint::localhost(0)).unwrap();
        socket.set_blocking(true);
        let mut buf = [0u8; 64];
        let start = std::time::Instant::now();
        let got = socket
            .receive_into(&mut buf, Some(Duration::from_millis(20)))
            .unwrap();
        assert!(got.is_none());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn socket_blocking_receive_waits_for_data() {
        let mut receiver = UdpSocket::open(Endpoint::localhost(0)).unwrap();
        receiver.set_blocking(true);
        let addr = receiver.local_addr().unwrap();

        let sender = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            let socket = UdpSocket::open(Endpoint::localhost(0)).unwrap();
            socket.send_to(&[7u8; 32], addr).unwrap();
        });

        let mut buf = [0u8; 64];
        assert_eq!(receiver.recv_datagram(&mut buf).unwrap(), Some(32));
        sender.join().unwrap();
    }

    #[test]
    fn socket_clear_buffered() {
        let sender = UdpSocket::open(Endpoint::localhost(0)).unwrap();
        let mut receiver = UdpSocket::open(Endpoint::localhost(0)).unwrap();
        let addr = receiver.local_addr().unwrap();
        for _ in 0..3 {
            sender.send_to(b"stale", addr).unwrap();
        }
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(receiver.clear_buffered().unwrap(), 3);
        let mut buf = [0u8; 16];
        assert!(receiver.recv_datagram(&mut buf).unwrap().is_none());
    }

    #[test]
    fn socket_buffer_sizes() {
        let socket = UdpSocket::open(Endpoint::localhost(0)).unwrap();

        let send_size = socket.send_buffer_size().unwrap();
        let recv_size = socket.recv_buffer_size().unwrap();
        assert!(send_size > 0);
        assert!(recv_size > 0);

        // Kernel may clamp, but never below the default
        socket.set_send_buffer_size(1024 * 1024).unwrap();
        let granted = socket.resize_kernel_buffer(1024 * 1024).unwrap();
        assert!(socket.send_buffer_size().unwrap() >= send_size);
        assert!(granted >= recv_size);
    }
}
