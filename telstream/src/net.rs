//! Network transport primitives.
//!
//! UDP sockets carry the packet streams, a TCP listener carries control
//! commands. Receivers are written against [`DatagramSource`] and the
//! generator against [`DatagramSink`], so tests can use in-memory packet
//! sequences instead of sockets.

pub mod endpoint;
pub mod socket;
pub mod tcp;

use std::io;

pub use endpoint::Endpoint;
pub use socket::UdpSocket;
pub use tcp::{ControlListener, send_command};

/// Something a receive loop can pull datagrams from.
pub trait DatagramSource: Send {
    /// Receives one datagram into `buf`, returning its length.
    ///
    /// `Ok(None)` means no datagram was available this attempt; the caller
    /// counts it as an idle poll and checks for control commands.
    ///
    /// # Errors
    ///
    /// Any transport failure; receivers treat it as fatal.
    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;
}

impl<T: DatagramSource + ?Sized> DatagramSource for Box<T> {
    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        (**self).recv_datagram(buf)
    }
}

/// Something a transmitter can push datagrams into.
pub trait DatagramSink: Send {
    /// Sends one datagram. `Ok(false)` means the transport would block and
    /// nothing was sent.
    ///
    /// # Errors
    ///
    /// Any transport failure.
    fn send_datagram(&mut self, buf: &[u8]) -> io::Result<bool>;
}

impl<T: DatagramSink + ?Sized> DatagramSink for Box<T> {
    fn send_datagram(&mut self, buf: &[u8]) -> io::Result<bool> {
        (**self).send_datagram(buf)
    }
}
