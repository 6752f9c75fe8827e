//! Paced packet generation.
//!
//! [`PacedSender`] emits format-encoded packets at a fixed payload data rate.
//! Packet `n` is due at `start + n · interval`; the sender sleeps until each
//! deadline rather than spinning, and a sender that falls behind catches up
//! without sleeping.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use minstant::Instant;

use crate::format::{FormatError, PacketFormat};
use crate::header::HeaderError;
use crate::net::{DatagramSink, Endpoint, UdpSocket};
use crate::receive::ReceiveError;
use crate::trace::{debug, info, warn};

/// Pause before retrying a send the transport refused.
const WOULD_BLOCK_BACKOFF: Duration = Duration::from_micros(50);

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("data rate must be positive, got {0} bytes/s")]
    InvalidRate(f64),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ReceiveError),
    #[error("send failed: {0}")]
    Io(#[from] io::Error),
}

/// When a paced run ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendBudget {
    pub packets: Option<u64>,
    pub duration: Option<Duration>,
}

impl SendBudget {
    #[must_use]
    pub const fn packets(n: u64) -> Self {
        Self {
            packets: Some(n),
            duration: None,
        }
    }

    #[must_use]
    pub const fn duration(d: Duration) -> Self {
        Self {
            packets: None,
            duration: Some(d),
        }
    }

    fn exhausted(&self, sent: u64, elapsed: Duration) -> bool {
        self.packets.is_some_and(|n| sent >= n) || self.duration.is_some_and(|d| elapsed >= d)
    }
}

/// Outcome of a paced run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SendSummary {
    pub packets: u64,
    pub payload_bytes: u64,
    pub elapsed: Duration,
    /// Sends the transport refused and that were retried.
    pub retries: u64,
}

impl SendSummary {
    /// Achieved payload rate in MB/s.
    #[must_use]
    pub fn rate_mb_per_s(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.payload_bytes as f64 / secs / 1e6
        } else {
            0.0
        }
    }
}

impl std::fmt::Display for SendSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} packets, {} bytes in {:.3}s ({:.1} MB/s, {} retries)",
            self.packets,
            self.payload_bytes,
            self.elapsed.as_secs_f64(),
            self.rate_mb_per_s(),
            self.retries
        )
    }
}

/// A UDP socket aimed at one destination.
#[derive(Debug)]
pub struct UdpTarget {
    socket: UdpSocket,
    dest: Endpoint,
}

impl UdpTarget {
    /// Binds an ephemeral local port for sending to `dest`.
    ///
    /// # Errors
    ///
    /// The socket cannot be bound.
    pub fn open(dest: Endpoint) -> io::Result<Self> {
        let local = match dest.ip() {
            std::net::IpAddr::V4(ip) if ip.is_loopback() => Endpoint::localhost(0),
            _ => Endpoint::any(0),
        };
        Ok(Self {
            socket: UdpSocket::open(local)?,
            dest,
        })
    }

    #[must_use]
    pub const fn dest(&self) -> Endpoint {
        self.dest
    }
}

impl DatagramSink for UdpTarget {
    fn send_datagram(&mut self, buf: &[u8]) -> io::Result<bool> {
        Ok(self.socket.try_send_to(buf, self.dest)?.is_some())
    }
}

/// Sends packets of one format at a fixed payload rate.
pub struct PacedSender<K> {
    sink: K,
    format: PacketFormat,
    interval: Duration,
    packet: Vec<u8>,
    seq: u64,
    retries: u64,
}

impl<K: DatagramSink> PacedSender<K> {
    /// Creates a sender emitting `bytes_per_second` of payload.
    ///
    /// # Errors
    ///
    /// A non-positive or non-finite rate.
    pub fn new(sink: K, format: PacketFormat, bytes_per_second: f64) -> Result<Self, GenerateError> {
        if !bytes_per_second.is_finite() || bytes_per_second <= 0.0 {
            return Err(GenerateError::InvalidRate(bytes_per_second));
        }
        let interval = Duration::from_secs_f64(format.payload_size() as f64 / bytes_per_second);
        let packet = vec![0u8; format.packet_size()];
        Ok(Self {
            sink,
            format,
            interval,
            packet,
            seq: 0,
            retries: 0,
        })
    }

    /// Starts the sequence at `seq` instead of zero.
    #[must_use]
    pub const fn starting_at(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    /// Time between consecutive packets.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Sequence number of the next packet.
    #[must_use]
    pub const fn next_seq(&self) -> u64 {
        self.seq
    }

    #[must_use]
    pub const fn sink(&self) -> &K {
        &self.sink
    }

    pub fn into_sink(self) -> K {
        self.sink
    }

    /// Encodes and sends the next packet immediately.
    ///
    /// # Errors
    ///
    /// Transport failure.
    pub fn send_next(&mut self) -> io::Result<()> {
        let header_size = self.format.header_size();
        self.format.encode_header(&mut self.packet, self.seq);
        self.format
            .generate_signal(self.seq, &mut self.packet[header_size..]);
        self.send_current()?;
        self.seq += 1;
        Ok(())
    }

    /// Sends the end-of-stream marker, if the format has one.
    ///
    /// # Errors
    ///
    /// Transport failure.
    pub fn send_stream_stop(&mut self) -> io::Result<bool> {
        if !self.format.encode_stream_stop(&mut self.packet) {
            debug!(format = self.format.kind().name(), "format has no end of stream marker");
            return Ok(false);
        }
        self.send_current()?;
        info!("end of stream marker sent");
        Ok(true)
    }

    fn send_current(&mut self) -> io::Result<()> {
        while !self.sink.send_datagram(&self.packet)? {
            self.retries += 1;
            thread::sleep(WOULD_BLOCK_BACKOFF);
        }
        Ok(())
    }

    /// Sends paced packets until `budget` is exhausted or `stop` is set.
    ///
    /// # Errors
    ///
    /// Transport failure.
    pub fn run(&mut self, budget: SendBudget, stop: &AtomicBool) -> Result<SendSummary, GenerateError> {
        info!(
            format = self.format.kind().name(),
            interval = ?self.interval,
            first_seq = self.seq,
            "paced sender started"
        );
        let start = Instant::now();
        let retries = self.retries;
        let mut sent: u64 = 0;
        let mut behind = false;

        while !stop.load(Ordering::Relaxed) && !budget.exhausted(sent, start.elapsed()) {
            let due = self.interval.mul_f64(sent as f64);
            let elapsed = start.elapsed();
            if let Some(wait) = due.checked_sub(elapsed) {
                behind = false;
                thread::sleep(wait);
            } else if !behind && elapsed - due > self.interval * 16 {
                behind = true;
                warn!(behind = ?(elapsed - due), "sender falling behind target rate");
            }
            self.send_next()?;
            sent += 1;
        }

        let summary = SendSummary {
            packets: sent,
            payload_bytes: sent * self.format.payload_size() as u64,
            elapsed: start.elapsed(),
            retries: self.retries - retries,
        };
        info!(%summary, "paced sender finished");
        Ok(summary)
    }
}

impl<K> std::fmt::Debug for PacedSender<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacedSender")
            .field("format", &self.format)
            .field("interval", &self.interval)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Decoded, FormatKind};

    #[derive(Default)]
    struct Collect {
        packets: Vec<Vec<u8>>,
        refuse: u32,
    }

    impl DatagramSink for Collect {
        fn send_datagram(&mut self, buf: &[u8]) -> io::Result<bool> {
            if self.refuse > 0 {
                self.refuse -= 1;
                return Ok(false);
            }
            self.packets.push(buf.to_vec());
            Ok(true)
        }
    }

    fn format() -> PacketFormat {
        PacketFormat::new(FormatKind::simple(8, 1024))
    }

    #[test]
    fn test_rejects_bad_rate() {
        for rate in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                PacedSender::new(Collect::default(), format(), rate),
                Err(GenerateError::InvalidRate(_))
            ));
        }
    }

    #[test]
    fn test_packets_decode_in_sequence() {
        let mut sender = PacedSender::new(Collect::default(), format(), 1e9)
            .unwrap()
            .starting_at(5);
        let summary = sender
            .run(SendBudget::packets(4), &AtomicBool::new(false))
            .unwrap();
        assert_eq!(summary.packets, 4);
        assert_eq!(summary.payload_bytes, 4096);
        assert!(sender.send_stream_stop().unwrap());

        let mut decoder = format();
        let sink = sender.into_sink();
        assert_eq!(sink.packets.len(), 5);
        for (i, packet) in sink.packets[..4].iter().enumerate() {
            assert_eq!(
                decoder.decode_packet(packet).unwrap(),
                Decoded::Packet {
                    byte_offset: (5 + i as u64) * 1024,
                    payload_len: 1024
                }
            );
        }
        assert_eq!(decoder.decode_packet(&sink.packets[4]).unwrap(), Decoded::StreamStop);
    }

    #[test]
    fn test_paces_to_rate() {
        // 1024 bytes every 5 ms
        let mut sender = PacedSender::new(Collect::default(), format(), 204_800.0).unwrap();
        assert!(sender.interval().abs_diff(Duration::from_millis(5)) < Duration::from_micros(1));
        let summary = sender
            .run(SendBudget::packets(11), &AtomicBool::new(false))
            .unwrap();
        assert!(summary.elapsed >= Duration::from_millis(45), "{summary}");
    }

    #[test]
    fn test_retries_refused_sends() {
        let sink = Collect {
            refuse: 3,
            ..Collect::default()
        };
        let mut sender = PacedSender::new(sink, format(), 1e9).unwrap();
        let summary = sender
            .run(SendBudget::packets(2), &AtomicBool::new(false))
            .unwrap();
        assert_eq!(summary.retries, 3);
        assert_eq!(sender.sink().packets.len(), 2);
    }

    #[test]
    fn test_stop_flag_ends_run() {
        let mut sender = PacedSender::new(Collect::default(), format(), 1e9).unwrap();
        let summary = sender.run(SendBudget::default(), &AtomicBool::new(true)).unwrap();
        assert_eq!(summary.packets, 0);
    }
}
