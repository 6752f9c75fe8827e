//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::io;
use std::sync::Once;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use telstream::format::PacketFormat;
use telstream::header::AsciiHeader;
use telstream::ipc::{ChannelCreator, ChannelGeometry, ChannelKey, RingBufferChannel, RingError, Role, channel};
use telstream::net::DatagramSource;

static INIT_TRACING: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        telstream::init_tracing();
    });
}

/// A key no other test in any process is using.
pub fn unique_key() -> ChannelKey {
    static COUNTER: AtomicU32 = AtomicU32::new(1);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    // Even keys only: the header ring sits at key + 1.
    ChannelKey::new(((std::process::id() & 0x7fff) << 16) | (n * 2))
}

pub fn geometry(nbufs: u64, bufsz: u64, nreaders: u32) -> ChannelGeometry {
    ChannelGeometry {
        nbufs,
        bufsz,
        nreaders,
        ..ChannelGeometry::default()
    }
}

/// Creates a fresh channel, or returns `None` where shared memory is not
/// available to the test user.
pub fn create_or_skip(geometry: ChannelGeometry) -> Option<ChannelCreator> {
    let key = unique_key();
    let _ = channel::destroy(key);
    match ChannelCreator::create(key, geometry) {
        Ok(creator) => Some(creator),
        Err(RingError::Shm(err)) if err.is_permission_denied() => {
            eprintln!("Skipping shared memory test: {err}");
            None
        }
        Err(err) => panic!("create failed: {err}"),
    }
}

pub fn attach(key: ChannelKey, role: Role) -> RingBufferChannel {
    let mut channel = RingBufferChannel::new(key);
    channel.connect().expect("connect");
    channel.lock(role).expect("lock");
    channel
}

/// Receiver configuration for a one-byte-per-sample stream of 4096 byte
/// payloads.
pub fn config(extra: &str) -> AsciiHeader {
    AsciiHeader::load_from_str(&format!(
        "NCHAN 1\nNBIT 8\nNPOL 1\nNDIM 1\nTSAMP 1\nBW 1\nPKT_PAYLOAD_SIZE 4096\n{extra}"
    ))
    .expect("config")
}

/// The payload pattern of packet `seq` on stream `tag`.
pub fn payload(seq: u64, tag: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (seq as usize).wrapping_mul(7).wrapping_add(i).wrapping_add(tag as usize) as u8)
        .collect()
}

/// A complete datagram carrying `payload(seq, tag, ..)`.
pub fn packet(format: &PacketFormat, seq: u64, tag: u8) -> Vec<u8> {
    let mut buf = vec![0u8; format.packet_size()];
    assert!(format.encode_header(&mut buf, seq));
    let header_size = format.header_size();
    buf[header_size..].copy_from_slice(&payload(seq, tag, format.payload_size()));
    buf
}

pub fn stream_stop(format: &PacketFormat) -> Vec<u8> {
    let mut buf = vec![0u8; format.packet_size()];
    assert!(format.encode_stream_stop(&mut buf));
    buf
}

/// Datagrams fed in by the test; reports nothing available when drained.
pub struct Script {
    rx: Receiver<Vec<u8>>,
}

impl DatagramSource for Script {
    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.rx.try_recv() {
            Ok(datagram) => {
                buf[..datagram.len()].copy_from_slice(&datagram);
                Ok(Some(datagram.len()))
            }
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => Ok(None),
        }
    }
}

pub fn script() -> (Sender<Vec<u8>>, Script) {
    let (tx, rx) = mpsc::channel();
    (tx, Script { rx })
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}
