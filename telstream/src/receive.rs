//! UDP capture into a ring buffer channel.
//!
//! [`StreamReceiver`] ingests one stream; [`MergeReceiver`] ingests two
//! sub-streams into the halves of each block. Both map every packet to a
//! byte offset through their own [`PacketFormat`](crate::format::PacketFormat)
//! and copy the payload to that offset, so final block content depends on
//! packet sequence numbers, not arrival order.
//!
//! ```text
//!   stream offset:  0          bufsz        2·bufsz
//!                   ├──────────┼────────────┼──────────
//!   block id:       │    0     │     1      │    2
//!                   └──────────┴────────────┴──────────
//!   late (< curr) → dropped    beyond next → rotate, then place
//! ```

pub mod config;
pub mod merge;
pub mod stream;

use std::io;
use std::time::Duration;

pub use config::{MergeConfig, ObservationParams, ReceiverConfig, StreamEndpoint};
pub use merge::{MergeControl, MergeHandle, MergeReceiver};
pub use stream::{ReceiverHandle, StreamReceiver};

use crate::control::ControlError;
use crate::format::FormatError;
use crate::header::HeaderError;
use crate::ipc::RingError;

/// Pause between receive attempts that found no datagram.
pub(crate) const IDLE_SLEEP: Duration = Duration::from_micros(10);

/// Errors that end a receiver.
#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error(transparent)]
    Ring(#[from] RingError),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error("transport failed: {0}")]
    Io(#[from] io::Error),
    #[error("invalid block geometry: {reason}")]
    Geometry { reason: String },
    #[error("received a {got} byte datagram, expected {expected}")]
    PacketSizeMismatch { expected: usize, got: usize },
    #[error("packet at offset {offset} is {blocks} blocks past the current block (limit {max})")]
    StreamGap { offset: u64, blocks: u64, max: u64 },
    #[error("worker {worker} panicked")]
    WorkerPanic { worker: usize },
    #[error("no block rotation for {waited:?}, filled {filled:?}")]
    WorkerStalled { waited: Duration, filled: [bool; 2] },
}

/// Checks a datagram length against the format's packet size.
#[inline]
pub(crate) fn check_packet_size(got: usize, expected: usize) -> Result<(), ReceiveError> {
    if got == expected {
        Ok(())
    } else {
        Err(ReceiveError::PacketSizeMismatch { expected, got })
    }
}

/// Slack past the packet size in receive buffers, so oversized datagrams
/// are seen as such rather than silently truncated.
pub(crate) const PACKET_SLACK: usize = 64;
