//! Inter-process communication through shared memory ring buffers.
//!
//! A channel is a pair of rings identified by one hexadecimal key: the data
//! ring at `key` and the header ring at `key + 1`. One writer fills blocks,
//! any number of readers consume them, and viewers monitor without consuming.
//!
//! - [`shmem`] - POSIX shared memory regions
//! - [`ring`] - block ring layout and block handles
//! - [`channel`] - [`RingBufferChannel`] lifecycle and [`ChannelCreator`]

pub mod channel;
pub mod ring;
pub mod shmem;

pub use channel::{ChannelCreator, ChannelGeometry, ChannelKey, RingBufferChannel, Role};
pub use ring::{ReadBlock, Timeout, WriteBlock};
pub use shmem::ShmError;

/// Errors from ring buffer channel operations.
#[derive(Debug, thiserror::Error)]
pub enum RingError {
    #[error(transparent)]
    Shm(#[from] ShmError),
    #[error("invalid channel key `{0}`: expected hexadecimal")]
    InvalidKey(String),
    #[error("invalid ring geometry: {reason}")]
    Geometry { reason: String },
    #[error("ring `{path}` is corrupt: {reason}")]
    Corrupt { path: String, reason: &'static str },
    #[error("channel {key} is already connected")]
    AlreadyConnected { key: ChannelKey },
    #[error("channel {key} is not connected")]
    NotConnected { key: ChannelKey },
    #[error("channel {key} is still locked as {role:?}")]
    StillLocked { key: ChannelKey, role: Role },
    #[error("channel {key} is already locked as {role:?}")]
    AlreadyLocked { key: ChannelKey, role: Role },
    #[error("channel {key} is not locked")]
    NotLocked { key: ChannelKey },
    #[error("channel {key} already has a writer")]
    WriterLocked { key: ChannelKey },
    #[error("channel {key} has no free reader slot ({nreaders} configured)")]
    NoReaderSlot { key: ChannelKey, nreaders: u32 },
    #[error("{op} requires the {required:?} lock, held: {held:?}")]
    WrongRole {
        op: &'static str,
        required: &'static [Role],
        held: Option<Role>,
    },
    #[error("block {id} is already open")]
    BlockAlreadyOpen { id: u64 },
    #[error("no block is open")]
    NoOpenBlock,
    #[error("block {got} does not belong to this channel's open block")]
    ForeignBlock { got: u64 },
    #[error("block {id} was closed while split into parts")]
    PartialBlock { id: u64 },
    #[error("{bytes} bytes exceed the block size of {bufsz}")]
    BytesExceedBlock { bytes: usize, bufsz: usize },
    #[error("header already written for this observation")]
    HeaderAlreadyWritten,
    #[error("header must be written before data blocks")]
    HeaderNotWritten,
    #[error("header already read for this observation")]
    HeaderAlreadyRead,
    #[error("header must be read before data blocks")]
    HeaderNotRead,
    #[error("header of {len} bytes exceeds header block size {bufsz}")]
    HeaderTooLarge { len: usize, bufsz: usize },
    #[error("timed out in {op}")]
    Timeout { op: &'static str },
}
