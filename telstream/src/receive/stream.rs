//! Single-stream receiver.
//!
//! One thread receives datagrams, decodes them and copies each payload to its
//! offset in the currently open block:
//!
//! ```text
//!            ┌───────────── Start ──────────────┐
//!            │                                  v
//!      ┌───────────┐  first packet   ┌─────────┐  packet ≥ next  ┌──────────┐
//!  ──> │ waiting   │ ──────────────> │ filling │ ──────────────> │ rotating │
//!      │ for block │                 └─────────┘ <────────────── └──────────┘
//!      └───────────┘                      │       close, open next
//!            ^                            │ Stop / Quit / end marker
//!            └──── observation closed ────┘
//! ```
//!
//! Blocks open lazily on the first packet addressed to them and close as soon
//! as they hold a block's worth of payload. A packet beyond the current block
//! closes it at full size; the shortfall counts as lost.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::config::{ReceiverConfig, check_block_geometry, observation_header};
use super::{IDLE_SLEEP, PACKET_SLACK, ReceiveError, check_packet_size};
use crate::control::{ControlCommand, ControlHandle};
use crate::format::{Decoded, PacketFormat};
use crate::header::AsciiHeader;
use crate::ipc::{RingBufferChannel, RingError, Role, WriteBlock};
use crate::net::DatagramSource;
use crate::stats::IngestStats;
use crate::trace::{debug, error, info, trace, warn};

/// Receives one UDP stream into a writer-locked channel.
pub struct StreamReceiver<S> {
    channel: RingBufferChannel,
    source: S,
    format: PacketFormat,
    config: AsciiHeader,
    control: Arc<ControlHandle>,
    stats: Arc<IngestStats>,
    bufsz: u64,
    max_block_skip: u64,
    zero_fill: bool,
    packet: Vec<u8>,
}

impl<S: DatagramSource> StreamReceiver<S> {
    /// Creates a receiver writing to `channel`, which must be locked as
    /// writer. The packet format is chosen by `PKT_FORMAT` in `config`.
    ///
    /// # Errors
    ///
    /// The channel is not writer-locked, the format configuration is
    /// invalid, or the block size is not a whole number of format units.
    pub fn new(
        channel: RingBufferChannel,
        source: S,
        config: AsciiHeader,
    ) -> Result<Self, ReceiveError> {
        if channel.role() != Some(Role::Writer) {
            return Err(RingError::WrongRole {
                op: "StreamReceiver::new",
                required: &[Role::Writer],
                held: channel.role(),
            }
            .into());
        }
        let format = PacketFormat::from_config(&config, "")?;
        let bufsz = channel.get_data_block_size()?;
        check_block_geometry(bufsz, 1, &format)?;

        let packet = vec![0u8; format.packet_size() + PACKET_SLACK];
        Ok(Self {
            channel,
            source,
            format,
            config,
            control: Arc::new(ControlHandle::new()),
            stats: Arc::new(IngestStats::new()),
            bufsz: bufsz as u64,
            max_block_skip: super::config::DEFAULT_MAX_BLOCK_SKIP,
            zero_fill: false,
            packet,
        })
    }

    /// Applies the tunables of `config`.
    #[must_use]
    pub fn with_settings(self, config: &ReceiverConfig) -> Self {
        self.with_max_block_skip(config.max_block_skip)
            .with_zero_fill(config.zero_fill)
    }

    #[must_use]
    pub const fn with_max_block_skip(mut self, blocks: u64) -> Self {
        self.max_block_skip = blocks;
        self
    }

    #[must_use]
    pub const fn with_zero_fill(mut self, zero_fill: bool) -> Self {
        self.zero_fill = zero_fill;
        self
    }

    /// Handle for delivering Start, Stop and Quit.
    #[must_use]
    pub fn control(&self) -> Arc<ControlHandle> {
        Arc::clone(&self.control)
    }

    #[must_use]
    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    #[must_use]
    pub const fn format(&self) -> &PacketFormat {
        &self.format
    }

    /// Runs observations until Quit.
    ///
    /// # Errors
    ///
    /// Transport failure, packet size mismatch, desynchronised counters,
    /// a stream gap, or a channel failure. The observation in progress is
    /// closed before the error is returned.
    pub fn run(&mut self) -> Result<(), ReceiveError> {
        info!(
            key = %self.channel.key(),
            format = self.format.kind().name(),
            bufsz = self.bufsz,
            "receiver waiting for start"
        );
        while let Some(start) = self.control.wait_for_start() {
            let result = self.observe(&start);
            self.control.finish_observation();
            result?;
        }
        info!(key = %self.channel.key(), "receiver quit");
        Ok(())
    }

    fn observe(&mut self, start: &AsciiHeader) -> Result<(), ReceiveError> {
        let resolution = self.format.get_resolution();
        let header = observation_header(&self.config, start, resolution);
        self.format.configure(&header, "")?;
        self.format.prepare(&header, "")?;
        self.channel.set_resolution(resolution)?;
        self.channel.write_header(header.raw().as_bytes())?;
        self.stats.reset();
        info!(
            key = %self.channel.key(),
            utc_start = header.get_str("UTC_START"),
            "observation started"
        );

        let mut cursor = BlockCursor::new(self.bufsz);
        let captured = self.capture(&mut cursor);
        if let Err(e) = &captured {
            error!(error = %e, "capture failed, closing observation");
        }
        let flushed = cursor.finish(&mut self.channel);
        let closed = self.channel.close_observation();
        captured?;
        flushed?;
        closed?;

        info!(stats = %self.stats.snapshot(), "observation finished");
        Ok(())
    }

    fn capture(&mut self, cursor: &mut BlockCursor) -> Result<(), ReceiveError> {
        loop {
            if matches!(
                self.control.command(),
                ControlCommand::Stop | ControlCommand::Quit
            ) {
                self.control.begin_stopping();
                info!("stop observed");
                return Ok(());
            }

            let Some(len) = self.source.recv_datagram(&mut self.packet)? else {
                self.stats.record_sleep(1);
                thread::sleep(IDLE_SLEEP);
                continue;
            };
            check_packet_size(len, self.format.packet_size())?;
            let packet = &self.packet[..len];

            match self.format.decode_packet(packet)? {
                Decoded::TooEarly => trace!("packet before observation start"),
                Decoded::StreamStop => {
                    info!("end of stream marker");
                    return Ok(());
                }
                Decoded::Packet {
                    byte_offset,
                    payload_len,
                } => {
                    if byte_offset < cursor.curr {
                        self.stats.drop_bytes(payload_len as u64);
                        trace!(byte_offset, curr = cursor.curr, "late packet dropped");
                        continue;
                    }
                    let ahead = (byte_offset - cursor.curr) / self.bufsz;
                    if ahead > self.max_block_skip {
                        error!(byte_offset, ahead, "stream gap");
                        return Err(ReceiveError::StreamGap {
                            offset: byte_offset,
                            blocks: ahead,
                            max: self.max_block_skip,
                        });
                    }
                    for _ in 0..ahead {
                        cursor.rotate(&mut self.channel, &self.stats)?;
                    }

                    let mut block = cursor.take_or_open(&mut self.channel, self.zero_fill)?;
                    let rel = (byte_offset - cursor.curr) as usize;
                    let n = self
                        .format
                        .insert_last_packet(packet, &mut block.as_mut_slice()[rel..]);
                    self.stats.increment_bytes(n as u64);
                    cursor.record(rel, n);
                    cursor.put_back(&mut self.channel, block)?;
                }
            }
        }
    }

    /// Runs the receiver on a named thread.
    ///
    /// # Errors
    ///
    /// The thread cannot be spawned.
    pub fn spawn(mut self) -> Result<ReceiverHandle, ReceiveError>
    where
        S: 'static,
    {
        let control = self.control();
        let stats = self.stats();
        let handle = thread::Builder::new()
            .name("telstream-rx".into())
            .spawn(move || {
                info!("receive thread started");
                let result = self.run();
                if let Err(e) = &result {
                    error!(error = %e, "receive thread failed");
                }
                info!("receive thread exiting");
                result
            })?;
        Ok(ReceiverHandle {
            control,
            stats,
            handle: Some(handle),
        })
    }
}

/// Position of the receiver in the stream.
struct BlockCursor {
    bufsz: u64,
    /// Stream offset of the current block's first byte.
    curr: u64,
    block: Option<WriteBlock>,
    filled: u64,
    high_water: usize,
}

impl BlockCursor {
    const fn new(bufsz: u64) -> Self {
        Self {
            bufsz,
            curr: 0,
            block: None,
            filled: 0,
            high_water: 0,
        }
    }

    fn take_or_open(
        &mut self,
        channel: &mut RingBufferChannel,
        zero_fill: bool,
    ) -> Result<WriteBlock, ReceiveError> {
        if let Some(block) = self.block.take() {
            return Ok(block);
        }
        let mut block = channel.open_block()?;
        if zero_fill {
            block.as_mut_slice().fill(0);
        }
        trace!(id = block.id(), curr = self.curr, "block opened");
        Ok(block)
    }

    const fn record(&mut self, rel: usize, n: usize) {
        self.filled += n as u64;
        if rel + n > self.high_water {
            self.high_water = rel + n;
        }
    }

    /// Keeps the block open, or closes it once it holds a block's worth.
    fn put_back(
        &mut self,
        channel: &mut RingBufferChannel,
        block: WriteBlock,
    ) -> Result<(), ReceiveError> {
        if self.filled < self.bufsz {
            self.block = Some(block);
            return Ok(());
        }
        let id = block.id();
        channel.close_block(block, self.bufsz as usize)?;
        debug!(id, "block full");
        self.advance();
        Ok(())
    }

    /// Closes the current block at full size and moves to the next.
    fn rotate(
        &mut self,
        channel: &mut RingBufferChannel,
        stats: &IngestStats,
    ) -> Result<(), ReceiveError> {
        let block = match self.block.take() {
            Some(block) => block,
            None => {
                // Nothing arrived for this block at all.
                let mut block = channel.open_block()?;
                block.as_mut_slice().fill(0);
                block
            }
        };
        let id = block.id();
        let shortfall = self.bufsz.saturating_sub(self.filled);
        stats.lost_bytes(shortfall);
        channel.close_block(block, self.bufsz as usize)?;
        if shortfall > 0 {
            warn!(id, lost = shortfall, "block closed short");
        } else {
            debug!(id, "block rotated");
        }
        self.advance();
        Ok(())
    }

    const fn advance(&mut self) {
        self.curr += self.bufsz;
        self.filled = 0;
        self.high_water = 0;
    }

    /// Publishes the partially filled block, or discards an empty one.
    fn finish(&mut self, channel: &mut RingBufferChannel) -> Result<(), ReceiveError> {
        if let Some(block) = self.block.take() {
            let id = block.id();
            channel.close_block(block, self.high_water)?;
            debug!(id, bytes = self.high_water, "final block closed");
        }
        Ok(())
    }
}

/// Handle to a spawned [`StreamReceiver`].
///
/// Dropping the handle requests Quit without waiting.
pub struct ReceiverHandle {
    control: Arc<ControlHandle>,
    stats: Arc<IngestStats>,
    handle: Option<JoinHandle<Result<(), ReceiveError>>>,
}

impl ReceiverHandle {
    #[must_use]
    pub const fn control(&self) -> &Arc<ControlHandle> {
        &self.control
    }

    #[must_use]
    pub const fn stats(&self) -> &Arc<IngestStats> {
        &self.stats
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Waits for the receiver to exit on its own (after Quit or an error).
    ///
    /// # Errors
    ///
    /// The receiver's error, or [`ReceiveError::WorkerPanic`].
    pub fn join(mut self) -> Result<(), ReceiveError> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| ReceiveError::WorkerPanic { worker: 0 })?,
            None => Ok(()),
        }
    }

    /// Requests Quit and waits for the receiver to exit.
    ///
    /// # Errors
    ///
    /// See [`join`](Self::join).
    pub fn shutdown(self) -> Result<(), ReceiveError> {
        self.control.request_quit();
        self.join()
    }
}

impl Drop for ReceiverHandle {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.control.request_quit();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::ipc::ChannelKey;

    struct Silent;

    impl DatagramSource for Silent {
        fn recv_datagram(&mut self, _buf: &mut [u8]) -> io::Result<Option<usize>> {
            Ok(None)
        }
    }

    #[test]
    fn test_requires_writer_lock() {
        let channel = RingBufferChannel::new(ChannelKey::new(0xdada));
        let config = AsciiHeader::load_from_str("NCHAN 1\nNBIT 8\nNPOL 1\nNDIM 1\n").unwrap();
        assert!(matches!(
            StreamReceiver::new(channel, Silent, config),
            Err(ReceiveError::Ring(RingError::WrongRole { held: None, .. }))
        ));
    }

    #[test]
    fn test_cursor_arithmetic() {
        let mut cursor = BlockCursor::new(8192);
        cursor.record(4096, 4096);
        cursor.record(0, 1024);
        assert_eq!(cursor.filled, 5120);
        assert_eq!(cursor.high_water, 8192);
        cursor.advance();
        assert_eq!(cursor.curr, 8192);
        assert_eq!((cursor.filled, cursor.high_water), (0, 0));
    }
}
