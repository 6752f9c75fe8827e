//! Ring buffer channel lifecycle.
//!
//! ```text
//! RingBufferChannel::new(key)
//!        │ connect()
//!        ▼
//!    connected ── lock(Writer) ──> write_header ─> open_block/close_block ... ─> close_observation
//!        │      └─ lock(Reader) ──> read_header  ─> open_read_block/close_read_block ... (None at end)
//!        │      └─ lock(Viewer) ──> open_read_block/close_read_block (never holds the writer back)
//!        │ unlock(); disconnect()
//!        ▼
//!   disconnected
//! ```

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use super::RingError;
use super::ring::{ReadBlock, Ring, RingGeometry, Timeout, WriteBlock, init_ring, wait_until};
use super::shmem::{self, Creator, ShmRegion};
use crate::trace::{debug, error, info, warn};

/// Numeric identifier of a channel; the header ring lives at `key + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelKey(u32);

impl ChannelKey {
    #[must_use]
    pub const fn new(key: u32) -> Self {
        Self(key)
    }

    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Key of the header ring.
    #[must_use]
    pub const fn header_key(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// POSIX shared memory name of the data ring.
    #[must_use]
    pub fn data_path(self) -> String {
        format!("/telstream-{:08x}", self.0)
    }

    /// POSIX shared memory name of the header ring.
    #[must_use]
    pub fn header_path(self) -> String {
        self.header_key().data_path()
    }
}

impl FromStr for ChannelKey {
    type Err = RingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        u32::from_str_radix(digits, 16)
            .map(Self)
            .map_err(|_| RingError::InvalidKey(s.to_string()))
    }
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

/// Access role held on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Exclusive producer of blocks.
    Writer,
    /// Consumer; the writer waits for every reader before reusing a block.
    Reader,
    /// Non-consuming monitor.
    Viewer,
}

/// Shape of both rings of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelGeometry {
    pub nbufs: u64,
    pub bufsz: u64,
    pub nreaders: u32,
    pub hdr_nbufs: u64,
    pub hdr_bufsz: u64,
    /// Initial block alignment granularity; receivers usually overwrite it.
    pub resolution: u64,
}

impl Default for ChannelGeometry {
    fn default() -> Self {
        Self {
            nbufs: 4,
            bufsz: 524_288,
            nreaders: 1,
            hdr_nbufs: 8,
            hdr_bufsz: 4096,
            resolution: 1,
        }
    }
}

impl ChannelGeometry {
    const fn data(&self) -> RingGeometry {
        RingGeometry {
            nbufs: self.nbufs,
            bufsz: self.bufsz,
            nreaders: self.nreaders,
        }
    }

    const fn header(&self) -> RingGeometry {
        RingGeometry {
            nbufs: self.hdr_nbufs,
            bufsz: self.hdr_bufsz,
            nreaders: self.nreaders,
        }
    }
}

/// Owner of a channel's shared memory; both rings are unlinked on drop.
pub struct ChannelCreator {
    key: ChannelKey,
    geometry: ChannelGeometry,
    /// Data and header regions; `None` once persisted.
    regions: Option<(ShmRegion<Creator>, ShmRegion<Creator>)>,
}

impl ChannelCreator {
    /// Creates and initialises both rings.
    ///
    /// # Errors
    ///
    /// Invalid geometry, or the shared memory objects cannot be created
    /// (e.g. `EEXIST` when the key is in use).
    pub fn create(key: ChannelKey, geometry: ChannelGeometry) -> Result<Self, RingError> {
        geometry.data().validate()?;
        geometry.header().validate()?;
        if geometry.resolution == 0 || geometry.bufsz % geometry.resolution != 0 {
            return Err(RingError::Geometry {
                reason: format!(
                    "resolution {} must divide the block size {}",
                    geometry.resolution, geometry.bufsz
                ),
            });
        }

        let data = ShmRegion::<Creator>::create(&key.data_path(), geometry.data().region_len()?)?;
        init_ring(&data, geometry.data(), geometry.resolution)?;

        let header =
            ShmRegion::<Creator>::create(&key.header_path(), geometry.header().region_len()?)?;
        init_ring(&header, geometry.header(), 1)?;

        info!(
            %key,
            nbufs = geometry.nbufs,
            bufsz = geometry.bufsz,
            nreaders = geometry.nreaders,
            "created channel"
        );

        Ok(Self {
            key,
            geometry,
            regions: Some((data, header)),
        })
    }

    #[must_use]
    pub const fn key(&self) -> ChannelKey {
        self.key
    }

    #[must_use]
    pub const fn geometry(&self) -> ChannelGeometry {
        self.geometry
    }

    /// Leaves both rings in place for other processes; remove them later
    /// with [`destroy`].
    pub fn persist(mut self) {
        if let Some((data, header)) = self.regions.take() {
            drop(data.persist());
            drop(header.persist());
            info!(key = %self.key, "channel persists");
        }
    }
}

impl Drop for ChannelCreator {
    fn drop(&mut self) {
        if self.regions.is_some() {
            debug!(key = %self.key, "destroying channel");
        }
    }
}

/// Removes a channel's shared memory objects left behind by another process.
///
/// # Errors
///
/// Any unlink failure other than the object not existing.
pub fn destroy(key: ChannelKey) -> Result<(), RingError> {
    shmem::unlink(&key.data_path())?;
    shmem::unlink(&key.header_path())?;
    info!(%key, "destroyed channel");
    Ok(())
}

struct Connection {
    data: Arc<Ring>,
    header: Arc<Ring>,
}

#[derive(Debug, Clone, Copy)]
enum Held {
    Writer,
    Reader { slot: usize },
    Viewer,
}

impl Held {
    const fn role(self) -> Role {
        match self {
            Self::Writer => Role::Writer,
            Self::Reader { .. } => Role::Reader,
            Self::Viewer => Role::Viewer,
        }
    }
}

fn next_token() -> u64 {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let local = COUNTER.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    (u64::from(std::process::id()) << 32) | u64::from(local)
}

/// A process's handle on one ring buffer channel.
pub struct RingBufferChannel {
    key: ChannelKey,
    token: u64,
    conn: Option<Connection>,
    held: Option<Held>,
    /// Writer: id of the open block. Reader/viewer: id of the block being read.
    open: Option<u64>,
    header_done: bool,
    view_cursor: u64,
}

impl RingBufferChannel {
    #[must_use]
    pub fn new(key: ChannelKey) -> Self {
        Self {
            key,
            token: next_token(),
            conn: None,
            held: None,
            open: None,
            header_done: false,
            view_cursor: 0,
        }
    }

    #[must_use]
    pub const fn key(&self) -> ChannelKey {
        self.key
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// The role currently held, if any.
    #[must_use]
    pub fn role(&self) -> Option<Role> {
        self.held.map(Held::role)
    }

    /// Attaches to both rings of the channel.
    ///
    /// # Errors
    ///
    /// Already connected, or the rings do not exist / are not initialised.
    pub fn connect(&mut self) -> Result<(), RingError> {
        if self.conn.is_some() {
            return Err(RingError::AlreadyConnected { key: self.key });
        }
        let data = Arc::new(Ring::attach(&self.key.data_path())?);
        let header = Arc::new(Ring::attach(&self.key.header_path())?);
        debug!(key = %self.key, bufsz = data.bufsz(), "connected");
        self.conn = Some(Connection { data, header });
        Ok(())
    }

    /// Detaches from the rings.
    ///
    /// # Errors
    ///
    /// Not connected, or a lock is still held.
    pub fn disconnect(&mut self) -> Result<(), RingError> {
        if self.conn.is_none() {
            return Err(RingError::NotConnected { key: self.key });
        }
        if let Some(held) = self.held {
            return Err(RingError::StillLocked {
                key: self.key,
                role: held.role(),
            });
        }
        self.conn = None;
        debug!(key = %self.key, "disconnected");
        Ok(())
    }

    fn conn(&self) -> Result<&Connection, RingError> {
        self.conn
            .as_ref()
            .ok_or(RingError::NotConnected { key: self.key })
    }

    /// Acquires the channel in `role`.
    ///
    /// # Errors
    ///
    /// Not connected, already locked, writer lock taken, or no free reader slot.
    pub fn lock(&mut self, role: Role) -> Result<(), RingError> {
        let key = self.key;
        let token = self.token;
        if let Some(held) = self.held {
            return Err(RingError::AlreadyLocked {
                key,
                role: held.role(),
            });
        }
        let conn = self.conn()?;

        let held = match role {
            Role::Writer => {
                if !conn.data.try_lock_writer(token) {
                    return Err(RingError::WriterLocked { key });
                }
                if !conn.header.try_lock_writer(token) {
                    conn.data.unlock_writer(token);
                    return Err(RingError::WriterLocked { key });
                }
                Held::Writer
            }
            Role::Reader => {
                let nreaders = conn.data.geometry().nreaders;
                let slot = (0..nreaders as usize).find(|&slot| {
                    if !conn.data.try_lock_reader(slot, token) {
                        return false;
                    }
                    if conn.header.try_lock_reader(slot, token) {
                        return true;
                    }
                    conn.data.unlock_reader(slot, token);
                    false
                });
                match slot {
                    Some(slot) => Held::Reader { slot },
                    None => return Err(RingError::NoReaderSlot { key, nreaders }),
                }
            }
            Role::Viewer => {
                let nbufs = conn.data.geometry().nbufs;
                self.view_cursor = conn.data.write_count().saturating_sub(nbufs - 1);
                Held::Viewer
            }
        };

        self.held = Some(held);
        self.open = None;
        self.header_done = false;
        info!(%key, ?role, "locked");
        Ok(())
    }

    /// Releases the held role.
    ///
    /// A writer in the middle of an observation publishes the end-of-data
    /// marker first so readers do not wait forever.
    ///
    /// # Errors
    ///
    /// Not locked, or a block is still open.
    pub fn unlock(&mut self) -> Result<(), RingError> {
        let Some(held) = self.held else {
            return Err(RingError::NotLocked { key: self.key });
        };
        if let Some(id) = self.open {
            return Err(RingError::BlockAlreadyOpen { id });
        }
        if matches!(held, Held::Writer) && self.header_done {
            self.close_observation()?;
        }
        self.release(held);
        info!(key = %self.key, role = ?held.role(), "unlocked");
        Ok(())
    }

    fn release(&mut self, held: Held) {
        if let Some(conn) = &self.conn {
            match held {
                Held::Writer => {
                    conn.data.unlock_writer(self.token);
                    conn.header.unlock_writer(self.token);
                }
                Held::Reader { slot } => {
                    conn.data.unlock_reader(slot, self.token);
                    conn.header.unlock_reader(slot, self.token);
                }
                Held::Viewer => {}
            }
        }
        self.held = None;
        self.open = None;
        self.header_done = false;
    }

    fn require(&self, op: &'static str, allowed: &'static [Role]) -> Result<Held, RingError> {
        match self.held {
            Some(held) if allowed.contains(&held.role()) => Ok(held),
            held => {
                let held = held.map(Held::role);
                error!(key = %self.key, op, ?held, "operation without the required lock");
                Err(RingError::WrongRole {
                    op,
                    required: allowed,
                    held,
                })
            }
        }
    }

    /// Writes the observation header. Allowed once per observation.
    ///
    /// # Errors
    ///
    /// Not the writer, header already written, or header too large.
    pub fn write_header(&mut self, header: &[u8]) -> Result<(), RingError> {
        self.require("write_header", &[Role::Writer])?;
        if self.header_done {
            return Err(RingError::HeaderAlreadyWritten);
        }
        let ring = Arc::clone(&self.conn()?.header);
        if header.len() > ring.bufsz() {
            return Err(RingError::HeaderTooLarge {
                len: header.len(),
                bufsz: ring.bufsz(),
            });
        }

        let id = ring.write_count();
        wait_until(Timeout::Infinite, || ring.slot_free(id));

        let mut block = WriteBlock::whole(Arc::clone(&ring), id);
        let dst = block.as_mut_slice();
        dst[..header.len()].copy_from_slice(header);
        dst[header.len()..].fill(0);
        ring.publish(id, header.len() as u64, false);

        self.header_done = true;
        debug!(key = %self.key, bytes = header.len(), "header written");
        Ok(())
    }

    /// Reads the observation header.
    ///
    /// A reader consumes the next header, once per observation. A viewer
    /// returns the most recent header without consuming it.
    ///
    /// # Errors
    ///
    /// Wrong role, header already read, or timeout.
    pub fn read_header(&mut self, timeout: Timeout) -> Result<Vec<u8>, RingError> {
        let held = self.require("read_header", &[Role::Reader, Role::Viewer])?;
        let ring = Arc::clone(&self.conn()?.header);

        match held {
            Held::Reader { slot } => {
                if self.header_done {
                    return Err(RingError::HeaderAlreadyRead);
                }
                loop {
                    let id = ring.read_count(slot);
                    if !wait_until(timeout, || ring.write_count() > id) {
                        return Err(RingError::Timeout { op: "read_header" });
                    }
                    let (bytes, eod, _) = ring.block_meta(id);
                    if eod {
                        ring.consume(slot, id);
                        continue;
                    }
                    let header = ReadBlock::new(Arc::clone(&ring), id, bytes as usize)
                        .as_slice()
                        .to_vec();
                    ring.consume(slot, id);
                    self.header_done = true;
                    return Ok(header);
                }
            }
            _ => {
                if !wait_until(timeout, || ring.write_count() > 0) {
                    return Err(RingError::Timeout { op: "read_header" });
                }
                let id = ring.write_count() - 1;
                let (bytes, _, _) = ring.block_meta(id);
                Ok(ReadBlock::new(Arc::clone(&ring), id, bytes as usize)
                    .as_slice()
                    .to_vec())
            }
        }
    }

    /// Opens the next data block for writing, waiting for readers to free it.
    ///
    /// # Errors
    ///
    /// Not the writer, a block is already open, or no header written yet.
    pub fn open_block(&mut self) -> Result<WriteBlock, RingError> {
        self.open_block_within(Timeout::Infinite)
    }

    /// As [`open_block`](Self::open_block) with a bound on the wait for readers.
    ///
    /// # Errors
    ///
    /// As `open_block`, plus [`RingError::Timeout`].
    pub fn open_block_within(&mut self, timeout: Timeout) -> Result<WriteBlock, RingError> {
        self.require("open_block", &[Role::Writer])?;
        if let Some(id) = self.open {
            error!(key = %self.key, id, "open_block while a block is open");
            return Err(RingError::BlockAlreadyOpen { id });
        }
        if !self.header_done {
            return Err(RingError::HeaderNotWritten);
        }
        let ring = Arc::clone(&self.conn()?.data);
        let id = ring.write_count();
        if !wait_until(timeout, || ring.slot_free(id)) {
            return Err(RingError::Timeout { op: "open_block" });
        }
        self.open = Some(id);
        Ok(WriteBlock::whole(ring, id))
    }

    #[must_use]
    pub const fn is_block_open(&self) -> bool {
        matches!(self.held, Some(Held::Writer)) && self.open.is_some()
    }

    /// Commits `bytes` valid bytes of the open block to readers.
    ///
    /// Closing with zero bytes discards the block instead of publishing it.
    ///
    /// # Errors
    ///
    /// Not the writer, the handle is not this channel's whole open block, or
    /// `bytes` exceeds the block size.
    pub fn close_block(&mut self, block: WriteBlock, bytes: usize) -> Result<(), RingError> {
        self.require("close_block", &[Role::Writer])?;
        let ring = Arc::clone(&self.conn()?.data);
        let Some(id) = self.open else {
            return Err(RingError::NoOpenBlock);
        };
        if block.id() != id || !block.belongs_to(&ring) {
            return Err(RingError::ForeignBlock { got: block.id() });
        }
        if !block.is_whole() {
            return Err(RingError::PartialBlock { id });
        }
        if bytes > ring.bufsz() {
            return Err(RingError::BytesExceedBlock {
                bytes,
                bufsz: ring.bufsz(),
            });
        }

        if bytes > 0 {
            ring.publish(id, bytes as u64, false);
        }
        self.open = None;
        Ok(())
    }

    /// Ends the observation by publishing the end-of-data marker.
    ///
    /// Readers see `None` from [`open_read_block`](Self::open_read_block) and
    /// may read the next observation's header. A new header may be written.
    ///
    /// # Errors
    ///
    /// Not the writer, a block is open, or no observation is in progress.
    pub fn close_observation(&mut self) -> Result<(), RingError> {
        self.require("close_observation", &[Role::Writer])?;
        if let Some(id) = self.open {
            return Err(RingError::BlockAlreadyOpen { id });
        }
        if !self.header_done {
            return Err(RingError::HeaderNotWritten);
        }
        let ring = Arc::clone(&self.conn()?.data);
        let id = ring.write_count();
        wait_until(Timeout::Infinite, || ring.slot_free(id));
        ring.publish(id, 0, true);
        self.header_done = false;
        info!(key = %self.key, blocks = id, "observation closed");
        Ok(())
    }

    /// Opens the next closed block for reading.
    ///
    /// Returns `Ok(None)` at the end of an observation. A viewer lapped by the
    /// writer skips ahead to the newest closed block.
    ///
    /// # Errors
    ///
    /// Wrong role, a block is already being read, a reader has not read the
    /// header, or timeout.
    pub fn open_read_block(&mut self, timeout: Timeout) -> Result<Option<ReadBlock>, RingError> {
        let held = self.require("open_read_block", &[Role::Reader, Role::Viewer])?;
        if let Some(id) = self.open {
            return Err(RingError::BlockAlreadyOpen { id });
        }
        let ring = Arc::clone(&self.conn()?.data);

        match held {
            Held::Reader { slot } => {
                if !self.header_done {
                    return Err(RingError::HeaderNotRead);
                }
                let id = ring.read_count(slot);
                if !wait_until(timeout, || ring.write_count() > id) {
                    return Err(RingError::Timeout {
                        op: "open_read_block",
                    });
                }
                let (bytes, eod, _) = ring.block_meta(id);
                if eod {
                    ring.consume(slot, id);
                    self.header_done = false;
                    debug!(key = %self.key, id, "end of observation");
                    return Ok(None);
                }
                self.open = Some(id);
                Ok(Some(ReadBlock::new(ring, id, bytes as usize)))
            }
            _ => loop {
                let cursor = self.view_cursor;
                if !wait_until(timeout, || ring.write_count() > cursor) {
                    return Err(RingError::Timeout {
                        op: "open_read_block",
                    });
                }
                let written = ring.write_count();
                let nbufs = ring.geometry().nbufs;
                if written - cursor >= nbufs {
                    warn!(key = %self.key, skipped = written - 1 - cursor, "viewer lapped by writer");
                    self.view_cursor = written - 1;
                    continue;
                }
                let (bytes, eod, stored) = ring.block_meta(cursor);
                if stored != cursor {
                    // Slot recycled between the two loads.
                    self.view_cursor = ring.write_count().saturating_sub(1).max(cursor + 1);
                    continue;
                }
                if eod {
                    self.view_cursor = cursor + 1;
                    return Ok(None);
                }
                self.open = Some(cursor);
                return Ok(Some(ReadBlock::new(ring, cursor, bytes as usize)));
            },
        }
    }

    /// Releases a block obtained from [`open_read_block`](Self::open_read_block).
    ///
    /// # Errors
    ///
    /// Wrong role or the block is not the one being read.
    pub fn close_read_block(&mut self, block: ReadBlock) -> Result<(), RingError> {
        let held = self.require("close_read_block", &[Role::Reader, Role::Viewer])?;
        let ring = Arc::clone(&self.conn()?.data);
        if self.open != Some(block.id()) || !block.belongs_to(&ring) {
            return Err(RingError::ForeignBlock { got: block.id() });
        }
        match held {
            Held::Reader { slot } => ring.consume(slot, block.id()),
            _ => self.view_cursor = block.id() + 1,
        }
        self.open = None;
        Ok(())
    }

    /// Block alignment granularity in bytes.
    ///
    /// # Errors
    ///
    /// Not connected.
    pub fn get_resolution(&self) -> Result<u64, RingError> {
        Ok(self.conn()?.data.resolution())
    }

    /// Sets the block alignment granularity; it must divide the block size.
    ///
    /// # Errors
    ///
    /// Not the writer, or `resolution` does not divide the block size.
    pub fn set_resolution(&mut self, resolution: u64) -> Result<(), RingError> {
        self.require("set_resolution", &[Role::Writer])?;
        let ring = &self.conn()?.data;
        let bufsz = ring.geometry().bufsz;
        if resolution == 0 || bufsz % resolution != 0 {
            return Err(RingError::Geometry {
                reason: format!("resolution {resolution} must divide the block size {bufsz}"),
            });
        }
        ring.set_resolution(resolution);
        Ok(())
    }

    /// Size of one data block in bytes.
    ///
    /// # Errors
    ///
    /// Not connected.
    pub fn get_data_block_size(&self) -> Result<usize, RingError> {
        Ok(self.conn()?.data.bufsz())
    }

    /// Number of data blocks in the ring.
    ///
    /// # Errors
    ///
    /// Not connected.
    pub fn nbufs(&self) -> Result<u64, RingError> {
        Ok(self.conn()?.data.geometry().nbufs)
    }

    /// Number of data blocks published so far (end-of-data markers included).
    ///
    /// # Errors
    ///
    /// Not connected.
    pub fn write_count(&self) -> Result<u64, RingError> {
        Ok(self.conn()?.data.write_count())
    }
}

impl Drop for RingBufferChannel {
    fn drop(&mut self) {
        let Some(held) = self.held else {
            return;
        };
        if matches!(held, Held::Writer) && self.open.is_none() && self.header_done {
            let _ = self.close_observation();
        }
        self.release(held);
    }
}

impl std::fmt::Debug for RingBufferChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBufferChannel")
            .field("key", &self.key)
            .field("connected", &self.conn.is_some())
            .field("role", &self.role())
            .field("open", &self.open)
            .finish()
    }
}
