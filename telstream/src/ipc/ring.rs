//! A ring of fixed-size blocks inside one shared memory object.
//!
//! Both halves of a channel (data and header) use this layout. The ring is a
//! single-writer, multi-reader circular buffer: the writer may only reuse a
//! slot once every consuming reader has advanced past it, while viewers follow
//! along without holding the writer back.
//!
//! # Memory Layout
//!
//! ```text
//! ┌────────────────────────────────────────┐
//! │ RingControl     (64-byte aligned)      │
//! │   init marker, geometry, writer token  │
//! │   write_count, reader slots            │
//! ├────────────────────────────────────────┤
//! │ BlockMeta × nbufs (bytes, id, eod)     │
//! ├────────────────────────────────────────┤
//! │ padding to page boundary               │
//! ├────────────────────────────────────────┤
//! │ block 0 │ block 1 │ ... │ block n-1    │
//! └────────────────────────────────────────┘
//! ```
//!
//! Blocks are numbered by a monotonically increasing id; block `id` lives in
//! slot `id % nbufs`. `write_count` is the number of blocks the writer has
//! published, each reader slot's `read_count` the number it has consumed.

use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use minstant::Instant;

use super::RingError;
use super::shmem::{Opener, SharedMemorySafe, ShmError, ShmMode, ShmRegion};

/// Upper bound on consuming readers per ring.
pub const MAX_READERS: usize = 8;

const INIT_MAGIC: u64 = 0x5453_5452_4D52_494E; // "TSTRMRIN" in ASCII
const INIT_TIMEOUT: Duration = Duration::from_secs(1);
const PAGE_SIZE: usize = 4096;

/// Timeout specification for blocking operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl Timeout {
    pub(crate) fn deadline(self) -> Option<Instant> {
        match self {
            Self::Infinite => None,
            Self::Duration(d) => Some(Instant::now() + d),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

impl From<Option<Duration>> for Timeout {
    fn from(d: Option<Duration>) -> Self {
        d.map_or(Self::Infinite, Self::Duration)
    }
}

/// Polls `ready` with backoff until it holds or the timeout expires.
///
/// Spins briefly, then yields, then sleeps in short naps.
pub(crate) fn wait_until(timeout: Timeout, mut ready: impl FnMut() -> bool) -> bool {
    let deadline = timeout.deadline();
    let mut attempts = 0u32;
    loop {
        if ready() {
            return true;
        }
        if let Some(dl) = deadline
            && Instant::now() > dl
        {
            return false;
        }
        match attempts {
            0..64 => std::hint::spin_loop(),
            64..128 => std::thread::yield_now(),
            _ => std::thread::sleep(Duration::from_micros(50)),
        }
        attempts = attempts.saturating_add(1);
    }
}

/// Per-reader consumption state.
#[repr(C)]
#[repr(align(64))]
pub(crate) struct ReaderSlot {
    /// Lock token of the process holding the slot, 0 when free.
    holder: AtomicU64,
    read_count: AtomicU64,
}

// SAFETY: repr(C), atomics only, zero is a valid state.
unsafe impl SharedMemorySafe for ReaderSlot {}

#[repr(C)]
#[repr(align(64))]
pub(crate) struct RingControl {
    init: AtomicU64,
    nbufs: AtomicU64,
    bufsz: AtomicU64,
    nreaders: AtomicU64,
    resolution: AtomicU64,
    /// Lock token of the writer, 0 when free.
    writer: AtomicU64,
    write_count: AtomicU64,
    readers: [ReaderSlot; MAX_READERS],
}

// SAFETY: repr(C), atomics only, zero is a valid state.
unsafe impl SharedMemorySafe for RingControl {}

#[repr(C)]
pub(crate) struct BlockMeta {
    bytes: AtomicU64,
    id: AtomicU64,
    eod: AtomicU64,
}

// SAFETY: repr(C), atomics only, zero is a valid state.
unsafe impl SharedMemorySafe for BlockMeta {}

/// Shape of one ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGeometry {
    /// Number of blocks.
    pub nbufs: u64,
    /// Size of each block in bytes.
    pub bufsz: u64,
    /// Number of consuming reader slots.
    pub nreaders: u32,
}

#[derive(Debug, Clone, Copy)]
struct RingLayout {
    meta_offset: usize,
    data_offset: usize,
    total_len: usize,
}

impl RingGeometry {
    pub(crate) fn validate(&self) -> Result<(), RingError> {
        if self.nbufs == 0 || self.bufsz == 0 {
            return Err(RingError::Geometry {
                reason: format!("nbufs ({}) and bufsz ({}) must be non-zero", self.nbufs, self.bufsz),
            });
        }
        if self.nreaders as usize > MAX_READERS {
            return Err(RingError::Geometry {
                reason: format!("at most {MAX_READERS} readers supported, got {}", self.nreaders),
            });
        }
        self.layout().map(|_| ())
    }

    fn layout(&self) -> Result<RingLayout, RingError> {
        let too_big = || RingError::Geometry {
            reason: format!("{} blocks of {} bytes do not fit in memory", self.nbufs, self.bufsz),
        };
        let nbufs = usize::try_from(self.nbufs).map_err(|_| too_big())?;
        let bufsz = usize::try_from(self.bufsz).map_err(|_| too_big())?;

        let meta_offset = size_of::<RingControl>();
        let meta_end = nbufs
            .checked_mul(size_of::<BlockMeta>())
            .and_then(|m| m.checked_add(meta_offset))
            .ok_or_else(too_big)?;
        let data_offset = meta_end.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let total_len = nbufs
            .checked_mul(bufsz)
            .and_then(|d| d.checked_add(data_offset))
            .ok_or_else(too_big)?;

        Ok(RingLayout {
            meta_offset,
            data_offset,
            total_len,
        })
    }

    /// Bytes of shared memory needed for this ring.
    pub(crate) fn region_len(&self) -> Result<usize, RingError> {
        self.layout().map(|l| l.total_len)
    }
}

/// Writes the control block of a freshly created (zeroed) region.
pub(crate) fn init_ring<M: ShmMode>(
    region: &ShmRegion<M>,
    geometry: RingGeometry,
    resolution: u64,
) -> Result<(), RingError> {
    let control: &RingControl = region.view(0).ok_or_else(|| RingError::Corrupt {
        path: region.path().to_string(),
        reason: "region too small for ring control block",
    })?;

    control.nbufs.store(geometry.nbufs, Ordering::Relaxed);
    control.bufsz.store(geometry.bufsz, Ordering::Relaxed);
    control.nreaders.store(u64::from(geometry.nreaders), Ordering::Relaxed);
    control.resolution.store(resolution.max(1), Ordering::Relaxed);
    control.writer.store(0, Ordering::Relaxed);
    control.write_count.store(0, Ordering::Relaxed);

    // Release store publishes the geometry to openers.
    control.init.store(INIT_MAGIC, Ordering::Release);
    Ok(())
}

/// An attached ring.
///
/// # Safety Invariants
///
/// `control` and `meta` point into `region`, which stays mapped for the
/// lifetime of this value.
pub(crate) struct Ring {
    region: ShmRegion<Opener>,
    control: NonNull<RingControl>,
    meta: NonNull<BlockMeta>,
    geometry: RingGeometry,
    data_offset: usize,
}

// SAFETY: the pointers refer to shared memory accessed only through atomics
// or through the block ownership protocol.
unsafe impl Send for Ring {}

// SAFETY: see above.
unsafe impl Sync for Ring {}

impl Ring {
    /// Maps an existing ring and waits for its creator to finish initialising.
    pub(crate) fn attach(path: &str) -> Result<Self, RingError> {
        let region = ShmRegion::<Opener>::open(path)?;

        let corrupt = |reason| RingError::Corrupt {
            path: path.to_string(),
            reason,
        };

        let control: &RingControl = region
            .view(0)
            .ok_or_else(|| corrupt("region too small for ring control block"))?;

        let ready = wait_until(Timeout::Duration(INIT_TIMEOUT), || {
            control.init.load(Ordering::Acquire) == INIT_MAGIC
        });
        if !ready {
            return Err(ShmError::InitTimeout {
                path: path.to_string(),
            }
            .into());
        }

        let geometry = RingGeometry {
            nbufs: control.nbufs.load(Ordering::Relaxed),
            bufsz: control.bufsz.load(Ordering::Relaxed),
            nreaders: u32::try_from(control.nreaders.load(Ordering::Relaxed))
                .map_err(|_| corrupt("reader count out of range"))?,
        };
        geometry.validate()?;
        let layout = geometry.layout()?;
        if layout.total_len > region.len() {
            return Err(corrupt("region smaller than its recorded geometry"));
        }

        let nbufs = usize::try_from(geometry.nbufs).map_err(|_| corrupt("nbufs out of range"))?;
        let meta = region
            .view_slice::<BlockMeta>(layout.meta_offset, nbufs)
            .ok_or_else(|| corrupt("block metadata out of bounds"))?;

        let control = NonNull::from(control);
        let meta = NonNull::from(&meta[0]);

        Ok(Self {
            region,
            control,
            meta,
            geometry,
            data_offset: layout.data_offset,
        })
    }

    fn control(&self) -> &RingControl {
        // SAFETY: points into `self.region`, validated at attach.
        unsafe { self.control.as_ref() }
    }

    fn meta(&self, id: u64) -> &BlockMeta {
        let slot = (id % self.geometry.nbufs) as usize;
        // SAFETY: slot < nbufs, and `meta` heads an array of nbufs entries
        // inside `self.region` (validated at attach).
        unsafe { &*self.meta.as_ptr().add(slot) }
    }

    pub(crate) fn path(&self) -> &str {
        self.region.path()
    }

    pub(crate) const fn geometry(&self) -> RingGeometry {
        self.geometry
    }

    pub(crate) const fn bufsz(&self) -> usize {
        self.geometry.bufsz as usize
    }

    pub(crate) fn resolution(&self) -> u64 {
        self.control().resolution.load(Ordering::Relaxed)
    }

    pub(crate) fn set_resolution(&self, resolution: u64) {
        self.control().resolution.store(resolution, Ordering::Relaxed);
    }

    pub(crate) fn try_lock_writer(&self, token: u64) -> bool {
        self.control()
            .writer
            .compare_exchange(0, token, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn unlock_writer(&self, token: u64) {
        let _ = self
            .control()
            .writer
            .compare_exchange(token, 0, Ordering::AcqRel, Ordering::Relaxed);
    }

    pub(crate) fn try_lock_reader(&self, slot: usize, token: u64) -> bool {
        slot < self.geometry.nreaders as usize
            && self.control().readers[slot]
                .holder
                .compare_exchange(0, token, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    pub(crate) fn unlock_reader(&self, slot: usize, token: u64) {
        if let Some(reader) = self.control().readers.get(slot) {
            let _ = reader
                .holder
                .compare_exchange(token, 0, Ordering::AcqRel, Ordering::Relaxed);
        }
    }

    pub(crate) fn write_count(&self) -> u64 {
        self.control().write_count.load(Ordering::Acquire)
    }

    pub(crate) fn read_count(&self, slot: usize) -> u64 {
        self.control().readers[slot].read_count.load(Ordering::Acquire)
    }

    /// Whether every consuming reader has released the slot block `id` maps to.
    pub(crate) fn slot_free(&self, id: u64) -> bool {
        let nbufs = self.geometry.nbufs;
        self.control().readers[..self.geometry.nreaders as usize]
            .iter()
            .all(|r| r.read_count.load(Ordering::Acquire) + nbufs > id)
    }

    /// Publishes block `id` to readers.
    pub(crate) fn publish(&self, id: u64, bytes: u64, eod: bool) {
        let meta = self.meta(id);
        meta.bytes.store(bytes, Ordering::Relaxed);
        meta.eod.store(u64::from(eod), Ordering::Relaxed);
        meta.id.store(id, Ordering::Relaxed);
        // Release makes the block contents and metadata visible together.
        self.control().write_count.store(id + 1, Ordering::Release);
    }

    /// Metadata of published block `id` as `(bytes, eod, stored id)`.
    pub(crate) fn block_meta(&self, id: u64) -> (u64, bool, u64) {
        let meta = self.meta(id);
        (
            meta.bytes.load(Ordering::Acquire),
            meta.eod.load(Ordering::Acquire) != 0,
            meta.id.load(Ordering::Acquire),
        )
    }

    pub(crate) fn consume(&self, slot: usize, id: u64) {
        self.control().readers[slot]
            .read_count
            .store(id + 1, Ordering::Release);
    }

    fn block_ptr(&self, id: u64, start: usize, len: usize) -> *mut u8 {
        let slot = (id % self.geometry.nbufs) as usize;
        self.region
            .byte_ptr(self.data_offset + slot * self.bufsz() + start, len)
    }
}

/// Exclusive write access to (part of) the currently open block.
///
/// Produced by [`RingBufferChannel::open_block`](super::RingBufferChannel::open_block).
/// The handle can be split into disjoint parts, moved to other threads, and
/// joined back before the block is closed.
pub struct WriteBlock {
    ring: Arc<Ring>,
    id: u64,
    start: usize,
    len: usize,
}

impl WriteBlock {
    pub(crate) fn whole(ring: Arc<Ring>, id: u64) -> Self {
        let len = ring.bufsz();
        Self {
            ring,
            id,
            start: 0,
            len,
        }
    }

    /// Block id (monotonic across the channel's lifetime).
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Number of bytes covered by this handle.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset of this handle's first byte within the block.
    #[must_use]
    pub const fn offset_in_block(&self) -> usize {
        self.start
    }

    /// Whether the handle covers the entire block.
    #[must_use]
    pub fn is_whole(&self) -> bool {
        self.start == 0 && self.len == self.ring.bufsz()
    }

    pub(crate) fn belongs_to(&self, ring: &Arc<Ring>) -> bool {
        Arc::ptr_eq(&self.ring, ring)
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let ptr = self.ring.block_ptr(self.id, self.start, self.len);
        // SAFETY: the channel hands out one whole handle per open block and
        // `split_at` produces disjoint ranges, so this range is not aliased.
        // Readers cannot observe the slot until the block is published.
        unsafe { std::slice::from_raw_parts_mut(ptr, self.len) }
    }

    /// Copies `src` to `offset` within this handle.
    ///
    /// Returns `false` without writing if the range does not fit.
    pub fn write_at(&mut self, offset: usize, src: &[u8]) -> bool {
        match self.as_mut_slice().get_mut(offset..offset.saturating_add(src.len())) {
            Some(dst) => {
                dst.copy_from_slice(src);
                true
            }
            None => false,
        }
    }

    /// Splits into `[0, mid)` and `[mid, len)`.
    ///
    /// # Panics
    ///
    /// Panics if `mid > len`.
    #[must_use]
    pub fn split_at(self, mid: usize) -> (Self, Self) {
        assert!(mid <= self.len, "split point {mid} beyond block part of {} bytes", self.len);
        let tail = Self {
            ring: Arc::clone(&self.ring),
            id: self.id,
            start: self.start + mid,
            len: self.len - mid,
        };
        let head = Self {
            ring: self.ring,
            id: self.id,
            start: self.start,
            len: mid,
        };
        (head, tail)
    }

    /// Rejoins two adjacent parts of the same block.
    ///
    /// # Errors
    ///
    /// Returns both parts unchanged if they are not adjacent parts of one block.
    pub fn join(self, other: Self) -> Result<Self, (Self, Self)> {
        if !Arc::ptr_eq(&self.ring, &other.ring) || self.id != other.id {
            return Err((self, other));
        }
        let (head, tail) = if self.start <= other.start {
            (self, other)
        } else {
            (other, self)
        };
        if head.start + head.len != tail.start {
            return Err((head, tail));
        }
        Ok(Self {
            ring: head.ring,
            id: head.id,
            start: head.start,
            len: head.len + tail.len,
        })
    }
}

impl std::fmt::Debug for WriteBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBlock")
            .field("ring", &self.ring.path())
            .field("id", &self.id)
            .field("start", &self.start)
            .field("len", &self.len)
            .finish()
    }
}

/// Read access to a published block.
pub struct ReadBlock {
    ring: Arc<Ring>,
    id: u64,
    bytes: usize,
}

impl ReadBlock {
    pub(crate) fn new(ring: Arc<Ring>, id: u64, bytes: usize) -> Self {
        Self { ring, id, bytes }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Number of valid bytes the writer committed.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.bytes
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    /// The committed bytes.
    ///
    /// For consuming readers the contents are stable until the block is
    /// closed. A viewer does not hold the writer back, so it must check
    /// [`is_intact`](Self::is_intact) after copying what it needs.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        let ptr = self.ring.block_ptr(self.id, 0, self.bytes);
        // SAFETY: in bounds (bytes <= bufsz). The writer does not reuse the
        // slot while a consuming reader holds it.
        unsafe { std::slice::from_raw_parts(ptr, self.bytes) }
    }

    /// `false` once the writer has started reusing this block's slot.
    #[must_use]
    pub fn is_intact(&self) -> bool {
        self.ring.write_count() < self.id + self.ring.geometry().nbufs
    }

    pub(crate) fn belongs_to(&self, ring: &Arc<Ring>) -> bool {
        Arc::ptr_eq(&self.ring, ring)
    }
}

impl std::fmt::Debug for ReadBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadBlock")
            .field("ring", &self.ring.path())
            .field("id", &self.id)
            .field("bytes", &self.bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_page_aligns_data() {
        let geometry = RingGeometry {
            nbufs: 4,
            bufsz: 8192,
            nreaders: 1,
        };
        let layout = geometry.layout().unwrap();
        assert_eq!(layout.data_offset % PAGE_SIZE, 0);
        assert!(layout.data_offset >= layout.meta_offset + 4 * size_of::<BlockMeta>());
        assert_eq!(layout.total_len, layout.data_offset + 4 * 8192);
    }

    #[test]
    fn test_geometry_rejects_zero_and_too_many_readers() {
        let zero = RingGeometry {
            nbufs: 0,
            bufsz: 8192,
            nreaders: 1,
        };
        assert!(matches!(zero.validate(), Err(RingError::Geometry { .. })));

        let readers = RingGeometry {
            nbufs: 4,
            bufsz: 8192,
            nreaders: MAX_READERS as u32 + 1,
        };
        assert!(matches!(readers.validate(), Err(RingError::Geometry { .. })));
    }

    #[test]
    fn test_geometry_overflow_detected() {
        let huge = RingGeometry {
            nbufs: u64::MAX,
            bufsz: u64::MAX,
            nreaders: 1,
        };
        assert!(huge.validate().is_err());
    }

    #[test]
    fn test_wait_until_times_out() {
        let start = Instant::now();
        let ready = wait_until(Timeout::Duration(Duration::from_millis(5)), || false);
        assert!(!ready);
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn test_wait_until_ready_immediately() {
        assert!(wait_until(Timeout::Infinite, || true));
    }

    #[test]
    fn test_timeout_from_option() {
        assert_eq!(Timeout::from(None), Timeout::Infinite);
        assert_eq!(
            Timeout::from(Some(Duration::from_secs(1))),
            Timeout::Duration(Duration::from_secs(1))
        );
    }
}
