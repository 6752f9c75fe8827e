//! POSIX shared memory regions with typestate-based cleanup.
//!
//! A ring buffer channel lives in two named shared memory objects whose size
//! is only known at creation time, so this module maps raw byte regions rather
//! than a single typed value. Typed access to the control structures inside a
//! region goes through [`ShmRegion::view`], which is restricted to
//! [`SharedMemorySafe`] types.
//!
//! # Overview
//!
//! - [`ShmRegion<Mode>`] - a mapped region of `len` bytes
//! - [`Creator`] - creates the object, unlinks the name on drop
//! - [`Opener`] - maps an existing object, leaves the name on drop
//!
//! ```no_run
//! use telstream::ipc::shmem::{Creator, Opener, ShmRegion};
//!
//! // Process A: create a 1 MiB region (zero filled by the kernel)
//! let owner = ShmRegion::<Creator>::create("/telstream-doc", 1 << 20)?;
//!
//! // Process B: map it, size is taken from the object itself
//! let view = ShmRegion::<Opener>::open("/telstream-doc")?;
//! assert_eq!(view.len(), owner.len());
//! # Ok::<(), telstream::ipc::shmem::ShmError>(())
//! ```
//!
//! # Unsafety Encapsulation
//!
//! ```text
//! Unsafe POSIX operations:    Safe Rust wrappers:
//! ┌──────────────────┐        ┌─────────────────────────┐
//! │ shm_open()       │───────>│ ShmRegion::create()     │
//! │ mmap()           │───────>│ ShmRegion::open()       │
//! │ munmap()         │───────>│ Drop::drop()            │
//! │ shm_unlink()     │───────>│ Drop::drop() (Creator)  │
//! │ *mut T           │───────>│ ShmRegion::view()       │
//! └──────────────────┘        └─────────────────────────┘
//! ```
//!
//! Byte-level access to block payloads is crate-private; the ring buffer hands
//! out bounds-checked block handles instead of raw pointers.

use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr::{NonNull, null_mut};
use std::sync::atomic::*;

use rustix::fs::{Mode, fstat, ftruncate};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::{io, shm};

/// Result alias for shared memory operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Contextual errors produced by [`ShmRegion`].
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    /// The provided POSIX shared memory name is invalid.
    #[error("invalid shared memory path `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    /// `mmap`, `shm_open`, `ftruncate`, etc. failed with an errno.
    #[error("{op} failed for `{path}`: {source}")]
    PosixError {
        op: &'static str,
        path: String,
        source: io::Errno,
    },
    /// The requested or existing object size is unusable.
    #[error("shared memory `{path}` has unusable size {size}")]
    BadSize { path: String, size: u64 },
    /// The creator never published its initialisation marker.
    #[error("shared memory `{path}` was not initialised in time")]
    InitTimeout { path: String },
}

impl ShmError {
    fn posix(op: &'static str, path: &str, err: io::Errno) -> Self {
        Self::PosixError {
            op,
            path: path.to_string(),
            source: err,
        }
    }

    /// Returns `true` if the failure was a permission denial.
    ///
    /// Sandboxed environments commonly forbid `/dev/shm`; tests use this to
    /// skip instead of fail.
    #[must_use]
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PosixError { source, .. } if *source == io::Errno::ACCESS)
    }

    /// Returns `true` if the object did not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::PosixError { source, .. } if *source == io::Errno::NOENT)
    }
}

/// Cleanup behaviour for a mapping.
///
/// `ShmRegion<Creator>` and `ShmRegion<Opener>` are different types with
/// different `Drop` behaviour:
///
/// ```text
/// Creator          Opener
///    ↓                ↓
/// munmap()        munmap()
/// unlink()        (no unlink)
/// ```
pub trait ShmMode {
    /// Whether to unlink the shared memory name on drop.
    const SHOULD_UNLINK: bool;
}

/// Typestate marker for the process that creates the object.
pub struct Creator;
impl ShmMode for Creator {
    const SHOULD_UNLINK: bool = true;
}

/// Typestate marker for processes that attach to an existing object.
pub struct Opener;
impl ShmMode for Opener {
    const SHOULD_UNLINK: bool = false;
}

/// Types safe to place in shared memory and access from several processes.
///
/// # Safety
///
/// Implementers must guarantee:
///
/// | Property | Requirement |
/// |----------|-------------|
/// | **Layout** | `#[repr(C)]` or `#[repr(transparent)]` |
/// | **Zero init** | the all-zero bit pattern is a valid value |
/// | **Pointers** | no heap/stack pointers or references |
/// | **Fields** | all fields are `SharedMemorySafe` |
/// | **Drop** | safe if `Drop` never runs |
/// | **Concurrency** | `Send + Sync`, mutation only through atomics |
///
/// The zero-init rule replaces a `Default` bound: fresh objects are zero
/// filled by `ftruncate`, and the creator publishes its own initialisation
/// through an atomic marker afterwards.
pub unsafe trait SharedMemorySafe: Send + Sync {}

macro_rules! impl_shared_memory_safe {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl SharedMemorySafe for $t {}
        )*
    };
}

impl_shared_memory_safe! {
    i8, i16, i32, i64, i128, isize,
    u8, u16, u32, u64, u128, usize,
    AtomicBool,
    AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize,
    AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize,
}

unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for [T; N] {}

const POSIX_NAME_MAX: usize = 255;

/// Validates that a path meets POSIX `shm_open` requirements.
fn validate_shm_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path must start with '/'",
        });
    }

    if path[1..].contains('/') {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path must not contain additional '/' characters",
        });
    }

    if path.len() > POSIX_NAME_MAX {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path length must be <= 255 bytes",
        });
    }

    Ok(())
}

/// Removes a shared memory name, ignoring objects that do not exist.
///
/// # Errors
///
/// Returns an error for an invalid name or any failure other than `ENOENT`.
pub fn unlink(path: &str) -> Result<()> {
    validate_shm_path(path)?;
    match shm::unlink(path) {
        Ok(()) => Ok(()),
        Err(io::Errno::NOENT) => Ok(()),
        Err(err) => Err(ShmError::posix("shm_unlink", path, err)),
    }
}

/// A mapped POSIX shared memory object.
///
/// # Safety Invariants
///
/// - `ptr` points to `len` bytes obtained from `mmap()` with read/write access
/// - the mapping stays valid until `Drop`
/// - `ptr` is page aligned
pub struct ShmRegion<Mode: ShmMode> {
    ptr: NonNull<u8>,
    len: usize,
    path: String,
    _mode: PhantomData<Mode>,
}

// SAFETY: the mapping is process-wide memory, not thread-local data. All
// concurrent mutation goes through atomics or through block ownership
// enforced by the ring buffer protocol.
unsafe impl<Mode: ShmMode> Send for ShmRegion<Mode> {}

// SAFETY: see above; shared references only expose `SharedMemorySafe` views.
unsafe impl<Mode: ShmMode> Sync for ShmRegion<Mode> {}

/// Maps `len` bytes of `fd` read/write and shared.
fn map_fd(fd: &rustix::fd::OwnedFd, len: usize, path: &str) -> Result<NonNull<u8>> {
    // SAFETY: fresh mapping requested from the kernel at an address of its
    // choosing, so nothing in this process is aliased. The object is at least
    // `len` bytes long (checked or set by the caller).
    let ptr = unsafe {
        mmap(
            null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
    }
    .map_err(|err| ShmError::posix("mmap", path, err))?;

    NonNull::new(ptr.cast::<u8>()).ok_or_else(|| ShmError::posix("mmap", path, io::Errno::NOMEM))
}

impl ShmRegion<Creator> {
    /// Creates a new object of `len` bytes and maps it.
    ///
    /// The contents start zeroed. Fails with `EEXIST` if the name is taken.
    ///
    /// # Errors
    ///
    /// Invalid name, zero length, or any POSIX failure. On failure after the
    /// object was created, the name is unlinked again.
    pub fn create(path: &str, len: usize) -> Result<Self> {
        validate_shm_path(path)?;
        if len == 0 {
            return Err(ShmError::BadSize {
                path: path.to_string(),
                size: 0,
            });
        }

        let fd = shm::open(
            path,
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP,
        )
        .map_err(|err| ShmError::posix("shm_open", path, err))?;

        if let Err(e) = ftruncate(&fd, len as u64) {
            drop(fd);
            let _ = shm::unlink(path);
            return Err(ShmError::posix("ftruncate", path, e));
        }

        let ptr = match map_fd(&fd, len, path) {
            Ok(ptr) => ptr,
            Err(err) => {
                drop(fd);
                let _ = shm::unlink(path);
                return Err(err);
            }
        };

        Ok(Self {
            ptr,
            len,
            path: path.to_string(),
            _mode: PhantomData,
        })
    }
}

impl ShmRegion<Creator> {
    /// Gives up ownership of the name: the object outlives this mapping.
    #[must_use]
    pub fn persist(self) -> ShmRegion<Opener> {
        let mut this = std::mem::ManuallyDrop::new(self);
        ShmRegion {
            ptr: this.ptr,
            len: this.len,
            path: std::mem::take(&mut this.path),
            _mode: PhantomData,
        }
    }
}

impl ShmRegion<Opener> {
    /// Maps an existing object in full.
    ///
    /// # Errors
    ///
    /// `ENOENT` if the object does not exist, `EACCES` on permissions, or
    /// [`ShmError::BadSize`] if the object is empty.
    pub fn open(path: &str) -> Result<Self> {
        validate_shm_path(path)?;

        let fd = shm::open(path, shm::OFlags::RDWR, Mode::empty())
            .map_err(|err| ShmError::posix("shm_open", path, err))?;

        let stat = fstat(&fd).map_err(|err| ShmError::posix("fstat", path, err))?;
        let len = match usize::try_from(stat.st_size) {
            Ok(len) if len > 0 => len,
            _ => {
                return Err(ShmError::BadSize {
                    path: path.to_string(),
                    size: stat.st_size.max(0) as u64,
                });
            }
        };

        let ptr = map_fd(&fd, len, path)?;

        Ok(Self {
            ptr,
            len,
            path: path.to_string(),
            _mode: PhantomData,
        })
    }
}

impl<Mode: ShmMode> ShmRegion<Mode> {
    /// Size of the mapping in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Always `false`; zero-length regions cannot be created or opened.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The POSIX name of the object.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns a typed view of the value stored at `offset`.
    ///
    /// Returns `None` if the value would not fit or `offset` is misaligned.
    #[must_use]
    pub fn view<T: SharedMemorySafe>(&self, offset: usize) -> Option<&T> {
        let end = offset.checked_add(size_of::<T>())?;
        if end > self.len || offset % align_of::<T>() != 0 {
            return None;
        }
        // SAFETY: in bounds and aligned (the base is page aligned). T is
        // valid for the all-zero pattern and only mutated through atomics.
        Some(unsafe { &*self.ptr.as_ptr().add(offset).cast::<T>() })
    }

    /// Returns a typed view of `count` consecutive values starting at `offset`.
    #[must_use]
    pub fn view_slice<T: SharedMemorySafe>(&self, offset: usize, count: usize) -> Option<&[T]> {
        let bytes = size_of::<T>().checked_mul(count)?;
        let end = offset.checked_add(bytes)?;
        if end > self.len || offset % align_of::<T>() != 0 {
            return None;
        }
        // SAFETY: as for `view`.
        Some(unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(offset).cast::<T>(), count) })
    }

    /// Raw pointer to byte `offset` of the mapping.
    ///
    /// # Panics
    ///
    /// Panics if `offset + len` exceeds the mapping.
    pub(crate) fn byte_ptr(&self, offset: usize, len: usize) -> *mut u8 {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "byte range {offset}+{len} outside shared memory `{}` ({} bytes)",
            self.path,
            self.len
        );
        // SAFETY: bounds checked above.
        unsafe { self.ptr.as_ptr().add(offset) }
    }
}

impl<Mode: ShmMode> Drop for ShmRegion<Mode> {
    fn drop(&mut self) {
        // SAFETY: ptr/len are exactly what mmap returned and nothing borrowed
        // from this region can outlive it.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), self.len);
        }

        if Mode::SHOULD_UNLINK {
            let _ = shm::unlink(&self.path);
        }
    }
}

impl<Mode: ShmMode> std::fmt::Debug for ShmRegion<Mode> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmRegion")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("unlink_on_drop", &Mode::SHOULD_UNLINK)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_or_skip(path: &str, len: usize) -> Option<ShmRegion<Creator>> {
        let _ = shm::unlink(path);
        match ShmRegion::<Creator>::create(path, len) {
            Ok(region) => Some(region),
            Err(err) if err.is_permission_denied() => {
                eprintln!("Skipping shared memory test: {err}");
                None
            }
            Err(err) => panic!("create failed: {err}"),
        }
    }

    #[test]
    fn test_region_create_and_drop_unlinks() {
        let path = "/telstream-test-region-drop";
        let Some(region) = create_or_skip(path, 4096) else {
            return;
        };
        assert_eq!(region.len(), 4096);
        drop(region);

        let err = ShmRegion::<Opener>::open(path).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_region_creator_and_opener_share_memory() {
        let path = "/telstream-test-region-shared";
        let Some(creator) = create_or_skip(path, 8192) else {
            return;
        };

        let counter: &AtomicU64 = creator.view(64).unwrap();
        counter.store(100, Ordering::SeqCst);

        {
            let opener = ShmRegion::<Opener>::open(path).unwrap();
            assert_eq!(opener.len(), 8192);
            let seen: &AtomicU64 = opener.view(64).unwrap();
            assert_eq!(seen.load(Ordering::SeqCst), 100);
            seen.store(200, Ordering::SeqCst);
        }

        assert_eq!(counter.load(Ordering::SeqCst), 200);
    }

    #[test]
    fn test_region_view_bounds_and_alignment() {
        let path = "/telstream-test-region-view";
        let Some(region) = create_or_skip(path, 4096) else {
            return;
        };

        assert!(region.view::<AtomicU64>(4088).is_some());
        assert!(region.view::<AtomicU64>(4089).is_none());
        assert!(region.view::<AtomicU64>(4).is_none());
        assert!(region.view_slice::<AtomicU64>(0, 512).is_some());
        assert!(region.view_slice::<AtomicU64>(0, 513).is_none());
    }

    #[test]
    fn test_persisted_region_survives_drop() {
        let path = "/telstream-test-region-persist";
        let Some(region) = create_or_skip(path, 4096) else {
            return;
        };
        drop(region.persist());
        let reopened = ShmRegion::<Opener>::open(path).unwrap();
        assert_eq!(reopened.len(), 4096);
        drop(reopened);
        unlink(path).unwrap();
    }

    #[test]
    fn test_zero_length_rejected() {
        let result = ShmRegion::<Creator>::create("/telstream-test-zero", 0);
        assert!(matches!(result, Err(ShmError::BadSize { size: 0, .. })));
    }

    #[test]
    fn test_unlink_missing_is_ok() {
        assert!(unlink("/telstream-test-never-created").is_ok());
    }

    #[test]
    fn test_validate_shm_path_valid() {
        assert!(validate_shm_path("/valid").is_ok());
        assert!(validate_shm_path("/telstream-0000dada").is_ok());
    }

    #[test]
    fn test_validate_shm_path_no_leading_slash() {
        let result = validate_shm_path("no-slash");
        assert!(matches!(
            result,
            Err(ShmError::InvalidPath { reason, .. }) if reason == "path must start with '/'"
        ));
    }

    #[test]
    fn test_validate_shm_path_extra_slashes() {
        let result = validate_shm_path("/foo/bar");
        assert!(matches!(
            result,
            Err(ShmError::InvalidPath { reason, .. })
                if reason == "path must not contain additional '/' characters"
        ));
    }

    #[test]
    fn test_validate_shm_path_too_long() {
        let long_path = format!("/{}", "a".repeat(255));
        assert!(validate_shm_path(&long_path).is_err());

        let max_path = format!("/{}", "a".repeat(254));
        assert!(validate_shm_path(&max_path).is_ok());
    }
}
