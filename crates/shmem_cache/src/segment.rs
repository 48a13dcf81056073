// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! POSIX named shared memory segments.
//!
//! A [`Segment`] is one process's mapping of a named shared memory object. Every process that
//! opens the same name maps the same physical pages, which is the only channel the cache uses to
//! communicate between processes.

use std::ffi::CString;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::{self, NonNull};

use crate::error::{Error, Result};

/// Permission bits for newly created shared memory objects (owner read/write).
const SEGMENT_MODE: libc::c_uint = 0o600;

/// A shared memory mapping, unmapped when dropped.
///
/// The contents of a freshly created segment are zero. Dropping a segment only removes this
/// process's mapping; other processes keep theirs.
#[derive(Debug)]
pub struct Segment {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: A segment is plain memory. Synchronizing access to its contents is the responsibility of
// the types laid over it, which only expose atomics or explicitly `unsafe` accessors.
unsafe impl Send for Segment {}

// SAFETY: See the `Send` impl above; shared references to the segment only expose its address.
unsafe impl Sync for Segment {}

impl Segment {
    /// Creates a new shared memory object of `len` bytes and maps it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SharedMemory`] if an object with this name already exists or the system
    /// refuses to create or map it, and [`Error::InvalidConfiguration`] for a zero `len` or a name
    /// containing NUL.
    pub fn create(name: &str, len: usize) -> Result<Self> {
        let fd = open_fd(name, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR)?;
        grow(&fd, len)?;
        Self::map(&fd, len)
    }

    /// Maps an existing shared memory object, which must be at least `len` bytes long.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SharedMemory`] if the object does not exist or cannot be mapped, and
    /// [`Error::InvalidConfiguration`] if it is smaller than `len`.
    pub fn open(name: &str, len: usize) -> Result<Self> {
        let fd = open_fd(name, libc::O_RDWR)?;
        let actual = file_len(&fd)?;
        if actual < len {
            return Err(Error::invalid_configuration(format!(
                "segment {name} holds {actual} bytes but {len} were expected; were all group members constructed with the same parameters?"
            )));
        }

        Self::map(&fd, len)
    }

    /// Maps the shared memory object `name`, creating it if it does not exist yet.
    ///
    /// Any number of processes may race on this call; all of them end up mapping the same object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SharedMemory`] if the object cannot be opened, sized or mapped.
    pub fn open_or_create(name: &str, len: usize) -> Result<Self> {
        let fd = open_fd(name, libc::O_CREAT | libc::O_RDWR)?;
        if file_len(&fd)? < len {
            grow(&fd, len)?;
        }

        Self::map(&fd, len)
    }

    /// Removes the name of a shared memory object. Existing mappings stay valid.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SharedMemory`] if no object has this name.
    pub fn unlink(name: &str) -> Result<()> {
        let name = segment_name(name)?;

        // SAFETY: `name` is a valid NUL-terminated string for the duration of the call.
        let rc = unsafe { libc::shm_unlink(name.as_ptr()) };
        if rc != 0 {
            return Err(Error::last_os_error("shm_unlink"));
        }

        Ok(())
    }

    /// Returns the base address of the mapping in this process.
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Returns the length of the mapping in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the mapping is zero bytes long, which never happens for a mapped segment.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn map(fd: &OwnedFd, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::invalid_configuration("cannot map a zero-length segment"));
        }

        // SAFETY: We ask the kernel for a fresh shared mapping of a valid descriptor. No existing
        // memory is affected. The descriptor may be closed once the mapping exists.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            return Err(Error::last_os_error("mmap"));
        }

        let ptr = NonNull::new(addr.cast::<u8>()).ok_or_else(|| Error::SharedMemory {
            operation: "mmap",
            source: std::io::Error::other("mmap returned a null mapping"),
        })?;

        Ok(Self { ptr, len })
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: The pointer and length describe a mapping created by `map` that nothing else
        // unmaps. Every borrow of the mapping is tied to the lifetime of this segment.
        let rc = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
        debug_assert_eq!(rc, 0, "munmap of a live segment failed");
    }
}

fn segment_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|e| Error::invalid_configuration(format!("segment name {name:?} is not valid: {e}")))
}

fn open_fd(name: &str, flags: libc::c_int) -> Result<OwnedFd> {
    let name = segment_name(name)?;

    // SAFETY: `name` is a valid NUL-terminated string for the duration of the call.
    let fd = unsafe { libc::shm_open(name.as_ptr(), flags, SEGMENT_MODE) };
    if fd < 0 {
        return Err(Error::last_os_error("shm_open"));
    }

    // SAFETY: `fd` was just returned by a successful `shm_open` and has no other owner.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn grow(fd: &OwnedFd, len: usize) -> Result<()> {
    let len = libc::off_t::try_from(len).map_err(|e| Error::invalid_configuration(format!("segment length {len} is too large: {e}")))?;

    // SAFETY: `fd` is a valid descriptor owned by the caller.
    let rc = unsafe { libc::ftruncate(fd.as_raw_fd(), len) };
    if rc != 0 {
        return Err(Error::last_os_error("ftruncate"));
    }

    Ok(())
}

fn file_len(fd: &OwnedFd) -> Result<usize> {
    let mut stat = MaybeUninit::<libc::stat>::uninit();

    // SAFETY: `fd` is a valid descriptor and `stat` points to writable storage for the result.
    let rc = unsafe { libc::fstat(fd.as_raw_fd(), stat.as_mut_ptr()) };
    if rc != 0 {
        return Err(Error::last_os_error("fstat"));
    }

    // SAFETY: `fstat` succeeded, so it initialized the structure.
    let stat = unsafe { stat.assume_init() };

    // A negative size is impossible for a shared memory object; treat it as empty.
    Ok(usize::try_from(stat.st_size).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;

    use super::*;
    use crate::testing::unique_name;

    fn io_kind(error: &Error) -> ErrorKind {
        match error {
            Error::SharedMemory { source, .. } => source.kind(),
            other => panic!("expected a shared memory error, got {other:?}"),
        }
    }

    #[test]
    fn created_segment_is_zeroed_and_visible_through_second_mapping() {
        let name = unique_name("seg");
        let first = Segment::create(&name, 4096).expect("create");
        let second = Segment::open(&name, 4096).expect("open");
        Segment::unlink(&name).expect("unlink");

        // SAFETY: Both mappings are 4096 bytes long and no other thread touches them.
        let before = unsafe { first.as_ptr().add(100).read() };
        assert_eq!(before, 0);

        // SAFETY: As above.
        unsafe { first.as_ptr().add(100).write(42) };

        // SAFETY: As above.
        let seen = unsafe { second.as_ptr().add(100).read() };
        assert_eq!(seen, 42);
        assert_ne!(first.as_ptr(), second.as_ptr(), "each open creates a distinct mapping");
    }

    #[test]
    fn exclusive_create_rejects_existing_name() {
        let name = unique_name("excl");
        let _segment = Segment::create(&name, 64).expect("create");

        let error = Segment::create(&name, 64).expect_err("name is taken");
        assert_eq!(io_kind(&error), ErrorKind::AlreadyExists);

        Segment::unlink(&name).expect("unlink");
    }

    #[test]
    fn open_missing_segment_fails() {
        let error = Segment::open(&unique_name("missing"), 64).expect_err("nothing to open");
        assert_eq!(io_kind(&error), ErrorKind::NotFound);
    }

    #[test]
    fn open_rejects_segment_smaller_than_expected() {
        let name = unique_name("small");
        let _segment = Segment::create(&name, 64).expect("create");

        let error = Segment::open(&name, 128).expect_err("too small");
        assert!(matches!(error, Error::InvalidConfiguration(_)), "{error:?}");

        Segment::unlink(&name).expect("unlink");
    }

    #[test]
    fn open_or_create_is_idempotent() {
        let name = unique_name("ooc");
        let first = Segment::open_or_create(&name, 256).expect("first");
        let second = Segment::open_or_create(&name, 256).expect("second");
        Segment::unlink(&name).expect("unlink");

        assert_eq!(first.len(), 256);
        assert_eq!(second.len(), 256);
    }

    #[test]
    fn zero_length_segment_is_rejected() {
        let name = unique_name("zero");
        let error = Segment::create(&name, 0).expect_err("zero length");
        assert!(matches!(error, Error::InvalidConfiguration(_)), "{error:?}");
        let _ = Segment::unlink(&name);
    }

    #[test]
    fn name_with_nul_is_rejected() {
        let error = Segment::create("/bad\0name", 64).expect_err("invalid name");
        assert!(matches!(error, Error::InvalidConfiguration(_)), "{error:?}");
    }
}
