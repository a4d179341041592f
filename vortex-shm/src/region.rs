//! Named POSIX shared memory objects.

use core::ffi::c_void;
use core::num::NonZeroUsize;
use core::ptr::NonNull;
use std::ffi::CStr;
use std::fs::File;
use std::io;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc::off_t;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;

use crate::error::ZoneError;
use crate::offset::Arena;

/// One process's mapping of a zone.
#[derive(Debug)]
pub(crate) struct ShmRegion {
    ptr: NonNull<c_void>,
    len: usize,
}

// SAFETY: the mapping is plain shared memory; all access to its contents goes through
// atomics or the zone lock.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Create the object at `size` bytes. Fails with `EEXIST` if the name is taken.
    ///
    /// A freshly truncated object reads as zeroes, which is the "unlocked,
    /// uninitialized" state of a zone header.
    pub(crate) fn create(name: &CStr, size: usize) -> Result<(), nix::Error> {
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )?;
        let len = off_t::try_from(size).map_err(|_| Errno::EFBIG)?;
        if let Err(err) = ftruncate(&fd, len) {
            let _ = shm_unlink(name);
            return Err(err);
        }
        Ok(())
    }

    /// Map an existing object, expecting at least `size` bytes.
    pub(crate) fn open(name: &CStr, size: usize) -> Result<Self, ZoneError> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty())?;
        let file = File::from(fd);

        let actual = file.metadata()?.len();
        if actual < size as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("shared memory object holds {actual} bytes, expected {size}"),
            )
            .into());
        }

        let len = NonZeroUsize::new(size).ok_or(Errno::EINVAL)?;
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                0,
            )?
        };
        // the mapping outlives the descriptor
        Ok(Self { ptr, len: size })
    }

    pub(crate) fn unlink(name: &CStr) -> Result<(), nix::Error> {
        shm_unlink(name)
    }

    pub(crate) fn arena(&self) -> Arena {
        // SAFETY: `len` bytes stay mapped until drop, and the arena is owned next to
        // the region by `Zone`.
        unsafe { Arena::new(self.ptr.cast(), self.len) }
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        if let Err(err) = unsafe { munmap(self.ptr, self.len) } {
            tracing::error!(%err, "failed to unmap zone");
        }
    }
}
