//! Zone-relative addressing.
//!
//! Each process maps the zone at its own base address, so nothing stored in the zone
//! may be a pointer. Records refer to each other by byte offset from the start of the
//! region, and every offset is resolved against the local mapping through [`Arena`],
//! which refuses anything out of bounds or misaligned.

use core::mem;
use core::num::NonZeroU32;
use core::ptr::NonNull;
use std::fmt;

use crate::error::ZoneError;

/// A non-null byte offset from the start of the zone.
///
/// Offset 0 is the lock word and never a record, so it doubles as the null link in
/// shared structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ZoneOffset(NonZeroU32);

impl ZoneOffset {
    /// Wrap a raw offset, `None` for the null link.
    pub const fn new(raw: u32) -> Option<Self> {
        match NonZeroU32::new(raw) {
            Some(n) => Some(Self(n)),
            None => None,
        }
    }

    /// The raw offset.
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for ZoneOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.get())
    }
}

/// One process's view of a zone: a base address and a length.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Arena {
    base: NonNull<u8>,
    len: usize,
}

impl Arena {
    /// # Safety
    /// `base` must point to at least `len` readable and writable bytes that stay mapped
    /// for as long as the arena (or any copy of it) is used.
    pub(crate) unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    fn resolve(&self, offset: u32, size: usize, align: usize) -> Result<*mut u8, ZoneError> {
        let start = offset as usize;
        if start == 0 {
            return Err(ZoneError::Corrupted("null zone offset"));
        }
        match start.checked_add(size) {
            Some(end) if end <= self.len => {}
            _ => return Err(ZoneError::Corrupted("zone offset out of bounds")),
        }
        let ptr = unsafe { self.base.as_ptr().add(start) };
        if (ptr as usize) % align != 0 {
            return Err(ZoneError::Corrupted("misaligned zone offset"));
        }
        Ok(ptr)
    }

    /// Copy a `T` out of the zone.
    ///
    /// `T` must be plain data that is valid for any bit pattern.
    pub(crate) fn load<T: Copy>(&self, offset: u32) -> Result<T, ZoneError> {
        let ptr = self.resolve(offset, mem::size_of::<T>(), mem::align_of::<T>())?;
        Ok(unsafe { ptr.cast::<T>().read() })
    }

    /// Copy a `T` into the zone.
    pub(crate) fn store<T: Copy>(&self, offset: u32, value: T) -> Result<(), ZoneError> {
        let ptr = self.resolve(offset, mem::size_of::<T>(), mem::align_of::<T>())?;
        unsafe { ptr.cast::<T>().write(value) };
        Ok(())
    }

    /// Zero `len` bytes starting at `offset`.
    pub(crate) fn zero(&self, offset: u32, len: usize) -> Result<(), ZoneError> {
        let ptr = self.resolve(offset, len, 1)?;
        unsafe { ptr.write_bytes(0, len) };
        Ok(())
    }

    /// Borrow raw bytes of the zone for reading.
    ///
    /// # Safety
    /// The caller must hold the zone lock for the lifetime of the slice, and no mutable
    /// slice over the same bytes may be alive.
    pub(crate) unsafe fn bytes<'a>(&self, offset: u32, len: usize) -> Result<&'a [u8], ZoneError> {
        let ptr = self.resolve(offset, len, 1)?;
        Ok(core::slice::from_raw_parts(ptr, len))
    }

    /// Borrow raw bytes of the zone.
    ///
    /// # Safety
    /// The caller must hold the zone lock for the lifetime of the slice, and no other
    /// slice over the same bytes may be alive.
    pub(crate) unsafe fn bytes_mut<'a>(
        &self,
        offset: u32,
        len: usize,
    ) -> Result<&'a mut [u8], ZoneError> {
        let ptr = self.resolve(offset, len, 1)?;
        Ok(core::slice::from_raw_parts_mut(ptr, len))
    }
}
