//! Slab allocator over the zone.
//!
//! The heap part of the zone is carved from a bump cursor in power-of-two size
//! classes. Freed chunks go onto a per-class free list whose links live in the first
//! four bytes of each free chunk, so the bookkeeping in the header is fixed size no
//! matter how many records exist. All of it is shared state: callers hold the zone
//! lock for the whole lifetime of a [`SlabAllocator`].

use crate::error::ZoneError;
use crate::offset::{Arena, ZoneOffset};

/// Chunk sizes handed out by the allocator.
pub const SIZE_CLASSES: [u32; 10] = [16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192];

/// Largest record the allocator serves.
pub const MAX_RECORD_SIZE: usize = 8192;

/// Alignment of every chunk.
pub const CHUNK_ALIGN: u32 = 16;

const CLASS_COUNT: usize = SIZE_CLASSES.len();

/// Allocator bookkeeping stored in the zone header.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SlabState {
    start: u32,
    next: u32,
    end: u32,
    live: u32,
    free: [u32; CLASS_COUNT],
}

impl SlabState {
    /// Bookkeeping for a heap spanning `start..end`, `start` rounded up to a chunk.
    pub(crate) fn new(start: u32, end: u32) -> Self {
        let start = start.div_ceil(CHUNK_ALIGN) * CHUNK_ALIGN;
        Self {
            start,
            next: start,
            end,
            live: 0,
            free: [0; CLASS_COUNT],
        }
    }

    /// Bytes taken from the bump cursor so far, free-listed chunks included.
    pub(crate) fn carved(&self) -> usize {
        (self.next - self.start) as usize
    }

    /// Bytes never handed out yet.
    pub(crate) fn untouched(&self) -> usize {
        self.end.saturating_sub(self.next) as usize
    }

    /// Allocations currently live.
    pub(crate) fn live(&self) -> u32 {
        self.live
    }
}

/// Index of the smallest class holding `size` bytes.
pub(crate) fn class_of(size: usize) -> Result<usize, ZoneError> {
    SIZE_CLASSES
        .iter()
        .position(|&class| size <= class as usize)
        .ok_or(ZoneError::RecordTooLarge(size))
}

/// Chunk size actually used for a `size` byte request.
pub fn chunk_size(size: usize) -> Result<usize, ZoneError> {
    class_of(size).map(|c| SIZE_CLASSES[c] as usize)
}

/// Allocator view over a zone, valid while the zone lock is held.
pub(crate) struct SlabAllocator<'a> {
    arena: &'a Arena,
    state: &'a mut SlabState,
}

impl<'a> SlabAllocator<'a> {
    pub(crate) fn new(arena: &'a Arena, state: &'a mut SlabState) -> Self {
        Self { arena, state }
    }

    /// Allocate a zeroed chunk of at least `size` bytes.
    pub(crate) fn allocate(&mut self, size: usize) -> Result<ZoneOffset, ZoneError> {
        let class = class_of(size)?;
        let chunk = SIZE_CLASSES[class];

        let offset = match ZoneOffset::new(self.state.free[class]) {
            Some(head) => {
                let next: u32 = self.arena.load(head.get())?;
                if next != 0 && next >= self.state.next {
                    return Err(ZoneError::Corrupted("free list link past the heap"));
                }
                self.state.free[class] = next;
                head
            }
            None => {
                let end = self
                    .state
                    .next
                    .checked_add(chunk)
                    .filter(|&end| end <= self.state.end)
                    .ok_or(ZoneError::OutOfSpace { requested: size })?;
                let offset = ZoneOffset::new(self.state.next)
                    .ok_or(ZoneError::Corrupted("heap starts at offset zero"))?;
                self.state.next = end;
                offset
            }
        };

        self.arena.zero(offset.get(), chunk as usize)?;
        self.state.live += 1;
        Ok(offset)
    }

    /// Return a chunk obtained from [`allocate`](Self::allocate) with the same `size`.
    pub(crate) fn free(&mut self, offset: ZoneOffset, size: usize) -> Result<(), ZoneError> {
        let class = class_of(size)?;
        let raw = offset.get();
        if raw < self.state.start
            || raw % CHUNK_ALIGN != 0
            || raw.saturating_add(SIZE_CLASSES[class]) > self.state.next
        {
            return Err(ZoneError::Corrupted("freeing a chunk outside the heap"));
        }
        if self.state.live == 0 {
            return Err(ZoneError::Corrupted("free with no live allocations"));
        }

        self.arena.store(raw, self.state.free[class])?;
        self.state.free[class] = raw;
        self.state.live -= 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ptr::NonNull;

    const START: u32 = 64;

    fn heap(bytes: usize) -> (Vec<u64>, Arena) {
        let mut buf = vec![0u64; bytes / 8];
        let arena = unsafe { Arena::new(NonNull::new(buf.as_mut_ptr().cast()).unwrap(), bytes) };
        (buf, arena)
    }

    #[test]
    fn classes_round_up() {
        assert_eq!(chunk_size(0).unwrap(), 16);
        assert_eq!(chunk_size(16).unwrap(), 16);
        assert_eq!(chunk_size(17).unwrap(), 32);
        assert_eq!(chunk_size(40).unwrap(), 64);
        assert_eq!(chunk_size(MAX_RECORD_SIZE).unwrap(), MAX_RECORD_SIZE);
        assert!(matches!(
            chunk_size(MAX_RECORD_SIZE + 1),
            Err(ZoneError::RecordTooLarge(_))
        ));
    }

    #[test]
    fn start_is_chunk_aligned() {
        let state = SlabState::new(70, 1024);
        assert_eq!(state.start, 80);
        assert_eq!(state.untouched(), 1024 - 80);
    }

    #[test]
    fn exhaustion_leaves_existing_chunks_intact() {
        const M: u32 = 5;
        let (_buf, arena) = heap((START + M * 64) as usize);
        let mut state = SlabState::new(START, START + M * 64);
        let mut slab = SlabAllocator::new(&arena, &mut state);

        let mut chunks = Vec::new();
        for i in 0..M {
            let off = slab.allocate(40).unwrap();
            arena.store(off.get(), u64::from(i) * 0x0101_0101).unwrap();
            chunks.push(off);
        }

        assert!(matches!(
            slab.allocate(40),
            Err(ZoneError::OutOfSpace { requested: 40 })
        ));
        for (i, off) in chunks.iter().enumerate() {
            assert_eq!(arena.load::<u64>(off.get()).unwrap(), i as u64 * 0x0101_0101);
        }
        assert_eq!(state.live(), M);
    }

    #[test]
    fn freed_chunks_are_reused_and_zeroed() {
        let (_buf, arena) = heap(4096);
        let mut state = SlabState::new(START, 4096);
        let mut slab = SlabAllocator::new(&arena, &mut state);

        let a = slab.allocate(100).unwrap();
        let b = slab.allocate(100).unwrap();
        arena.store(a.get(), u64::MAX).unwrap();
        slab.free(a, 100).unwrap();

        let c = slab.allocate(128).unwrap();
        assert_eq!(c, a);
        assert_eq!(arena.load::<u64>(c.get()).unwrap(), 0);

        // a different class never takes the 128 byte chunk
        slab.free(c, 128).unwrap();
        let d = slab.allocate(8).unwrap();
        assert_ne!(d, a);
        assert!(d.get() > b.get());
        assert_eq!(state.live(), 2);
    }

    #[test]
    fn bogus_free_is_reported() {
        let (_buf, arena) = heap(4096);
        let mut state = SlabState::new(START, 4096);
        let mut slab = SlabAllocator::new(&arena, &mut state);
        let a = slab.allocate(16).unwrap();

        let outside = ZoneOffset::new(2048).unwrap();
        assert!(matches!(slab.free(outside, 16), Err(ZoneError::Corrupted(_))));
        slab.free(a, 16).unwrap();
        assert!(matches!(slab.free(a, 16), Err(ZoneError::Corrupted(_))));
    }
}
