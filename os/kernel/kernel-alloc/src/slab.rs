//! # Slab Caches
//!
//! Fixed-size object caches on top of the [`Heap`]. A cache takes whole slabs
//! of `chunks_per_slab` chunks from the heap and hands chunks out of them.
//! Occupancy is a bitmap per slab, so like the heap the cache never touches
//! the memory it manages.
//!
//! ```text
//!  slab.base
//!  │ chunk 0 │ chunk 1 │ chunk 2 │ ... │ chunk n-1 │    live: 0b...0101
//! ```
//!
//! Empty slabs stay with the cache until [`shrink`](SlabCache::shrink) or
//! [`destroy`](SlabCache::destroy) hands them back to the heap.

use crate::heap::{Heap, HeapGrowth, MIN_BLOCK};
use kernel_memory_addresses::VirtualAddress;
use kernel_status::{KResult, Status};
use kernel_vmem::align_up;

/// Chunks per slab are tracked in one `u64`.
pub const MAX_CHUNKS_PER_SLAB: u32 = 64;

/// Chunk sizes are rounded up to this.
pub const CHUNK_ALIGN: u32 = 8;

/// A slab owned by a cache; `base == 0` marks a vacant entry.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct Slab {
    base: u32,
    live: u64,
}

impl Slab {
    pub const VACANT: Self = Self { base: 0, live: 0 };

    const fn is_vacant(&self) -> bool {
        self.base == 0
    }
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct SlabStats {
    pub slabs: usize,
    pub live_chunks: u32,
    pub free_chunks: u32,
}

pub struct SlabCache<'s> {
    chunk_size: u32,
    chunks: u32,
    slabs: &'s mut [Slab],
}

impl<'s> SlabCache<'s> {
    /// An empty cache that can hold up to `slabs.len()` slabs.
    ///
    /// # Errors
    /// [`Status::BadParameter`] for a zero chunk size or count, more than
    /// [`MAX_CHUNKS_PER_SLAB`] chunks, no slab entries, or a slab size that
    /// overflows.
    pub fn new(chunk_size: u32, chunks_per_slab: u32, slabs: &'s mut [Slab]) -> KResult<Self> {
        if chunk_size == 0 || chunks_per_slab == 0 || chunks_per_slab > MAX_CHUNKS_PER_SLAB || slabs.is_empty() {
            return Err(Status::BadParameter);
        }
        let chunk_size = align_up(chunk_size, CHUNK_ALIGN).ok_or(Status::BadParameter)?;
        chunk_size
            .checked_mul(chunks_per_slab)
            .ok_or(Status::BadParameter)?;
        slabs.fill(Slab::VACANT);
        Ok(Self {
            chunk_size,
            chunks: chunks_per_slab,
            slabs,
        })
    }

    /// Bytes between two chunks; the requested size rounded up.
    #[inline]
    #[must_use]
    pub const fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    const fn slab_len(&self) -> u32 {
        self.chunk_size * self.chunks
    }

    const fn full_mask(&self) -> u64 {
        if self.chunks == MAX_CHUNKS_PER_SLAB {
            u64::MAX
        } else {
            (1 << self.chunks) - 1
        }
    }

    /// Hand out a free chunk, taking a new slab from `heap` if every slab is
    /// full.
    ///
    /// # Errors
    /// - [`Status::MmTooManyEntries`] if a new slab is needed and the cache
    ///   holds as many as it can track.
    /// - As [`Heap::allocate_aligned`] for the new slab.
    pub fn allocate<G: HeapGrowth + ?Sized>(
        &mut self,
        heap: &mut Heap<'_>,
        growth: &mut G,
    ) -> KResult<VirtualAddress> {
        let full = self.full_mask();
        let index = match self.slabs.iter().position(|s| !s.is_vacant() && s.live != full) {
            Some(i) => i,
            None => {
                let Some(i) = self.slabs.iter().position(Slab::is_vacant) else {
                    log::warn!("slab: cache of {}-byte chunks is full", self.chunk_size);
                    return Err(Status::MmTooManyEntries);
                };
                let base = heap.allocate_aligned(self.slab_len(), MIN_BLOCK, growth)?;
                log::trace!("slab: new slab at {base} for {}-byte chunks", self.chunk_size);
                self.slabs[i] = Slab {
                    base: base.as_u32(),
                    live: 0,
                };
                i
            }
        };
        let stride = self.chunk_size;
        let slab = &mut self.slabs[index];
        let chunk = (!slab.live).trailing_zeros();
        slab.live |= 1 << chunk;
        Ok(VirtualAddress::new(slab.base + chunk * stride))
    }

    /// Return a chunk to its slab. A null pointer is ignored.
    ///
    /// # Errors
    /// [`Status::BadParameter`] if `ptr` is not the start of a live chunk of
    /// this cache.
    pub fn free(&mut self, ptr: VirtualAddress) -> KResult<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let (index, chunk) = self.locate(ptr).ok_or_else(|| {
            log::warn!("slab: free of foreign pointer {ptr}");
            Status::BadParameter
        })?;
        let slab = &mut self.slabs[index];
        if slab.live & (1 << chunk) == 0 {
            log::warn!("slab: double free of {ptr}");
            return Err(Status::BadParameter);
        }
        slab.live &= !(1 << chunk);
        Ok(())
    }

    /// Whether `ptr` is a live chunk of this cache.
    #[must_use]
    pub fn owns(&self, ptr: VirtualAddress) -> bool {
        self.locate(ptr)
            .is_some_and(|(i, chunk)| self.slabs[i].live & (1 << chunk) != 0)
    }

    /// Hand empty slabs back to `heap`; returns how many were released.
    ///
    /// # Errors
    /// As [`Heap::free`]; slabs released before the error stay released.
    pub fn shrink(&mut self, heap: &mut Heap<'_>) -> KResult<usize> {
        let mut released = 0;
        for slab in self.slabs.iter_mut().filter(|s| !s.is_vacant() && s.live == 0) {
            heap.free(VirtualAddress::new(slab.base))?;
            *slab = Slab::VACANT;
            released += 1;
        }
        Ok(released)
    }

    /// Hand every slab back to `heap`. The cache stays usable and starts
    /// out empty.
    ///
    /// # Errors
    /// - [`Status::OperationNotAllowed`] while any chunk is live; nothing is
    ///   released then.
    /// - As [`Heap::free`].
    pub fn destroy(&mut self, heap: &mut Heap<'_>) -> KResult<()> {
        if self.slabs.iter().any(|s| s.live != 0) {
            return Err(Status::OperationNotAllowed);
        }
        self.shrink(heap).map(|_| ())
    }

    #[must_use]
    pub fn stats(&self) -> SlabStats {
        let (slabs, live) = self
            .slabs
            .iter()
            .filter(|s| !s.is_vacant())
            .fold((0, 0), |(n, live), s| (n + 1, live + s.live.count_ones()));
        #[allow(clippy::cast_possible_truncation)]
        let total = slabs as u32 * self.chunks;
        SlabStats {
            slabs,
            live_chunks: live,
            free_chunks: total - live,
        }
    }

    /// Slab index and chunk number of a chunk start inside this cache.
    fn locate(&self, ptr: VirtualAddress) -> Option<(usize, u32)> {
        let p = ptr.as_u32();
        let len = self.slab_len();
        let index = self
            .slabs
            .iter()
            .position(|s| !s.is_vacant() && p >= s.base && p - s.base < len)?;
        let offset = p - self.slabs[index].base;
        offset
            .is_multiple_of(self.chunk_size)
            .then_some((index, offset / self.chunk_size))
    }
}
