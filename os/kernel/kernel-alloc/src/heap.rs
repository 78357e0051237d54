//! # Kernel Heap
//!
//! Byte-granular allocator over virtual ranges handed in by a [`HeapGrowth`]
//! source. The heap only keeps books: free ranges live in a [`FreeList`]
//! (best fit, coalesced), live blocks in an [`AvlTree`] keyed by the payload
//! address. It never touches the memory it manages.
//!
//! ```text
//!  block.start      payload (aligned)            block end
//!  │ sliver < 16 │  requested bytes   │ sliver < 16 │
//! ```
//!
//! Remainders of at least [`MIN_BLOCK`] bytes in front of or behind the
//! payload go back to the free index; smaller slivers stay with the block and
//! return with it on [`free`](Heap::free).

use crate::avl::{AvlTree, Slot};
use crate::free_list::FreeList;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::VirtualAddress;
use kernel_status::{KResult, Status};
use kernel_vmem::align_up;

/// Smallest free range the heap keeps; also the minimum payload alignment.
pub const MIN_BLOCK: u32 = 16;

/// Source of fresh heap memory.
pub trait HeapGrowth {
    /// Provide a mapped range of at least `min_len` bytes.
    ///
    /// # Errors
    /// Any status; the heap reports it as
    /// [`Status::MmDynamicMemoryAllocationFailure`].
    fn grow(&mut self, min_len: u32) -> KResult<(VirtualAddress, u32)>;
}

/// A live block.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Block {
    /// First byte owned by the block, including a leading sliver.
    pub start: u32,
    /// Bytes owned by the block.
    pub len: u32,
}

/// Arena slot of the live-block index.
pub type UsedSlot = Slot<u32, Block>;

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct HeapStats {
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub used_blocks: usize,
    pub free_blocks: usize,
    /// Bytes obtained from the growth source so far.
    pub total_bytes: u64,
}

pub struct Heap<'s> {
    free: FreeList<'s>,
    used: AvlTree<'s, u32, Block>,
    granule: u32,
    used_bytes: u64,
    total_bytes: u64,
}

impl<'s> Heap<'s> {
    /// An empty heap that grows by at least `granule` bytes at a time.
    pub fn new(free: FreeList<'s>, used: &'s mut [UsedSlot], granule: u32) -> Self {
        Self {
            free,
            used: AvlTree::new(used),
            granule: granule.max(PAGE_SIZE),
            used_bytes: 0,
            total_bytes: 0,
        }
    }

    /// Hand `[base, base + len)` to the heap without going through growth.
    ///
    /// # Errors
    /// As [`FreeList::insert`].
    pub fn add_region(&mut self, base: VirtualAddress, len: u32) -> KResult<()> {
        self.free.insert(base.as_u32(), len)?;
        self.total_bytes += u64::from(len);
        Ok(())
    }

    /// [`allocate_aligned`](Self::allocate_aligned) with the minimum alignment.
    ///
    /// # Errors
    /// As [`allocate_aligned`](Self::allocate_aligned).
    pub fn allocate<G: HeapGrowth + ?Sized>(&mut self, size: u32, growth: &mut G) -> KResult<VirtualAddress> {
        self.allocate_aligned(size, MIN_BLOCK, growth)
    }

    /// Allocate `size` bytes whose address is a multiple of `align`.
    ///
    /// Best fit first; on a miss the heap grows exactly once and retries.
    ///
    /// # Errors
    /// - [`Status::BadParameter`] for `size == 0` or an `align` that is not a
    ///   power of two.
    /// - [`Status::MmDynamicMemoryAllocationFailure`] if growing failed.
    /// - [`Status::MmHeapAllocationFailure`] if the grown heap still has no
    ///   fit, or the bookkeeping is full.
    pub fn allocate_aligned<G: HeapGrowth + ?Sized>(
        &mut self,
        size: u32,
        align: u32,
        growth: &mut G,
    ) -> KResult<VirtualAddress> {
        if size == 0 || !align.is_power_of_two() {
            return Err(Status::BadParameter);
        }
        let align = align.max(MIN_BLOCK);
        let len = align_up(size, MIN_BLOCK).ok_or(Status::MmHeapAllocationFailure)?;
        if self.used.is_full() {
            log::warn!("heap: block index full");
            return Err(Status::MmHeapAllocationFailure);
        }

        if let Some(va) = self.try_take(len, align)? {
            return Ok(va);
        }

        let want = len
            .checked_add(align)
            .map(|n| n.max(self.granule))
            .and_then(|n| align_up(n, PAGE_SIZE))
            .ok_or(Status::MmHeapAllocationFailure)?;
        let (base, got) = growth.grow(want).map_err(|e| {
            log::warn!("heap: growth by {want:#x} bytes failed: {e}");
            Status::MmDynamicMemoryAllocationFailure
        })?;
        log::debug!("heap: grew by {got:#x} bytes at {base}");
        if let Err(e) = self.add_region(base, got) {
            log::error!("heap: lost grown range {base}+{got:#x}: {e}");
            return Err(Status::MmHeapAllocationFailure);
        }

        self.try_take(len, align)?.ok_or_else(|| {
            log::warn!("heap: no fit for {size:#x} bytes after growth");
            Status::MmHeapAllocationFailure
        })
    }

    /// Release the block whose payload starts at `ptr`.
    ///
    /// # Errors
    /// - [`Status::NullPointerGiven`] for a null pointer.
    /// - [`Status::BadParameter`] if `ptr` is not a live allocation.
    /// - [`Status::MmTooManyEntries`] if the free index has no room; the block
    ///   then stays allocated.
    pub fn free(&mut self, ptr: VirtualAddress) -> KResult<()> {
        if ptr.is_null() {
            return Err(Status::NullPointerGiven);
        }
        let Some(block) = self.used.remove(&ptr.as_u32()) else {
            log::warn!("heap: free of unknown pointer {ptr}");
            return Err(Status::BadParameter);
        };
        if let Err(e) = self.free.insert(block.start, block.len) {
            self.used.insert(ptr.as_u32(), block)?;
            return Err(e);
        }
        self.used_bytes -= u64::from(block.len);
        Ok(())
    }

    /// Usable bytes at `ptr`, if it is a live allocation.
    #[must_use]
    pub fn allocation_size(&self, ptr: VirtualAddress) -> Option<u32> {
        self.used
            .get(&ptr.as_u32())
            .map(|b| b.start + b.len - ptr.as_u32())
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            used_bytes: self.used_bytes,
            free_bytes: self.free.free_bytes(),
            used_blocks: self.used.len(),
            free_blocks: self.free.len(),
            total_bytes: self.total_bytes,
        }
    }

    /// Free ranges in address order, as `(base, len)`.
    pub fn free_ranges(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.free.iter()
    }

    fn try_take(&mut self, len: u32, align: u32) -> KResult<Option<VirtualAddress>> {
        let carve = match self.free.take(len, align, MIN_BLOCK) {
            Ok(Some(c)) => c,
            Ok(None) => return Ok(None),
            Err(_) => return Err(Status::MmHeapAllocationFailure),
        };
        let block = Block {
            start: carve.block,
            len: carve.len,
        };
        if self.used.insert(carve.start, block).is_err() {
            // Capacity was checked up front.
            if let Err(e) = self.free.insert(block.start, block.len) {
                log::warn!("heap: lost {:#x}+{:#x} while backing out: {e}", block.start, block.len);
            }
            return Err(Status::MmHeapAllocationFailure);
        }
        self.used_bytes += u64::from(block.len);
        Ok(Some(VirtualAddress::new(carve.start)))
    }
}
