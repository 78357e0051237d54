//! # Physical Memory Allocator
//!
//! A binary buddy allocator over a per-frame metadata array (the *PFN
//! database*). Blocks hold `2^order` frames for `order` in `0..=MAX_ORDER`;
//! free blocks of each order sit on an intrusive doubly linked list threaded
//! through the metadata, so allocation and free touch at most `MAX_ORDER`
//! list heads.
//!
//! Only block heads carry a meaningful state. Interior frames are
//! [`FrameState::Tail`] for as long as their block exists.
//!
//! Frames start out [`FrameState::Reserved`]; boot code hands usable RAM to the
//! allocator with [`release_region`](PhysicalMemoryAllocator::release_region)
//! and withdraws the kernel image and boot structures again with
//! [`reserve_region`](PhysicalMemoryAllocator::reserve_region).
//!
//! ```rust
//! # use kernel_alloc::pma::{FrameInfo, PhysicalMemoryAllocator};
//! # use kernel_memory_addresses::PhysicalAddress;
//! let mut db = [FrameInfo::RESERVED; 16];
//! let mut pma = PhysicalMemoryAllocator::new(&mut db, PhysicalAddress::new(0)).unwrap();
//! pma.release_region(PhysicalAddress::new(0x1000), 0x3000);
//!
//! let frame = pma.allocate_frame().unwrap();
//! pma.free_frame(frame);
//! assert_eq!(pma.free_frames(), 3);
//! ```

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use kernel_status::{KResult, Status};
use kernel_vmem::FrameAlloc;

/// Largest block order: `2^10` frames, 4 MiB.
pub const MAX_ORDER: usize = 10;

const FRAME_SIZE: u64 = 4096;
const NIL: u32 = u32::MAX;

/// State of a frame in the PFN database.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameState {
    /// Not available to the allocator (firmware, kernel image, holes).
    Reserved,
    /// Head of a free block.
    Free,
    /// Head of an allocated block.
    Allocated,
    /// Interior frame of a block.
    Tail,
}

/// Per-frame metadata.
#[derive(Debug, Copy, Clone)]
pub struct FrameInfo {
    state: FrameState,
    order: u8,
    prev: u32,
    next: u32,
}

impl FrameInfo {
    /// Initial value for every entry of the database.
    pub const RESERVED: Self = Self {
        state: FrameState::Reserved,
        order: 0,
        prev: NIL,
        next: NIL,
    };

    #[inline]
    #[must_use]
    pub const fn state(&self) -> FrameState {
        self.state
    }
}

/// Frame counters of a [`PhysicalMemoryAllocator`].
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct PmaStats {
    /// Frames handed to the allocator (released minus reserved again).
    pub total_frames: u32,
    /// Frames currently free.
    pub free_frames: u32,
    /// Free blocks per order.
    pub free_blocks: [u32; MAX_ORDER + 1],
}

/// Buddy allocator for 4 KiB physical frames.
pub struct PhysicalMemoryAllocator<'db> {
    frames: &'db mut [FrameInfo],
    base: u32,
    heads: [u32; MAX_ORDER + 1],
    free: u32,
    total: u32,
}

impl<'db> PhysicalMemoryAllocator<'db> {
    /// Manage the frames `[base, base + frames.len() * 4 KiB)`, all reserved.
    ///
    /// # Errors
    /// - [`Status::BadAlignment`] if `base` is not aligned to the largest block
    ///   (4 MiB), which keeps block alignment physical.
    /// - [`Status::BadParameter`] if the range exceeds the 32-bit space.
    pub fn new(frames: &'db mut [FrameInfo], base: PhysicalAddress) -> KResult<Self> {
        if !base.as_u32().is_multiple_of(4096 << MAX_ORDER) {
            return Err(Status::BadAlignment);
        }
        let end = u64::from(base.as_u32()) + frames.len() as u64 * FRAME_SIZE;
        if end > 1 << 32 {
            return Err(Status::BadParameter);
        }
        frames.fill(FrameInfo::RESERVED);
        log::debug!(
            "pma: managing {} frames from {}",
            frames.len(),
            base
        );
        Ok(Self {
            frames,
            base: base.as_u32() >> 12,
            heads: [NIL; MAX_ORDER + 1],
            free: 0,
            total: 0,
        })
    }

    /// Hand every whole frame of `[base, base + len)` that is still reserved
    /// to the allocator. Frames outside the managed range are ignored.
    ///
    /// Returns the number of frames released.
    pub fn release_region(&mut self, base: PhysicalAddress, len: u32) -> u32 {
        let Some((first, last)) = self.frame_span(base, len, true) else {
            return 0;
        };
        let mut released = 0;
        for idx in first..last {
            if self.frames[idx as usize].state != FrameState::Reserved {
                continue;
            }
            self.total += 1;
            self.free_block(idx, 0);
            released += 1;
        }
        log::debug!("pma: released {released} frames at {base}");
        released
    }

    /// Withdraw every frame touching `[base, base + len)` that is currently
    /// free. Allocated frames are left alone.
    ///
    /// Returns the number of frames withdrawn.
    pub fn reserve_region(&mut self, base: PhysicalAddress, len: u32) -> u32 {
        let Some((first, last)) = self.frame_span(base, len, false) else {
            return 0;
        };
        let mut withdrawn = 0;
        for idx in first..last {
            if let Some((head, order)) = self.free_block_containing(idx) {
                self.split_out(head, order, idx);
                self.frames[idx as usize] = FrameInfo::RESERVED;
                self.free -= 1;
                self.total -= 1;
                withdrawn += 1;
            } else if self.frames[idx as usize].state != FrameState::Reserved {
                log::warn!("pma: cannot reserve allocated frame {}", self.address_of(idx));
            }
        }
        log::debug!("pma: reserved {withdrawn} frames at {base}");
        withdrawn
    }

    /// Allocate one 4 KiB frame.
    ///
    /// # Errors
    /// [`Status::OutOfResources`] if no frame is free.
    pub fn allocate_frame(&mut self) -> KResult<PhysicalPage<Size4K>> {
        let idx = self.allocate_order(0).ok_or(Status::OutOfResources)?;
        Ok(self.page_of(idx))
    }

    /// Return a frame obtained from [`allocate_frame`](Self::allocate_frame).
    ///
    /// # Panics
    /// If `frame` is not an allocated single frame of this allocator (double
    /// free, foreign frame, interior of a contiguous run).
    pub fn free_frame(&mut self, frame: PhysicalPage<Size4K>) {
        let idx = self.index_of(frame).unwrap_or_else(|| {
            panic!("pma: freeing foreign frame {}", frame.base());
        });
        self.check_allocated(idx, 0);
        self.free_block(idx, 0);
    }

    /// Allocate `count` physically contiguous frames whose base is aligned to
    /// `align` bytes.
    ///
    /// # Errors
    /// - [`Status::BadParameter`] if `count` is zero or `align` is not a power
    ///   of two.
    /// - [`Status::OutOfResources`] if no suitable run is free or the request
    ///   exceeds the largest block.
    pub fn allocate_contiguous(&mut self, count: u32, align: u32) -> KResult<PhysicalPage<Size4K>> {
        if count == 0 || !align.is_power_of_two() {
            return Err(Status::BadParameter);
        }
        if count > 1 << MAX_ORDER {
            return Err(Status::OutOfResources);
        }
        let order = (count.next_power_of_two().trailing_zeros())
            .max(align.trailing_zeros().saturating_sub(12)) as usize;
        if order > MAX_ORDER {
            return Err(Status::OutOfResources);
        }
        let head = self.allocate_order(order).ok_or(Status::OutOfResources)?;

        // Keep the pieces covering `count`, give the rest back.
        let block = 1u32 << order;
        for (offset, piece) in pieces(0, count) {
            self.mark_allocated(head + offset, piece);
        }
        for (offset, piece) in pieces(count, block) {
            self.mark_allocated(head + offset, piece);
            self.free_block(head + offset, piece);
        }
        Ok(self.page_of(head))
    }

    /// Return a run obtained from [`allocate_contiguous`](Self::allocate_contiguous).
    ///
    /// # Panics
    /// If the run was not allocated with the same `count`.
    pub fn free_contiguous(&mut self, base: PhysicalPage<Size4K>, count: u32) {
        let head = self.index_of(base).unwrap_or_else(|| {
            panic!("pma: freeing foreign run {}", base.base());
        });
        for (offset, piece) in pieces(0, count) {
            self.check_allocated(head + offset, piece);
        }
        for (offset, piece) in pieces(0, count) {
            self.free_block(head + offset, piece);
        }
    }

    /// Whether every frame touching `[base, base + len)` is managed RAM.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn is_usable(&self, base: PhysicalAddress, len: u32) -> bool {
        let start = u64::from(base.as_u32()) >> 12;
        let end = (u64::from(base.as_u32()) + u64::from(len)).div_ceil(FRAME_SIZE);
        let managed = u64::from(self.base)..u64::from(self.base) + self.frames.len() as u64;
        if len == 0 || !managed.contains(&start) || end > managed.end {
            return false;
        }
        (start..end).all(|pfn| {
            self.frames[(pfn - u64::from(self.base)) as usize].state != FrameState::Reserved
        })
    }

    #[inline]
    #[must_use]
    pub const fn free_frames(&self) -> u32 {
        self.free
    }

    #[inline]
    #[must_use]
    pub const fn total_frames(&self) -> u32 {
        self.total
    }

    #[must_use]
    pub fn stats(&self) -> PmaStats {
        let mut free_blocks = [0; MAX_ORDER + 1];
        for (order, count) in free_blocks.iter_mut().enumerate() {
            let mut n = self.heads[order];
            while n != NIL {
                *count += 1;
                n = self.frames[n as usize].next;
            }
        }
        PmaStats {
            total_frames: self.total,
            free_frames: self.free,
            free_blocks,
        }
    }

    /// Frame indices covered by the range; inner frames only when `whole`.
    #[allow(clippy::cast_possible_truncation)]
    fn frame_span(&self, base: PhysicalAddress, len: u32, whole: bool) -> Option<(u32, u32)> {
        let start = u64::from(base.as_u32());
        let end = start + u64::from(len);
        let (first, last) = if whole {
            (start.div_ceil(FRAME_SIZE), end / FRAME_SIZE)
        } else {
            (start / FRAME_SIZE, end.div_ceil(FRAME_SIZE))
        };
        let lo = u64::from(self.base);
        let hi = lo + self.frames.len() as u64;
        let first = first.max(lo);
        let last = last.min(hi);
        (first < last).then(|| ((first - lo) as u32, (last - lo) as u32))
    }

    fn index_of(&self, page: PhysicalPage<Size4K>) -> Option<u32> {
        let idx = page.number().checked_sub(self.base)?;
        ((idx as usize) < self.frames.len()).then_some(idx)
    }

    const fn page_of(&self, idx: u32) -> PhysicalPage<Size4K> {
        PhysicalPage::from_number(self.base + idx)
    }

    const fn address_of(&self, idx: u32) -> PhysicalAddress {
        self.page_of(idx).base()
    }

    fn check_allocated(&self, idx: u32, order: u32) {
        let info = self.frames[idx as usize];
        match info.state {
            FrameState::Allocated if u32::from(info.order) == order => {}
            FrameState::Allocated => panic!(
                "pma: frame {} heads an order-{} block, not order {order}",
                self.address_of(idx),
                info.order
            ),
            FrameState::Free => panic!("pma: double free of frame {}", self.address_of(idx)),
            FrameState::Tail => panic!(
                "pma: frame {} is inside a block, not its head",
                self.address_of(idx)
            ),
            FrameState::Reserved => {
                panic!("pma: frame {} was never allocated", self.address_of(idx))
            }
        }
    }

    fn mark_allocated(&mut self, idx: u32, order: u32) {
        #[allow(clippy::cast_possible_truncation)]
        let order = order as u8;
        self.frames[idx as usize] = FrameInfo {
            state: FrameState::Allocated,
            order,
            prev: NIL,
            next: NIL,
        };
    }

    fn push(&mut self, idx: u32, order: usize) {
        let head = self.heads[order];
        #[allow(clippy::cast_possible_truncation)]
        let info = FrameInfo {
            state: FrameState::Free,
            order: order as u8,
            prev: NIL,
            next: head,
        };
        self.frames[idx as usize] = info;
        if head != NIL {
            self.frames[head as usize].prev = idx;
        }
        self.heads[order] = idx;
    }

    fn unlink(&mut self, idx: u32) {
        let FrameInfo {
            prev, next, order, ..
        } = self.frames[idx as usize];
        if prev == NIL {
            self.heads[order as usize] = next;
        } else {
            self.frames[prev as usize].next = next;
        }
        if next != NIL {
            self.frames[next as usize].prev = prev;
        }
    }

    fn allocate_order(&mut self, order: usize) -> Option<u32> {
        let found = (order..=MAX_ORDER).find(|&o| self.heads[o] != NIL)?;
        let head = self.heads[found];
        self.unlink(head);
        let mut o = found;
        while o > order {
            o -= 1;
            self.push(head + (1 << o), o);
        }
        #[allow(clippy::cast_possible_truncation)]
        self.mark_allocated(head, order as u32);
        self.free -= 1 << order;
        Some(head)
    }

    /// Put the block `(idx, order)` on the free lists, merging buddies.
    fn free_block(&mut self, mut idx: u32, order: u32) {
        self.free += 1 << order;
        let mut order = order as usize;
        while order < MAX_ORDER {
            let buddy = idx ^ (1 << order);
            let mergeable = self.frames.get(buddy as usize).is_some_and(|b| {
                b.state == FrameState::Free && usize::from(b.order) == order
            });
            if !mergeable {
                break;
            }
            self.unlink(buddy);
            let (low, high) = (idx.min(buddy), idx.max(buddy));
            self.frames[high as usize].state = FrameState::Tail;
            idx = low;
            order += 1;
        }
        self.push(idx, order);
    }

    fn free_block_containing(&self, idx: u32) -> Option<(u32, usize)> {
        (0..=MAX_ORDER).find_map(|order| {
            let head = idx & !((1 << order) - 1);
            let info = self.frames[head as usize];
            (info.state == FrameState::Free && usize::from(info.order) == order)
                .then_some((head, order))
        })
    }

    /// Remove the free block `(head, order)` and re-add everything but `idx`.
    fn split_out(&mut self, mut head: u32, mut order: usize, idx: u32) {
        self.unlink(head);
        while order > 0 {
            order -= 1;
            let upper = head + (1 << order);
            if idx >= upper {
                self.push(head, order);
                head = upper;
            } else {
                self.push(upper, order);
            }
        }
    }
}

impl FrameAlloc for PhysicalMemoryAllocator<'_> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.allocate_frame().ok()
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        self.free_frame(page);
    }
}

/// Decompose the frame offsets `[from, to)` into naturally aligned
/// power-of-two blocks, yielding `(offset, order)`.
fn pieces(from: u32, to: u32) -> impl Iterator<Item = (u32, u32)> {
    let mut at = from;
    core::iter::from_fn(move || {
        if at >= to {
            return None;
        }
        let align = if at == 0 { 31 } else { at.trailing_zeros() };
        let fit = 31 - (to - at).leading_zeros();
        let order = align.min(fit);
        let piece = (at, order);
        at += 1 << order;
        Some(piece)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pma(db: &mut [FrameInfo]) -> PhysicalMemoryAllocator<'_> {
        let len = u32::try_from(db.len()).unwrap() * 4096;
        let mut pma = PhysicalMemoryAllocator::new(db, PhysicalAddress::new(0)).unwrap();
        pma.release_region(PhysicalAddress::new(0), len);
        pma
    }

    #[test]
    fn single_free_frame_is_reissued() {
        let mut db = [FrameInfo::RESERVED; 4];
        let mut pma = PhysicalMemoryAllocator::new(&mut db, PhysicalAddress::new(0)).unwrap();
        pma.release_region(PhysicalAddress::new(0x2000), 0x1000);
        assert_eq!(pma.free_frames(), 1);

        let a = pma.allocate_frame().unwrap();
        assert_eq!(pma.allocate_frame(), Err(Status::OutOfResources));
        pma.free_frame(a);
        let b = pma.allocate_frame().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.base(), PhysicalAddress::new(0x2000));
    }

    #[test]
    fn released_range_coalesces_into_large_blocks() {
        let mut db = [FrameInfo::RESERVED; 1024];
        let p = pma(&mut db);
        let stats = p.stats();
        assert_eq!(stats.free_frames, 1024);
        assert_eq!(stats.free_blocks[MAX_ORDER], 1);
        assert_eq!(stats.free_blocks[..MAX_ORDER].iter().sum::<u32>(), 0);
    }

    #[test]
    fn freed_buddies_recombine() {
        let mut db = [FrameInfo::RESERVED; 8];
        let mut p = pma(&mut db);
        let frames: Vec<_> = (0..8).map(|_| p.allocate_frame().unwrap()).collect();
        assert_eq!(p.allocate_contiguous(2, 4096), Err(Status::OutOfResources));
        for f in frames {
            p.free_frame(f);
        }
        let run = p.allocate_contiguous(8, 4096).unwrap();
        assert_eq!(run.base(), PhysicalAddress::new(0));
        assert_eq!(p.free_frames(), 0);
    }

    #[test]
    fn contiguous_run_trims_excess_and_honors_alignment() {
        let mut db = [FrameInfo::RESERVED; 64];
        let mut p = pma(&mut db);
        let _first = p.allocate_frame().unwrap();
        let run = p.allocate_contiguous(3, 0x4000).unwrap();
        assert!(run.base().is_aligned::<Size4K>());
        assert_eq!(run.base().as_u32() % 0x4000, 0);
        assert_eq!(p.free_frames(), 64 - 1 - 3);

        p.free_contiguous(run, 3);
        assert_eq!(p.free_frames(), 63);
        assert_eq!(p.allocate_contiguous(0, 4096), Err(Status::BadParameter));
        assert_eq!(p.allocate_contiguous(1, 3), Err(Status::BadParameter));
        assert_eq!(p.allocate_contiguous(2048, 4096), Err(Status::OutOfResources));
    }

    #[test]
    fn reserve_region_withdraws_free_frames() {
        let mut db = [FrameInfo::RESERVED; 32];
        let mut p = pma(&mut db);
        let withdrawn = p.reserve_region(PhysicalAddress::new(0x5800), 0x2000);
        assert_eq!(withdrawn, 3);
        assert_eq!(p.free_frames(), 29);
        assert_eq!(p.total_frames(), 29);
        assert!(!p.is_usable(PhysicalAddress::new(0x6000), 0x1000));
        assert!(p.is_usable(PhysicalAddress::new(0x8000), 0x8000));

        let mut seen = Vec::new();
        while let Ok(f) = p.allocate_frame() {
            seen.push(f.base().as_u32());
        }
        assert_eq!(seen.len(), 29);
        assert!(!seen.contains(&0x5000));
        assert!(!seen.contains(&0x6000));
        assert!(!seen.contains(&0x7000));
    }

    #[test]
    fn stays_consistent_under_random_churn() {
        let mut db = [FrameInfo::RESERVED; 256];
        let mut p = pma(&mut db);
        let mut held = Vec::new();
        let mut x = 0x9E37_79B9u32;
        for _ in 0..4000 {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            if x % 2 == 0 || held.is_empty() {
                if let Ok(f) = p.allocate_frame() {
                    assert!(!held.contains(&f), "frame issued twice");
                    held.push(f);
                }
            } else {
                let f = held.swap_remove(x as usize % held.len());
                p.free_frame(f);
            }
            assert_eq!(p.free_frames() as usize + held.len(), 256);
        }
        for f in held.drain(..) {
            p.free_frame(f);
        }
        assert_eq!(p.stats().free_blocks[MAX_ORDER - 2], 1);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut db = [FrameInfo::RESERVED; 4];
        let mut p = pma(&mut db);
        let f = p.allocate_frame().unwrap();
        p.free_frame(f);
        p.free_frame(f);
    }

    #[test]
    #[should_panic(expected = "never allocated")]
    fn freeing_reserved_frame_panics() {
        let mut db = [FrameInfo::RESERVED; 4];
        let mut p = PhysicalMemoryAllocator::new(&mut db, PhysicalAddress::new(0)).unwrap();
        p.free_frame(PhysicalPage::from_number(1));
    }

    #[test]
    fn misaligned_database_base_is_rejected() {
        let mut db = [FrameInfo::RESERVED; 4];
        assert!(matches!(
            PhysicalMemoryAllocator::new(&mut db, PhysicalAddress::new(0x1000)),
            Err(Status::BadAlignment)
        ));
    }
}
