//! # Dynamic Kernel Mapper
//!
//! Hands out kernel virtual ranges from a dedicated window of the kernel half
//! and maps them through the [`Vmm`] into the kernel address space. Used for
//! device memory, page-table bootstrap and heap growth.
//!
//! Free ranges of the window live in a [`FreeList`]; allocation is best fit
//! (smallest free range that holds the request, lowest address on ties) and
//! released ranges coalesce with their free neighbours.

use crate::avl::{AvlTree, Slot};
use crate::free_list::FreeList;
use crate::vmm::{AddressSpaceState, SpaceKind, Vmm};
use kernel_info::memory::{PAGE_SIZE, USER_END};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_status::{KResult, Status};
use kernel_vmem::{FrameAlloc, PhysMapper, Protection, align_down, align_up};

/// How a live range of the window is used.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Use {
    /// Mapped through the VMM.
    Mapped,
    /// Reserved virtual space only.
    Reserved,
}

/// A live range of the window.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Allocation {
    pub len: u32,
    pub usage: Use,
}

/// Arena slot of the live-range index.
pub type LiveSlot = Slot<VirtualAddress, Allocation>;

/// Allocator of kernel virtual ranges inside `[base, base + size)`.
pub struct DynamicMapper<'s> {
    base: VirtualAddress,
    size: u32,
    free: FreeList<'s>,
    live: AvlTree<'s, VirtualAddress, Allocation>,
}

impl<'s> DynamicMapper<'s> {
    /// Manage the window `[base, base + size)`.
    ///
    /// `free` should hold one more range than `live` so that returning a
    /// range never runs out of slots.
    ///
    /// # Errors
    /// [`Status::MmDynamicMemoryInitFailure`] if the window is empty,
    /// misaligned, wraps or leaves the kernel half.
    pub fn new(
        base: VirtualAddress,
        size: u32,
        mut free: FreeList<'s>,
        live: &'s mut [LiveSlot],
    ) -> KResult<Self> {
        let valid = size > 0
            && base.as_u32() >= USER_END
            && base.as_u32().is_multiple_of(PAGE_SIZE)
            && size.is_multiple_of(PAGE_SIZE)
            && base.checked_add(size).is_some();
        if !valid || !free.is_empty() {
            log::error!("dynmap: invalid window {base}+{size:#x}");
            return Err(Status::MmDynamicMemoryInitFailure);
        }
        free.insert(base.as_u32(), size)
            .map_err(|_| Status::MmDynamicMemoryInitFailure)?;
        log::info!("dynmap: window {base}+{size:#x}");
        Ok(Self {
            base,
            size,
            free,
            live: AvlTree::new(live),
        })
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// Free bytes left in the window.
    #[must_use]
    pub const fn free_bytes(&self) -> u64 {
        self.free.free_bytes()
    }

    /// Live ranges in address order.
    pub fn allocations(&self) -> impl Iterator<Item = (VirtualAddress, Allocation)> + '_ {
        self.live.iter().map(|(va, a)| (va, *a))
    }

    /// Map the physical range `[pa, pa + len)` somewhere in the window and
    /// return the virtual address of `pa` (the in-page offset is kept).
    ///
    /// # Errors
    /// - [`Status::BadParameter`] if `len` is zero or the range wraps.
    /// - [`Status::MmDynamicMemoryAllocationFailure`] if no free range fits.
    /// - Errors of [`Vmm::map`].
    pub fn map_any<M: PhysMapper, A: FrameAlloc>(
        &mut self,
        vmm: &Vmm<'_, M>,
        space: &mut AddressSpaceState<'_>,
        alloc: &mut A,
        pa: PhysicalAddress,
        len: u32,
        protection: Protection,
    ) -> KResult<VirtualAddress> {
        debug_assert_eq!(space.kind(), SpaceKind::Kernel);
        let first = align_down(pa.as_u32(), PAGE_SIZE);
        let offset = pa.as_u32() - first;
        let span = page_span(offset, len)?;
        let va = self.carve(span)?;
        if let Err(e) = vmm.map(space, alloc, va, PhysicalAddress::new(first), span, protection) {
            self.give_back(va, span);
            return Err(e);
        }
        self.record(va, span, Use::Mapped)?;
        log::trace!("dynmap: {pa}+{len:#x} at {va}");
        Ok(va + offset)
    }

    /// [`map_any`](Self::map_any) for device registers: uncached, supervisor
    /// read-write.
    ///
    /// # Errors
    /// As [`map_any`](Self::map_any).
    pub fn map_mmio<M: PhysMapper, A: FrameAlloc>(
        &mut self,
        vmm: &Vmm<'_, M>,
        space: &mut AddressSpaceState<'_>,
        alloc: &mut A,
        pa: PhysicalAddress,
        len: u32,
    ) -> KResult<VirtualAddress> {
        self.map_any(vmm, space, alloc, pa, len, Protection::MMIO)
    }

    /// Back `len` bytes (rounded up to pages) of the window with fresh,
    /// zeroed frames.
    ///
    /// # Errors
    /// As [`map_any`](Self::map_any), plus the errors of [`Vmm::map_anonymous`].
    pub fn map_any_anonymous<M: PhysMapper, A: FrameAlloc>(
        &mut self,
        vmm: &Vmm<'_, M>,
        space: &mut AddressSpaceState<'_>,
        alloc: &mut A,
        len: u32,
        protection: Protection,
    ) -> KResult<VirtualAddress> {
        debug_assert_eq!(space.kind(), SpaceKind::Kernel);
        let span = page_span(0, len)?;
        let va = self.carve(span)?;
        if let Err(e) = vmm.map_anonymous(space, alloc, va, span, protection) {
            self.give_back(va, span);
            return Err(e);
        }
        self.record(va, span, Use::Mapped)?;
        log::trace!("dynmap: anonymous {span:#x} at {va}");
        Ok(va)
    }

    /// Unmap a range obtained from one of the `map_*` calls.
    ///
    /// # Errors
    /// - [`Status::MemoryAlreadyUnmapped`] if `[va, va + len)` is not a live
    ///   mapping of this window.
    /// - Errors of [`Vmm::unmap`].
    pub fn unmap_any<M: PhysMapper, A: FrameAlloc>(
        &mut self,
        vmm: &Vmm<'_, M>,
        space: &mut AddressSpaceState<'_>,
        alloc: &mut A,
        va: VirtualAddress,
        len: u32,
    ) -> KResult<()> {
        let base = VirtualAddress::new(align_down(va.as_u32(), PAGE_SIZE));
        let span = page_span(va.as_u32() - base.as_u32(), len)
            .map_err(|_| Status::MemoryAlreadyUnmapped)?;
        match self.live.get(&base) {
            Some(a) if a.usage == Use::Mapped && a.len == span => {}
            _ => return Err(Status::MemoryAlreadyUnmapped),
        }
        vmm.unmap(space, alloc, base, span)?;
        self.live.remove(&base);
        self.give_back(base, span);
        log::trace!("dynmap: released {base}+{span:#x}");
        Ok(())
    }

    /// Reserve `len` bytes (rounded up to pages) of the window without mapping.
    ///
    /// # Errors
    /// [`Status::BadParameter`] for `len == 0`,
    /// [`Status::MmDynamicMemoryAllocationFailure`] if no free range fits.
    pub fn reserve_any(&mut self, len: u32) -> KResult<VirtualAddress> {
        let span = page_span(0, len)?;
        let va = self.carve(span)?;
        self.record(va, span, Use::Reserved)?;
        Ok(va)
    }

    /// Return a range obtained from [`reserve_any`](Self::reserve_any).
    ///
    /// # Errors
    /// [`Status::MemoryAlreadyUnmapped`] if `va` is not a live reservation.
    pub fn release(&mut self, va: VirtualAddress) -> KResult<()> {
        let len = match self.live.get(&va) {
            Some(a) if a.usage == Use::Reserved => a.len,
            _ => return Err(Status::MemoryAlreadyUnmapped),
        };
        self.live.remove(&va);
        self.give_back(va, len);
        Ok(())
    }

    fn carve(&mut self, span: u32) -> KResult<VirtualAddress> {
        if self.live.is_full() {
            return Err(Status::MmDynamicMemoryAllocationFailure);
        }
        match self.free.take(span, PAGE_SIZE, PAGE_SIZE) {
            Ok(Some(c)) => Ok(VirtualAddress::new(c.start)),
            Ok(None) | Err(_) => {
                log::warn!("dynmap: no free range of {span:#x} bytes");
                Err(Status::MmDynamicMemoryAllocationFailure)
            }
        }
    }

    fn record(&mut self, va: VirtualAddress, len: u32, usage: Use) -> KResult<()> {
        self.live.insert(va, Allocation { len, usage }).map(|_| ())
    }

    fn give_back(&mut self, va: VirtualAddress, len: u32) {
        if let Err(e) = self.free.insert(va.as_u32(), len) {
            log::error!("dynmap: lost {va}+{len:#x}: {e}");
        }
    }
}

/// Whole pages covering `len` bytes that start `offset` bytes into a page.
fn page_span(offset: u32, len: u32) -> KResult<u32> {
    if len == 0 {
        return Err(Status::BadParameter);
    }
    offset
        .checked_add(len)
        .and_then(|end| align_up(end, PAGE_SIZE))
        .ok_or(Status::BadParameter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::free_list::{AddrSlot, SizeSlot};
    use crate::pma::{FrameInfo, PhysicalMemoryAllocator};
    use crate::vmm::RegionSlot;
    use kernel_vmem::test_support::TestPhys;

    const BASE: u32 = 0xF800_0000;

    struct Storage {
        addr: Vec<AddrSlot>,
        size: Vec<SizeSlot>,
        live: Vec<LiveSlot>,
        regions: Vec<RegionSlot>,
        db: Vec<FrameInfo>,
    }

    impl Storage {
        fn new(live: usize) -> Self {
            Self {
                addr: (0..=live).map(|_| Slot::vacant()).collect(),
                size: (0..=live).map(|_| Slot::vacant()).collect(),
                live: (0..live).map(|_| Slot::vacant()).collect(),
                regions: (0..16).map(|_| Slot::vacant()).collect(),
                db: vec![FrameInfo::RESERVED; 32],
            }
        }
    }

    macro_rules! setup {
        ($st:ident, $phys:ident, $size:expr => $dm:ident, $vmm:ident, $space:ident, $pma:ident) => {
            let mut $pma = PhysicalMemoryAllocator::new(&mut $st.db, PhysicalAddress::new(0)).unwrap();
            $pma.release_region(PhysicalAddress::new(0x8000), 24 * 4096);
            let $vmm = Vmm::new(&$phys);
            let mut $space = $vmm.create_kernel_space(&mut $pma, &mut $st.regions).unwrap();
            let free = FreeList::new(&mut $st.addr, &mut $st.size);
            let mut $dm = DynamicMapper::new(VirtualAddress::new(BASE), $size, free, &mut $st.live).unwrap();
        };
    }

    #[test]
    fn invalid_windows_are_rejected() {
        for (base, size) in [(BASE, 0), (BASE + 1, 0x1000), (0x1000, 0x1000), (0xFFFF_F000, 0x2000)] {
            let mut st = Storage::new(2);
            let free = FreeList::new(&mut st.addr, &mut st.size);
            assert!(matches!(
                DynamicMapper::new(VirtualAddress::new(base), size, free, &mut st.live),
                Err(Status::MmDynamicMemoryInitFailure)
            ));
        }
    }

    #[test]
    fn map_any_keeps_offset_and_reuses_freed_range() {
        let phys = TestPhys::with_frames(32);
        let mut st = Storage::new(4);
        setup!(st, phys, 0x10_0000 => dm, vmm, space, pma);

        let va = dm
            .map_any(&vmm, &mut space, &mut pma, PhysicalAddress::new(0x1234), 0x2000, Protection::KERNEL_RW)
            .unwrap();
        assert_eq!(va.as_u32() & 0xFFF, 0x234);
        assert_eq!(vmm.translate(&space, va), Some(PhysicalAddress::new(0x1234)));
        // 0x234 + 0x2000 spans three pages.
        assert_eq!(dm.allocations().next().map(|(_, a)| a.len), Some(0x3000));

        dm.unmap_any(&vmm, &mut space, &mut pma, va, 0x2000).unwrap();
        assert_eq!(vmm.translate(&space, va), None);
        assert_eq!(dm.free_bytes(), 0x10_0000);

        let again = dm
            .map_any(&vmm, &mut space, &mut pma, PhysicalAddress::new(0x1234), 0x2000, Protection::KERNEL_RW)
            .unwrap();
        assert_eq!(again, va);
    }

    #[test]
    fn best_fit_picks_smallest_hole() {
        let mut st = Storage::new(8);
        let free = FreeList::new(&mut st.addr, &mut st.size);
        let mut dm = DynamicMapper::new(VirtualAddress::new(BASE), 0x10_0000, free, &mut st.live).unwrap();

        let a = dm.reserve_any(0x3000).unwrap();
        let b = dm.reserve_any(0x1000).unwrap();
        let c = dm.reserve_any(0x1000).unwrap();
        let _d = dm.reserve_any(0x1000).unwrap();
        dm.release(a).unwrap();
        dm.release(c).unwrap();
        // Holes: a (3 pages) and c (1 page); a single page goes into c.
        assert_eq!(dm.reserve_any(0x1000).unwrap(), c);
        assert_eq!(dm.reserve_any(0x2000).unwrap(), a);
        assert_eq!(b.as_u32(), BASE + 0x3000);
    }

    #[test]
    fn exhaustion_and_stale_handles() {
        let phys = TestPhys::with_frames(32);
        let mut st = Storage::new(4);
        setup!(st, phys, 0x2000 => dm, vmm, space, pma);

        let va = dm
            .map_any_anonymous(&vmm, &mut space, &mut pma, 0x2000, Protection::KERNEL_RW)
            .unwrap();
        assert_eq!(dm.reserve_any(1), Err(Status::MmDynamicMemoryAllocationFailure));
        assert_eq!(
            dm.unmap_any(&vmm, &mut space, &mut pma, va, 0x1000),
            Err(Status::MemoryAlreadyUnmapped)
        );
        assert_eq!(dm.release(va), Err(Status::MemoryAlreadyUnmapped));
        dm.unmap_any(&vmm, &mut space, &mut pma, va, 0x2000).unwrap();
        assert_eq!(
            dm.unmap_any(&vmm, &mut space, &mut pma, va, 0x2000),
            Err(Status::MemoryAlreadyUnmapped)
        );
    }

    #[test]
    fn failed_mapping_returns_the_range() {
        let phys = TestPhys::with_frames(32);
        let mut st = Storage::new(4);
        setup!(st, phys, 0x10_0000 => dm, vmm, space, pma);
        // More pages than the PMA has frames.
        assert_eq!(
            dm.map_any_anonymous(&vmm, &mut space, &mut pma, 0x4_0000, Protection::KERNEL_RW),
            Err(Status::OutOfResources)
        );
        assert_eq!(dm.free_bytes(), 0x10_0000);
        assert_eq!(dm.allocations().count(), 0);
    }
}
