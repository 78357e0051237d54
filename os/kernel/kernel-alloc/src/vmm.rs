//! # Virtual Memory Manager
//!
//! Region-tracked mapping on top of the page-table layer of `kernel-vmem`.
//!
//! Every address space pairs a page directory with an [`AvlTree`] of
//! [`Region`]s keyed by base address. Regions never overlap; a range is either
//! tracked by exactly one region or free. What a region owns depends on its
//! [`Backing`]:
//!
//! | Backing | Frames | On unmap |
//! |---------|--------|----------|
//! | [`Backing::Physical`] | caller's (device memory, boot mappings) | kept |
//! | [`Backing::Anonymous`] | drawn from the frame allocator at map time | freed |
//! | [`Backing::Reserved`] | committed one page at a time on fault | committed ones freed |
//!
//! Requests that touch an existing region or a present page fail closed with
//! [`Status::MemoryAlreadyMapped`]; a failure halfway through writing PTEs
//! rolls the written ones back.
//!
//! ```rust
//! # use kernel_alloc::avl::Slot;
//! # use kernel_alloc::pma::{FrameInfo, PhysicalMemoryAllocator};
//! # use kernel_alloc::vmm::Vmm;
//! # use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
//! # use kernel_vmem::{FaultAccess, FaultResolution, Protection, test_support::TestPhys};
//! let phys = TestPhys::with_frames(16);
//! let mut db = [FrameInfo::RESERVED; 16];
//! let mut pma = PhysicalMemoryAllocator::new(&mut db, PhysicalAddress::new(0)).unwrap();
//! pma.release_region(PhysicalAddress::new(0), 16 * 4096);
//! let mut slots: Vec<_> = (0..8).map(|_| Slot::vacant()).collect();
//!
//! let vmm = Vmm::new(&phys);
//! let mut space = vmm.create_kernel_space(&mut pma, &mut slots).unwrap();
//! let va = VirtualAddress::new(0xE000_0000);
//! vmm.reserve(&mut space, va, 0x2000, Protection::KERNEL_RW).unwrap();
//! assert_eq!(
//!     vmm.resolve_fault(&space, &mut pma, va + 8, FaultAccess::write()),
//!     Ok(FaultResolution::Committed)
//! );
//! assert!(vmm.translate(&space, va).is_some());
//! ```

use crate::avl::{AvlTree, Slot};
use kernel_info::memory::{PAGE_SIZE, USER_END};
use kernel_memory_addresses::{PhysicalAddress, Size4K, Size4M, VirtualAddress, VirtualPage};
use kernel_status::{KResult, Status};
use kernel_vmem::{
    AddressSpace, FaultAccess, FaultResolution, FrameAlloc, PhysMapper, Protection, RootPage,
    invalidate_tlb_page,
};

/// Size of one page directory slot.
const LARGE_PAGE: u32 = 4 << 20;

/// What backs the pages of a [`Region`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Backing {
    /// A fixed physical range starting at the given address. Never freed.
    Physical(PhysicalAddress),
    /// Frames allocated when the region was mapped.
    Anonymous,
    /// Frames committed lazily on first access.
    Reserved,
}

/// A tracked virtual range with uniform protection and backing.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Region {
    pub base: VirtualAddress,
    pub len: u32,
    pub protection: Protection,
    pub backing: Backing,
}

impl Region {
    /// Exclusive end address.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u32 {
        self.base.as_u32() + self.len
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u32() >= self.base.as_u32() && va.as_u32() < self.end()
    }

    /// The part `[from, to)` of this region.
    fn slice(&self, from: u32, to: u32) -> Self {
        let backing = match self.backing {
            Backing::Physical(pa) => Backing::Physical(pa + (from - self.base.as_u32())),
            other => other,
        };
        Self {
            base: VirtualAddress::new(from),
            len: to - from,
            protection: self.protection,
            backing,
        }
    }
}

/// Arena slot of a region tree.
pub type RegionSlot = Slot<VirtualAddress, Region>;

/// Whether an address space is the kernel's or a process's.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SpaceKind {
    /// Owns the kernel half; its directory entries are copied into processes.
    Kernel,
    /// Confined to the user half; the kernel half is shared.
    Process,
}

/// A page directory and the regions mapped through it.
pub struct AddressSpaceState<'s> {
    root: RootPage,
    kind: SpaceKind,
    regions: AvlTree<'s, VirtualAddress, Region>,
}

impl<'s> AddressSpaceState<'s> {
    /// Wrap an existing page directory, tracking no regions yet.
    pub fn new(root: RootPage, kind: SpaceKind, slots: &'s mut [RegionSlot]) -> Self {
        Self {
            root,
            kind,
            regions: AvlTree::new(slots),
        }
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> RootPage {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> SpaceKind {
        self.kind
    }

    /// Regions in address order.
    pub fn regions(&self) -> impl Iterator<Item = &Region> + '_ {
        self.regions.iter().map(|(_, r)| r)
    }

    #[inline]
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// The region containing `va`.
    #[must_use]
    pub fn region_at(&self, va: VirtualAddress) -> Option<&Region> {
        self.regions
            .floor(&va)
            .map(|(_, r)| r)
            .filter(|r| r.contains(va))
    }

    /// Whether any region intersects `[start, end)`.
    fn intersects(&self, start: u32, end: u32) -> bool {
        let below = self
            .regions
            .floor(&VirtualAddress::new(start))
            .is_some_and(|(_, r)| r.end() > start);
        let above = self
            .regions
            .ceiling(&VirtualAddress::new(start))
            .is_some_and(|(b, _)| b.as_u32() < end);
        below || above
    }
}

/// Mapping operations over [`AddressSpaceState`]s.
pub struct Vmm<'m, M: PhysMapper> {
    mapper: &'m M,
}

impl<'m, M: PhysMapper> Vmm<'m, M> {
    pub const fn new(mapper: &'m M) -> Self {
        Self { mapper }
    }

    #[inline]
    const fn aspace(&self, root: RootPage) -> AddressSpace<'m, M> {
        AddressSpace::from_root(self.mapper, root)
    }

    /// A fresh kernel address space: empty directory plus the self map.
    ///
    /// # Errors
    /// [`Status::OutOfResources`] if no frame is available for the directory.
    pub fn create_kernel_space<'s, A: FrameAlloc>(
        &self,
        alloc: &mut A,
        slots: &'s mut [RegionSlot],
    ) -> KResult<AddressSpaceState<'s>> {
        let root = alloc.alloc_4k().ok_or(Status::OutOfResources)?;
        self.mapper.zero_frame(root);
        self.aspace(root).install_self_map();
        log::debug!("vmm: kernel directory at {}", root.base());
        Ok(AddressSpaceState::new(root, SpaceKind::Kernel, slots))
    }

    /// A fresh process address space sharing the kernel half of `kernel`.
    ///
    /// # Errors
    /// [`Status::OutOfResources`] if no frame is available for the directory.
    pub fn create_address_space<'s, A: FrameAlloc>(
        &self,
        kernel: &AddressSpaceState<'_>,
        alloc: &mut A,
        slots: &'s mut [RegionSlot],
    ) -> KResult<AddressSpaceState<'s>> {
        let root = alloc.alloc_4k().ok_or(Status::OutOfResources)?;
        self.mapper.zero_frame(root);
        let aspace = self.aspace(root);
        aspace.share_kernel_half(&self.aspace(kernel.root));
        aspace.install_self_map();
        log::debug!("vmm: process directory at {}", root.base());
        Ok(AddressSpaceState::new(root, SpaceKind::Process, slots))
    }

    /// Unmap every region of `space`, then free its user-half page tables and
    /// its directory.
    ///
    /// # Errors
    /// [`Status::OperationNotAllowed`] for the kernel space.
    pub fn destroy_address_space<A: FrameAlloc>(
        &self,
        mut space: AddressSpaceState<'_>,
        alloc: &mut A,
    ) -> KResult<()> {
        if space.kind == SpaceKind::Kernel {
            return Err(Status::OperationNotAllowed);
        }
        while let Some((base, len)) = space.regions.first().map(|(b, r)| (b, r.len)) {
            self.unmap(&mut space, alloc, base, len)?;
        }
        let tables = self.aspace(space.root).release_user_tables(alloc);
        alloc.free_4k(space.root);
        log::debug!(
            "vmm: destroyed directory {} ({tables} stray tables)",
            space.root.base()
        );
        Ok(())
    }

    /// Map `[va, va + len)` to `[pa, pa + len)`.
    ///
    /// # Errors
    /// - [`Status::BadAlignment`] if `va`, `pa` or `len` is not page aligned.
    /// - [`Status::BadParameter`] for an empty or wrapping range, or a kernel
    ///   address in a process space.
    /// - [`Status::MemoryAlreadyMapped`] if the range touches a region or a
    ///   present page.
    /// - [`Status::MmTooManyEntries`] if the region tree is full.
    /// - [`Status::OutOfResources`] if a page table cannot be allocated.
    pub fn map<A: FrameAlloc>(
        &self,
        space: &mut AddressSpaceState<'_>,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        len: u32,
        protection: Protection,
    ) -> KResult<()> {
        check_aligned(&[va.as_u32(), pa.as_u32(), len])?;
        let end = check_range(space, va, len)?;
        pa.checked_add(len).ok_or(Status::BadParameter)?;
        self.check_vacant(space, va.as_u32(), end)?;

        let aspace = self.aspace(space.root);
        let flags = protection.leaf_bits();
        let mut done = 0;
        while done < len {
            if let Err(e) = aspace.map_one(alloc, va + done, pa + done, flags) {
                Self::rollback(&aspace, alloc, va, done, false);
                return Err(e.into());
            }
            done += PAGE_SIZE;
        }
        space.regions.insert(
            va,
            Region {
                base: va,
                len,
                protection,
                backing: Backing::Physical(pa),
            },
        )?;
        log::trace!("vmm: mapped {va}+{len:#x} -> {pa}");
        Ok(())
    }

    /// Map `[va, va + len)` to freshly allocated, zeroed frames.
    ///
    /// # Errors
    /// As [`map`](Self::map); [`Status::OutOfResources`] also when a backing
    /// frame cannot be allocated.
    pub fn map_anonymous<A: FrameAlloc>(
        &self,
        space: &mut AddressSpaceState<'_>,
        alloc: &mut A,
        va: VirtualAddress,
        len: u32,
        protection: Protection,
    ) -> KResult<()> {
        check_aligned(&[va.as_u32(), len])?;
        let end = check_range(space, va, len)?;
        self.check_vacant(space, va.as_u32(), end)?;

        let aspace = self.aspace(space.root);
        let flags = protection.leaf_bits();
        let mut done = 0;
        while done < len {
            let Some(frame) = alloc.alloc_4k() else {
                Self::rollback(&aspace, alloc, va, done, true);
                return Err(Status::OutOfResources);
            };
            self.mapper.zero_frame(frame);
            if let Err(e) = aspace.map_one(alloc, va + done, frame.base(), flags) {
                alloc.free_4k(frame);
                Self::rollback(&aspace, alloc, va, done, true);
                return Err(e.into());
            }
            done += PAGE_SIZE;
        }
        space.regions.insert(
            va,
            Region {
                base: va,
                len,
                protection,
                backing: Backing::Anonymous,
            },
        )?;
        log::trace!("vmm: mapped anonymous {va}+{len:#x}");
        Ok(())
    }

    /// Track `[va, va + len)` without mapping anything; pages are committed
    /// by [`resolve_fault`](Self::resolve_fault).
    ///
    /// # Errors
    /// As [`map`](Self::map), minus page-table allocation.
    pub fn reserve(
        &self,
        space: &mut AddressSpaceState<'_>,
        va: VirtualAddress,
        len: u32,
        protection: Protection,
    ) -> KResult<()> {
        check_aligned(&[va.as_u32(), len])?;
        let end = check_range(space, va, len)?;
        self.check_vacant(space, va.as_u32(), end)?;
        space.regions.insert(
            va,
            Region {
                base: va,
                len,
                protection,
                backing: Backing::Reserved,
            },
        )?;
        log::trace!("vmm: reserved {va}+{len:#x}");
        Ok(())
    }

    /// Track mappings that already exist in the page tables (the boot
    /// loader's direct map and kernel image) as a `Physical` region.
    ///
    /// # Errors
    /// As [`reserve`](Self::reserve), except that present pages are expected.
    pub fn adopt(
        &self,
        space: &mut AddressSpaceState<'_>,
        va: VirtualAddress,
        pa: PhysicalAddress,
        len: u32,
        protection: Protection,
    ) -> KResult<()> {
        check_aligned(&[va.as_u32(), pa.as_u32(), len])?;
        let end = check_range(space, va, len)?;
        if space.intersects(va.as_u32(), end) {
            return Err(Status::MemoryAlreadyMapped);
        }
        space.regions.insert(
            va,
            Region {
                base: va,
                len,
                protection,
                backing: Backing::Physical(pa),
            },
        )?;
        log::debug!("vmm: adopted {va}+{len:#x} -> {pa}");
        Ok(())
    }

    /// Unmap `[va, va + len)`.
    ///
    /// Every page must lie in a tracked region; regions are split where the
    /// range cuts them. Frames of `Anonymous` and committed `Reserved` pages
    /// go back to `alloc`; empty user-half page tables are released.
    ///
    /// # Errors
    /// - [`Status::BadAlignment`] if `va` or `len` is not page aligned, or the
    ///   range cuts through a 4 MiB mapping.
    /// - [`Status::BadParameter`] for an empty or wrapping range.
    /// - [`Status::MemoryAlreadyUnmapped`] if some page is not tracked.
    /// - [`Status::MmTooManyEntries`] if splitting a region needs a tree node
    ///   that is not available.
    pub fn unmap<A: FrameAlloc>(
        &self,
        space: &mut AddressSpaceState<'_>,
        alloc: &mut A,
        va: VirtualAddress,
        len: u32,
    ) -> KResult<()> {
        check_aligned(&[va.as_u32(), len])?;
        let start = va.as_u32();
        let end = start
            .checked_add(len)
            .filter(|_| len > 0)
            .ok_or(Status::BadParameter)?;

        let mut covered = 0;
        let mut cur = start;
        while cur < end {
            let region = space
                .region_at(VirtualAddress::new(cur))
                .ok_or(Status::MemoryAlreadyUnmapped)?;
            cur = region.end();
            covered += 1;
        }
        let aspace = self.aspace(space.root);
        Self::check_large_cuts(&aspace, start, end)?;

        let split_left = space.region_at(va).is_some_and(|r| r.base.as_u32() < start);
        let split_right = space
            .region_at(VirtualAddress::new(end - PAGE_SIZE))
            .is_some_and(|r| r.end() > end);
        let needed = space.regions.len() - covered + usize::from(split_left) + usize::from(split_right);
        if needed > space.regions.capacity() {
            return Err(Status::MmTooManyEntries);
        }

        let mut cur = start;
        while cur < end {
            let Some(&region) = space.region_at(VirtualAddress::new(cur)) else {
                break;
            };
            space.regions.remove(&region.base);
            let from = region.base.as_u32().max(start);
            let to = region.end().min(end);
            Self::clear(&aspace, alloc, from, to, region.backing);
            if region.base.as_u32() < from {
                let left = region.slice(region.base.as_u32(), from);
                space.regions.insert(left.base, left)?;
            }
            if to < region.end() {
                let right = region.slice(to, region.end());
                space.regions.insert(right.base, right)?;
            }
            cur = to;
        }
        Self::release_tables(&aspace, alloc, start, end);
        log::trace!("vmm: unmapped {va}+{len:#x}");
        Ok(())
    }

    /// Resolve a page fault at `addr`.
    ///
    /// - A present page that permits `access` only had a stale TLB entry; the
    ///   entry is dropped and [`FaultResolution::Stale`] returned.
    /// - A non-present page inside a `Reserved` region that permits `access`
    ///   gets a zeroed frame: [`FaultResolution::Committed`].
    ///
    /// # Errors
    /// - [`Status::PageNotPresent`] for anything else.
    /// - [`Status::OutOfResources`] if the commit finds no frame.
    pub fn resolve_fault<A: FrameAlloc>(
        &self,
        space: &AddressSpaceState<'_>,
        alloc: &mut A,
        addr: VirtualAddress,
        access: FaultAccess,
    ) -> KResult<FaultResolution> {
        let page = VirtualPage::<Size4K>::containing_address(addr);
        let aspace = self.aspace(space.root);

        if let Some(leaf) = aspace.leaf(page.base()) {
            if Protection::from_leaf(leaf).permits(access) {
                // SAFETY: fault resolution runs in ring 0; the stale entry is dropped.
                unsafe { invalidate_tlb_page(page) };
                return Ok(FaultResolution::Stale);
            }
            log::debug!("vmm: protection fault at {addr} ({access:?})");
            return Err(Status::PageNotPresent);
        }

        let region = space.region_at(addr).ok_or(Status::PageNotPresent)?;
        if region.backing != Backing::Reserved || !region.protection.permits(access) {
            return Err(Status::PageNotPresent);
        }
        let frame = alloc.alloc_4k().ok_or(Status::OutOfResources)?;
        self.mapper.zero_frame(frame);
        if let Err(e) = aspace.map_one(alloc, page.base(), frame.base(), region.protection.leaf_bits()) {
            alloc.free_4k(frame);
            return Err(e.into());
        }
        log::trace!("vmm: committed {} at {}", frame.base(), page.base());
        Ok(FaultResolution::Committed)
    }

    /// Physical address `va` translates to.
    #[must_use]
    pub fn translate(&self, space: &AddressSpaceState<'_>, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.aspace(space.root).query(va)
    }

    /// Protection of the present page at `va`.
    #[must_use]
    pub fn protection_of(&self, space: &AddressSpaceState<'_>, va: VirtualAddress) -> Option<Protection> {
        self.aspace(space.root).leaf(va).map(Protection::from_leaf)
    }

    /// Make sure page tables exist for every directory slot of
    /// `[va, va + len)`, so that later kernel-half mappings are visible in
    /// every directory that copied the kernel half.
    ///
    /// # Errors
    /// [`Status::OutOfResources`] if a table cannot be allocated.
    pub fn prepare_tables<A: FrameAlloc>(
        &self,
        space: &AddressSpaceState<'_>,
        alloc: &mut A,
        va: VirtualAddress,
        len: u32,
    ) -> KResult<()> {
        let aspace = self.aspace(space.root);
        let end = u64::from(va.as_u32()) + u64::from(len);
        let mut slot = u64::from(va.as_u32() & !(LARGE_PAGE - 1));
        while slot < end {
            #[allow(clippy::cast_possible_truncation)]
            let at = VirtualAddress::new(slot as u32);
            if !aspace.leaf(at).is_some_and(|f| f.large_page()) {
                aspace.ensure_table(alloc, at)?;
            }
            slot += u64::from(LARGE_PAGE);
        }
        Ok(())
    }

    fn check_vacant(&self, space: &AddressSpaceState<'_>, start: u32, end: u32) -> KResult<()> {
        if space.intersects(start, end) {
            return Err(Status::MemoryAlreadyMapped);
        }
        let aspace = self.aspace(space.root);
        let present = (start..end)
            .step_by(PAGE_SIZE as usize)
            .any(|p| aspace.leaf(VirtualAddress::new(p)).is_some());
        if present {
            return Err(Status::MemoryAlreadyMapped);
        }
        if space.regions.is_full() {
            return Err(Status::MmTooManyEntries);
        }
        Ok(())
    }

    /// Reject unmapping only part of a 4 MiB leaf.
    fn check_large_cuts(aspace: &AddressSpace<'m, M>, start: u32, end: u32) -> KResult<()> {
        let mut slot = start & !(LARGE_PAGE - 1);
        while slot < end {
            let large = aspace
                .leaf(VirtualAddress::new(slot))
                .is_some_and(|f| f.large_page());
            let inside = slot >= start && u64::from(slot) + u64::from(LARGE_PAGE) <= u64::from(end);
            if large && !inside {
                return Err(Status::BadAlignment);
            }
            match slot.checked_add(LARGE_PAGE) {
                Some(next) => slot = next,
                None => break,
            }
        }
        Ok(())
    }

    /// Drop the mappings of `[from, to)`, freeing owned frames.
    fn clear<A: FrameAlloc>(
        aspace: &AddressSpace<'m, M>,
        alloc: &mut A,
        from: u32,
        to: u32,
        backing: Backing,
    ) {
        let mut at = from;
        while at < to {
            let va = VirtualAddress::new(at);
            if va.is_aligned::<Size4M>() && aspace.leaf(va).is_some_and(|f| f.large_page()) {
                if aspace.unmap_large(va).is_ok() {
                    // SAFETY: ring 0; the entry was just cleared.
                    unsafe { invalidate_tlb_page(VirtualPage::containing_address(va)) };
                }
                at = at.saturating_add(LARGE_PAGE);
                continue;
            }
            if let Ok((frame, _)) = aspace.unmap_one(va) {
                // SAFETY: ring 0; the entry was just cleared.
                unsafe { invalidate_tlb_page(VirtualPage::containing_address(va)) };
                if !matches!(backing, Backing::Physical(_)) {
                    alloc.free_4k(frame);
                }
            }
            at += PAGE_SIZE;
        }
    }

    /// Undo the first `len` bytes of a partially written mapping at `va`.
    fn rollback<A: FrameAlloc>(
        aspace: &AddressSpace<'m, M>,
        alloc: &mut A,
        va: VirtualAddress,
        len: u32,
        owned: bool,
    ) {
        let backing = if owned {
            Backing::Anonymous
        } else {
            Backing::Physical(PhysicalAddress::new(0))
        };
        Self::clear(aspace, alloc, va.as_u32(), va.as_u32() + len, backing);
        Self::release_tables(aspace, alloc, va.as_u32(), va.as_u32() + len.max(PAGE_SIZE));
        log::debug!("vmm: rolled back {va}+{len:#x}");
    }

    /// Free the user-half page tables over `[start, end)` that map nothing.
    fn release_tables<A: FrameAlloc>(
        aspace: &AddressSpace<'m, M>,
        alloc: &mut A,
        start: u32,
        end: u32,
    ) {
        let mut slot = start & !(LARGE_PAGE - 1);
        while slot < end && slot < USER_END {
            if let Some(table) = aspace.release_table_if_empty(VirtualAddress::new(slot)) {
                alloc.free_4k(table);
            }
            slot += LARGE_PAGE;
        }
    }
}

fn check_aligned(values: &[u32]) -> KResult<()> {
    if values.iter().all(|v| v.is_multiple_of(PAGE_SIZE)) {
        Ok(())
    } else {
        Err(Status::BadAlignment)
    }
}

/// Validate a non-empty, non-wrapping range for `space`; returns its end.
fn check_range(space: &AddressSpaceState<'_>, va: VirtualAddress, len: u32) -> KResult<u32> {
    let end = va
        .as_u32()
        .checked_add(len)
        .filter(|_| len > 0)
        .ok_or(Status::BadParameter)?;
    if space.kind == SpaceKind::Process && end > USER_END {
        return Err(Status::BadParameter);
    }
    Ok(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pma::{FrameInfo, PhysicalMemoryAllocator};
    use kernel_vmem::test_support::TestPhys;

    const FRAMES: usize = 64;

    struct Fixture {
        phys: TestPhys,
        db: Vec<FrameInfo>,
        slots: Vec<RegionSlot>,
    }

    impl Fixture {
        fn new(slots: usize) -> Self {
            Self {
                phys: TestPhys::with_frames(FRAMES),
                db: vec![FrameInfo::RESERVED; FRAMES],
                slots: (0..slots).map(|_| Slot::vacant()).collect(),
            }
        }

        /// PMA over the simulated RAM, minus the low 16 frames which serve
        /// as "device memory" for `Physical` mappings.
        fn parts(
            &mut self,
        ) -> (
            Vmm<'_, TestPhys>,
            PhysicalMemoryAllocator<'_>,
            &mut [RegionSlot],
        ) {
            let mut pma = PhysicalMemoryAllocator::new(&mut self.db, PhysicalAddress::new(0)).unwrap();
            pma.release_region(PhysicalAddress::new(0x10000), (FRAMES as u32 - 16) * 4096);
            (Vmm::new(&self.phys), pma, &mut self.slots)
        }
    }

    const RW: Protection = Protection::KERNEL_RW;

    fn va(v: u32) -> VirtualAddress {
        VirtualAddress::new(v)
    }

    fn pa(v: u32) -> PhysicalAddress {
        PhysicalAddress::new(v)
    }

    #[test]
    fn map_checks_alignment_before_parameters() {
        let mut fx = Fixture::new(8);
        let (vmm, mut pma, slots) = fx.parts();
        let mut space = vmm.create_kernel_space(&mut pma, slots).unwrap();
        assert_eq!(vmm.map(&mut space, &mut pma, va(0x1001), pa(0), 0, RW), Err(Status::BadAlignment));
        assert_eq!(vmm.map(&mut space, &mut pma, va(0x1000), pa(0), 0, RW), Err(Status::BadParameter));
        assert_eq!(
            vmm.map(&mut space, &mut pma, va(0xFFFF_F000), pa(0), 0x2000, RW),
            Err(Status::BadParameter)
        );
        assert_eq!(space.region_count(), 0);
    }

    #[test]
    fn map_translate_and_double_map() {
        let mut fx = Fixture::new(8);
        let (vmm, mut pma, slots) = fx.parts();
        let mut space = vmm.create_kernel_space(&mut pma, slots).unwrap();
        vmm.map(&mut space, &mut pma, va(0xE000_0000), pa(0x3000), 0x3000, RW).unwrap();
        assert_eq!(vmm.translate(&space, va(0xE000_2010)), Some(pa(0x5010)));
        assert_eq!(vmm.protection_of(&space, va(0xE000_1000)), Some(RW));

        assert_eq!(
            vmm.map(&mut space, &mut pma, va(0xE000_2000), pa(0x8000), 0x2000, RW),
            Err(Status::MemoryAlreadyMapped)
        );
        assert_eq!(
            vmm.map(&mut space, &mut pma, va(0xDFFF_F000), pa(0x8000), 0x2000, RW),
            Err(Status::MemoryAlreadyMapped)
        );
        assert_eq!(vmm.translate(&space, va(0xDFFF_F000)), None);
    }

    #[test]
    fn unmap_of_untracked_range_fails() {
        let mut fx = Fixture::new(8);
        let (vmm, mut pma, slots) = fx.parts();
        let mut space = vmm.create_kernel_space(&mut pma, slots).unwrap();
        assert_eq!(
            vmm.unmap(&mut space, &mut pma, va(0x40_0000), 0x1000),
            Err(Status::MemoryAlreadyUnmapped)
        );
        vmm.map(&mut space, &mut pma, va(0x40_0000), pa(0x1000), 0x1000, RW).unwrap();
        assert_eq!(
            vmm.unmap(&mut space, &mut pma, va(0x40_0000), 0x2000),
            Err(Status::MemoryAlreadyUnmapped)
        );
        assert!(vmm.translate(&space, va(0x40_0000)).is_some());
    }

    #[test]
    fn unmap_splits_regions_and_frees_owned_frames() {
        let mut fx = Fixture::new(8);
        let (vmm, mut pma, slots) = fx.parts();
        let mut space = vmm.create_kernel_space(&mut pma, slots).unwrap();
        let before = pma.free_frames();

        vmm.map_anonymous(&mut space, &mut pma, va(0x40_0000), 0x4000, RW).unwrap();
        // One table plus four frames.
        assert_eq!(pma.free_frames(), before - 5);

        vmm.unmap(&mut space, &mut pma, va(0x40_1000), 0x2000).unwrap();
        assert_eq!(pma.free_frames(), before - 3);
        let regions: Vec<_> = space.regions().map(|r| (r.base.as_u32(), r.len)).collect();
        assert_eq!(regions, vec![(0x40_0000, 0x1000), (0x40_3000, 0x1000)]);

        vmm.unmap(&mut space, &mut pma, va(0x40_0000), 0x4000).unwrap_err();
        vmm.unmap(&mut space, &mut pma, va(0x40_0000), 0x1000).unwrap();
        vmm.unmap(&mut space, &mut pma, va(0x40_3000), 0x1000).unwrap();
        // The empty user-half table went back as well.
        assert_eq!(pma.free_frames(), before);
        assert_eq!(space.region_count(), 0);
    }

    #[test]
    fn physical_frames_survive_unmap_and_keep_offsets_on_split() {
        let mut fx = Fixture::new(8);
        let (vmm, mut pma, slots) = fx.parts();
        let mut space = vmm.create_kernel_space(&mut pma, slots).unwrap();
        vmm.map(&mut space, &mut pma, va(0xE000_0000), pa(0x4000), 0x3000, RW).unwrap();
        let free = pma.free_frames();
        vmm.unmap(&mut space, &mut pma, va(0xE000_0000), 0x1000).unwrap();
        assert_eq!(pma.free_frames(), free);
        let rest = *space.region_at(va(0xE000_1000)).unwrap();
        assert_eq!(rest.backing, Backing::Physical(pa(0x5000)));
        assert_eq!(vmm.translate(&space, va(0xE000_1000)), Some(pa(0x5000)));
    }

    #[test]
    fn full_region_tree_rejects_map_and_split() {
        let mut fx = Fixture::new(1);
        let (vmm, mut pma, slots) = fx.parts();
        let mut space = vmm.create_kernel_space(&mut pma, slots).unwrap();
        vmm.map(&mut space, &mut pma, va(0xE000_0000), pa(0x1000), 0x3000, RW).unwrap();
        assert_eq!(
            vmm.map(&mut space, &mut pma, va(0xE010_0000), pa(0x1000), 0x1000, RW),
            Err(Status::MmTooManyEntries)
        );
        assert_eq!(
            vmm.unmap(&mut space, &mut pma, va(0xE000_1000), 0x1000),
            Err(Status::MmTooManyEntries)
        );
        assert!(vmm.translate(&space, va(0xE000_1000)).is_some());
    }

    #[test]
    fn anonymous_map_rolls_back_when_frames_run_out() {
        let mut fx = Fixture::new(8);
        let (vmm, mut pma, slots) = fx.parts();
        let mut space = vmm.create_kernel_space(&mut pma, slots).unwrap();
        let free = pma.free_frames();
        let too_many = (free + 4) * PAGE_SIZE;
        assert_eq!(
            vmm.map_anonymous(&mut space, &mut pma, va(0x100_0000), too_many, RW),
            Err(Status::OutOfResources)
        );
        assert_eq!(pma.free_frames(), free);
        assert_eq!(space.region_count(), 0);
        assert_eq!(vmm.translate(&space, va(0x100_0000)), None);
    }

    #[test]
    fn reserved_page_commits_exactly_once() {
        let mut fx = Fixture::new(8);
        let (vmm, mut pma, slots) = fx.parts();
        let mut space = vmm.create_kernel_space(&mut pma, slots).unwrap();
        vmm.reserve(&mut space, va(0x80_0000), 0x4000, Protection::USER_RW).unwrap();
        let free = pma.free_frames();
        for frame in 16..FRAMES as u32 {
            vmm.mapper.write_byte(pa((frame << 12) + 0x234), 0xAA);
        }

        let access = FaultAccess::write().from_user();
        assert_eq!(
            vmm.resolve_fault(&space, &mut pma, va(0x80_1234), access),
            Ok(FaultResolution::Committed)
        );
        let frame = vmm.translate(&space, va(0x80_1000)).unwrap();
        assert_eq!(vmm.mapper.read_byte(frame + 0x234), 0);
        assert_eq!(
            vmm.resolve_fault(&space, &mut pma, va(0x80_1FFF), access),
            Ok(FaultResolution::Stale)
        );
        assert_eq!(vmm.translate(&space, va(0x80_1000)), Some(frame));
        // One table and one frame.
        assert_eq!(pma.free_frames(), free - 2);

        vmm.unmap(&mut space, &mut pma, va(0x80_0000), 0x4000).unwrap();
        assert_eq!(pma.free_frames(), free);
    }

    #[test]
    fn unresolvable_faults_report_page_not_present() {
        let mut fx = Fixture::new(8);
        let (vmm, mut pma, slots) = fx.parts();
        let mut space = vmm.create_kernel_space(&mut pma, slots).unwrap();
        vmm.reserve(&mut space, va(0x80_0000), 0x1000, Protection::KERNEL_RO).unwrap();
        vmm.map(&mut space, &mut pma, va(0xE000_0000), pa(0x1000), 0x1000, Protection::KERNEL_RO)
            .unwrap();

        // Outside any region.
        assert_eq!(
            vmm.resolve_fault(&space, &mut pma, va(0x90_0000), FaultAccess::read()),
            Err(Status::PageNotPresent)
        );
        // Write to a read-only reservation.
        assert_eq!(
            vmm.resolve_fault(&space, &mut pma, va(0x80_0000), FaultAccess::write()),
            Err(Status::PageNotPresent)
        );
        // User access to a kernel reservation.
        assert_eq!(
            vmm.resolve_fault(&space, &mut pma, va(0x80_0000), FaultAccess::read().from_user()),
            Err(Status::PageNotPresent)
        );
        // Write to a present read-only page.
        assert_eq!(
            vmm.resolve_fault(&space, &mut pma, va(0xE000_0000), FaultAccess::write()),
            Err(Status::PageNotPresent)
        );
    }

    #[test]
    fn commit_without_frames_is_out_of_resources() {
        let mut fx = Fixture::new(8);
        let (vmm, mut pma, slots) = fx.parts();
        let mut space = vmm.create_kernel_space(&mut pma, slots).unwrap();
        vmm.reserve(&mut space, va(0xE000_0000), 0x1000, RW).unwrap();
        while pma.allocate_frame().is_ok() {}
        assert_eq!(
            vmm.resolve_fault(&space, &mut pma, va(0xE000_0000), FaultAccess::write()),
            Err(Status::OutOfResources)
        );
    }

    #[test]
    fn random_map_unmap_keeps_regions_disjoint_and_sorted() {
        let mut fx = Fixture::new(32);
        let (vmm, mut pma, slots) = fx.parts();
        let mut space = vmm.create_kernel_space(&mut pma, slots).unwrap();
        let mut x = 0x1234_5678u32;
        let mut next = move || {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            x
        };
        for _ in 0..2000 {
            let page = next() % 64;
            let pages = 1 + next() % 4;
            let at = va(0xE000_0000 + page * PAGE_SIZE);
            let len = pages * PAGE_SIZE;
            let _ = if next() % 2 == 0 {
                vmm.reserve(&mut space, at, len, RW)
            } else {
                vmm.unmap(&mut space, &mut pma, at, len)
            };
            let regions: Vec<_> = space.regions().copied().collect();
            for pair in regions.windows(2) {
                assert!(pair[0].end() <= pair[1].base.as_u32());
            }
        }
    }

    #[test]
    fn process_spaces_share_the_kernel_half() {
        let mut fx = Fixture::new(8);
        let (vmm, mut pma, slots) = fx.parts();
        let (kslots, pslots) = slots.split_at_mut(4);
        let mut kernel = vmm.create_kernel_space(&mut pma, kslots).unwrap();
        vmm.map(&mut kernel, &mut pma, va(0xE000_0000), pa(0x2000), 0x1000, RW).unwrap();

        let free = pma.free_frames();
        let mut process = vmm.create_address_space(&kernel, &mut pma, pslots).unwrap();
        assert_eq!(vmm.translate(&process, va(0xE000_0000)), Some(pa(0x2000)));
        assert_eq!(
            vmm.map(&mut process, &mut pma, va(0xE010_0000), pa(0x2000), 0x1000, RW),
            Err(Status::BadParameter)
        );
        vmm.map_anonymous(&mut process, &mut pma, va(0x40_0000), 0x2000, Protection::USER_RW)
            .unwrap();
        vmm.reserve(&mut process, va(0x80_0000), 0x1000, Protection::USER_RW).unwrap();
        vmm.resolve_fault(&process, &mut pma, va(0x80_0000), FaultAccess::read().from_user())
            .unwrap();

        vmm.destroy_address_space(process, &mut pma).unwrap();
        assert_eq!(pma.free_frames(), free);
        assert_eq!(vmm.translate(&kernel, va(0xE000_0000)), Some(pa(0x2000)));
        assert_eq!(vmm.destroy_address_space(kernel, &mut pma), Err(Status::OperationNotAllowed));
    }

    #[test]
    fn adopted_large_pages_unmap_only_whole() {
        let mut fx = Fixture::new(8);
        let (vmm, mut pma, slots) = fx.parts();
        let mut space = vmm.create_kernel_space(&mut pma, slots).unwrap();
        let aspace = vmm.aspace(space.root());
        aspace
            .map_large(va(0xC000_0000), pa(0), RW.leaf_bits().with_large_page(true))
            .unwrap();
        vmm.adopt(&mut space, va(0xC000_0000), pa(0), LARGE_PAGE, RW).unwrap();
        assert_eq!(
            vmm.map(&mut space, &mut pma, va(0xC000_1000), pa(0x1000), 0x1000, RW),
            Err(Status::MemoryAlreadyMapped)
        );
        assert_eq!(
            vmm.unmap(&mut space, &mut pma, va(0xC000_0000), 0x1000),
            Err(Status::BadAlignment)
        );
        vmm.unmap(&mut space, &mut pma, va(0xC000_0000), LARGE_PAGE).unwrap();
        assert_eq!(vmm.translate(&space, va(0xC000_0000)), None);
    }
}
