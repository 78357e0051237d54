//! # Address Space (i686, page-directory rooted)
//!
//! Strongly-typed helpers to build and manipulate a **single** virtual address
//! space (a page directory and its page tables).
//!
//! ## Highlights
//!
//! - [`AddressSpace::map_one`] installs one 4 KiB mapping, creating the page
//!   table on demand.
//! - [`AddressSpace::map_large`] installs one 4 MiB directory mapping.
//! - [`AddressSpace::unmap_one`] clears a single PTE and hands back the frame.
//! - [`AddressSpace::query`] translates a VA to a PA (handles 4 MiB pages).
//! - [`AddressSpace::activate`] loads CR3 with this space's root.
//!
//! ## Design
//!
//! - Directory links are permissive (present + writable, user for the lower
//!   three quarters); effective rights come from the leaf.
//! - Kernel-half tables are shared between spaces by copying PDEs, so the
//!   kernel half never has its tables released here.
//! - `unsafe` is confined to mapping a physical frame to a typed table through
//!   the [`PhysMapper`].
//!
//! ## Safety
//!
//! - Mutating active mappings requires TLB maintenance
//!   ([`invalidate_tlb_page`](crate::invalidate_tlb_page) per page or a CR3 reload).

use crate::page_table::pd::{PageDirectory, PdEntry, PdEntryKind, PdIndex};
use crate::page_table::pt::{PageTable, PtEntry};
use crate::{FrameAlloc, PageEntryBits, PhysMapper};
use kernel_info::memory::{KERNEL_PDE_START, SELF_MAP_PDE};
use kernel_memory_addresses::{
    MemoryAddressOffset, PhysicalAddress, PhysicalPage, Size4K, Size4M, VirtualAddress,
};
use kernel_status::Status;

/// The page directory frame of an [`AddressSpace`].
pub type RootPage = PhysicalPage<Size4K>;

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: RootPage,
    mapper: &'m M,
}

/// Errors of the single-page operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("out of memory (page table)")]
    OutOfMemory,
    #[error("page already mapped")]
    AlreadyMapped,
    #[error("address covered by a 4 MiB mapping")]
    LargePageConflict,
    #[error("page not mapped")]
    NotMapped,
    #[error("address not aligned to the page size")]
    Unaligned,
}

impl From<MapError> for Status {
    fn from(value: MapError) -> Self {
        match value {
            MapError::OutOfMemory => Self::OutOfResources,
            MapError::AlreadyMapped | MapError::LargePageConflict => Self::MemoryAlreadyMapped,
            MapError::NotMapped => Self::MemoryAlreadyUnmapped,
            MapError::Unaligned => Self::BadAlignment,
        }
    }
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    #[inline]
    pub const fn from_root(mapper: &'m M, root: RootPage) -> Self {
        Self { root, mapper }
    }

    /// Load CR3 with this address space's root.
    ///
    /// # Safety
    /// The kernel half must be present in this space; the code executing the
    /// switch must stay mapped.
    #[inline]
    pub unsafe fn activate(&self) {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        {
            use kernel_registers::ControlRegister;
            use kernel_registers::cr3::Cr3;

            unsafe { Cr3::from_page_directory(self.root.base()).write() }
        }
    }

    /// Physical page of the page directory.
    #[inline]
    pub const fn root_page(&self) -> RootPage {
        self.root
    }

    #[inline]
    pub(crate) fn pd_mut(&self) -> &mut PageDirectory {
        self.mapper.pd_mut(self.root)
    }

    #[inline]
    pub(crate) fn pt_mut(&self, page: PhysicalPage<Size4K>) -> &mut PageTable {
        self.mapper.pt_mut(page)
    }

    /// Return the page table covering `va`, allocating and linking a zeroed
    /// one if missing.
    ///
    /// # Errors
    /// - [`MapError::LargePageConflict`] if a 4 MiB leaf covers `va`.
    /// - [`MapError::OutOfMemory`] if no frame is available for the table.
    pub fn ensure_table<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
    ) -> Result<PhysicalPage<Size4K>, MapError> {
        let i = PdIndex::from(va);
        let pd = self.pd_mut();
        match pd.get(i).kind() {
            Some(PdEntryKind::NextPageTable(page, _)) => Ok(page),
            Some(PdEntryKind::Leaf4MiB(..)) => Err(MapError::LargePageConflict),
            None => {
                let page = alloc.alloc_4k().ok_or(MapError::OutOfMemory)?;
                self.mapper.zero_frame(page);
                let user = i.as_usize() < KERNEL_PDE_START;
                pd.set(i, PdEntry::make_next(page, PageEntryBits::new_table_link(user)));
                log::trace!("linked page table {} at PDE {}", page.base(), i.as_usize());
                Ok(page)
            }
        }
    }

    /// Map **one** 4 KiB page at `va → pa` with `leaf_flags`.
    ///
    /// # Errors
    /// - [`MapError::Unaligned`] if `va` or `pa` is not 4 KiB aligned.
    /// - [`MapError::AlreadyMapped`] if the PTE is present.
    /// - Errors of [`ensure_table`](Self::ensure_table).
    pub fn map_one<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        leaf_flags: PageEntryBits,
    ) -> Result<(), MapError> {
        if !va.is_aligned::<Size4K>() || !pa.is_aligned::<Size4K>() {
            return Err(MapError::Unaligned);
        }
        let pt_page = self.ensure_table(alloc, va)?;
        let pt = self.pt_mut(pt_page);
        let i = PageTable::index_of(va);
        if pt.get(i).is_present() {
            return Err(MapError::AlreadyMapped);
        }
        pt.set(i, PtEntry::make_4k(pa.page(), leaf_flags));
        Ok(())
    }

    /// Map one 4 MiB page with a directory entry.
    ///
    /// # Errors
    /// - [`MapError::Unaligned`] if `va` or `pa` is not 4 MiB aligned.
    /// - [`MapError::AlreadyMapped`] if the directory slot is in use.
    pub fn map_large(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        leaf_flags: PageEntryBits,
    ) -> Result<(), MapError> {
        if !va.is_aligned::<Size4M>() || !pa.is_aligned::<Size4M>() {
            return Err(MapError::Unaligned);
        }
        let pd = self.pd_mut();
        let i = PdIndex::from(va);
        if pd.get(i).is_present() {
            return Err(MapError::AlreadyMapped);
        }
        pd.set(i, PdEntry::make_4m(pa.page(), leaf_flags));
        Ok(())
    }

    /// Unmap a single **4 KiB** page at `va` and return the frame it mapped
    /// together with the old entry flags.
    ///
    /// # Errors
    /// - [`MapError::NotMapped`] if no 4 KiB mapping exists at `va`.
    pub fn unmap_one(
        &self,
        va: VirtualAddress,
    ) -> Result<(PhysicalPage<Size4K>, PageEntryBits), MapError> {
        let Some(pt_page) = self.pd_mut().get(PdIndex::from(va)).next_table() else {
            return Err(MapError::NotMapped);
        };
        let pt = self.pt_mut(pt_page);
        let i = PageTable::index_of(va);
        let Some(mapped) = pt.get(i).page_4k() else {
            return Err(MapError::NotMapped);
        };
        pt.set(i, PtEntry::zero());
        Ok(mapped)
    }

    /// Clear the 4 MiB directory mapping at `va` and return its page.
    ///
    /// # Errors
    /// - [`MapError::Unaligned`] if `va` is not 4 MiB aligned.
    /// - [`MapError::NotMapped`] if the directory slot holds no 4 MiB leaf.
    pub fn unmap_large(&self, va: VirtualAddress) -> Result<PhysicalPage<Size4M>, MapError> {
        if !va.is_aligned::<Size4M>() {
            return Err(MapError::Unaligned);
        }
        let pd = self.pd_mut();
        let i = PdIndex::from(va);
        match pd.get(i).kind() {
            Some(PdEntryKind::Leaf4MiB(page, _)) => {
                pd.set(i, PdEntry::zero());
                Ok(page)
            }
            _ => Err(MapError::NotMapped),
        }
    }

    /// The leaf PTE for `va`, present or not, if a page table covers it.
    #[must_use]
    pub fn entry(&self, va: VirtualAddress) -> Option<PtEntry> {
        let pt_page = self.pd_mut().get(PdIndex::from(va)).next_table()?;
        Some(self.pt_mut(pt_page).get(PageTable::index_of(va)))
    }

    /// Translate a `VirtualAddress` to `PhysicalAddress` if mapped.
    ///
    /// Handles 4 MiB leaves by adding the appropriate **in-page offset**.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        match self.pd_mut().get(PdIndex::from(va)).kind()? {
            PdEntryKind::Leaf4MiB(base, _) => {
                let off: MemoryAddressOffset<Size4M> = va.offset::<Size4M>();
                Some(base.join(off))
            }
            PdEntryKind::NextPageTable(pt_page, _) => {
                let (base, _) = self.pt_mut(pt_page).get(PageTable::index_of(va)).page_4k()?;
                let off: MemoryAddressOffset<Size4K> = va.offset::<Size4K>();
                Some(base.join(off))
            }
        }
    }

    /// Flags of the present leaf (4 KiB or 4 MiB) translating `va`.
    #[must_use]
    pub fn leaf(&self, va: VirtualAddress) -> Option<PageEntryBits> {
        match self.pd_mut().get(PdIndex::from(va)).kind()? {
            PdEntryKind::Leaf4MiB(_, flags) => Some(flags),
            PdEntryKind::NextPageTable(pt_page, _) => {
                let e = self.pt_mut(pt_page).get(PageTable::index_of(va));
                e.is_present().then(|| e.flags())
            }
        }
    }

    /// Unlink and return the page table covering `va` if it maps nothing.
    ///
    /// Kernel-half tables are shared with other spaces and are never released.
    #[must_use]
    pub fn release_table_if_empty(&self, va: VirtualAddress) -> Option<PhysicalPage<Size4K>> {
        let i = PdIndex::from(va);
        if i.as_usize() >= KERNEL_PDE_START {
            return None;
        }
        let pd = self.pd_mut();
        let pt_page = pd.get(i).next_table()?;
        if !self.pt_mut(pt_page).is_empty() {
            return None;
        }
        pd.set(i, PdEntry::zero());
        Some(pt_page)
    }

    /// Page tables linked from the user half of the directory.
    pub fn user_tables(&self) -> impl Iterator<Item = PhysicalPage<Size4K>> + '_ {
        (0..KERNEL_PDE_START).filter_map(|i| {
            #[allow(clippy::cast_possible_truncation)]
            let i = PdIndex::new(i as u16);
            self.pd_mut().get(i).next_table()
        })
    }

    /// Unlink every user-half page table and hand its frame to `alloc`.
    ///
    /// Leaves referenced by the tables are not touched. Returns the number of
    /// tables released.
    pub fn release_user_tables<A: FrameAlloc>(&self, alloc: &mut A) -> usize {
        let pd = self.pd_mut();
        let mut released = 0;
        for i in 0..KERNEL_PDE_START {
            #[allow(clippy::cast_possible_truncation)]
            let i = PdIndex::new(i as u16);
            if let Some(pt_page) = pd.get(i).next_table() {
                pd.set(i, PdEntry::zero());
                alloc.free_4k(pt_page);
                released += 1;
            }
        }
        released
    }

    /// Copy the kernel-half directory entries of `kernel` into this space.
    pub fn share_kernel_half(&self, kernel: &AddressSpace<'_, M>) {
        let dst = self.pd_mut();
        let src = kernel.pd_mut();
        for i in KERNEL_PDE_START..SELF_MAP_PDE {
            #[allow(clippy::cast_possible_truncation)]
            let i = PdIndex::new(i as u16);
            dst.set(i, src.get(i));
        }
    }

    /// Point the last directory entry back at the directory itself, exposing
    /// every page table of this space at `0xFFC0_0000`.
    pub fn install_self_map(&self) {
        #[allow(clippy::cast_possible_truncation)]
        let i = PdIndex::new(SELF_MAP_PDE as u16);
        self.pd_mut()
            .set(i, PdEntry::make_next(self.root, PageEntryBits::new_table_link(false)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{BumpAlloc, TestPhys};

    fn fresh(phys: &TestPhys, alloc: &mut BumpAlloc) -> RootPage {
        let root = alloc.alloc_4k().unwrap();
        phys.zero_frame(root);
        root
    }

    #[test]
    fn map_one_4k_creates_table_and_leaf() {
        let phys = TestPhys::with_frames(16);
        let mut alloc = BumpAlloc::new(0, 16 << 12);
        let aspace = AddressSpace::from_root(&phys, fresh(&phys, &mut alloc));

        let va = VirtualAddress::new(0x0040_3000);
        let pa = PhysicalAddress::new(0x0000_A000);
        aspace
            .map_one(&mut alloc, va, pa, PageEntryBits::new_kernel_rw())
            .expect("map_one");

        let pde = aspace.pd_mut().get(PdIndex::from(va));
        let pt_page = pde.next_table().expect("table linked");
        assert!(pde.flags().user_access(), "user-half link");
        let pte = aspace.pt_mut(pt_page).get(PageTable::index_of(va));
        assert!(pte.is_present());
        assert_eq!(pte.flags().physical_address(), pa);
        assert_eq!(aspace.query(va + 0x123), Some(pa + 0x123));
    }

    #[test]
    fn double_map_is_rejected() {
        let phys = TestPhys::with_frames(8);
        let mut alloc = BumpAlloc::new(0, 8 << 12);
        let aspace = AddressSpace::from_root(&phys, fresh(&phys, &mut alloc));
        let va = VirtualAddress::new(0x1000);
        let flags = PageEntryBits::new_kernel_rw();
        aspace
            .map_one(&mut alloc, va, PhysicalAddress::new(0x5000), flags)
            .unwrap();
        assert_eq!(
            aspace.map_one(&mut alloc, va, PhysicalAddress::new(0x6000), flags),
            Err(MapError::AlreadyMapped)
        );
        assert_eq!(
            aspace.map_one(&mut alloc, va + 1, PhysicalAddress::new(0x6000), flags),
            Err(MapError::Unaligned)
        );
    }

    #[test]
    fn large_page_translation_and_conflict() {
        let phys = TestPhys::with_frames(8);
        let mut alloc = BumpAlloc::new(0, 8 << 12);
        let aspace = AddressSpace::from_root(&phys, fresh(&phys, &mut alloc));
        let va = VirtualAddress::new(0xC000_0000);
        aspace
            .map_large(va, PhysicalAddress::new(0), PageEntryBits::new_kernel_rw())
            .unwrap();
        assert_eq!(
            aspace.query(VirtualAddress::new(0xC012_3456)),
            Some(PhysicalAddress::new(0x0012_3456))
        );
        assert_eq!(
            aspace.map_one(
                &mut alloc,
                VirtualAddress::new(0xC000_1000),
                PhysicalAddress::new(0x1000),
                PageEntryBits::new_kernel_rw()
            ),
            Err(MapError::LargePageConflict)
        );
        assert!(aspace.leaf(va).is_some_and(|f| f.large_page()));
        assert_eq!(aspace.unmap_large(va + 0x1000), Err(MapError::Unaligned));
        assert_eq!(aspace.unmap_large(va).map(|p| p.base()), Ok(PhysicalAddress::new(0)));
        assert_eq!(aspace.query(va), None);
    }

    #[test]
    fn unmap_returns_frame_and_releases_empty_table() {
        let phys = TestPhys::with_frames(8);
        let mut alloc = BumpAlloc::new(0, 8 << 12);
        let aspace = AddressSpace::from_root(&phys, fresh(&phys, &mut alloc));
        let va = VirtualAddress::new(0x0080_0000);
        let pa = PhysicalAddress::new(0x7000);
        aspace
            .map_one(&mut alloc, va, pa, PageEntryBits::new_kernel_rw())
            .unwrap();

        let (frame, _) = aspace.unmap_one(va).unwrap();
        assert_eq!(frame.base(), pa);
        assert_eq!(aspace.unmap_one(va), Err(MapError::NotMapped));
        assert_eq!(aspace.query(va), None);
        assert!(aspace.entry(va).is_some_and(|e| !e.is_present()));

        let table = aspace.release_table_if_empty(va).expect("empty table released");
        assert_eq!(aspace.user_tables().count(), 0);
        assert_ne!(table, aspace.root_page());
        assert!(aspace.entry(va).is_none());
    }

    #[test]
    fn leaf_flags_and_user_table_release() {
        let phys = TestPhys::with_frames(8);
        let mut alloc = BumpAlloc::new(0, 8 << 12);
        let aspace = AddressSpace::from_root(&phys, fresh(&phys, &mut alloc));
        let va = VirtualAddress::new(0x0040_0000);
        aspace
            .map_one(&mut alloc, va, PhysicalAddress::new(0x5000), PageEntryBits::new_user_ro())
            .unwrap();
        let leaf = aspace.leaf(va).expect("present leaf");
        assert!(leaf.user_access() && !leaf.writable());
        assert!(aspace.leaf(va + 0x1000).is_none());

        assert_eq!(aspace.release_user_tables(&mut alloc), 1);
        assert_eq!(alloc.freed, 1);
        assert!(aspace.leaf(va).is_none());
    }

    #[test]
    fn kernel_half_sharing_and_self_map() {
        let phys = TestPhys::with_frames(16);
        let mut alloc = BumpAlloc::new(0, 16 << 12);
        let kernel = AddressSpace::from_root(&phys, fresh(&phys, &mut alloc));
        let kva = VirtualAddress::new(0xD000_0000);
        kernel
            .map_one(&mut alloc, kva, PhysicalAddress::new(0xF000), PageEntryBits::new_kernel_rw())
            .unwrap();

        let process = AddressSpace::from_root(&phys, fresh(&phys, &mut alloc));
        process.share_kernel_half(&kernel);
        process.install_self_map();

        assert_eq!(process.query(kva), Some(PhysicalAddress::new(0xF000)));
        let self_pde = process.pd_mut().get(PdIndex::new(1023));
        assert_eq!(self_pde.next_table(), Some(process.root_page()));
        assert!(!self_pde.flags().user_access());
        assert!(process.release_table_if_empty(kva).is_none());
    }
}
