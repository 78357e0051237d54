//! # i686 Page Directory
//!
//! - [`PdIndex`]: index type for VA bits `[31:22]`.
//! - [`PdEntry`]: a directory entry; either a link to a [`PageTable`](super::pt::PageTable)
//!   (`PS=0`) or a 4 MiB leaf (`PS=1`).
//! - [`PageDirectory`]: a 4 KiB-aligned array of 1024 PDEs.

use crate::PageEntryBits;
use crate::page_table::ENTRIES;
use kernel_memory_addresses::{PhysicalPage, Size4K, Size4M, VirtualAddress};

/// Index into the Page Directory (derived from VA bits `[31:22]`).
#[repr(transparent)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PdIndex(u16);

/// A single Page Directory entry (PDE).
#[doc(alias = "PDE")]
#[repr(transparent)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PdEntry(PageEntryBits);

/// Decoded kind of a present PDE.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PdEntryKind {
    /// Link to a page table.
    NextPageTable(PhysicalPage<Size4K>, PageEntryBits),
    /// 4 MiB leaf mapping.
    Leaf4MiB(PhysicalPage<Size4M>, PageEntryBits),
}

/// The Page Directory: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PD")]
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PdEntry; ENTRIES],
}

impl PdIndex {
    /// Build an index from a virtual address (extracts bits `[31:22]`).
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new((va.as_u32() >> 22) as u16)
    }

    /// Construct from a raw `u16`, asserting `v < 1024` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!(v < 1024);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// First virtual address covered by this directory slot.
    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new((self.0 as u32) << 22)
    }
}

impl PdEntry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(PageEntryBits::new())
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0.present()
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageEntryBits {
        self.0
    }

    /// Decode a present entry.
    #[inline]
    #[must_use]
    pub const fn kind(self) -> Option<PdEntryKind> {
        if !self.is_present() {
            return None;
        }
        let pa = self.0.physical_address();
        if self.0.large_page() {
            Some(PdEntryKind::Leaf4MiB(PhysicalPage::from_addr(pa), self.0))
        } else {
            Some(PdEntryKind::NextPageTable(PhysicalPage::from_addr(pa), self.0))
        }
    }

    /// The linked page table, if this is a present non-leaf entry.
    #[inline]
    #[must_use]
    pub const fn next_table(self) -> Option<PhysicalPage<Size4K>> {
        match self.kind() {
            Some(PdEntryKind::NextPageTable(page, _)) => Some(page),
            _ => None,
        }
    }

    /// Link to a page table (`PS=0`).
    #[inline]
    #[must_use]
    pub const fn make_next(pt_page: PhysicalPage<Size4K>, mut flags: PageEntryBits) -> Self {
        flags.set_large_page(false);
        flags.set_present(true);
        flags.set_physical_address(pt_page.base());
        Self(flags)
    }

    /// 4 MiB leaf (`PS=1`).
    #[inline]
    #[must_use]
    pub const fn make_4m(page: PhysicalPage<Size4M>, mut flags: PageEntryBits) -> Self {
        flags.set_large_page(true);
        flags.set_present(true);
        flags.set_physical_address(page.base());
        Self(flags)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0.into_bits()
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(v: u32) -> Self {
        Self(PageEntryBits::from_bits(v))
    }
}

impl PageDirectory {
    /// Create a fully zeroed Page Directory (all entries non-present).
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PdEntry::zero(); ENTRIES],
        }
    }

    /// Clear every entry.
    #[inline]
    pub fn zero(&mut self) {
        self.entries = [PdEntry::zero(); ENTRIES];
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: PdIndex) -> PdEntry {
        self.entries[i.as_usize()]
    }

    /// Write the entry at `i`.
    ///
    /// Caller must handle any required TLB invalidation when changing active mappings.
    #[inline]
    pub const fn set(&mut self, i: PdIndex, e: PdEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// Derive the PD index from a virtual address.
    #[inline]
    #[must_use]
    pub const fn index_of(va: VirtualAddress) -> PdIndex {
        PdIndex::from(va)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use kernel_memory_addresses::PhysicalAddress;

    #[test]
    fn pde_link_vs_leaf() {
        let pt = PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(0x0020_0000));
        let link = PdEntry::make_next(pt, PageEntryBits::new_table_link(false));
        assert_eq!(link.next_table(), Some(pt));

        let big = PhysicalPage::<Size4M>::from_addr(PhysicalAddress::new(0x0040_0000));
        let leaf = PdEntry::make_4m(big, PageEntryBits::new_kernel_rw());
        assert!(matches!(leaf.kind(), Some(PdEntryKind::Leaf4MiB(p, _)) if p == big));
        assert_eq!(leaf.next_table(), None);
        assert_eq!(PdEntry::zero().kind(), None);
    }

    #[test]
    fn index_base() {
        let i = PdIndex::from(VirtualAddress::new(0xFFC0_1234));
        assert_eq!(i.as_usize(), 1023);
        assert_eq!(i.base(), VirtualAddress::new(0xFFC0_0000));
    }
}
