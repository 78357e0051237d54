//! # Virtual Memory Support
//!
//! Two-level i686 paging (no PAE) for the kernel's memory manager.
//!
//! ## What you get
//! - An [`AddressSpace`] describing a page-directory rooted translation tree.
//! - Page table types ([`PageDirectory`], [`PageTable`]) with typed indices.
//! - The raw entry layout [`PageEntryBits`] and the layout-independent
//!   [`Protection`] flags.
//! - A tiny allocator/mapper interface ([`FrameAlloc`], [`PhysMapper`]).
//! - The [`FaultResolver`] capability handed to the exception dispatcher.
//!
//! ## i686 Virtual Address → Physical Address Walk
//!
//! Each 32-bit virtual address is divided into three fields:
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |   PD  |   PT  | Offset |
//! ```
//!
//! ```text
//!  CR3 → PD  →  PT  →  Physical Page
//!         │      │
//!         │      └───► PTE → maps 4 KiB page
//!         └──────────► PDE → PS=1 → maps 4 MiB page
//! ```
//!
//! | Level | Table name | Entry name | Description |
//! |:------|:-----------|:-----------|:------------|
//! | 1 | **PD** (Page Directory) | **PDE** | 1024 entries, referenced by `CR3`. With `PS=1` a leaf mapping 4 MiB. |
//! | 2 | **PT** (Page Table) | **PTE** | 1024 entries, each mapping a 4 KiB page. |
//!
//! The directory's last entry points back at the directory itself (the
//! *self map*), which exposes all page tables of the active space at
//! `0xFFC0_0000`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod address_space;
pub mod fault;
mod page_entry_bits;
pub mod page_table;
mod protection;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use crate::address_space::{AddressSpace, MapError, RootPage};
pub use crate::fault::{FaultAccess, FaultResolution, FaultResolver};
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::pd::{PageDirectory, PdEntry, PdIndex};
pub use crate::page_table::pt::{PageTable, PtEntry, PtIndex};
pub use crate::protection::Protection;

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualPage};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

/// Minimal frame allocator used to obtain **physical** 4 KiB frames
/// for page tables.
///
/// Returned frames **must** be 4 KiB aligned and reachable through the
/// [`PhysMapper`] in use.
pub trait FrameAlloc {
    /// Allocate one 4 KiB *physical* frame. Returns `None` on out-of-memory.
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Return a frame obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&mut self, page: PhysicalPage<Size4K>);
}

/// Converts physical addresses to usable references in the current virtual
/// address space (the kernel's direct map, or simulated RAM in tests).
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// - `pa` must be covered by the mapping strategy and writable.
    /// - Type `T` must match the bytes at `pa` and fit into the frame.
    /// - The caller must not create overlapping references to the same frame.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// Borrow the frame as a page directory.
    #[inline]
    fn pd_mut(&self, page: PhysicalPage<Size4K>) -> &mut PageDirectory {
        unsafe { self.phys_to_mut::<PageDirectory>(page.base()) }
    }

    /// Borrow the frame as a page table.
    #[inline]
    fn pt_mut(&self, page: PhysicalPage<Size4K>) -> &mut PageTable {
        unsafe { self.phys_to_mut::<PageTable>(page.base()) }
    }

    /// Fill the frame with zeros.
    #[inline]
    fn zero_frame(&self, page: PhysicalPage<Size4K>) {
        let bytes = unsafe { self.phys_to_mut::<[u8; 4096]>(page.base()) };
        bytes.fill(0);
    }
}

/// Invalidate the TLB entry of one page on this CPU.
///
/// # Safety
/// Must run at CPL0. A no-op on hosted builds.
#[inline(always)]
pub unsafe fn invalidate_tlb_page(page: VirtualPage<Size4K>) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    unsafe {
        core::arch::asm!(
            "invlpg [{}]",
            in(reg) page.base().as_u32(),
            options(nostack, preserves_flags)
        );
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    let _ = page;
}

/// Align `x` down to the nearest multiple of `a` (a power of two).
///
/// ```rust
/// # use kernel_vmem::align_down;
/// assert_eq!(align_down(0x12345, 4096), 0x12000);
/// assert_eq!(align_down(4096, 4096), 4096);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u32, a: u32) -> u32 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a` (a power of two), `None` on
/// overflow.
///
/// ```rust
/// # use kernel_vmem::align_up;
/// assert_eq!(align_up(1, 4096), Some(4096));
/// assert_eq!(align_up(4096, 4096), Some(4096));
/// assert_eq!(align_up(0xFFFF_F001, 4096), None);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u32, a: u32) -> Option<u32> {
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}
