//! # Direct-Map PhysMapper
//!
//! The kernel half starts with a linear window over the first 256 MiB of
//! physical memory: physical `pa` is visible at `DIRECT_MAP_BASE + pa`. Page
//! tables, directories and the PFN database are reached through it.
//!
//! ```rust,no_run
//! use kernel_alloc::phys_mapper::DirectMapper;
//! use kernel_memory_addresses::PhysicalAddress;
//! use kernel_vmem::{PageTable, PhysMapper};
//!
//! let table: &mut PageTable = unsafe { DirectMapper.phys_to_mut(PhysicalAddress::new(0x0010_0000)) };
//! table.zero();
//! ```

use kernel_info::memory::{DIRECT_MAP_BASE, DIRECT_MAP_SIZE};
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] over the kernel's direct map.
///
/// Only frames below `DIRECT_MAP_SIZE` are reachable; the PMA must not hand
/// out page-table frames above it.
#[derive(Debug, Copy, Clone, Default)]
pub struct DirectMapper;

impl DirectMapper {
    /// Whether `pa` lies inside the direct map.
    #[inline]
    #[must_use]
    pub const fn covers(pa: PhysicalAddress) -> bool {
        pa.as_u32() < DIRECT_MAP_SIZE
    }

    /// The direct-map address of `pa`.
    #[inline]
    #[must_use]
    pub const fn virt_of(pa: PhysicalAddress) -> u32 {
        DIRECT_MAP_BASE + pa.as_u32()
    }
}

impl PhysMapper for DirectMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        debug_assert!(Self::covers(pa), "{pa} outside the direct map");
        let va = Self::virt_of(pa) as usize as *mut T;
        unsafe { &mut *va }
    }
}
