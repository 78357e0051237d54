//! # i686 Paging Structures
//!
//! - [`pd`]: the page directory (1024 PDEs, each linking a page table or
//!   mapping a 4 MiB page).
//! - [`pt`]: the page table (1024 PTEs, each mapping a 4 KiB page).

pub mod pd;
pub mod pt;

use crate::page_table::pd::PdIndex;
use crate::page_table::pt::PtIndex;
use kernel_memory_addresses::VirtualAddress;

/// Number of entries in a page directory or page table.
pub const ENTRIES: usize = 1024;

/// Split a virtual address into its directory and table indices.
///
/// ```text
/// | 31‒22 | 21‒12 | 11‒0   |
/// |   PD  |   PT  | Offset |
/// ```
#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (PdIndex, PtIndex) {
    (PdIndex::from(va), PtIndex::from(va))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_of_kernel_address() {
        let (pd, pt) = split_indices(VirtualAddress::new(0xC040_3123));
        assert_eq!(pd.as_usize(), 769);
        assert_eq!(pt.as_usize(), 3);
    }
}
