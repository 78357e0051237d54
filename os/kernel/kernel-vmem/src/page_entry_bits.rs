use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// A single 32-bit i686 paging entry (PDE or PTE) in its raw bitfield form.
///
/// Page directory entries and page table entries share one layout in
/// classic (non-PAE) paging; only the meaning of `large_page` differs.
///
/// ### Bit layout
///
/// | Bits  | Name / Mnemonic | Meaning |
/// |-------|-----------------|---------|
/// | 0     | `P`             | Valid entry if set |
/// | 1     | `RW`            | Writable if set |
/// | 2     | `US`            | User-mode accessible if set |
/// | 3     | `PWT`           | Write-through caching |
/// | 4     | `PCD`           | Disable caching |
/// | 5     | `A`             | Accessed |
/// | 6     | `D`             | Dirty (leaf only) |
/// | 7     | `PS` / `PAT`    | 4 MiB page in a PDE, PAT in a PTE |
/// | 8     | `G`             | Global (leaf only) |
/// | 9–11  | OS avail        | Reserved for OS use |
/// | 12–31 | `frame`         | Physical frame number |
///
/// ### Example
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::PageEntryBits;
/// let mut e = PageEntryBits::new();
/// e.set_present(true);
/// e.set_writable(true);
/// e.set_physical_address(PhysicalAddress::new(0x0012_3000));
/// assert!(e.present());
/// assert_eq!(e.into_bits(), 0x0012_3003);
/// ```
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    ///
    /// Clear for read-only. Supervisor writes honor it only with `CR0.WP` set.
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    ///
    /// Set for MMIO mappings.
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU; not a permission bit.
    pub accessed: bool,

    /// Dirty (D, bit 6): **leaf only**.
    pub dirty: bool,

    /// Large Page (PS, bit 7).
    ///
    /// In a PDE, a set bit makes the entry a 4 MiB leaf (requires `CR4.PSE`).
    /// In a PTE the position is PAT and is kept clear.
    pub large_page: bool,

    /// Global (G, bit 8): **leaf only**, requires `CR4.PGE`.
    pub global_translation: bool,

    /// OS-available (bits 9..=11).
    #[bits(3)]
    pub os_available: u8,

    /// Physical frame number (bits 12..=31).
    #[bits(20)]
    frame: u32,
}

impl PageEntryBits {
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        self.set_frame(phys.as_u32() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame() << 12)
    }

    /// Flags for a link from a directory entry to a page table.
    ///
    /// Links are permissive (writable, user); the leaf decides the effective
    /// permissions.
    #[inline]
    #[must_use]
    pub const fn new_table_link(user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(user)
    }

    #[inline]
    #[must_use]
    pub const fn new_kernel_rw() -> Self {
        Self::new().with_present(true).with_writable(true)
    }

    #[inline]
    #[must_use]
    pub const fn new_user_ro() -> Self {
        Self::new()
            .with_present(true)
            .with_writable(false)
            .with_user_access(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_address_roundtrip() {
        let mut e = PageEntryBits::new_kernel_rw();
        e.set_physical_address(PhysicalAddress::new(0xFFFF_F000));
        assert_eq!(e.physical_address(), PhysicalAddress::new(0xFFFF_F000));
        assert_eq!(e.into_bits(), 0xFFFF_F003);
    }

    #[test]
    fn table_link_is_permissive() {
        let e = PageEntryBits::new_table_link(true);
        assert!(e.present() && e.writable() && e.user_access());
        assert!(!e.large_page());
    }
}
