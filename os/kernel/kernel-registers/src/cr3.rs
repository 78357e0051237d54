use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// CR3 for two-level 32-bit paging: page directory frame plus the cache
/// attributes used while walking it.
#[bitfield(u32)]
pub struct Cr3 {
    #[bits(3)]
    _ignored_0: u8,
    /// PWT
    pub pwt: bool,
    /// PCD
    pub pcd: bool,
    #[bits(7)]
    _ignored_5: u8,
    #[bits(20)]
    directory_frame: u32,
}

impl Cr3 {
    /// A write-back CR3 for the directory at `pd`, which must be
    /// page-aligned.
    #[must_use]
    pub fn from_page_directory(pd: PhysicalAddress) -> Self {
        debug_assert_eq!(pd.as_u32() & 0xFFF, 0, "unaligned page directory {pd}");
        Self::new().with_directory_frame(pd.as_u32() >> 12)
    }

    #[must_use]
    pub const fn page_directory(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.directory_frame() << 12)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
crate::control_register!(Cr3, "cr3");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_frame_ignores_cache_bits() {
        let cr3 = Cr3::from_page_directory(PhysicalAddress::new(0x0012_3000));
        assert_eq!(cr3.into_bits(), 0x0012_3000);
        let cached = Cr3::from_bits(0x0012_3018);
        assert!(cached.pwt() && cached.pcd());
        assert_eq!(cached.page_directory(), PhysicalAddress::new(0x0012_3000));
    }
}
