use bitfield_struct::bitfield;

/// CR4 on i686. The kernel touches PSE and PGE; PAE stays clear because
/// the page tables are the classic two-level format.
#[bitfield(u32, order = Lsb)]
pub struct Cr4 {
    pub vme: bool,
    pub pvi: bool,
    pub tsd: bool,
    pub de: bool,
    /// PSE: 4 MiB directory entries.
    pub pse: bool,
    pub pae: bool,
    pub mce: bool,
    /// PGE: global TLB entries survive CR3 reloads.
    pub pge: bool,
    pub pce: bool,
    pub osfxsr: bool,
    pub osxmmexcpt: bool,
    pub umip: bool,
    #[bits(8, default = 0)]
    _reserved_12: u8,
    pub smep: bool,
    pub smap: bool,
    #[bits(10, default = 0)]
    _reserved_22: u16,
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
crate::control_register!(Cr4, "cr4");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paging_extension_bits() {
        let cr4 = Cr4::new().with_pse(true).with_pge(true);
        assert_eq!(cr4.into_bits(), 0x90);
        assert!(!Cr4::from_bits(0x90).pae());
    }
}
