use bitfield_struct::bitfield;

/// CR0 in 32-bit protected mode. Reserved ranges read back as zero.
#[bitfield(u32)]
pub struct Cr0 {
    /// PE: protected mode.
    pub pe_protection_enable: bool,
    /// MP
    pub mp_monitor_coprocessor: bool,
    /// EM: x87 instructions raise #NM.
    pub em_emulation: bool,
    /// TS
    pub ts_task_switched: bool,
    /// ET
    pub et_extension_type: bool,
    /// NE: native x87 error reporting.
    pub ne_numeric_error: bool,
    #[bits(10, default = 0)]
    _reserved_6: u16,
    /// WP: ring 0 writes honour read-only PTEs. Guard pages and read-only
    /// kernel mappings only fault with this set.
    pub wp_write_protect: bool,
    #[bits(default = 0)]
    _reserved_17: bool,
    /// AM
    pub am_alignment_mask: bool,
    #[bits(10, default = 0)]
    _reserved_19: u16,
    /// NW
    pub nw_not_write_through: bool,
    /// CD
    pub cd_cache_disable: bool,
    /// PG: paging through the directory in CR3.
    pub pg_paging: bool,
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
crate::control_register!(Cr0, "cr0");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_protect_sits_between_the_reserved_ranges() {
        let boot = Cr0::from_bits(0x8000_0011);
        assert!(boot.pg_paging() && boot.pe_protection_enable() && boot.et_extension_type());
        assert!(!boot.wp_write_protect());
        assert_eq!(boot.with_wp_write_protect(true).into_bits(), 0x8001_0011);
    }
}
