//! # Kernel Boot Information

/// Kernel entry function pointer.
///
/// # ABI
/// The boot stub calls the kernel with the `cdecl` convention and a single
/// pointer argument.
pub type KernelEntryFn = extern "C" fn(*const KernelEntryArgs) -> !;

/// `attributes` value of a BIOS memory map entry describing usable RAM.
pub const BIOS_MEMORY_USABLE: u64 = 0x1_0000_0001;

/// One entry of the BIOS (`INT 15h, E820h`) memory map, as stored by the boot stub.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BiosMemoryMapEntry {
    /// Physical base address of the range.
    pub base: u64,
    /// Length of the range in bytes.
    pub length: u64,
    /// Range type in the low dword, ACPI 3.0 extended attributes in the high dword.
    pub attributes: u64,
}

impl BiosMemoryMapEntry {
    /// Whether the range is RAM the kernel may hand to the frame allocator.
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        self.attributes == BIOS_MEMORY_USABLE
    }

    /// The part of the range below the 4 GiB boundary as 32-bit `(base, length)`.
    ///
    /// `None` when the range starts above 4 GiB or is empty.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn clamp_32bit(&self) -> Option<(u32, u32)> {
        const LIMIT: u64 = 1 << 32;
        if self.base >= LIMIT || self.length == 0 {
            return None;
        }
        let end = self.base.saturating_add(self.length);
        let end = if end > LIMIT { LIMIT } else { end };
        let len = end - self.base;
        // A range reaching the top of the 32-bit space loses its final page.
        let len = if len >= LIMIT { (LIMIT - 4096) as u32 } else { len as u32 };
        Some((self.base as u32, len))
    }
}

/// Arguments the boot stub hands to the kernel entry point.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct KernelEntryArgs {
    /// Pointer to the first BIOS memory map entry.
    pub memory_map: *const BiosMemoryMapEntry,
    /// Number of BIOS memory map entries.
    pub memory_map_len: u32,
    /// Physical start of the loaded kernel image.
    pub kernel_phys_start: u32,
    /// Physical end (exclusive) of the loaded kernel image.
    pub kernel_phys_end: u32,
    /// Physical address of the boot page directory.
    pub boot_page_directory: u32,
    /// Whether CPUID reported a local APIC.
    pub has_apic: u32,
}

impl KernelEntryArgs {
    /// The memory map as a slice.
    ///
    /// # Safety
    /// `memory_map` must point to `memory_map_len` readable entries that
    /// outlive the returned slice.
    #[allow(unsafe_code)]
    #[must_use]
    pub unsafe fn memory_map(&self) -> &[BiosMemoryMapEntry] {
        if self.memory_map.is_null() || self.memory_map_len == 0 {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(self.memory_map, self.memory_map_len as usize) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usable_attribute() {
        let ram = BiosMemoryMapEntry {
            base: 0x10_0000,
            length: 0x100_0000,
            attributes: BIOS_MEMORY_USABLE,
        };
        let reserved = BiosMemoryMapEntry {
            attributes: 0x1_0000_0002,
            ..ram
        };
        assert!(ram.is_usable());
        assert!(!reserved.is_usable());
    }

    #[test]
    fn clamps_to_32bit() {
        let high = BiosMemoryMapEntry {
            base: 0x1_0000_0000,
            length: 0x1000,
            attributes: BIOS_MEMORY_USABLE,
        };
        assert_eq!(high.clamp_32bit(), None);

        let straddling = BiosMemoryMapEntry {
            base: 0xFFFF_0000,
            length: 0x2_0000,
            attributes: BIOS_MEMORY_USABLE,
        };
        assert_eq!(straddling.clamp_32bit(), Some((0xFFFF_0000, 0x1_0000)));
    }
}
