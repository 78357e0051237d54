//! # CPU Capability Detection
//!
//! The interrupt core needs to know whether a local APIC is present, the
//! paging code whether 4 MiB and global pages are. Both come from CPUID
//! leaf 01H:
//!
//! ```text
//! CPUID.(EAX=0):EAX     highest basic leaf
//! CPUID.(EAX=1):EDX[3]  page size extension
//! CPUID.(EAX=1):EDX[9]  on-chip local APIC
//! CPUID.(EAX=1):EDX[13] global pages
//! CPUID.(EAX=1):EBX     initial APIC ID in bits 31:24
//! ```

use bitfield_struct::bitfield;
use kernel_interrupts::CpuCapabilities;

pub const LEAF_00H: u32 = 0x00;
pub const LEAF_01H: u32 = 0x01;

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
#[repr(C)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// Execute CPUID with the given leaf and subleaf.
///
/// # Safety
/// The CPU must support the `cpuid` instruction (every i586 and later).
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[inline]
pub unsafe fn cpuid(leaf: u32, subleaf: u32) -> CpuidResult {
    let (mut eax, mut ecx) = (leaf, subleaf);
    let (ebx, edx): (u32, u32);
    unsafe {
        core::arch::asm!(
            // EBX may be reserved by the code generator.
            "push ebx",
            "cpuid",
            "mov {ebx_out:e}, ebx",
            "pop ebx",
            ebx_out = lateout(reg) ebx,
            inlateout("eax") eax,
            inlateout("ecx") ecx,
            lateout("edx") edx,
            options(preserves_flags),
        );
    }
    CpuidResult { eax, ebx, ecx, edx }
}

/// `CPUID.(EAX=1):EDX`, the classic feature flags.
///
/// Reference: Intel SDM Vol. 2A, Table 3-11.
#[bitfield(u32)]
pub struct Leaf1Edx {
    /// x87 FPU on chip.
    pub fpu: bool, // 0
    /// Virtual 8086 mode enhancements.
    pub vme: bool, // 1
    /// Debugging extensions.
    pub de: bool, // 2
    /// Page size extension (4 MiB pages).
    pub pse: bool, // 3
    /// Time stamp counter.
    pub tsc: bool, // 4
    /// RDMSR/WRMSR.
    pub msr: bool, // 5
    /// Physical address extension.
    pub pae: bool, // 6
    /// Machine check exception.
    pub mce: bool, // 7
    /// CMPXCHG8B.
    pub cx8: bool, // 8
    /// On-chip local APIC.
    pub apic: bool, // 9
    __rsv10: bool, // 10
    /// SYSENTER/SYSEXIT.
    pub sep: bool, // 11
    /// Memory type range registers.
    pub mtrr: bool, // 12
    /// Global pages.
    pub pge: bool, // 13
    #[bits(18)]
    __: u32,
}

/// `CPUID.(EAX=1):EBX`.
#[bitfield(u32)]
pub struct Leaf1Ebx {
    pub brand_index: u8,
    /// CLFLUSH line size in 8-byte units.
    pub clflush_line_size_8b: u8,
    /// Logical processors per package (legacy).
    pub logical_processor_count: u8,
    pub initial_apic_id: u8,
}

/// Parsed leaf 01H.
#[derive(Copy, Clone, Debug)]
pub struct Leaf01h {
    pub ebx: Leaf1Ebx,
    pub edx: Leaf1Edx,
}

impl Leaf01h {
    #[must_use]
    pub const fn from_result(r: CpuidResult) -> Self {
        Self {
            ebx: Leaf1Ebx::from_bits(r.ebx),
            edx: Leaf1Edx::from_bits(r.edx),
        }
    }

    #[inline]
    #[must_use]
    pub const fn capabilities(&self) -> CpuCapabilities {
        CpuCapabilities {
            apic: self.edx.apic(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn paging(&self) -> PagingFeatures {
        PagingFeatures {
            pse: self.edx.pse(),
            pge: self.edx.pge(),
        }
    }
}

/// Optional paging features.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct PagingFeatures {
    /// 4 MiB directory entries.
    pub pse: bool,
    /// Global TLB entries.
    pub pge: bool,
}

/// Capabilities of a CPU whose leaf 0 reported `max_basic` and whose leaf 1
/// returned `leaf1`.
#[must_use]
pub const fn capabilities_from(max_basic: u32, leaf1: CpuidResult) -> CpuCapabilities {
    if max_basic < LEAF_01H {
        return CpuCapabilities { apic: false };
    }
    Leaf01h::from_result(leaf1).capabilities()
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
fn read_leaf1() -> (u32, CpuidResult) {
    let max_basic = unsafe { cpuid(LEAF_00H, 0) }.eax;
    let leaf1 = if max_basic >= LEAF_01H {
        unsafe { cpuid(LEAF_01H, 0) }
    } else {
        CpuidResult::default()
    };
    (max_basic, leaf1)
}

/// Query the running CPU.
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[must_use]
pub fn detect() -> CpuCapabilities {
    let (max_basic, leaf1) = read_leaf1();
    let caps = capabilities_from(max_basic, leaf1);
    log::debug!(
        "cpu: max basic leaf {max_basic:#x}, APIC {}, initial APIC ID {}",
        caps.apic,
        Leaf01h::from_result(leaf1).ebx.initial_apic_id()
    );
    caps
}

/// Paging features of the running CPU.
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[must_use]
pub fn detect_paging() -> PagingFeatures {
    let (max_basic, leaf1) = read_leaf1();
    if max_basic < LEAF_01H {
        return PagingFeatures::default();
    }
    Leaf01h::from_result(leaf1).paging()
}

/// Hosted builds report no APIC.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
#[must_use]
pub const fn detect() -> CpuCapabilities {
    CpuCapabilities { apic: false }
}
