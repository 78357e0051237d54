//! # Interrupt Context
//!
//! The frame the entry stubs build on the kernel stack before calling into
//! Rust. Lowest address first:
//!
//! ```text
//!  fault_address   ← CR2, pushed last by the common stub
//!  gs fs es ds
//!  edi esi ebp esp ebx edx ecx eax   ← pushad
//!  vector
//!  error_code      ← CPU, or 0 pushed by the stub
//!  eip cs eflags   ← CPU
//! ```
//!
//! On a ring 3 → ring 0 transition the CPU also pushes the user `esp` and
//! `ss` above `eflags`; they are not part of this struct.

use crate::vector::Vector;
use kernel_memory_addresses::VirtualAddress;
use kernel_registers::cr2::Cr2;
use kernel_registers::eflags::Eflags;

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct InterruptContext {
    /// CR2 at entry. Meaningful for page faults only.
    pub fault_address: u32,
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// Kernel `esp` before `pushad`; ignored by `popad`.
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub vector: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
}

const _: () = assert!(size_of::<InterruptContext>() == 18 * 4);

impl InterruptContext {
    /// The vector, if the stub stored a valid one.
    #[must_use]
    pub fn vector(&self) -> Option<Vector> {
        u8::try_from(self.vector).ok().map(Vector::new)
    }

    /// The saved CR2. Only meaningful for page faults.
    #[inline]
    #[must_use]
    pub const fn fault_address(&self) -> VirtualAddress {
        Cr2::from_bits(self.fault_address).fault_address()
    }

    /// Requested privilege level of the interrupted code segment.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn privilege_level(&self) -> u8 {
        (self.cs & 3) as u8
    }
}

/// Whether the interrupted code ran in kernel mode: ring 0 and not in
/// virtual-8086 mode.
#[must_use]
pub fn is_caused_by_kernel_mode(ctx: &InterruptContext) -> bool {
    ctx.privilege_level() == 0 && !Eflags::from_bits(ctx.eflags).vm_virtual_8086()
}
