//! # i686 Interrupt Descriptor Table
//!
//! 256 gate descriptors of 8 bytes each, loaded with `lidt`. Entries are
//! written through a small fluent builder:
//!
//! ```rust
//! use kernel_interrupts::idt::{GateType, Idt};
//!
//! let mut idt = Idt::new();
//! idt[0x80]
//!     .set_handler(0xD000_1234)
//!     .selector(0x08)
//!     .dpl(3)
//!     .gate_type(GateType::TrapGate)
//!     .present(true);
//! assert_eq!(idt[0x80].handler(), 0xD000_1234);
//! ```
//!
//! Gate layout (Intel SDM Vol. 3A, §6.11):
//!
//! ```text
//! 63            48 47 46 45 44 43   40 39    32
//! ┌───────────────┬──┬─────┬──┬───────┬────────┐
//! │ offset[31:16] │P │ DPL │S │ type  │  zero  │
//! ├───────────────┴──┴─────┴──┴───────┴────────┤
//! │ selector                │ offset[15:0]     │
//! └─────────────────────────┴──────────────────┘
//! 31                      16 15               0
//! ```

use bitfield_struct::bitfield;
use core::ops::{Index, IndexMut};

const _: () = assert!(size_of::<IdtEntry>() == 8);
const _: () = assert!(size_of::<Idt>() == 256 * 8);

/// Selector of the flat kernel code segment set up by the boot stub.
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;

/// Type/attribute byte of a gate.
#[bitfield(u8)]
pub struct IdtGateAttr {
    /// 0xE = 32-bit interrupt gate, 0xF = 32-bit trap gate.
    #[bits(4)]
    pub typ: u8,
    /// Must be `0` for interrupt and trap gates.
    pub s: bool,
    /// Privilege required to raise the vector with `int n`.
    #[bits(2)]
    pub dpl: u8,
    pub present: bool,
}

impl IdtGateAttr {
    #[inline]
    #[must_use]
    pub const fn interrupt_gate() -> Self {
        Self::new().with_typ(0xE).with_s(false)
    }

    #[inline]
    #[must_use]
    pub const fn trap_gate() -> Self {
        Self::new().with_typ(0xF).with_s(false)
    }
}

/// Gate kinds.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum GateType {
    /// Clears `IF` on entry.
    InterruptGate,
    /// Leaves `IF` unchanged.
    TrapGate,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IdtEntry {
    offset_lo: u16,
    selector: u16,
    zero: u8,
    attr: u8,
    offset_hi: u16,
}

impl IdtEntry {
    /// A zeroed, non-present entry.
    pub const MISSING: Self = Self {
        offset_lo: 0,
        selector: 0,
        zero: 0,
        attr: IdtGateAttr::new().into_bits(),
        offset_hi: 0,
    };

    /// Point the entry at `handler` and return a builder. The entry starts
    /// out as a non-present ring 0 interrupt gate on the kernel code segment.
    #[allow(clippy::cast_possible_truncation)]
    pub const fn set_handler(&mut self, handler: u32) -> IdtEntryBuilder<'_> {
        self.offset_lo = handler as u16;
        self.offset_hi = (handler >> 16) as u16;
        self.selector = KERNEL_CODE_SELECTOR;
        self.zero = 0;
        self.attr = IdtGateAttr::interrupt_gate().into_bits();
        IdtEntryBuilder { entry: self }
    }

    #[inline]
    #[must_use]
    pub fn handler(&self) -> u32 {
        (u32::from(self.offset_hi) << 16) | u32::from(self.offset_lo)
    }

    #[inline]
    #[must_use]
    pub const fn selector(&self) -> u16 {
        self.selector
    }

    #[inline]
    #[must_use]
    pub const fn attributes(&self) -> IdtGateAttr {
        IdtGateAttr::from_bits(self.attr)
    }

    #[inline]
    #[must_use]
    pub const fn is_present(&self) -> bool {
        self.attributes().present()
    }
}

/// Fluent builder for an [`IdtEntry`].
pub struct IdtEntryBuilder<'a> {
    entry: &'a mut IdtEntry,
}

impl IdtEntryBuilder<'_> {
    #[inline]
    #[must_use]
    pub const fn present(self, p: bool) -> Self {
        self.entry.attr = IdtGateAttr::from_bits(self.entry.attr).with_present(p).into_bits();
        self
    }

    /// Set the DPL, `0..=3`.
    #[inline]
    #[must_use]
    pub fn dpl(self, dpl: u8) -> Self {
        debug_assert!(dpl <= 3);
        self.entry.attr = IdtGateAttr::from_bits(self.entry.attr).with_dpl(dpl).into_bits();
        self
    }

    #[inline]
    #[must_use]
    pub const fn gate_type(self, gate_type: GateType) -> Self {
        let attr = match gate_type {
            GateType::InterruptGate => IdtGateAttr::interrupt_gate(),
            GateType::TrapGate => IdtGateAttr::trap_gate(),
        };
        let old = IdtGateAttr::from_bits(self.entry.attr);
        self.entry.attr = attr.with_dpl(old.dpl()).with_present(old.present()).into_bits();
        self
    }

    #[inline]
    #[must_use]
    pub const fn selector(self, sel: u16) -> Self {
        self.entry.selector = sel;
        self
    }
}

/// The 256-entry table.
#[repr(C, align(8))]
pub struct Idt {
    entries: [IdtEntry; 256],
}

impl Default for Idt {
    fn default() -> Self {
        Self::new()
    }
}

impl Idt {
    /// All gates non-present.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [IdtEntry::MISSING; 256],
        }
    }

    /// Point every gate at the entry stub of its vector. Vector 0x80 and the
    /// breakpoint vector get DPL 3 so user code can raise them.
    pub fn populate(&mut self, stub_address: impl Fn(u8) -> u32) {
        for v in 0..=u8::MAX {
            let dpl = if v == 3 || v == 0x80 { 3 } else { 0 };
            let _ = self.entries[usize::from(v)]
                .set_handler(stub_address(v))
                .dpl(dpl)
                .present(true);
        }
    }

    /// Load this table into the IDTR.
    ///
    /// # Safety
    /// Must run at CPL 0, and every present gate must point at valid handler
    /// code in the kernel code segment.
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    pub unsafe fn load(&'static self) {
        #[repr(C, packed)]
        struct Idtr {
            limit: u16,
            base: u32,
        }

        #[allow(clippy::cast_possible_truncation)]
        let idtr = Idtr {
            limit: (size_of::<Self>() - 1) as u16,
            base: core::ptr::from_ref(self) as u32,
        };
        unsafe {
            core::arch::asm!("lidt [{}]", in(reg) &raw const idtr, options(nostack, preserves_flags, readonly));
        }
    }
}

impl Index<usize> for Idt {
    type Output = IdtEntry;
    fn index(&self, i: usize) -> &Self::Output {
        &self.entries[i]
    }
}

impl IndexMut<usize> for Idt {
    fn index_mut(&mut self, i: usize) -> &mut Self::Output {
        &mut self.entries[i]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_encoding() {
        let mut e = IdtEntry::MISSING;
        let _ = e.set_handler(0xD012_3456).dpl(3).present(true);
        // P=1, DPL=3, S=0, type=0xE
        assert_eq!(e.attr, 0xEE);
        assert_eq!(e.offset_lo, 0x3456);
        assert_eq!(e.offset_hi, 0xD012);
        assert_eq!(e.selector(), KERNEL_CODE_SELECTOR);

        let _ = e.set_handler(0x1000).gate_type(GateType::TrapGate).present(true);
        assert_eq!(e.attr, 0x8F);
    }

    #[test]
    fn populate_marks_all_present() {
        let mut idt = Idt::new();
        idt.populate(|v| 0xD000_0000 + u32::from(v) * 16);
        assert!((0..256).all(|i| idt[i].is_present()));
        assert_eq!(idt[14].handler(), 0xD000_00E0);
        assert_eq!(idt[0x80].attributes().dpl(), 3);
        assert_eq!(idt[13].attributes().dpl(), 0);
    }
}
