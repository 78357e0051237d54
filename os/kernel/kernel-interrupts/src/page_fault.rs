//! # Page-Fault Error Code

use bitfield_struct::bitfield;
use kernel_vmem::FaultAccess;

/// Error code the CPU pushes for `#PF` (Intel SDM Vol. 3A, §4.7).
#[bitfield(u32)]
pub struct PageFaultError {
    /// 0 = non-present page, 1 = protection violation.
    pub present: bool,
    /// 0 = read, 1 = write.
    pub write: bool,
    /// 0 = supervisor, 1 = user mode.
    pub user: bool,
    /// A reserved bit was set in a paging structure.
    pub reserved_bit: bool,
    /// Instruction fetch (only reported with PAE/NX).
    pub instruction_fetch: bool,
    pub protection_key: bool,
    pub shadow_stack: bool,
    #[bits(25)]
    __: u32,
}

impl PageFaultError {
    /// The attempted access, as the fault resolver sees it.
    #[must_use]
    pub const fn access(&self) -> FaultAccess {
        FaultAccess {
            write: self.write(),
            user: self.user(),
            instruction_fetch: self.instruction_fetch(),
        }
    }

    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if self.reserved_bit() {
            "Reserved bit set in a paging structure"
        } else if !self.present() {
            "Non-present page"
        } else if self.instruction_fetch() {
            "Instruction fetch from a protected page"
        } else if self.write() {
            "Write access to a protected page"
        } else {
            "Read access to a protected page"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_user_write() {
        let e = PageFaultError::from_bits(0b110);
        assert!(!e.present());
        assert_eq!(e.access(), FaultAccess::write().from_user());
        assert_eq!(e.explain(), "Non-present page");
        assert_eq!(PageFaultError::from_bits(0b011).explain(), "Write access to a protected page");
    }
}
