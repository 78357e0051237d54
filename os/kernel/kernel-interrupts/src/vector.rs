//! # Interrupt Vectors

use core::fmt;
use kernel_info::interrupts::{EXCEPTION_COUNT, VECTOR_COUNT};
use kernel_status::Status;

/// An interrupt vector number, `0..=255`.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Vector(u8);

impl Vector {
    pub const DIVIDE_ERROR: Self = Self(0);
    pub const DEBUG: Self = Self(1);
    pub const NMI: Self = Self(2);
    pub const BREAKPOINT: Self = Self(3);
    pub const OVERFLOW: Self = Self(4);
    pub const BOUND_RANGE: Self = Self(5);
    pub const INVALID_OPCODE: Self = Self(6);
    pub const DEVICE_NOT_AVAILABLE: Self = Self(7);
    pub const DOUBLE_FAULT: Self = Self(8);
    pub const COPROCESSOR_OVERRUN: Self = Self(9);
    pub const INVALID_TSS: Self = Self(10);
    pub const SEGMENT_NOT_PRESENT: Self = Self(11);
    pub const STACK_FAULT: Self = Self(12);
    pub const GENERAL_PROTECTION: Self = Self(13);
    pub const PAGE_FAULT: Self = Self(14);
    pub const FPU_ERROR: Self = Self(16);
    pub const ALIGNMENT_CHECK: Self = Self(17);
    pub const MACHINE_CHECK: Self = Self(18);
    pub const SIMD_ERROR: Self = Self(19);

    #[inline]
    #[must_use]
    pub const fn new(v: u8) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    /// Vectors `0..32` belong to the CPU.
    #[inline]
    #[must_use]
    pub const fn is_exception(self) -> bool {
        self.0 < EXCEPTION_COUNT
    }

    /// Whether the CPU pushes an error code for this vector.
    #[must_use]
    pub const fn has_error_code(self) -> bool {
        matches!(self.0, 8 | 10..=14 | 17 | 21 | 29 | 30)
    }

    /// Mnemonic of an exception vector, `None` for everything else.
    #[must_use]
    pub const fn exception_name(self) -> Option<&'static str> {
        let name = match self.0 {
            0 => "#DE divide error",
            1 => "#DB debug",
            2 => "NMI",
            3 => "#BP breakpoint",
            4 => "#OF overflow",
            5 => "#BR bound range exceeded",
            6 => "#UD invalid opcode",
            7 => "#NM device not available",
            8 => "#DF double fault",
            9 => "coprocessor segment overrun",
            10 => "#TS invalid TSS",
            11 => "#NP segment not present",
            12 => "#SS stack fault",
            13 => "#GP general protection",
            14 => "#PF page fault",
            16 => "#MF x87 floating point",
            17 => "#AC alignment check",
            18 => "#MC machine check",
            19 => "#XM SIMD floating point",
            20 => "#VE virtualization",
            21 => "#CP control protection",
            v if v < EXCEPTION_COUNT => "reserved",
            _ => return None,
        };
        Some(name)
    }
}

impl TryFrom<u16> for Vector {
    type Error = Status;

    fn try_from(v: u16) -> Result<Self, Self::Error> {
        if usize::from(v) >= VECTOR_COUNT {
            return Err(Status::BadInterruptVector);
        }
        u8::try_from(v).map(Self).map_err(|_| Status::BadInterruptVector)
    }
}

impl From<u8> for Vector {
    fn from(v: u8) -> Self {
        Self(v)
    }
}

impl fmt::Debug for Vector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Vector({:#04x})", self.0)
    }
}

impl fmt::Display for Vector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exception_name() {
            Some(name) => write!(f, "{:#04x} ({name})", self.0),
            None => write!(f, "{:#04x}", self.0),
        }
    }
}

/// Who a reserved vector slot belongs to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum VectorClass {
    /// CPU exception, `0..32`.
    Exception,
    /// Line of the selected interrupt controller.
    Irq,
    /// Controller-owned vector outside the IRQ range (APIC spurious).
    System,
}
