//! # Memory-Mapped Registers

use kernel_memory_addresses::VirtualAddress;

/// 32-bit register access relative to a device's register block.
pub trait Mmio: Send + Sync {
    fn read32(&self, offset: u32) -> u32;
    fn write32(&self, offset: u32, value: u32);
}

/// Volatile access to a register block mapped at `base`.
#[derive(Debug)]
pub struct VolatileMmio {
    base: VirtualAddress,
}

impl VolatileMmio {
    /// # Safety
    /// `base` must map the device's register block uncached for as long as
    /// this value lives, and every offset used must lie inside it.
    #[must_use]
    pub const unsafe fn new(base: VirtualAddress) -> Self {
        Self { base }
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    const fn register(&self, offset: u32) -> *mut u32 {
        (self.base.as_u32() + offset) as usize as *mut u32
    }
}

impl Mmio for VolatileMmio {
    #[inline]
    fn read32(&self, offset: u32) -> u32 {
        unsafe { self.register(offset).read_volatile() }
    }

    #[inline]
    fn write32(&self, offset: u32, value: u32) {
        unsafe { self.register(offset).write_volatile(value) }
    }
}
