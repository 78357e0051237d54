//! # Typed i686 Registers
//!
//! Bitfield views of the registers the kernel reads or programs. Access to
//! the control registers goes through [`ControlRegister`], implemented for
//! bare-metal x86 builds with the `asm` feature.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "cr0")]
pub mod cr0;

#[cfg(feature = "cr2")]
pub mod cr2;

#[cfg(feature = "cr3")]
pub mod cr3;

#[cfg(feature = "cr4")]
pub mod cr4;

#[cfg(feature = "eflags")]
pub mod eflags;

/// A CRn register moved with `mov`.
pub trait ControlRegister: Sized {
    /// # Safety
    /// Ring 0 only.
    unsafe fn read() -> Self;

    /// # Safety
    /// Ring 0 only. The new value takes effect immediately: paging and
    /// protection bits must describe a state the running code survives.
    unsafe fn write(self);
}

/// Implements [`ControlRegister`] for a `#[bitfield(u32)]` type over `crN`.
#[cfg(all(feature = "asm", target_arch = "x86"))]
macro_rules! control_register {
    ($ty:ty, $reg:literal) => {
        impl $crate::ControlRegister for $ty {
            #[inline]
            unsafe fn read() -> Self {
                let bits: u32;
                unsafe {
                    core::arch::asm!(concat!("mov {}, ", $reg), out(reg) bits, options(nomem, nostack, preserves_flags));
                }
                Self::from_bits(bits)
            }

            #[inline]
            unsafe fn write(self) {
                let bits = self.into_bits();
                unsafe {
                    core::arch::asm!(concat!("mov ", $reg, ", {}"), in(reg) bits, options(nostack, preserves_flags));
                }
            }
        }
    };
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
pub(crate) use control_register;
