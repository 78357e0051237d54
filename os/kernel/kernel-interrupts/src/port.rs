//! # Port I/O
//!
//! Controllers that live in the legacy I/O port space (the 8259 pair) talk to
//! hardware through [`PortIo`], so tests can substitute a recording fake.

/// Byte access to the I/O port space.
pub trait PortIo: Send {
    fn read_u8(&self, port: u16) -> u8;
    fn write_u8(&self, port: u16, value: u8);
}

/// The real port space, via `in`/`out`.
///
/// Hosted builds read `0` and drop writes.
#[derive(Debug)]
pub struct X86Ports {
    _private: (),
}

impl X86Ports {
    /// # Safety
    /// Port accesses must be permitted (CPL 0 or a matching IOPL), and only
    /// one driver may own each device behind the ports it touches.
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl PortIo for X86Ports {
    #[inline]
    fn read_u8(&self, port: u16) -> u8 {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        {
            let v: u8;
            unsafe {
                core::arch::asm!("in al, dx", in("dx") port, out("al") v, options(nomem, nostack, preserves_flags));
            }
            v
        }
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        {
            let _ = port;
            0
        }
    }

    #[inline]
    fn write_u8(&self, port: u16, value: u8) {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        unsafe {
            core::arch::asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags));
        }
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        {
            let _ = (port, value);
        }
    }
}
