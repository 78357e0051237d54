//! # QEMU Debug Console Support
//!
//! Logging and tracing for a kernel running under QEMU or Bochs, written
//! byte-wise to the debug console port `0xE9`.
//!
//! ## Output Mechanism
//! ```text
//! log::info!(..) / qemu_trace!(..)
//!     ↓
//! QemuSink (fmt::Write)
//!     ↓
//! dbg_putc() → I/O port 0xE9
//!     ↓
//! -debugcon stdio on the host
//! ```
//!
//! ## Feature System
//!
//! With the `enabled` feature (default) on a bare-metal i686 target the
//! port writes are compiled in. Without it, or on a hosted target, every
//! write is a no-op so the crate can be linked into unit tests.
//!
//! ## Usage
//! ```rust,no_run
//! use log::{LevelFilter, info};
//!
//! kernel_qemu::init(LevelFilter::Debug).expect("logger initialization");
//! info!("memory core up");
//! ```
//!
//! Capture the output on the host with
//! `qemu-system-i386 -kernel kernel.bin -debugcon stdio`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::{QemuLogger, init};

#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    /// The Bochs/QEMU debug console port.
    pub const QEMU_DEBUG_PORT: u16 = 0xE9;

    /// Write a single byte to the debug console port.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn dbg_putc(c: u8) {
        #[cfg(all(feature = "enabled", target_arch = "x86", target_os = "none"))]
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") QEMU_DEBUG_PORT,
                in("al") c,
                options(nomem, nostack, preserves_flags)
            );
        }
        #[cfg(not(all(feature = "enabled", target_arch = "x86", target_os = "none")))]
        let _ = c;
    }

    /// `fmt::Write` adapter over [`dbg_putc`].
    pub struct QemuSink;

    impl Write for QemuSink {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for b in s.bytes() {
                dbg_putc(b);
            }
            Ok(())
        }
    }

    #[doc(hidden)]
    #[inline]
    pub fn qemu_write(args: fmt::Arguments) {
        // Best-effort debug output.
        let _ = fmt::write(&mut QemuSink, args);
    }
}

/// Raw formatted output to the debug console, bypassing `log`.
///
/// Usable before the logger is installed.
#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        $crate::qemu_fmt::qemu_write(core::format_args!($($arg)*));
    }};
}
