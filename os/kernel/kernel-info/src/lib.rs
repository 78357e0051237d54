//! # Kernel Configuration and Boot Interface
//!
//! Memory layout constants, the interrupt vector layout, the boot stub's
//! handoff structures and the runtime boot configuration shared by every
//! kernel crate.
//!
//! ## Modules
//!
//! | Module | Content |
//! |--------|---------|
//! | [`memory`] | Virtual address space layout (user/kernel split, direct map, dynamic window, self map). |
//! | [`interrupts`] | Exception range and controller vector bases. |
//! | [`boot`] | BIOS memory map entries and the kernel entry arguments. |
//! | [`config`] | [`KernelConfig`](config::KernelConfig) with sensible defaults. |
//!
//! ## Build Script Integration
//! ```rust
//! use kernel_info::memory::{KERNEL_BASE, PHYS_LOAD};
//!
//! println!("cargo:rustc-link-arg=--defsym=KERNEL_BASE={:#x}", KERNEL_BASE);
//! println!("cargo:rustc-link-arg=--defsym=PHYS_LOAD={:#x}", PHYS_LOAD);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod config;
pub mod interrupts;
pub mod memory;
