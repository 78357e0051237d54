//! # i686 Kernel Core
//!
//! Glue between the memory crates, the interrupt crates and the boot stub.
//! Everything that does not touch hardware directly is host-testable; the
//! entry point in `main.rs` only wires statics together.
//!
//! | Module | Content |
//! |--------|---------|
//! | [`boot`] | Bring-up order and the steps that make it up. |
//! | [`cpu`] | CPUID probing for the local APIC and paging features. |
//! | [`memory`] | The kernel memory singleton: PMA, directory, window, heap. |
//! | [`process`] | Process page directories sharing the kernel half. |
//! | [`global_alloc`] | `GlobalAlloc` on top of the kernel heap. |
//! | [`trap`] | Routing of interrupt outcomes. |
//! | [`fatal`] | Fault reports and halting. |

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod boot;
pub mod cpu;
pub mod fatal;
pub mod global_alloc;
pub mod memory;
pub mod process;
pub mod trap;
