//! # Interrupt Dispatch Core
//!
//! Everything between the CPU delivering a vector and a handler running:
//!
//! ```text
//!  CPU ──▶ stubs ──▶ InterruptContext ──▶ Ivt::dispatch ──▶ InterruptHandler
//!                                            │                 (ExceptionDispatcher
//!                                            ▼                  for vectors 0..32)
//!                                  InterruptController
//!                                  (Pic8259 | Apic)
//! ```
//!
//! | Module | Content |
//! |--------|---------|
//! | [`vector`] | Vector numbers, exception names, slot classes. |
//! | [`context`] | The register frame saved by the entry stubs. |
//! | [`idt`] | 8-byte i686 gate descriptors and the 256-entry table. |
//! | [`page_fault`] | Decoding of the page-fault error code. |
//! | [`port`] / [`mmio`] | Hardware access seams for the controllers. |
//! | [`controller`] | The controller abstraction and boot-time selection. |
//! | [`pic`] / [`apic`] | Legacy 8259 pair and local + I/O APIC. |
//! | [`ivt`] | Vector slot table: reservation, install, dispatch. |
//! | [`dispatcher`] | Default handler for CPU exceptions. |
//! | `stubs` | Entry stubs and the stub address table (bare metal only). |

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod apic;
pub mod context;
pub mod controller;
pub mod dispatcher;
pub mod idt;
pub mod ivt;
pub mod mmio;
pub mod page_fault;
pub mod pic;
pub mod port;
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod stubs;
pub mod vector;

pub use context::{InterruptContext, is_caused_by_kernel_mode};
pub use controller::{ControllerKind, CpuCapabilities, InterruptController};
pub use dispatcher::ExceptionDispatcher;
pub use ivt::{FaultInfo, InterruptHandler, Ivt, Outcome};
pub use vector::{Vector, VectorClass};
