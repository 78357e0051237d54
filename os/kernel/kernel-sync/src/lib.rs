//! # Kernel synchronization primitives
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`SpinMutex`] | Spin lock that keeps interrupts off while held. |
//! | [`IrqState`] | Saved interrupt flag, restored on drop. |
//! | [`SyncOnceCell`] | Write-once cell for values chosen at boot. |
//!
//! The kernel runs on one CPU, so a lock shared with an interrupt handler
//! only needs interrupts masked while it is held. Handlers that may
//! interrupt a holder use [`SpinMutex::try_lock_irq`] and back off.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod once;
mod spin_mutex;

pub use irq::IrqState;
pub use once::SyncOnceCell;
pub use spin_mutex::{SpinGuard, SpinMutex};
