//! # Interrupt Entry Stubs
//!
//! One 16-byte stub per vector, laid out back to back starting at
//! `isr_stub_table`. Each stub pushes a zero error code (unless the CPU pushed
//! one), pushes its vector number and jumps to [`isr_common`], which completes
//! the [`InterruptContext`] and calls `kernel_trap`.
//!
//! The kernel crate provides:
//!
//! ```ignore
//! #[unsafe(no_mangle)]
//! extern "C" fn kernel_trap(ctx: &mut InterruptContext) { .. }
//! ```
#![allow(clippy::missing_safety_doc)]

use crate::context::InterruptContext;
use core::arch::{global_asm, naked_asm};

/// Size of one entry stub.
pub const STUB_SIZE: u32 = 16;

/// Data segment selector loaded before entering Rust.
const KERNEL_DATA_SELECTOR: u16 = 0x10;

global_asm!(
    ".section .text.isr_stubs, \"ax\"",
    ".balign 16",
    ".global isr_stub_table",
    "isr_stub_table:",
    ".set vec, 0",
    ".rept 256",
    ".balign 16",
    ".if !((vec == 8) || ((vec >= 10) && (vec <= 14)) || (vec == 17) || (vec == 21) || (vec == 29) || (vec == 30))",
    "pushl $0",
    ".endif",
    "pushl $vec",
    "jmp isr_common",
    ".set vec, vec + 1",
    ".endr",
    ".previous",
    options(att_syntax)
);

unsafe extern "C" {
    static isr_stub_table: u8;
    fn kernel_trap(ctx: *mut InterruptContext);
}

/// Address of the entry stub for `vector`, for [`Idt::populate`](crate::idt::Idt::populate).
#[must_use]
pub fn stub_address(vector: u8) -> u32 {
    let base = (&raw const isr_stub_table).addr();
    #[allow(clippy::cast_possible_truncation)]
    let base = base as u32;
    base + u32::from(vector) * STUB_SIZE
}

/// Common tail of every stub. On entry the stack holds the vector, the error
/// code and the CPU frame; the registers, segments and CR2 are pushed on top
/// so that `esp` points at an [`InterruptContext`].
#[unsafe(naked)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn isr_common() {
    naked_asm!(
        "pushad",
        "push ds",
        "push es",
        "push fs",
        "push gs",
        "mov eax, cr2",
        "push eax",
        "mov ax, {data}",
        "mov ds, ax",
        "mov es, ax",
        "cld",
        "push esp",
        "call {trap}",
        // argument and fault address
        "add esp, 8",
        "pop gs",
        "pop fs",
        "pop es",
        "pop ds",
        "popad",
        // vector and error code
        "add esp, 8",
        "iretd",
        data = const KERNEL_DATA_SELECTOR,
        trap = sym kernel_trap,
    );
}
