//! # Memory Layout
//!
//! ```text
//! Virtual Address Space Layout (i686, 2-level paging):
//!
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │          User Space             │
//! USER_END    ├─────────────────────────────────┤ 0xC000_0000
//!             │   Direct Map (phys 0..256 MiB)  │
//! KERNEL_BASE ├─────────────────────────────────┤ 0xD000_0000
//!             │   Kernel Image, Boot Tables     │
//! DYNAMIC_BASE├─────────────────────────────────┤ 0xF800_0000
//!             │   Dynamic Kernel Mappings       │
//!             │   (MMIO, heap growth)           │
//! SELF_MAP    ├─────────────────────────────────┤ 0xFFC0_0000
//!             │   Page Tables (PDE 1023)        │
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```

/// Size of a page and of a physical frame.
pub const PAGE_SIZE: u32 = 4096;

/// First address that is not user space; the kernel half begins here.
pub const USER_END: u32 = 0xC000_0000;

/// Index of the first page directory entry of the kernel half.
pub const KERNEL_PDE_START: usize = (USER_END >> 22) as usize;

/// Virtual base of the direct map of low physical memory.
///
/// Physical address `pa` below [`DIRECT_MAP_SIZE`] is reachable at
/// `DIRECT_MAP_BASE + pa`. Page tables and frames handed out by the
/// physical allocator always lie inside this window.
pub const DIRECT_MAP_BASE: u32 = 0xC000_0000;

/// Amount of physical memory covered by the direct map.
pub const DIRECT_MAP_SIZE: u32 = 0x1000_0000; // 256 MiB

/// Where the kernel executes (VMA), matches the linker script.
pub const KERNEL_BASE: u32 = 0xD000_0000;

/// Where the boot loader places the kernel image in physical memory (LMA).
pub const PHYS_LOAD: u32 = 0x0010_0000; // 1 MiB

/// Base of the window managed by the dynamic kernel mapper.
pub const DYNAMIC_BASE: u32 = 0xF800_0000;

/// Size of the dynamic kernel mapping window.
pub const DYNAMIC_SIZE: u32 = 0x0780_0000;

/// Page directory slot that refers back to the directory itself.
pub const SELF_MAP_PDE: usize = 1023;

/// Virtual base of the recursive page table window.
pub const SELF_MAP_BASE: u32 = 0xFFC0_0000;

/// The size of the kernel stack.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(KERNEL_STACK_SIZE.is_multiple_of(PAGE_SIZE as usize));
    assert!(DIRECT_MAP_BASE >= USER_END);
    assert!(DIRECT_MAP_BASE + DIRECT_MAP_SIZE <= KERNEL_BASE);
    assert!(KERNEL_BASE < DYNAMIC_BASE);
    assert!(DYNAMIC_BASE.is_multiple_of(PAGE_SIZE));
    assert!(DYNAMIC_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(DYNAMIC_BASE + DYNAMIC_SIZE <= SELF_MAP_BASE);
    assert!(SELF_MAP_BASE == (SELF_MAP_PDE as u32) << 22);
};
