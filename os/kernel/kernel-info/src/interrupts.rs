//! # Interrupt Vector Layout

/// Number of interrupt vectors on x86.
pub const VECTOR_COUNT: usize = 256;

/// Vectors `0..EXCEPTION_COUNT` are reserved for CPU exceptions.
pub const EXCEPTION_COUNT: u8 = 32;

/// Vector of the first line of the master 8259 PIC after remapping.
pub const PIC_MASTER_BASE: u8 = 0x20;

/// Vector of the first line of the slave 8259 PIC after remapping.
pub const PIC_SLAVE_BASE: u8 = 0x28;

/// Number of lines of the cascaded PIC pair.
pub const PIC_LINES: u8 = 16;

/// Vector of the first I/O APIC redirection entry.
pub const APIC_IRQ_BASE: u8 = 0x20;

/// Local APIC spurious interrupt vector.
pub const APIC_SPURIOUS_VECTOR: u8 = 0xFF;

const _: () = {
    assert!(PIC_MASTER_BASE >= EXCEPTION_COUNT);
    assert!(PIC_SLAVE_BASE == PIC_MASTER_BASE + 8);
    assert!(APIC_IRQ_BASE >= EXCEPTION_COUNT);
};
