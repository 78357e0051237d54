//! # Local APIC and I/O APIC
//!
//! The local APIC is software-enabled through the spurious interrupt vector
//! register and acknowledges interrupts through its EOI register. Device lines
//! come from one I/O APIC whose redirection entries are programmed through the
//! `IOREGSEL`/`IOWIN` window. Pin `n` raises vector `APIC_IRQ_BASE + n` on
//! APIC 0.
//!
//! Both register blocks must be mapped uncached (see
//! `DynamicMapper::map_mmio`) before [`Apic::new`] is called.

use crate::controller::{ControllerKind, InterruptController};
use crate::mmio::Mmio;
use crate::vector::Vector;
use bitfield_struct::bitfield;
use kernel_info::interrupts::{APIC_IRQ_BASE, APIC_SPURIOUS_VECTOR};
use kernel_status::{KResult, Status};
use kernel_sync::SpinMutex;

/// Physical base of the local APIC after reset.
pub const LAPIC_DEFAULT_BASE: u32 = 0xFEE0_0000;

/// Physical base of the first I/O APIC on PC platforms.
pub const IOAPIC_DEFAULT_BASE: u32 = 0xFEC0_0000;

const LAPIC_ID: u32 = 0x20;
const LAPIC_TPR: u32 = 0x80;
const LAPIC_EOI: u32 = 0xB0;
const LAPIC_SVR: u32 = 0xF0;
const SVR_APIC_ENABLE: u32 = 1 << 8;

const IOREGSEL: u32 = 0x00;
const IOWIN: u32 = 0x10;
const IOAPIC_VER: u32 = 0x01;

fn redirection_register(pin: u8) -> u32 {
    0x10 + 2 * u32::from(pin)
}

/// An I/O APIC redirection table entry.
#[bitfield(u64)]
pub struct RedirectionEntry {
    pub vector: u8,
    /// 0 = fixed.
    #[bits(3)]
    pub delivery_mode: u8,
    pub logical_destination: bool,
    pub pending: bool,
    pub active_low: bool,
    pub remote_irr: bool,
    pub level_triggered: bool,
    pub masked: bool,
    #[bits(39)]
    __: u64,
    pub destination: u8,
}

pub struct Apic<R: Mmio> {
    lapic: R,
    ioapic: SpinMutex<R>,
    pins: u8,
}

impl<R: Mmio> Apic<R> {
    /// Wrap the two register blocks and read the number of I/O APIC pins.
    pub fn new(lapic: R, ioapic: R) -> Self {
        ioapic.write32(IOREGSEL, IOAPIC_VER);
        let max_entry = (ioapic.read32(IOWIN) >> 16) & 0xFF;
        let limit = u32::from(APIC_SPURIOUS_VECTOR - APIC_IRQ_BASE);
        #[allow(clippy::cast_possible_truncation)]
        let pins = (max_entry + 1).min(limit) as u8;
        Self {
            lapic,
            ioapic: SpinMutex::new(ioapic),
            pins,
        }
    }

    /// Enable the local APIC with the spurious vector, accept every priority
    /// and mask every redirection entry.
    pub fn init(&self) {
        self.lapic
            .write32(LAPIC_SVR, SVR_APIC_ENABLE | u32::from(APIC_SPURIOUS_VECTOR));
        self.lapic.write32(LAPIC_TPR, 0);
        for pin in 0..self.pins {
            self.write_entry(pin, Self::entry(pin, true));
        }
        log::debug!(
            "apic: local APIC {} enabled, {} I/O APIC pins masked",
            self.lapic.read32(LAPIC_ID) >> 24,
            self.pins
        );
    }

    /// The redirection entry currently programmed for `pin`.
    pub fn read_entry(&self, pin: u8) -> RedirectionEntry {
        let io = self.ioapic.lock_irq();
        io.write32(IOREGSEL, redirection_register(pin));
        let lo = io.read32(IOWIN);
        io.write32(IOREGSEL, redirection_register(pin) + 1);
        let hi = io.read32(IOWIN);
        RedirectionEntry::from_bits((u64::from(hi) << 32) | u64::from(lo))
    }

    const fn entry(pin: u8, masked: bool) -> RedirectionEntry {
        RedirectionEntry::new()
            .with_vector(APIC_IRQ_BASE + pin)
            .with_masked(masked)
            .with_destination(0)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_entry(&self, pin: u8, entry: RedirectionEntry) {
        let bits = entry.into_bits();
        let io = self.ioapic.lock_irq();
        // High half first so the entry never points at a stale destination
        // while unmasked.
        io.write32(IOREGSEL, redirection_register(pin) + 1);
        io.write32(IOWIN, (bits >> 32) as u32);
        io.write32(IOREGSEL, redirection_register(pin));
        io.write32(IOWIN, bits as u32);
    }

    fn set_masked(&self, line: u8, masked: bool) -> KResult<()> {
        if line >= self.pins {
            return Err(Status::BadInterruptVector);
        }
        self.write_entry(line, Self::entry(line, masked));
        Ok(())
    }
}

impl<R: Mmio> InterruptController for Apic<R> {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Apic
    }

    fn vector_base(&self) -> u8 {
        APIC_IRQ_BASE
    }

    fn line_count(&self) -> u8 {
        self.pins
    }

    fn spurious_vector(&self) -> Option<Vector> {
        Some(Vector::new(APIC_SPURIOUS_VECTOR))
    }

    fn enable(&self, line: u8) -> KResult<()> {
        self.set_masked(line, false)
    }

    fn disable(&self, line: u8) -> KResult<()> {
        self.set_masked(line, true)
    }

    fn acknowledge(&self, _line: u8) {
        self.lapic.write32(LAPIC_EOI, 0);
    }

    fn is_spurious(&self, _line: u8) -> bool {
        // Spurious APIC interrupts arrive on their own vector.
        false
    }
}
