//! # Interrupt Controller Abstraction
//!
//! The IVT manager drives whichever controller was selected at boot through
//! this trait. Lines are numbered from 0; line `n` arrives on vector
//! `vector_base() + n`.

use crate::vector::Vector;
use kernel_info::config::ControllerPreference;
use kernel_status::KResult;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ControllerKind {
    /// Cascaded 8259 pair.
    Pic,
    /// Local APIC with one I/O APIC.
    Apic,
}

pub trait InterruptController: Sync {
    fn kind(&self) -> ControllerKind;

    /// Vector of line 0.
    fn vector_base(&self) -> u8;

    /// Number of routable lines.
    fn line_count(&self) -> u8;

    /// Vector the controller raises for spurious interrupts, if it has a
    /// dedicated one.
    fn spurious_vector(&self) -> Option<Vector>;

    /// Unmask `line`.
    ///
    /// # Errors
    /// [`Status::BadInterruptVector`](kernel_status::Status::BadInterruptVector)
    /// if the line does not exist.
    fn enable(&self, line: u8) -> KResult<()>;

    /// Mask `line`.
    ///
    /// # Errors
    /// As [`enable`](Self::enable).
    fn disable(&self, line: u8) -> KResult<()>;

    /// Signal end of interrupt for `line`.
    fn acknowledge(&self, line: u8);

    /// Whether an interrupt that arrived on `line` was spurious. A spurious
    /// interrupt must not be acknowledged by the caller.
    fn is_spurious(&self, line: u8) -> bool;

    /// The line a vector belongs to, if it is in the controller's range.
    fn line_of(&self, vector: Vector) -> Option<u8> {
        let line = vector.as_u8().checked_sub(self.vector_base())?;
        (line < self.line_count()).then_some(line)
    }
}

/// What the CPU reports about interrupt hardware.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct CpuCapabilities {
    /// CPUID.01h:EDX.APIC
    pub apic: bool,
}

/// Pick the controller to use: the APIC when the CPU has one, it was brought
/// up and the configuration allows it; the PIC otherwise.
pub fn choose<'c>(
    caps: CpuCapabilities,
    preference: ControllerPreference,
    pic: &'c dyn InterruptController,
    apic: Option<&'c dyn InterruptController>,
) -> &'c dyn InterruptController {
    match apic {
        Some(apic) if caps.apic && preference == ControllerPreference::Auto => {
            log::info!("interrupts: using the APIC");
            apic
        }
        _ => {
            log::info!("interrupts: using the legacy PIC");
            pic
        }
    }
}
