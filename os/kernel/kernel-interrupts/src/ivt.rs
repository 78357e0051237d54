//! # Interrupt Vector Table Manager
//!
//! Owns the binding of vector numbers to handlers. Every slot moves through
//!
//! ```text
//!  Unreserved ──reserve──▶ Reserved(class) ──install──▶ Installed
//!                               ▲                          │
//!                               └────────uninstall─────────┘
//! ```
//!
//! Vectors `0..32` are reserved for CPU exceptions and bound to the exception
//! dispatcher by [`Ivt::init`]; drivers cannot install or uninstall them. IRQ
//! slots come from the controller chosen with [`Ivt::select_controller`].
//!
//! ```rust
//! use kernel_interrupts::{InterruptContext, InterruptHandler, Ivt, Outcome, VectorClass};
//! # use kernel_interrupts::{ControllerKind, InterruptController, Vector};
//! # use kernel_status::{KResult, Status};
//! # struct NoLines;
//! # impl InterruptController for NoLines {
//! #     fn kind(&self) -> ControllerKind { ControllerKind::Pic }
//! #     fn vector_base(&self) -> u8 { 0x20 }
//! #     fn line_count(&self) -> u8 { 16 }
//! #     fn spurious_vector(&self) -> Option<Vector> { None }
//! #     fn enable(&self, _: u8) -> KResult<()> { Ok(()) }
//! #     fn disable(&self, _: u8) -> KResult<()> { Ok(()) }
//! #     fn acknowledge(&self, _: u8) {}
//! #     fn is_spurious(&self, _: u8) -> bool { false }
//! # }
//! struct Ignore;
//! impl InterruptHandler for Ignore {
//!     fn handle(&self, _ctx: &mut InterruptContext) -> Outcome {
//!         Outcome::Handled
//!     }
//! }
//!
//! static PIC: NoLines = NoLines;
//! static EXCEPTIONS: Ignore = Ignore;
//! static TIMER: Ignore = Ignore;
//! static IVT: Ivt<'static> = Ivt::new();
//!
//! IVT.select_controller(&PIC).unwrap();
//! IVT.init(&EXCEPTIONS).unwrap();
//! let v = IVT.get_free_vector(VectorClass::Irq).unwrap();
//! IVT.install(v.as_u8().into(), &TIMER).unwrap();
//! ```

use crate::context::InterruptContext;
use crate::controller::InterruptController;
use crate::vector::{Vector, VectorClass};
use kernel_info::interrupts::{EXCEPTION_COUNT, VECTOR_COUNT};
use kernel_memory_addresses::VirtualAddress;
use kernel_status::{KResult, Status};
use kernel_sync::{SpinMutex, SyncOnceCell};

/// Details of an exception that could not be handled in place.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FaultInfo {
    pub vector: Vector,
    pub error_code: u32,
    /// Faulting linear address (CR2), page faults only.
    pub address: Option<VirtualAddress>,
    pub eip: u32,
    pub cs: u32,
    /// Why resolution failed, when a resolver was asked.
    pub status: Option<Status>,
}

impl FaultInfo {
    #[must_use]
    pub fn from_context(ctx: &InterruptContext, vector: Vector) -> Self {
        Self {
            vector,
            error_code: ctx.error_code,
            address: (vector == Vector::PAGE_FAULT).then(|| ctx.fault_address()),
            eip: ctx.eip,
            cs: ctx.cs,
            status: None,
        }
    }

    #[must_use]
    pub const fn with_status(self, status: Status) -> Self {
        Self {
            status: Some(status),
            ..self
        }
    }
}

/// What the interrupted context should do next.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Outcome {
    /// Resume the interrupted code.
    Handled,
    /// Unrecoverable fault in kernel mode; the kernel halts.
    Fatal(FaultInfo),
    /// Fault in user mode; the owning process is notified.
    ReportToProcess(FaultInfo),
}

/// A handler bound to one or more vectors.
pub trait InterruptHandler: Sync {
    fn handle(&self, ctx: &mut InterruptContext) -> Outcome;
}

#[derive(Copy, Clone)]
struct Slot<'h> {
    class: Option<VectorClass>,
    handler: Option<&'h dyn InterruptHandler>,
    enabled: bool,
}

impl Slot<'_> {
    const UNRESERVED: Self = Self {
        class: None,
        handler: None,
        enabled: false,
    };
}

pub struct Ivt<'h> {
    slots: SpinMutex<[Slot<'h>; VECTOR_COUNT]>,
    controller: SyncOnceCell<&'h dyn InterruptController>,
}

impl Default for Ivt<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'h> Ivt<'h> {
    /// Every slot unreserved, no controller.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: SpinMutex::new([Slot::UNRESERVED; VECTOR_COUNT]),
            controller: SyncOnceCell::new(),
        }
    }

    /// The selected controller.
    pub fn controller(&self) -> Option<&'h dyn InterruptController> {
        self.controller.get().copied()
    }

    /// Choose the interrupt controller and reserve its vectors.
    ///
    /// # Errors
    /// [`Status::OperationNotAllowed`] if a controller was selected before.
    pub fn select_controller(&self, controller: &'h dyn InterruptController) -> KResult<()> {
        if self.controller.set(controller).is_err() {
            return Err(Status::OperationNotAllowed);
        }
        let base = usize::from(controller.vector_base());
        let end = (base + usize::from(controller.line_count())).min(VECTOR_COUNT);
        let mut slots = self.slots.lock_irq();
        for slot in &mut slots[base..end] {
            slot.class = Some(VectorClass::Irq);
        }
        if let Some(v) = controller.spurious_vector() {
            slots[v.index()].class = Some(VectorClass::System);
        }
        log::info!(
            "ivt: {:?} controller, IRQ vectors {base:#x}..{end:#x}",
            controller.kind()
        );
        Ok(())
    }

    /// Reserve the exception vectors and bind `dispatcher` to all of them.
    ///
    /// # Errors
    /// [`Status::ItNoControllerConfigured`] if no controller was selected;
    /// the exception vectors are installed regardless.
    pub fn init(&self, dispatcher: &'h dyn InterruptHandler) -> KResult<()> {
        {
            let mut slots = self.slots.lock_irq();
            for slot in &mut slots[..usize::from(EXCEPTION_COUNT)] {
                *slot = Slot {
                    class: Some(VectorClass::Exception),
                    handler: Some(dispatcher),
                    enabled: true,
                };
            }
        }
        if self.controller.get().is_none() {
            log::error!("ivt: no interrupt controller selected");
            return Err(Status::ItNoControllerConfigured);
        }
        log::debug!("ivt: exception dispatcher installed on 0..{EXCEPTION_COUNT}");
        Ok(())
    }

    /// The lowest reserved, uninstalled vector of `class`.
    ///
    /// # Errors
    /// - [`Status::ItNoControllerConfigured`] when asking for an IRQ vector
    ///   before a controller was selected.
    /// - [`Status::NoFreeInterruptVectors`] if every slot of the class is
    ///   installed.
    pub fn get_free_vector(&self, class: VectorClass) -> KResult<Vector> {
        if class == VectorClass::Irq && self.controller.get().is_none() {
            return Err(Status::ItNoControllerConfigured);
        }
        let slots = self.slots.lock_irq();
        slots
            .iter()
            .position(|s| s.class == Some(class) && s.handler.is_none())
            .and_then(|i| u8::try_from(i).ok())
            .map(Vector::new)
            .ok_or(Status::NoFreeInterruptVectors)
    }

    /// Bind `handler` to a reserved vector and enable its line.
    ///
    /// # Errors
    /// - [`Status::BadInterruptVector`] if the vector is out of range, an
    ///   exception vector, or not reserved.
    /// - [`Status::InterruptAlreadyRegistered`] if a handler is installed.
    /// - Errors of the controller when enabling the line.
    pub fn install(&self, vector: u16, handler: &'h dyn InterruptHandler) -> KResult<()> {
        let vector = Self::check_vector(vector)?;
        let class = {
            let mut slots = self.slots.lock_irq();
            let slot = &mut slots[vector.index()];
            let Some(class) = slot.class else {
                return Err(Status::BadInterruptVector);
            };
            if slot.handler.is_some() {
                return Err(Status::InterruptAlreadyRegistered);
            }
            slot.handler = Some(handler);
            slot.enabled = true;
            class
        };
        if class == VectorClass::Irq
            && let Err(e) = self.set_line(vector, true)
        {
            let mut slots = self.slots.lock_irq();
            slots[vector.index()].handler = None;
            slots[vector.index()].enabled = false;
            return Err(e);
        }
        log::debug!("ivt: handler installed on {vector}");
        Ok(())
    }

    /// Disable the line and unbind the handler of `vector`.
    ///
    /// # Errors
    /// - [`Status::BadInterruptVector`] as for [`install`](Self::install).
    /// - [`Status::InterruptNotRegistered`] if no handler is installed.
    pub fn uninstall(&self, vector: u16) -> KResult<()> {
        let vector = Self::check_vector(vector)?;
        let class = self.installed_class(vector)?;
        if class == VectorClass::Irq {
            self.set_line(vector, false)?;
        }
        let mut slots = self.slots.lock_irq();
        slots[vector.index()].handler = None;
        slots[vector.index()].enabled = false;
        log::debug!("ivt: handler removed from {vector}");
        Ok(())
    }

    /// Enable or disable delivery to an installed handler.
    ///
    /// # Errors
    /// - [`Status::BadInterruptVector`] as for [`install`](Self::install).
    /// - [`Status::InterruptNotRegistered`] if no handler is installed.
    pub fn set_enabled(&self, vector: u16, enabled: bool) -> KResult<()> {
        let vector = Self::check_vector(vector)?;
        if self.installed_class(vector)? == VectorClass::Irq {
            self.set_line(vector, enabled)?;
        }
        self.slots.lock_irq()[vector.index()].enabled = enabled;
        Ok(())
    }

    /// Whether a handler is installed on `vector`.
    pub fn is_installed(&self, vector: Vector) -> bool {
        self.slots.lock_irq()[vector.index()].handler.is_some()
    }

    /// The class `vector` is reserved for.
    pub fn class_of(&self, vector: Vector) -> Option<VectorClass> {
        self.slots.lock_irq()[vector.index()].class
    }

    /// Route an interrupt to its handler.
    ///
    /// Spurious controller interrupts are dropped without an end of interrupt;
    /// every other IRQ is acknowledged after its handler ran. The slot table
    /// is not locked while the handler runs.
    pub fn dispatch(&self, ctx: &mut InterruptContext) -> Outcome {
        let Some(vector) = ctx.vector() else {
            log::error!("ivt: stub passed invalid vector {:#x}", ctx.vector);
            return Outcome::Handled;
        };
        let slot = self.slots.lock_irq()[vector.index()];
        let controller = self.controller();

        let line = match (slot.class, controller) {
            (Some(VectorClass::Irq), Some(c)) => c.line_of(vector),
            _ => None,
        };
        if let (Some(line), Some(c)) = (line, controller)
            && c.is_spurious(line)
        {
            return Outcome::Handled;
        }

        let outcome = match slot.handler {
            Some(h) if slot.enabled => h.handle(ctx),
            Some(_) => {
                log::trace!("ivt: {vector} disabled, dropped");
                Outcome::Handled
            }
            None if vector.is_exception() => {
                // Exceptions must never be dropped silently.
                Outcome::Fatal(FaultInfo::from_context(ctx, vector))
            }
            None => {
                log::warn!("ivt: unhandled interrupt {vector}");
                Outcome::Handled
            }
        };

        if let (Some(line), Some(c)) = (line, controller) {
            c.acknowledge(line);
        }
        outcome
    }

    fn check_vector(vector: u16) -> KResult<Vector> {
        let v = Vector::try_from(vector)?;
        if v.is_exception() {
            return Err(Status::BadInterruptVector);
        }
        Ok(v)
    }

    fn installed_class(&self, vector: Vector) -> KResult<VectorClass> {
        let slots = self.slots.lock_irq();
        let slot = &slots[vector.index()];
        let Some(class) = slot.class else {
            return Err(Status::BadInterruptVector);
        };
        if slot.handler.is_none() {
            return Err(Status::InterruptNotRegistered);
        }
        Ok(class)
    }

    fn set_line(&self, vector: Vector, enabled: bool) -> KResult<()> {
        let c = self.controller().ok_or(Status::ItNoControllerConfigured)?;
        let line = c.line_of(vector).ok_or(Status::BadInterruptVector)?;
        if enabled { c.enable(line) } else { c.disable(line) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerKind;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeController {
        spurious_line: Option<u8>,
        apic: bool,
        log: Mutex<Vec<String>>,
    }

    impl FakeController {
        fn take_log(&self) -> Vec<String> {
            std::mem::take(&mut *self.log.lock().unwrap())
        }
    }

    impl InterruptController for FakeController {
        fn kind(&self) -> ControllerKind {
            if self.apic { ControllerKind::Apic } else { ControllerKind::Pic }
        }
        fn vector_base(&self) -> u8 {
            0x20
        }
        fn line_count(&self) -> u8 {
            4
        }
        fn spurious_vector(&self) -> Option<Vector> {
            self.apic.then_some(Vector::new(0xFF))
        }
        fn enable(&self, line: u8) -> KResult<()> {
            self.log.lock().unwrap().push(format!("enable {line}"));
            Ok(())
        }
        fn disable(&self, line: u8) -> KResult<()> {
            self.log.lock().unwrap().push(format!("disable {line}"));
            Ok(())
        }
        fn acknowledge(&self, line: u8) {
            self.log.lock().unwrap().push(format!("eoi {line}"));
        }
        fn is_spurious(&self, line: u8) -> bool {
            self.spurious_line == Some(line)
        }
    }

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl InterruptHandler for Counter {
        fn handle(&self, _ctx: &mut InterruptContext) -> Outcome {
            self.0.fetch_add(1, Ordering::SeqCst);
            Outcome::Handled
        }
    }

    fn ctx(vector: u32) -> InterruptContext {
        InterruptContext {
            vector,
            cs: 0x08,
            ..InterruptContext::default()
        }
    }

    #[test]
    fn init_without_controller_still_installs_exceptions() {
        let dispatcher = Counter::default();
        let ivt = Ivt::new();
        assert_eq!(ivt.init(&dispatcher), Err(Status::ItNoControllerConfigured));
        for v in 0..32 {
            assert!(ivt.is_installed(Vector::new(v)));
            assert_eq!(ivt.class_of(Vector::new(v)), Some(VectorClass::Exception));
        }
        assert_eq!(ivt.get_free_vector(VectorClass::Irq), Err(Status::ItNoControllerConfigured));
        ivt.dispatch(&mut ctx(14));
        assert_eq!(dispatcher.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn controller_is_selected_once() {
        let a = FakeController::default();
        let b = FakeController::default();
        let ivt = Ivt::new();
        ivt.select_controller(&a).unwrap();
        assert_eq!(ivt.select_controller(&b), Err(Status::OperationNotAllowed));
        assert_eq!(ivt.class_of(Vector::new(0x23)), Some(VectorClass::Irq));
        assert_eq!(ivt.class_of(Vector::new(0x24)), None);
    }

    #[test]
    fn install_uninstall_lifecycle() {
        let pic = FakeController::default();
        let exceptions = Counter::default();
        let h1 = Counter::default();
        let h2 = Counter::default();
        let ivt = Ivt::new();
        ivt.select_controller(&pic).unwrap();
        ivt.init(&exceptions).unwrap();

        assert_eq!(ivt.install(14, &h1), Err(Status::BadInterruptVector));
        assert_eq!(ivt.install(0x40, &h1), Err(Status::BadInterruptVector));
        assert_eq!(ivt.install(256, &h1), Err(Status::BadInterruptVector));
        assert_eq!(ivt.uninstall(13), Err(Status::BadInterruptVector));

        ivt.install(0x21, &h1).unwrap();
        assert_eq!(ivt.install(0x21, &h2), Err(Status::InterruptAlreadyRegistered));
        assert_eq!(pic.take_log(), vec!["enable 1"]);

        assert_eq!(ivt.uninstall(0x22), Err(Status::InterruptNotRegistered));
        ivt.uninstall(0x21).unwrap();
        assert_eq!(pic.take_log(), vec!["disable 1"]);
        assert_eq!(ivt.uninstall(0x21), Err(Status::InterruptNotRegistered));
        ivt.install(0x21, &h2).unwrap();
    }

    #[test]
    fn free_vectors_run_out() {
        let pic = FakeController::default();
        let h = Counter::default();
        let ivt = Ivt::new();
        ivt.select_controller(&pic).unwrap();
        for expected in 0x20..0x24_u16 {
            let v = ivt.get_free_vector(VectorClass::Irq).unwrap();
            assert_eq!(u16::from(v.as_u8()), expected);
            ivt.install(expected, &h).unwrap();
        }
        assert_eq!(ivt.get_free_vector(VectorClass::Irq), Err(Status::NoFreeInterruptVectors));
        ivt.uninstall(0x22).unwrap();
        assert_eq!(ivt.get_free_vector(VectorClass::Irq), Ok(Vector::new(0x22)));
    }

    #[test]
    fn dispatch_acknowledges_irqs_but_not_spurious_ones() {
        let pic = FakeController {
            spurious_line: Some(3),
            ..FakeController::default()
        };
        let h = Counter::default();
        let ivt = Ivt::new();
        ivt.select_controller(&pic).unwrap();
        ivt.install(0x21, &h).unwrap();
        ivt.install(0x23, &h).unwrap();
        pic.take_log();

        assert_eq!(ivt.dispatch(&mut ctx(0x21)), Outcome::Handled);
        assert_eq!(ivt.dispatch(&mut ctx(0x23)), Outcome::Handled);
        assert_eq!(h.0.load(Ordering::SeqCst), 1);
        assert_eq!(pic.take_log(), vec!["eoi 1"]);

        // Unhandled lines are still acknowledged.
        ivt.dispatch(&mut ctx(0x22));
        assert_eq!(pic.take_log(), vec!["eoi 2"]);
    }

    #[test]
    fn disabled_handlers_are_skipped() {
        let pic = FakeController::default();
        let h = Counter::default();
        let ivt = Ivt::new();
        ivt.select_controller(&pic).unwrap();
        assert_eq!(ivt.set_enabled(0x20, false), Err(Status::InterruptNotRegistered));
        ivt.install(0x20, &h).unwrap();
        ivt.set_enabled(0x20, false).unwrap();
        ivt.dispatch(&mut ctx(0x20));
        assert_eq!(h.0.load(Ordering::SeqCst), 0);
        ivt.set_enabled(0x20, true).unwrap();
        ivt.dispatch(&mut ctx(0x20));
        assert_eq!(h.0.load(Ordering::SeqCst), 1);
        assert_eq!(pic.take_log(), vec!["enable 0", "disable 0", "eoi 0", "enable 0", "eoi 0"]);
    }

    #[test]
    fn apic_spurious_vector_is_a_system_slot() {
        let apic = FakeController {
            apic: true,
            ..FakeController::default()
        };
        let h = Counter::default();
        let ivt = Ivt::new();
        ivt.select_controller(&apic).unwrap();
        assert_eq!(ivt.get_free_vector(VectorClass::System), Ok(Vector::new(0xFF)));
        ivt.install(0xFF, &h).unwrap();
        ivt.dispatch(&mut ctx(0xFF));
        assert_eq!(h.0.load(Ordering::SeqCst), 1);
        // No line, no EOI.
        assert!(apic.take_log().is_empty());
    }
}
