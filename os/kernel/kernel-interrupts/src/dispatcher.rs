//! # Exception Dispatcher
//!
//! Default handler for vectors `0..32`. Page faults are forwarded to the
//! memory manager through a [`FaultResolver`]; debug traps and breakpoints
//! resume; everything else is fatal in kernel mode and reported to the
//! process in user mode.

use crate::context::{InterruptContext, is_caused_by_kernel_mode};
use crate::ivt::{FaultInfo, InterruptHandler, Outcome};
use crate::page_fault::PageFaultError;
use crate::vector::Vector;
use kernel_status::Status;
use kernel_vmem::FaultResolver;

pub struct ExceptionDispatcher<'r> {
    resolver: &'r dyn FaultResolver,
}

impl<'r> ExceptionDispatcher<'r> {
    #[must_use]
    pub const fn new(resolver: &'r dyn FaultResolver) -> Self {
        Self { resolver }
    }

    fn page_fault(&self, ctx: &InterruptContext) -> Outcome {
        let error = PageFaultError::from_bits(ctx.error_code);
        let addr = ctx.fault_address();
        match self.resolver.resolve_fault(addr, error.access()) {
            Ok(resolution) => {
                log::trace!("#PF at {addr} resolved: {resolution:?}");
                Outcome::Handled
            }
            Err(status) => {
                log::debug!("#PF at {addr} unresolved ({}): {status}", error.explain());
                let info = FaultInfo::from_context(ctx, Vector::PAGE_FAULT)
                    .with_status(Status::PageNotPresent);
                Self::escalate(ctx, info)
            }
        }
    }

    fn escalate(ctx: &InterruptContext, info: FaultInfo) -> Outcome {
        if is_caused_by_kernel_mode(ctx) {
            Outcome::Fatal(info)
        } else {
            Outcome::ReportToProcess(info)
        }
    }
}

impl InterruptHandler for ExceptionDispatcher<'_> {
    fn handle(&self, ctx: &mut InterruptContext) -> Outcome {
        let Some(vector) = ctx.vector() else {
            return Outcome::Handled;
        };
        match vector {
            Vector::PAGE_FAULT => self.page_fault(ctx),
            Vector::DEBUG | Vector::BREAKPOINT => {
                log::info!("{vector} at {:#010x}", ctx.eip);
                Outcome::Handled
            }
            _ => Self::escalate(ctx, FaultInfo::from_context(ctx, vector)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::VirtualAddress;
    use kernel_status::KResult;
    use kernel_vmem::{FaultAccess, FaultResolution};
    use std::sync::Mutex;

    /// Resolves faults inside one page and records every request.
    struct OnePage {
        page: u32,
        seen: Mutex<Vec<(u32, FaultAccess)>>,
    }

    impl OnePage {
        fn new(page: u32) -> Self {
            Self {
                page,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl FaultResolver for OnePage {
        fn resolve_fault(
            &self,
            addr: VirtualAddress,
            access: FaultAccess,
        ) -> KResult<FaultResolution> {
            self.seen.lock().unwrap().push((addr.as_u32(), access));
            if addr.as_u32() & !0xFFF == self.page {
                Ok(FaultResolution::Committed)
            } else {
                Err(Status::PageNotPresent)
            }
        }
    }

    fn fault(cs: u32, vector: u32, error_code: u32, cr2: u32) -> InterruptContext {
        InterruptContext {
            fault_address: cr2,
            vector,
            error_code,
            eip: 0xD000_4000,
            cs,
            eflags: 0x202,
            ..InterruptContext::default()
        }
    }

    #[test]
    fn resolved_page_fault_resumes() {
        let resolver = OnePage::new(0xF800_0000);
        let d = ExceptionDispatcher::new(&resolver);
        let mut ctx = fault(0x08, 14, 0b010, 0xF800_0123);
        assert_eq!(d.handle(&mut ctx), Outcome::Handled);
        assert_eq!(
            resolver.seen.lock().unwrap().as_slice(),
            &[(0xF800_0123, FaultAccess::write())]
        );
    }

    #[test]
    fn unresolved_kernel_page_fault_is_fatal() {
        let resolver = OnePage::new(0xF800_0000);
        let d = ExceptionDispatcher::new(&resolver);
        let mut ctx = fault(0x08, 14, 0, 0x0000_0010);
        let Outcome::Fatal(info) = d.handle(&mut ctx) else {
            panic!("expected a fatal outcome");
        };
        assert_eq!(info.vector, Vector::PAGE_FAULT);
        assert_eq!(info.status, Some(Status::PageNotPresent));
        assert_eq!(info.address, Some(VirtualAddress::new(0x10)));
        assert_eq!(info.eip, 0xD000_4000);
    }

    #[test]
    fn unresolved_user_page_fault_goes_to_the_process() {
        let resolver = OnePage::new(0xF800_0000);
        let d = ExceptionDispatcher::new(&resolver);
        let mut ctx = fault(0x1B, 14, 0b110, 0x0804_8000);
        let outcome = d.handle(&mut ctx);
        assert!(matches!(outcome, Outcome::ReportToProcess(i) if i.error_code == 0b110));
        assert_eq!(
            resolver.seen.lock().unwrap()[0].1,
            FaultAccess::write().from_user()
        );
    }

    #[test]
    fn traps_resume_and_other_exceptions_escalate() {
        let resolver = OnePage::new(0);
        let d = ExceptionDispatcher::new(&resolver);
        assert_eq!(d.handle(&mut fault(0x08, 3, 0, 0)), Outcome::Handled);
        assert_eq!(d.handle(&mut fault(0x1B, 1, 0, 0)), Outcome::Handled);

        let Outcome::Fatal(info) = d.handle(&mut fault(0x08, 13, 0x18, 0)) else {
            panic!("#GP in kernel mode must be fatal");
        };
        assert_eq!(info.status, None);
        assert_eq!(info.address, None);
        assert!(matches!(
            d.handle(&mut fault(0x1B, 0, 0, 0)),
            Outcome::ReportToProcess(_)
        ));
        assert!(resolver.seen.lock().unwrap().is_empty());
    }
}
