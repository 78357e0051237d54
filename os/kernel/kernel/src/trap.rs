//! # Trap Routing
//!
//! Every entry stub ends up in [`route`], which hands the frame to the IVT and
//! acts on the outcome.

use crate::fatal::FaultReport;
use kernel_interrupts::{FaultInfo, InterruptContext, Ivt, Outcome};

/// Receives faults raised by user code.
pub trait ProcessFaultSink: Sync {
    fn deliver(&self, fault: FaultInfo);
}

/// Sink used while no process manager is running: user faults are logged
/// and otherwise ignored.
#[derive(Debug, Default)]
pub struct LogUserFaults;

impl ProcessFaultSink for LogUserFaults {
    fn deliver(&self, fault: FaultInfo) {
        log::warn!("user fault without a process manager: {}", FaultReport::from(fault));
    }
}

/// Dispatch `ctx` through `ivt`.
///
/// # Errors
/// The report of a fatal kernel fault; the caller must not return to the
/// interrupted code.
pub fn route(ivt: &Ivt<'_>, sink: &dyn ProcessFaultSink, ctx: &mut InterruptContext) -> Result<(), FaultReport> {
    match ivt.dispatch(ctx) {
        Outcome::Handled => Ok(()),
        Outcome::ReportToProcess(fault) => {
            sink.deliver(fault);
            Ok(())
        }
        Outcome::Fatal(fault) => Err(FaultReport::from(fault)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_interrupts::{ExceptionDispatcher, Vector};
    use kernel_memory_addresses::VirtualAddress;
    use kernel_status::{KResult, Status};
    use kernel_vmem::{FaultAccess, FaultResolution, FaultResolver};
    use std::sync::Mutex;

    struct NothingMapped;

    impl FaultResolver for NothingMapped {
        fn resolve_fault(&self, _: VirtualAddress, _: FaultAccess) -> KResult<FaultResolution> {
            Err(Status::PageNotPresent)
        }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<FaultInfo>>);

    impl ProcessFaultSink for Collect {
        fn deliver(&self, fault: FaultInfo) {
            self.0.lock().unwrap().push(fault);
        }
    }

    fn page_fault(cs: u32, address: u32) -> InterruptContext {
        InterruptContext {
            vector: u32::from(Vector::PAGE_FAULT.as_u8()),
            error_code: if cs & 3 == 3 { 0b110 } else { 0b010 },
            fault_address: address,
            cs,
            ..InterruptContext::default()
        }
    }

    #[test]
    fn user_faults_reach_the_sink_and_kernel_faults_are_fatal() {
        let resolver = NothingMapped;
        let dispatcher = ExceptionDispatcher::new(&resolver);
        let ivt = Ivt::new();
        // No controller: exception slots are still installed.
        assert_eq!(ivt.init(&dispatcher), Err(Status::ItNoControllerConfigured));

        let sink = Collect::default();
        let mut user = page_fault(0x1B, 0x0804_8000);
        assert_eq!(route(&ivt, &sink, &mut user), Ok(()));
        let delivered = sink.0.lock().unwrap().clone();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].address, Some(VirtualAddress::new(0x0804_8000)));

        let mut kernel = page_fault(0x08, 0xD100_0000);
        let report = route(&ivt, &sink, &mut kernel).unwrap_err();
        assert_eq!(report.info.status, Some(Status::PageNotPresent));
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn breakpoints_resume() {
        let resolver = NothingMapped;
        let dispatcher = ExceptionDispatcher::new(&resolver);
        let ivt = Ivt::new();
        assert_eq!(ivt.init(&dispatcher), Err(Status::ItNoControllerConfigured));
        let mut ctx = InterruptContext {
            vector: u32::from(Vector::BREAKPOINT.as_u8()),
            cs: 0x08,
            ..InterruptContext::default()
        };
        assert_eq!(route(&ivt, &LogUserFaults, &mut ctx), Ok(()));
    }
}
