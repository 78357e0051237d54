//! # Fatal Faults
//!
//! A kernel-mode exception that could not be resolved ends here: the report
//! goes to the log and the CPU parks.

use core::fmt;
use kernel_interrupts::page_fault::PageFaultError;
use kernel_interrupts::{FaultInfo, Vector};

/// Human-readable dump of an unrecoverable fault.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FaultReport {
    pub info: FaultInfo,
}

impl From<FaultInfo> for FaultReport {
    fn from(info: FaultInfo) -> Self {
        Self { info }
    }
}

impl fmt::Display for FaultReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let i = &self.info;
        write!(
            f,
            "vector {} at {:#06x}:{:#010x}, error code {:#x}",
            i.vector, i.cs, i.eip, i.error_code
        )?;
        if i.vector == Vector::PAGE_FAULT {
            let pf = PageFaultError::from_bits(i.error_code);
            if let Some(addr) = i.address {
                write!(f, ", CR2 {:#010x}", addr.as_u32())?;
            }
            write!(
                f,
                " [{}; {} {} access]",
                pf.explain(),
                if pf.user() { "user" } else { "supervisor" },
                if pf.write() { "write" } else { "read" }
            )?;
        }
        if let Some(status) = i.status {
            write!(f, ": {status}")?;
        }
        Ok(())
    }
}

/// Log `report` and stop this CPU.
pub fn fatal(report: FaultReport) -> ! {
    log::error!("KERNEL FAULT: {report}");
    halt()
}

/// Disable interrupts and halt forever.
pub fn halt() -> ! {
    loop {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        unsafe {
            core::arch::asm!("cli", "hlt", options(nomem, nostack));
        }
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::VirtualAddress;
    use kernel_status::Status;

    #[test]
    fn page_fault_report_decodes_error_code() {
        let report = FaultReport::from(FaultInfo {
            vector: Vector::PAGE_FAULT,
            error_code: 0b010,
            address: Some(VirtualAddress::new(0xD040_1000)),
            eip: 0xD000_1234,
            cs: 0x08,
            status: Some(Status::PageNotPresent),
        });
        let text = report.to_string();
        assert!(text.starts_with("vector 0x0e (#PF page fault)"), "{text}");
        assert!(text.contains("0x0008:0xd0001234"), "{text}");
        assert!(text.contains("CR2 0xd0401000"), "{text}");
        assert!(text.contains("Non-present page; supervisor write access"), "{text}");
        assert!(text.ends_with(&Status::PageNotPresent.to_string()), "{text}");
    }

    #[test]
    fn other_exceptions_have_no_fault_address() {
        let report = FaultReport::from(FaultInfo {
            vector: Vector::new(13),
            error_code: 0x18,
            address: None,
            eip: 0xD000_0042,
            cs: 0x08,
            status: None,
        });
        let text = report.to_string();
        assert!(text.contains("#GP general protection"), "{text}");
        assert!(!text.contains("CR2"), "{text}");
        assert!(text.contains("error code 0x18"), "{text}");
    }
}
