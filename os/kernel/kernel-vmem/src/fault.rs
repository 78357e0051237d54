//! # Page Fault Resolution Capability
//!
//! The exception dispatcher does not know about address spaces or frame
//! allocators. It holds a `&dyn FaultResolver` and forwards the faulting
//! address together with the decoded access kind.

use kernel_memory_addresses::VirtualAddress;
use kernel_status::KResult;

/// What the faulting instruction attempted.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct FaultAccess {
    /// The access was a write.
    pub write: bool,
    /// The access was made from user mode.
    pub user: bool,
    /// The access was an instruction fetch.
    pub instruction_fetch: bool,
}

impl FaultAccess {
    /// A supervisor read.
    #[must_use]
    pub const fn read() -> Self {
        Self {
            write: false,
            user: false,
            instruction_fetch: false,
        }
    }

    /// A supervisor write.
    #[must_use]
    pub const fn write() -> Self {
        Self {
            write: true,
            user: false,
            instruction_fetch: false,
        }
    }

    /// The same access, made from user mode.
    #[must_use]
    pub const fn from_user(self) -> Self {
        Self { user: true, ..self }
    }
}

/// Outcome of a successfully resolved fault.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultResolution {
    /// A frame was committed for a lazily reserved page.
    Committed,
    /// The page was already present and permits the access; only the stale
    /// TLB entry was dropped.
    Stale,
}

/// Resolves page faults on behalf of the exception dispatcher.
pub trait FaultResolver: Sync {
    /// Try to make `addr` accessible for `access`.
    ///
    /// # Errors
    /// - [`Status::PageNotPresent`](kernel_status::Status::PageNotPresent) if
    ///   the fault cannot be resolved (the dispatcher escalates it).
    /// - [`Status::OutOfResources`](kernel_status::Status::OutOfResources) if
    ///   no frame was available to commit.
    fn resolve_fault(&self, addr: VirtualAddress, access: FaultAccess) -> KResult<FaultResolution>;
}
