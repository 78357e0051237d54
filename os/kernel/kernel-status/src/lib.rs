//! # Kernel Status Codes
//!
//! The fixed set of status codes exchanged across the memory-management and
//! interrupt boundaries. Successful calls return `Ok(..)` (numeric code `0`);
//! every failure is one [`Status`] variant.
//!
//! Codes are grouped by subsystem:
//!
//! | Range | Subsystem |
//! |-------|-----------|
//! | `0x0100..` | Common errors |
//! | `0x1000..` | Interrupt subsystem |
//! | `0x2000..` | Memory management |
//! | `0x3000..` | Process execution |
//!
//! ```rust
//! # use kernel_status::{KResult, Status, status_code};
//! fn check(aligned: bool) -> KResult<()> {
//!     if aligned { Ok(()) } else { Err(Status::BadAlignment) }
//! }
//! assert_eq!(status_code(&check(true)), 0);
//! assert_eq!(status_code(&check(false)), 0x107);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

/// Result type used by every fallible kernel-core operation.
pub type KResult<T> = Result<T, Status>;

/// Numeric code for a successful operation.
pub const OK: u32 = 0;

/// Kernel status codes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, thiserror::Error)]
#[repr(u32)]
pub enum Status {
    #[error("null pointer given")]
    NullPointerGiven = 0x100,
    #[error("out of resources")]
    OutOfResources = 0x102,
    #[error("bad parameter")]
    BadParameter = 0x105,
    #[error("operation not allowed")]
    OperationNotAllowed = 0x106,
    #[error("bad alignment")]
    BadAlignment = 0x107,

    #[error("bad interrupt vector")]
    BadInterruptVector = 0x1000,
    #[error("no interrupt controller configured")]
    ItNoControllerConfigured = 0x1002,
    #[error("interrupt already registered")]
    InterruptAlreadyRegistered = 0x1003,
    #[error("interrupt not registered")]
    InterruptNotRegistered = 0x1004,
    #[error("no free interrupt vectors")]
    NoFreeInterruptVectors = 0x1005,

    #[error("page not present")]
    PageNotPresent = 0x2001,
    #[error("memory already mapped")]
    MemoryAlreadyMapped = 0x2002,
    #[error("too many entries")]
    MmTooManyEntries = 0x2003,
    #[error("dynamic memory initialization failure")]
    MmDynamicMemoryInitFailure = 0x2005,
    #[error("memory already unmapped")]
    MemoryAlreadyUnmapped = 0x2007,
    #[error("heap allocation failure")]
    MmHeapAllocationFailure = 0x2008,
    #[error("dynamic memory allocation failure")]
    MmDynamicMemoryAllocationFailure = 0x2009,

    #[error("process page directory creation failure")]
    ExecProcessPageDirectoryCreationFailure = 0x300B,
}

impl Status {
    /// The numeric status code.
    #[inline]
    #[must_use]
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Whether the status reports exhaustion of some resource, i.e. the
    /// caller may retry later.
    #[must_use]
    pub const fn is_exhaustion(self) -> bool {
        matches!(
            self,
            Self::OutOfResources
                | Self::MmHeapAllocationFailure
                | Self::MmDynamicMemoryAllocationFailure
                | Self::MmTooManyEntries
                | Self::NoFreeInterruptVectors
        )
    }
}

impl From<Status> for u32 {
    #[inline]
    fn from(value: Status) -> Self {
        value.code()
    }
}

/// Numeric code of a result; [`OK`] for `Ok(..)`.
#[inline]
#[must_use]
pub const fn status_code<T>(result: &KResult<T>) -> u32 {
    match result {
        Ok(_) => OK,
        Err(status) => status.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_subsystem_blocks() {
        assert_eq!(Status::NullPointerGiven.code(), 0x100);
        assert_eq!(Status::BadAlignment.code(), 0x107);
        assert_eq!(Status::BadInterruptVector.code(), 0x1000);
        assert_eq!(Status::NoFreeInterruptVectors.code(), 0x1005);
        assert_eq!(Status::PageNotPresent.code(), 0x2001);
        assert_eq!(Status::MemoryAlreadyUnmapped.code(), 0x2007);
        assert_eq!(Status::ExecProcessPageDirectoryCreationFailure.code(), 0x300B);
    }

    #[test]
    fn display_is_human_readable() {
        assert_eq!(
            Status::MemoryAlreadyMapped.to_string(),
            "memory already mapped"
        );
    }

    #[test]
    fn ok_maps_to_zero() {
        let ok: KResult<u8> = Ok(1);
        let err: KResult<u8> = Err(Status::OutOfResources);
        assert_eq!(status_code(&ok), OK);
        assert_eq!(status_code(&err), 0x102);
        assert!(Status::OutOfResources.is_exhaustion());
        assert!(!Status::BadAlignment.is_exhaustion());
    }
}
