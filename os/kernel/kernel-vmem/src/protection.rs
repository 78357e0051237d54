//! # Mapping Protection

use crate::PageEntryBits;
use crate::fault::FaultAccess;
use bitfield_struct::bitfield;

/// Access rights and caching policy of a mapping, independent of the
/// hardware entry layout.
///
/// ```rust
/// # use kernel_vmem::{FaultAccess, Protection};
/// let p = Protection::USER_RO;
/// assert!(p.permits(FaultAccess::read().from_user()));
/// assert!(!p.permits(FaultAccess::write()));
/// ```
#[bitfield(u8)]
#[derive(PartialEq, Eq, Hash)]
pub struct Protection {
    /// Writes are allowed.
    pub writable: bool,
    /// User mode (CPL 3) may access the mapping.
    pub user: bool,
    /// Caching disabled (MMIO).
    pub cache_disabled: bool,
    /// Write-through caching.
    pub write_through: bool,
    /// Global translation (kernel mappings only).
    pub global: bool,
    #[bits(3)]
    __: u8,
}

impl Protection {
    /// Supervisor read-only.
    pub const KERNEL_RO: Self = Self::new();
    /// Supervisor read-write.
    pub const KERNEL_RW: Self = Self::new().with_writable(true);
    /// User read-only.
    pub const USER_RO: Self = Self::new().with_user(true);
    /// User read-write.
    pub const USER_RW: Self = Self::new().with_user(true).with_writable(true);
    /// Supervisor read-write device memory, uncached.
    pub const MMIO: Self = Self::new()
        .with_writable(true)
        .with_cache_disabled(true)
        .with_write_through(true);

    /// The present leaf entry bits implementing this protection.
    #[must_use]
    pub const fn leaf_bits(self) -> PageEntryBits {
        PageEntryBits::new()
            .with_present(true)
            .with_writable(self.writable())
            .with_user_access(self.user())
            .with_cache_disabled(self.cache_disabled())
            .with_write_through(self.write_through())
            .with_global_translation(self.global())
    }

    /// Recover the protection from a leaf entry.
    #[must_use]
    pub const fn from_leaf(bits: PageEntryBits) -> Self {
        Self::new()
            .with_writable(bits.writable())
            .with_user(bits.user_access())
            .with_cache_disabled(bits.cache_disabled())
            .with_write_through(bits.write_through())
            .with_global(bits.global_translation())
    }

    /// Whether an access of the given kind is allowed.
    ///
    /// Supervisor writes honor the writable bit (`CR0.WP` is always set).
    #[must_use]
    pub const fn permits(self, access: FaultAccess) -> bool {
        if access.user && !self.user() {
            return false;
        }
        !access.write || self.writable()
    }
}
