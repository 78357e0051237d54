//! Interrupt flag control for bare-metal i686. Hosted builds run the same
//! code paths and treat interrupts as always masked.

/// `IF` (interrupt enable) bit of `EFLAGS`.
#[cfg(all(target_arch = "x86", target_os = "none"))]
const EFLAGS_IF: u32 = 1 << 9;

/// `cli`; ring 0 only.
#[inline]
pub fn cli_stop_interrupts() {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack, preserves_flags));
    }
}

/// `sti`; ring 0 only.
#[inline]
pub fn sti_enable_interrupts() {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
    }
}

#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        let flags: u32;
        unsafe { core::arch::asm!("pushfd; pop {}", out(reg) flags, options(preserves_flags)) }
        flags & EFLAGS_IF != 0
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    {
        false
    }
}

/// The interrupt flag as it was before [`save_and_disable`](Self::save_and_disable).
///
/// Dropping the state turns interrupts back on only if they were on when it
/// was taken, so nested states unwind to the outermost caller's setting.
#[must_use = "dropping the state restores interrupts immediately"]
#[derive(Debug)]
pub struct IrqState {
    enabled: bool,
}

impl IrqState {
    #[inline]
    pub fn save_and_disable() -> Self {
        let enabled = interrupts_enabled();
        if enabled {
            cli_stop_interrupts();
        }
        Self { enabled }
    }

    /// Whether dropping this state executes `sti`.
    #[inline]
    #[must_use]
    pub const fn restores_interrupts(&self) -> bool {
        self.enabled
    }
}

impl Drop for IrqState {
    fn drop(&mut self) {
        if self.enabled {
            sti_enable_interrupts();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosted_states_never_reenable() {
        let outer = IrqState::save_and_disable();
        let inner = IrqState::save_and_disable();
        assert!(!outer.restores_interrupts());
        assert!(!inner.restores_interrupts());
        assert!(!interrupts_enabled());
    }
}
