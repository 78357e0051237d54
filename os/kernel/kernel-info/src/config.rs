//! # Runtime Boot Configuration

use crate::memory::{DYNAMIC_BASE, DYNAMIC_SIZE};

/// Which interrupt controller the boot code should prefer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ControllerPreference {
    /// Use the APIC when the CPU reports one, the legacy PIC otherwise.
    Auto,
    /// Always use the legacy 8259 PIC pair.
    LegacyPic,
}

/// Tunables for bringing up the memory and interrupt core.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Maximum level forwarded to the log backend.
    pub log_level: log::LevelFilter,
    /// Capacity of the region tree of every address space.
    pub region_capacity: usize,
    /// Base of the dynamic kernel mapping window.
    pub dynamic_base: u32,
    /// Size of the dynamic kernel mapping window.
    pub dynamic_size: u32,
    /// Capacity of the dynamic mapper's bookkeeping trees.
    pub dynamic_capacity: usize,
    /// Capacity of the heap's block bookkeeping trees.
    pub heap_capacity: usize,
    /// Minimum number of bytes the heap grows by.
    pub heap_growth_granule: u32,
    /// Interrupt controller selection.
    pub controller: ControllerPreference,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            log_level: log::LevelFilter::Info,
            region_capacity: 256,
            dynamic_base: DYNAMIC_BASE,
            dynamic_size: DYNAMIC_SIZE,
            dynamic_capacity: 256,
            heap_capacity: 1024,
            heap_growth_granule: 64 * 1024,
            controller: ControllerPreference::Auto,
        }
    }
}
