//! # Boot Sequence
//!
//! Bring-up order, driven by the entry point:
//!
//! 1. logger ([`kernel_qemu::init`])
//! 2. [`bootstrap_memory`]: PMA, kernel directory, dynamic window, heap
//! 3. load the kernel directory into CR3, then [`paging_control`]
//! 4. [`map_apic_registers`] when the CPU has an APIC
//! 5. [`bring_up_interrupts`]: controller selection and the IVT
//! 6. load the IDT and enable interrupts

use crate::cpu::PagingFeatures;
use crate::memory::{KernelImage, KernelMemory};
use kernel_info::boot::KernelEntryArgs;
use kernel_info::config::{ControllerPreference, KernelConfig};
use kernel_info::memory::PAGE_SIZE;
use kernel_interrupts::apic::{Apic, IOAPIC_DEFAULT_BASE, LAPIC_DEFAULT_BASE};
use kernel_interrupts::mmio::Mmio;
use kernel_interrupts::pic::Pic8259;
use kernel_interrupts::port::PortIo;
use kernel_interrupts::{ControllerKind, CpuCapabilities, InterruptController, InterruptHandler, Ivt, controller};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_registers::cr0::Cr0;
use kernel_registers::cr4::Cr4;
use kernel_status::KResult;
use kernel_vmem::PhysMapper;

/// The physical extent of the kernel image the boot stub loaded.
#[must_use]
pub const fn kernel_image(args: &KernelEntryArgs) -> KernelImage {
    KernelImage {
        start: PhysicalAddress::new(args.kernel_phys_start),
        end: PhysicalAddress::new(args.kernel_phys_end),
    }
}

/// Build the memory core from the boot stub's arguments.
///
/// # Safety
/// The memory map `args` points to must be readable through the boot page
/// directory.
///
/// # Errors
/// As [`KernelMemory::bootstrap`].
pub unsafe fn bootstrap_memory<'s, M: PhysMapper>(
    mapper: &'s M,
    args: &KernelEntryArgs,
    config: &KernelConfig,
) -> KResult<KernelMemory<'s, M>> {
    let map = unsafe { args.memory_map() };
    log::info!("boot: {} memory map entries", map.len());
    for e in map {
        log::debug!(
            "boot:   {:#011x}+{:#011x} attributes {:#x}",
            e.base,
            e.length,
            e.attributes
        );
    }
    KernelMemory::bootstrap(mapper, map, kernel_image(args), config)
}

/// Control register values for the kernel directory: supervisor writes honor
/// read-only pages, and large and global pages are on where the CPU has them.
/// Bits already set are kept.
#[must_use]
pub const fn paging_control(cr0: Cr0, cr4: Cr4, features: PagingFeatures) -> (Cr0, Cr4) {
    let cr0 = cr0.with_wp_write_protect(true);
    let cr4 = cr4
        .with_pse(cr4.pse() || features.pse)
        .with_pge(cr4.pge() || features.pge);
    (cr0, cr4)
}

/// Map the local APIC and the first I/O APIC uncached, returning their
/// virtual bases.
///
/// # Errors
/// As [`KernelMemory::map_mmio`].
pub fn map_apic_registers<M: PhysMapper>(
    memory: &KernelMemory<'_, M>,
) -> KResult<(VirtualAddress, VirtualAddress)> {
    let lapic = memory.map_mmio(PhysicalAddress::new(LAPIC_DEFAULT_BASE), PAGE_SIZE)?;
    match memory.map_mmio(PhysicalAddress::new(IOAPIC_DEFAULT_BASE), PAGE_SIZE) {
        Ok(ioapic) => Ok((lapic, ioapic)),
        Err(e) => {
            if let Err(undo) = memory.unmap_any(lapic, PAGE_SIZE) {
                log::warn!("boot: cannot unmap the local APIC at {lapic}: {undo}");
            }
            Err(e)
        }
    }
}

/// Whether the APIC should be brought up at all.
#[must_use]
pub fn wants_apic(caps: CpuCapabilities, preference: ControllerPreference) -> bool {
    caps.apic && preference == ControllerPreference::Auto
}

/// Initialize the PIC, pick the controller and set up the IVT.
///
/// The PIC is always remapped and masked so a stray legacy interrupt cannot
/// land on an exception vector, even when the APIC is used.
///
/// # Errors
/// Errors of [`Ivt::select_controller`] and [`Ivt::init`].
pub fn bring_up_interrupts<'h, P: PortIo, R: Mmio>(
    ivt: &Ivt<'h>,
    dispatcher: &'h dyn InterruptHandler,
    pic: &'h Pic8259<P>,
    apic: Option<&'h Apic<R>>,
    caps: CpuCapabilities,
    preference: ControllerPreference,
) -> KResult<ControllerKind> {
    pic.init();
    let selected = controller::choose(
        caps,
        preference,
        pic,
        apic.map(|a| a as &dyn InterruptController),
    );
    if let Some(apic) = apic
        && selected.kind() == ControllerKind::Apic
    {
        apic.init();
    }
    ivt.select_controller(selected)?;
    ivt.init(dispatcher)?;
    log::info!("boot: interrupts routed through {:?}", selected.kind());
    Ok(selected.kind())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::{BIOS_MEMORY_USABLE, BiosMemoryMapEntry};
    use kernel_interrupts::port::X86Ports;
    use kernel_interrupts::vector::VectorClass;
    use kernel_interrupts::{ExceptionDispatcher, Vector};
    use kernel_status::Status;
    use kernel_vmem::test_support::TestPhys;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const MIB: u32 = 1 << 20;

    /// Register file answering the I/O APIC version register with 24 pins.
    #[derive(Default)]
    struct FakeMmio {
        regs: Mutex<HashMap<u32, u32>>,
    }

    impl Mmio for FakeMmio {
        fn read32(&self, offset: u32) -> u32 {
            let regs = self.regs.lock().unwrap();
            if offset == 0x10 && regs.get(&0) == Some(&1) {
                return 23 << 16;
            }
            regs.get(&offset).copied().unwrap_or(0)
        }

        fn write32(&self, offset: u32, value: u32) {
            self.regs.lock().unwrap().insert(offset, value);
        }
    }

    fn args(map: &[BiosMemoryMapEntry]) -> KernelEntryArgs {
        KernelEntryArgs {
            memory_map: map.as_ptr(),
            memory_map_len: u32::try_from(map.len()).unwrap(),
            kernel_phys_start: MIB,
            kernel_phys_end: MIB + 0x2_0000,
            boot_page_directory: 0x9000,
            has_apic: 1,
        }
    }

    fn small_config() -> KernelConfig {
        KernelConfig {
            region_capacity: 16,
            dynamic_size: 0x0040_0000,
            dynamic_capacity: 8,
            heap_capacity: 8,
            ..KernelConfig::default()
        }
    }

    #[test]
    fn memory_comes_up_from_entry_args() {
        let phys = TestPhys::with_frames(1024);
        let map = [
            BiosMemoryMapEntry {
                base: 0,
                length: 0x9_F000,
                attributes: BIOS_MEMORY_USABLE,
            },
            BiosMemoryMapEntry {
                base: u64::from(MIB),
                length: u64::from(3 * MIB),
                attributes: BIOS_MEMORY_USABLE,
            },
        ];
        let memory = unsafe { bootstrap_memory(&phys, &args(&map), &small_config()) }.unwrap();
        let image = memory.translate(VirtualAddress::new(kernel_info::memory::KERNEL_BASE + 0x1_0000));
        assert_eq!(image, Some(PhysicalAddress::new(MIB + 0x1_0000)));

        let (lapic, ioapic) = map_apic_registers(&memory).unwrap();
        assert_eq!(memory.translate(lapic), Some(PhysicalAddress::new(LAPIC_DEFAULT_BASE)));
        assert_eq!(memory.translate(ioapic), Some(PhysicalAddress::new(IOAPIC_DEFAULT_BASE)));
    }

    #[test]
    fn paging_control_adds_supported_features() {
        let cr0 = Cr0::new().with_pe_protection_enable(true).with_pg_paging(true);
        let (cr0, cr4) = paging_control(cr0, Cr4::new(), PagingFeatures { pse: true, pge: false });
        assert!(cr0.wp_write_protect());
        assert!(cr0.pg_paging());
        assert!(cr4.pse());
        assert!(!cr4.pge());

        let (_, cr4) = paging_control(cr0, Cr4::new().with_pge(true), PagingFeatures::default());
        assert!(cr4.pge());
        assert!(!cr4.pse());
    }

    #[test]
    fn empty_memory_map_is_rejected() {
        let phys = TestPhys::with_frames(16);
        let result = unsafe { bootstrap_memory(&phys, &args(&[]), &small_config()) };
        assert_eq!(result.err(), Some(Status::OutOfResources));
    }

    struct NoFaults;

    impl kernel_vmem::FaultResolver for NoFaults {
        fn resolve_fault(
            &self,
            _: VirtualAddress,
            _: kernel_vmem::FaultAccess,
        ) -> KResult<kernel_vmem::FaultResolution> {
            Err(Status::PageNotPresent)
        }
    }

    #[test]
    fn apic_is_preferred_when_present() {
        let dispatcher = ExceptionDispatcher::new(&NoFaults);
        let pic = Pic8259::new(unsafe { X86Ports::new() });
        let apic = Apic::new(FakeMmio::default(), FakeMmio::default());
        let ivt = Ivt::new();
        let kind = bring_up_interrupts(
            &ivt,
            &dispatcher,
            &pic,
            Some(&apic),
            CpuCapabilities { apic: true },
            ControllerPreference::Auto,
        )
        .unwrap();
        assert_eq!(kind, ControllerKind::Apic);
        assert!(ivt.is_installed(Vector::PAGE_FAULT));
        assert_eq!(ivt.class_of(Vector::new(0xFF)), Some(VectorClass::System));
    }

    #[test]
    fn legacy_preference_keeps_the_pic() {
        let dispatcher = ExceptionDispatcher::new(&NoFaults);
        let pic = Pic8259::new(unsafe { X86Ports::new() });
        let apic = Apic::new(FakeMmio::default(), FakeMmio::default());
        let ivt = Ivt::new();
        let caps = CpuCapabilities { apic: true };
        assert!(!wants_apic(caps, ControllerPreference::LegacyPic));
        let kind = bring_up_interrupts(
            &ivt,
            &dispatcher,
            &pic,
            Some(&apic),
            caps,
            ControllerPreference::LegacyPic,
        )
        .unwrap();
        assert_eq!(kind, ControllerKind::Pic);
        assert_eq!(ivt.class_of(Vector::new(0x21)), Some(VectorClass::Irq));

        let again = bring_up_interrupts(
            &ivt,
            &dispatcher,
            &pic,
            None::<&Apic<FakeMmio>>,
            caps,
            ControllerPreference::Auto,
        );
        assert_eq!(again, Err(Status::OperationNotAllowed));
    }
}
