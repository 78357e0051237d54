//! # Kernel Entry Point
//!
//! The boot stub enables paging with a directory that maps the image at
//! `KERNEL_BASE` and low memory through the direct map, then calls
//! [`_start_kernel`] with a pointer to [`KernelEntryArgs`].

#![cfg_attr(all(target_arch = "x86", target_os = "none"), no_std, no_main)]
#![allow(unsafe_code)]

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod entry {
    use core::arch::naked_asm;
    use kernel::fatal;
    use kernel::global_alloc::KernelAllocator;
    use kernel::memory::KernelMemory;
    use kernel::trap::{self, LogUserFaults};
    use kernel::{boot, cpu};
    use kernel_alloc::phys_mapper::DirectMapper;
    use kernel_info::boot::KernelEntryArgs;
    use kernel_info::config::KernelConfig;
    use kernel_interrupts::apic::Apic;
    use kernel_interrupts::idt::Idt;
    use kernel_interrupts::mmio::VolatileMmio;
    use kernel_interrupts::pic::Pic8259;
    use kernel_interrupts::port::X86Ports;
    use kernel_interrupts::{ExceptionDispatcher, InterruptContext, Ivt, stubs};
    use kernel_qemu::qemu_trace;
    use kernel_registers::cr0::Cr0;
    use kernel_registers::cr4::Cr4;
    use kernel_registers::ControlRegister;
    use kernel_status::{KResult, Status};
    use kernel_sync::SyncOnceCell;
    use kernel_sync::irq::sti_enable_interrupts;

    const BOOT_STACK_SIZE: usize = 64 * 1024;

    #[repr(align(16))]
    struct Aligned<const N: usize>([u8; N]);

    #[unsafe(link_section = ".bss.boot")]
    static mut BOOT_STACK: Aligned<BOOT_STACK_SIZE> = Aligned([0; BOOT_STACK_SIZE]);

    static MAPPER: DirectMapper = DirectMapper;
    static MEMORY: SyncOnceCell<KernelMemory<'static, DirectMapper>> = SyncOnceCell::new();
    static DISPATCHER: SyncOnceCell<ExceptionDispatcher<'static>> = SyncOnceCell::new();
    static IVT: Ivt<'static> = Ivt::new();
    static PIC: Pic8259<X86Ports> = Pic8259::new(unsafe { X86Ports::new() });
    static APIC: SyncOnceCell<Apic<VolatileMmio>> = SyncOnceCell::new();
    static IDT: SyncOnceCell<Idt> = SyncOnceCell::new();

    #[global_allocator]
    static ALLOCATOR: KernelAllocator<DirectMapper> = KernelAllocator::new();

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        log::error!("panic: {info}");
        fatal::halt()
    }

    /// The kernel entry point.
    ///
    /// # ABI
    /// `cdecl`: the argument pointer sits above the return address. The boot
    /// stack is replaced before any Rust code runs, so this must be naked.
    #[unsafe(no_mangle)]
    #[unsafe(naked)]
    #[unsafe(link_section = ".text._start_kernel")]
    pub unsafe extern "C" fn _start_kernel(_args: *const KernelEntryArgs) -> ! {
        naked_asm!(
            "cli",
            "mov eax, [esp + 4]",
            "lea esp, [{stack} + {size}]",
            "and esp, -16",
            // keep esp 16-byte aligned at the call
            "sub esp, 12",
            "push eax",
            "xor ebp, ebp",
            "call {entry}",
            "2:",
            "hlt",
            "jmp 2b",
            stack = sym BOOT_STACK,
            size = const BOOT_STACK_SIZE,
            entry = sym kernel_entry,
        );
    }

    extern "C" fn kernel_entry(args: *const KernelEntryArgs) -> ! {
        #[cfg(feature = "qemu")]
        qemu_trace!("kernel: entered, args at {args:p}\n");

        let config = KernelConfig::default();
        if kernel_qemu::init(config.log_level).is_err() {
            qemu_trace!("kernel: logger already set\n");
        }
        let Some(args) = (unsafe { args.as_ref() }) else {
            log::error!("boot: no entry arguments");
            fatal::halt()
        };
        if let Err(e) = kernel_main(args, &config) {
            log::error!("boot: bring-up failed: {e}");
            fatal::halt();
        }
        log::info!("boot: idle");
        loop {
            unsafe { core::arch::asm!("hlt", options(nomem, nostack)) };
        }
    }

    fn kernel_main(args: &KernelEntryArgs, config: &KernelConfig) -> KResult<()> {
        let memory = unsafe { boot::bootstrap_memory(&MAPPER, args, config) }?;
        MEMORY.set(memory).map_err(|_| Status::OperationNotAllowed)?;
        let memory = MEMORY.get().ok_or(Status::OperationNotAllowed)?;
        unsafe { memory.activate() };
        unsafe {
            let (cr0, cr4) = boot::paging_control(Cr0::read(), Cr4::read(), cpu::detect_paging());
            cr4.write();
            cr0.write();
        }
        ALLOCATOR.install(memory)?;

        let caps = cpu::detect();
        if caps.apic != (args.has_apic != 0) {
            log::warn!("boot: boot stub and CPUID disagree about the APIC");
        }
        let apic = if boot::wants_apic(caps, config.controller) {
            match boot::map_apic_registers(memory) {
                Ok((lapic, ioapic)) => {
                    let apic = unsafe { Apic::new(VolatileMmio::new(lapic), VolatileMmio::new(ioapic)) };
                    APIC.set(apic).map_err(|_| Status::OperationNotAllowed)?;
                    APIC.get()
                }
                Err(e) => {
                    log::warn!("boot: cannot map the APIC ({e}), using the PIC");
                    None
                }
            }
        } else {
            None
        };

        let dispatcher = DISPATCHER.get_or_init(|| ExceptionDispatcher::new(memory));
        boot::bring_up_interrupts(&IVT, dispatcher, &PIC, apic, caps, config.controller)?;

        let idt = IDT.get_or_init(|| {
            let mut idt = Idt::new();
            idt.populate(stubs::stub_address);
            idt
        });
        unsafe { idt.load() };
        sti_enable_interrupts();

        let stats = memory.heap_stats();
        log::info!(
            "boot: interrupts on, heap holds {} bytes in {} blocks of {} grown",
            stats.used_bytes,
            stats.used_blocks,
            stats.total_bytes
        );
        Ok(())
    }

    /// Called by the common interrupt stub with the saved register frame.
    #[unsafe(no_mangle)]
    extern "C" fn kernel_trap(ctx: *mut InterruptContext) {
        let Some(ctx) = (unsafe { ctx.as_mut() }) else {
            return;
        };
        if let Err(report) = trap::route(&IVT, &LogUserFaults, ctx) {
            fatal::fatal(report);
        }
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
fn main() {}
