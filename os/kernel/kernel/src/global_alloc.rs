//! # Kernel Global Allocator
//!
//! Forwards `alloc`/`dealloc` to the kernel heap once [`KernelMemory`] is up.
//! Before [`KernelAllocator::install`] every allocation fails with a null
//! pointer.

use crate::memory::KernelMemory;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use kernel_memory_addresses::VirtualAddress;
use kernel_status::{KResult, Status};
use kernel_sync::SyncOnceCell;
use kernel_vmem::PhysMapper;

pub struct KernelAllocator<M: PhysMapper + 'static> {
    memory: SyncOnceCell<&'static KernelMemory<'static, M>>,
}

impl<M: PhysMapper + 'static> Default for KernelAllocator<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: PhysMapper + 'static> KernelAllocator<M> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            memory: SyncOnceCell::new(),
        }
    }

    /// Route allocations to `memory`.
    ///
    /// # Errors
    /// [`Status::OperationNotAllowed`] if a heap was already installed.
    pub fn install(&self, memory: &'static KernelMemory<'static, M>) -> KResult<()> {
        self.memory.set(memory).map_err(|_| Status::OperationNotAllowed)
    }

    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.memory.is_initialized()
    }

    fn request(layout: Layout) -> Option<(u32, u32)> {
        let size = u32::try_from(layout.size()).ok()?;
        let align = u32::try_from(layout.align()).ok()?;
        Some((size.max(1), align))
    }

    fn address(ptr: *mut u8) -> Option<VirtualAddress> {
        u32::try_from(ptr.addr()).ok().map(VirtualAddress::new)
    }

    fn pointer(va: VirtualAddress) -> *mut u8 {
        ptr::with_exposed_provenance_mut(va.as_u32() as usize)
    }

    fn with_memory(
        &self,
        f: impl FnOnce(&KernelMemory<'static, M>) -> KResult<VirtualAddress>,
    ) -> *mut u8 {
        let Some(memory) = self.memory.get() else {
            return ptr::null_mut();
        };
        match f(memory) {
            Ok(va) => Self::pointer(va),
            Err(e) => {
                log::warn!("heap: allocation failed: {e}");
                ptr::null_mut()
            }
        }
    }
}

unsafe impl<M: PhysMapper + Sync + 'static> GlobalAlloc for KernelAllocator<M> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let Some((size, align)) = Self::request(layout) else {
            return ptr::null_mut();
        };
        self.with_memory(|m| m.allocate_aligned(size, align))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if ptr.is_null() {
            return;
        }
        let (Some(memory), Some(va)) = (self.memory.get(), Self::address(ptr)) else {
            return;
        };
        if let Err(e) = memory.free(va) {
            log::error!("heap: bad free of {va}: {e}");
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let Some((size, align)) = Self::request(layout) else {
            return ptr::null_mut();
        };
        self.with_memory(|m| m.allocate_zeroed(size, align))
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let (Some(va), Ok(new_size)) = (Self::address(ptr), u32::try_from(new_size)) else {
            return ptr::null_mut();
        };
        let Ok(align) = u32::try_from(layout.align()) else {
            return ptr::null_mut();
        };
        self.with_memory(|m| m.reallocate(va, new_size.max(1), align))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::KernelImage;
    use kernel_info::boot::{BIOS_MEMORY_USABLE, BiosMemoryMapEntry};
    use kernel_info::config::KernelConfig;
    use kernel_memory_addresses::PhysicalAddress;
    use kernel_vmem::test_support::TestPhys;

    const MIB: u32 = 1 << 20;

    fn leak_memory() -> &'static KernelMemory<'static, TestPhys> {
        let phys: &'static TestPhys = Box::leak(Box::new(TestPhys::with_frames(1024)));
        let map = [BiosMemoryMapEntry {
            base: u64::from(MIB),
            length: u64::from(3 * MIB),
            attributes: BIOS_MEMORY_USABLE,
        }];
        let image = KernelImage {
            start: PhysicalAddress::new(MIB),
            end: PhysicalAddress::new(MIB + 0x1_0000),
        };
        let config = KernelConfig {
            region_capacity: 16,
            dynamic_size: 0x0040_0000,
            dynamic_capacity: 8,
            heap_capacity: 16,
            ..KernelConfig::default()
        };
        Box::leak(Box::new(KernelMemory::bootstrap(phys, &map, image, &config).unwrap()))
    }

    #[test]
    fn null_until_installed() {
        let alloc = KernelAllocator::<TestPhys>::new();
        let layout = Layout::from_size_align(64, 8).unwrap();
        assert!(unsafe { alloc.alloc(layout) }.is_null());
        assert!(!alloc.is_installed());
    }

    #[test]
    fn allocations_come_from_the_kernel_heap() {
        let memory = leak_memory();
        let alloc = KernelAllocator::new();
        alloc.install(memory).unwrap();
        assert_eq!(alloc.install(memory), Err(Status::OperationNotAllowed));

        let layout = Layout::from_size_align(100, 64).unwrap();
        let p = unsafe { alloc.alloc(layout) };
        assert!(!p.is_null());
        assert_eq!(p.addr() % 64, 0);
        assert!(memory.heap_stats().used_bytes >= 100);

        let va = VirtualAddress::new(u32::try_from(p.addr()).unwrap());
        memory.write(va, b"kernel").unwrap();
        let q = unsafe { alloc.realloc(p, layout, 4096) };
        assert!(!q.is_null());
        let mut buf = [0u8; 6];
        memory
            .read(VirtualAddress::new(u32::try_from(q.addr()).unwrap()), &mut buf)
            .unwrap();
        assert_eq!(&buf, b"kernel");

        unsafe { alloc.dealloc(q, Layout::from_size_align(4096, 64).unwrap()) };
        assert_eq!(memory.heap_stats().used_bytes, 0);
    }

    #[test]
    fn zeroed_allocations_are_zero() {
        let memory = leak_memory();
        let alloc = KernelAllocator::new();
        alloc.install(memory).unwrap();
        let layout = Layout::from_size_align(32, 16).unwrap();

        let dirty = unsafe { alloc.alloc(layout) };
        let dirty_va = VirtualAddress::new(u32::try_from(dirty.addr()).unwrap());
        memory.fill(dirty_va, 32, 0xAA).unwrap();
        unsafe { alloc.dealloc(dirty, layout) };

        let clean = unsafe { alloc.alloc_zeroed(layout) };
        let mut buf = [0xFFu8; 32];
        memory
            .read(VirtualAddress::new(u32::try_from(clean.addr()).unwrap()), &mut buf)
            .unwrap();
        assert_eq!(buf, [0u8; 32]);
    }
}
