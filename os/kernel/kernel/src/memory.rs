//! # Kernel Memory Singleton
//!
//! Owns the frame allocator, the kernel address space, the dynamic mapper and
//! the heap behind one interrupt-safe spin lock, and wires them together:
//!
//! ```text
//!             KernelMemory (SpinMutex, lock_irq)
//!   ┌───────────────┬────────────────┬──────────────┬──────────┐
//!   │ PMA           │ kernel space   │ DynamicMapper│ Heap     │
//!   │ (buddy, PFN)  │ (PD + regions) │ (window)     │ (blocks) │
//!   └──────▲────────┴───────▲────────┴──────▲───────┴────┬─────┘
//!          └────────────────┴───────────────┴── growth ──┘
//! ```
//!
//! Every bookkeeping array is carved out of physical frames at boot and
//! reached through the [`PhysMapper`], so nothing here needs a heap.

use crate::process::{self, ProcessTable};
use kernel_alloc::avl::Slot;
use kernel_alloc::dynmap::DynamicMapper;
use kernel_alloc::free_list::FreeList;
use kernel_alloc::heap::{Heap, HeapGrowth, HeapStats, MIN_BLOCK};
use kernel_alloc::pma::{FrameInfo, PhysicalMemoryAllocator, PmaStats};
use kernel_alloc::slab::SlabCache;
use kernel_alloc::vmm::{AddressSpaceState, Vmm};
use kernel_info::boot::BiosMemoryMapEntry;
use kernel_info::config::KernelConfig;
use kernel_info::memory::{DIRECT_MAP_BASE, DIRECT_MAP_SIZE, KERNEL_BASE, PAGE_SIZE, USER_END};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_status::{KResult, Status};
use kernel_sync::SpinMutex;
use kernel_vmem::{
    AddressSpace, FaultAccess, FaultResolution, FaultResolver, PhysMapper, Protection, align_down,
    align_up,
};

/// Memory below 1 MiB stays with the firmware and the boot stub.
const LOW_MEMORY_END: u32 = 0x0010_0000;

/// Physical range of the loaded kernel image, `[start, end)`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KernelImage {
    pub start: PhysicalAddress,
    pub end: PhysicalAddress,
}

impl KernelImage {
    /// Page-rounded length of the image.
    #[must_use]
    pub fn len(&self) -> u32 {
        let end = align_up(self.end.as_u32(), PAGE_SIZE).unwrap_or(u32::MAX & !(PAGE_SIZE - 1));
        end.saturating_sub(align_down(self.start.as_u32(), PAGE_SIZE))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Usable RAM below 4 GiB as `(base, len)`.
fn usable_ranges(map: &[BiosMemoryMapEntry]) -> impl Iterator<Item = (u32, u32)> + '_ {
    map.iter()
        .filter(|e| e.is_usable())
        .filter_map(BiosMemoryMapEntry::clamp_32bit)
}

/// End of the physical memory the allocator manages: the highest usable
/// byte reported by the firmware, capped to the direct map.
#[must_use]
pub fn managed_top(map: &[BiosMemoryMapEntry]) -> u32 {
    let top = usable_ranges(map)
        .map(|(base, len)| u64::from(base) + u64::from(len))
        .max()
        .unwrap_or(0)
        .min(u64::from(DIRECT_MAP_SIZE));
    #[allow(clippy::cast_possible_truncation)]
    let top = top as u32;
    align_down(top, PAGE_SIZE)
}

/// Lowest page-aligned physical range of `len` bytes that lies in usable
/// memory above 1 MiB, below `top`, and outside of `avoid`.
#[must_use]
pub fn find_boot_area(
    map: &[BiosMemoryMapEntry],
    top: u32,
    len: u32,
    avoid: KernelImage,
) -> Option<PhysicalAddress> {
    let avoid_start = align_down(avoid.start.as_u32(), PAGE_SIZE);
    let avoid_end = avoid_start + avoid.len();
    usable_ranges(map)
        .filter_map(|(base, size)| {
            let start = align_up(base.max(LOW_MEMORY_END), PAGE_SIZE)?;
            let end = align_down(base.saturating_add(size).min(top), PAGE_SIZE);
            // Skip past the image if the candidate would overlap it.
            let start = if start < avoid_end && start.saturating_add(len) > avoid_start {
                avoid_end
            } else {
                start
            };
            (start.checked_add(len)? <= end).then_some(start)
        })
        .min()
        .map(PhysicalAddress::new)
}

/// The components guarded by the [`KernelMemory`] lock.
pub struct MemoryState<'s> {
    pub pma: PhysicalMemoryAllocator<'s>,
    pub space: AddressSpaceState<'s>,
    pub dynamic: DynamicMapper<'s>,
    pub heap: Heap<'s>,
    pub processes: ProcessTable<'s>,
}

/// Heap growth through anonymous mappings of the dynamic window.
pub struct DynamicGrowth<'a, 's, M: PhysMapper> {
    pub vmm: &'a Vmm<'s, M>,
    pub space: &'a mut AddressSpaceState<'s>,
    pub dynamic: &'a mut DynamicMapper<'s>,
    pub pma: &'a mut PhysicalMemoryAllocator<'s>,
}

impl<M: PhysMapper> HeapGrowth for DynamicGrowth<'_, '_, M> {
    fn grow(&mut self, min_len: u32) -> KResult<(VirtualAddress, u32)> {
        let len = align_up(min_len, PAGE_SIZE).ok_or(Status::BadParameter)?;
        let va = self
            .dynamic
            .map_any_anonymous(self.vmm, self.space, self.pma, len, Protection::KERNEL_RW)?;
        Ok((va, len))
    }
}

pub struct KernelMemory<'s, M: PhysMapper> {
    mapper: &'s M,
    state: SpinMutex<MemoryState<'s>>,
}

impl<'s, M: PhysMapper> KernelMemory<'s, M> {
    /// Bring up the memory core from the firmware memory map.
    ///
    /// 1. The PFN database is placed in the first usable range above 1 MiB
    ///    that does not overlap the kernel image.
    /// 2. Usable RAM is released to the allocator; low memory, the image and
    ///    the database are withdrawn again.
    /// 3. The tree arenas are carved from allocator frames.
    /// 4. A fresh kernel directory maps the direct map and the image, and
    ///    gets page tables for the whole dynamic window so that process
    ///    directories created later see every dynamic mapping.
    ///
    /// The new directory is not activated; see [`activate`](Self::activate).
    ///
    /// # Errors
    /// - [`Status::OutOfResources`] if there is no usable memory or no room
    ///   for the bookkeeping.
    /// - [`Status::MmDynamicMemoryInitFailure`] for an invalid dynamic window.
    /// - Errors of the VMM while building the kernel directory.
    pub fn bootstrap(
        mapper: &'s M,
        map: &[BiosMemoryMapEntry],
        image: KernelImage,
        config: &KernelConfig,
    ) -> KResult<Self> {
        let top = managed_top(map);
        let frame_count = top / PAGE_SIZE;
        if frame_count == 0 {
            log::error!("memory: firmware reports no usable memory");
            return Err(Status::OutOfResources);
        }
        let db_bytes = u32::try_from(size_of::<FrameInfo>())
            .ok()
            .and_then(|s| s.checked_mul(frame_count))
            .and_then(|b| align_up(b, PAGE_SIZE))
            .ok_or(Status::OutOfResources)?;
        let db_pa = find_boot_area(map, top, db_bytes, image).ok_or_else(|| {
            log::error!("memory: no room for a {db_bytes:#x} byte frame database");
            Status::OutOfResources
        })?;

        let db = unsafe { frame_database(mapper, db_pa, frame_count as usize) };
        let mut pma = PhysicalMemoryAllocator::new(db, PhysicalAddress::new(0))?;
        for (base, len) in usable_ranges(map) {
            pma.release_region(PhysicalAddress::new(base), len);
        }
        pma.reserve_region(PhysicalAddress::new(0), LOW_MEMORY_END);
        let image_start = PhysicalAddress::new(align_down(image.start.as_u32(), PAGE_SIZE));
        pma.reserve_region(image_start, image.len());
        pma.reserve_region(db_pa, db_bytes);
        log::info!(
            "memory: {} of {} frames free below {:#x}",
            pma.free_frames(),
            pma.total_frames(),
            top
        );

        let regions = carve_slots(mapper, &mut pma, config.region_capacity)?;
        let dyn_by_addr = carve_slots(mapper, &mut pma, config.dynamic_capacity + 1)?;
        let dyn_by_size = carve_slots(mapper, &mut pma, config.dynamic_capacity + 1)?;
        let dyn_live = carve_slots(mapper, &mut pma, config.dynamic_capacity)?;
        let heap_by_addr = carve_slots(mapper, &mut pma, config.heap_capacity + 1)?;
        let heap_by_size = carve_slots(mapper, &mut pma, config.heap_capacity + 1)?;
        let heap_used = carve_slots(mapper, &mut pma, config.heap_capacity)?;

        let vmm = Vmm::new(mapper);
        let mut space = vmm.create_kernel_space(&mut pma, regions)?;
        vmm.map(
            &mut space,
            &mut pma,
            VirtualAddress::new(DIRECT_MAP_BASE),
            PhysicalAddress::new(0),
            top,
            Protection::KERNEL_RW,
        )?;
        if !image.is_empty() {
            vmm.map(
                &mut space,
                &mut pma,
                VirtualAddress::new(KERNEL_BASE),
                image_start,
                image.len(),
                Protection::KERNEL_RW,
            )?;
        }
        let window = VirtualAddress::new(config.dynamic_base);
        vmm.prepare_tables(&space, &mut pma, window, config.dynamic_size)?;

        let dynamic = DynamicMapper::new(
            window,
            config.dynamic_size,
            FreeList::new(dyn_by_addr, dyn_by_size),
            dyn_live,
        )?;
        let heap = Heap::new(
            FreeList::new(heap_by_addr, heap_by_size),
            heap_used,
            config.heap_growth_granule,
        );
        log::info!(
            "memory: kernel directory at {}, {} frames left",
            space.root().base(),
            pma.free_frames()
        );

        Ok(Self {
            mapper,
            state: SpinMutex::new(MemoryState {
                pma,
                space,
                dynamic,
                heap,
                processes: ProcessTable::new(),
            }),
        })
    }

    #[inline]
    #[must_use]
    pub const fn vmm(&self) -> Vmm<'s, M> {
        Vmm::new(self.mapper)
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &'s M {
        self.mapper
    }

    /// Load the kernel directory into CR3.
    ///
    /// # Safety
    /// The directory must map the running code, its stack and every
    /// structure reachable from here.
    pub unsafe fn activate(&self) {
        let root = self.state.lock_irq().space.root();
        unsafe { AddressSpace::from_root(self.mapper, root).activate() };
    }

    /// Run `f` with the VMM and the locked state.
    pub fn with_state<R>(&self, f: impl FnOnce(&Vmm<'s, M>, &mut MemoryState<'s>) -> R) -> R {
        let vmm = self.vmm();
        self.state.with_lock(|state| f(&vmm, state))
    }

    /// See [`DynamicMapper::map_any`].
    ///
    /// # Errors
    /// As [`DynamicMapper::map_any`].
    pub fn map_any(&self, pa: PhysicalAddress, len: u32, protection: Protection) -> KResult<VirtualAddress> {
        self.with_state(|vmm, s| s.dynamic.map_any(vmm, &mut s.space, &mut s.pma, pa, len, protection))
    }

    /// See [`DynamicMapper::map_mmio`].
    ///
    /// # Errors
    /// As [`DynamicMapper::map_mmio`].
    pub fn map_mmio(&self, pa: PhysicalAddress, len: u32) -> KResult<VirtualAddress> {
        self.with_state(|vmm, s| s.dynamic.map_mmio(vmm, &mut s.space, &mut s.pma, pa, len))
    }

    /// See [`DynamicMapper::unmap_any`].
    ///
    /// # Errors
    /// As [`DynamicMapper::unmap_any`].
    pub fn unmap_any(&self, va: VirtualAddress, len: u32) -> KResult<()> {
        self.with_state(|vmm, s| s.dynamic.unmap_any(vmm, &mut s.space, &mut s.pma, va, len))
    }

    /// Physical address behind a kernel virtual address.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.with_state(|vmm, s| vmm.translate(&s.space, va))
    }

    /// # Errors
    /// As [`Heap::allocate_aligned`].
    pub fn allocate(&self, size: u32) -> KResult<VirtualAddress> {
        self.allocate_aligned(size, MIN_BLOCK)
    }

    /// Heap allocation that grows through the dynamic mapper on a miss.
    ///
    /// # Errors
    /// As [`Heap::allocate_aligned`].
    pub fn allocate_aligned(&self, size: u32, align: u32) -> KResult<VirtualAddress> {
        self.with_heap(|heap, growth| heap.allocate_aligned(size, align, growth))
    }

    /// Run `f` with the heap and a growth source over the dynamic window.
    fn with_heap<R>(&self, f: impl FnOnce(&mut Heap<'s>, &mut DynamicGrowth<'_, 's, M>) -> R) -> R {
        self.with_state(|vmm, s| {
            let MemoryState {
                pma,
                space,
                dynamic,
                heap,
                ..
            } = s;
            let mut growth = DynamicGrowth {
                vmm,
                space,
                dynamic,
                pma,
            };
            f(heap, &mut growth)
        })
    }

    /// Take a chunk from `cache`; a new slab comes from the heap.
    ///
    /// # Errors
    /// As [`SlabCache::allocate`].
    pub fn slab_allocate(&self, cache: &mut SlabCache<'_>) -> KResult<VirtualAddress> {
        self.with_heap(|heap, growth| cache.allocate(heap, growth))
    }

    /// Hand the empty slabs of `cache` back to the heap.
    ///
    /// # Errors
    /// As [`SlabCache::shrink`].
    pub fn slab_shrink(&self, cache: &mut SlabCache<'_>) -> KResult<usize> {
        self.with_state(|_, s| cache.shrink(&mut s.heap))
    }

    /// Hand every slab of `cache` back to the heap.
    ///
    /// # Errors
    /// As [`SlabCache::destroy`].
    pub fn slab_destroy(&self, cache: &mut SlabCache<'_>) -> KResult<()> {
        self.with_state(|_, s| cache.destroy(&mut s.heap))
    }

    /// [`allocate_aligned`](Self::allocate_aligned) with the payload zeroed.
    ///
    /// # Errors
    /// As [`Heap::allocate_aligned`]; [`Status::PageNotPresent`] if a heap
    /// page is not mapped.
    pub fn allocate_zeroed(&self, size: u32, align: u32) -> KResult<VirtualAddress> {
        let va = self.allocate_aligned(size, align)?;
        if let Err(e) = self.fill(va, size, 0) {
            if let Err(free) = self.free(va) {
                log::warn!("memory: cannot return {va} after a failed fill: {free}");
            }
            return Err(e);
        }
        Ok(va)
    }

    /// Resize the allocation at `ptr`, moving it if it does not fit in place.
    ///
    /// A null `ptr` allocates. On failure the old allocation is untouched.
    ///
    /// # Errors
    /// - [`Status::BadParameter`] if `ptr` is not a live allocation or
    ///   `new_size` is zero.
    /// - As [`allocate_aligned`](Self::allocate_aligned).
    pub fn reallocate(&self, ptr: VirtualAddress, new_size: u32, align: u32) -> KResult<VirtualAddress> {
        if ptr.is_null() {
            return self.allocate_aligned(new_size, align);
        }
        if new_size == 0 {
            return Err(Status::BadParameter);
        }
        let old_size = self
            .with_state(|_, s| s.heap.allocation_size(ptr))
            .ok_or(Status::BadParameter)?;
        if new_size <= old_size && ptr.as_u32().is_multiple_of(align.max(1)) {
            return Ok(ptr);
        }
        let new = self.allocate_aligned(new_size, align)?;
        if let Err(e) = self.copy(ptr, new, old_size.min(new_size)) {
            if let Err(free) = self.free(new) {
                log::warn!("memory: cannot return {new} after a failed copy: {free}");
            }
            return Err(e);
        }
        self.free(ptr)?;
        Ok(new)
    }

    /// # Errors
    /// As [`Heap::free`].
    pub fn free(&self, ptr: VirtualAddress) -> KResult<()> {
        self.with_state(|_, s| s.heap.free(ptr))
    }

    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        self.with_state(|_, s| s.heap.stats())
    }

    #[must_use]
    pub fn pma_stats(&self) -> PmaStats {
        self.with_state(|_, s| s.pma.stats())
    }

    /// Set `len` bytes at `va` to `value`.
    ///
    /// Kernel memory is written through the [`PhysMapper`], so this does not
    /// depend on which directory is active.
    ///
    /// # Errors
    /// [`Status::PageNotPresent`] if a page of the range is not mapped.
    pub fn fill(&self, va: VirtualAddress, len: u32, value: u8) -> KResult<()> {
        self.with_state(|vmm, s| {
            for_each_chunk(vmm, self.mapper, &s.space, va, len, |chunk, _| chunk.fill(value))
        })
    }

    /// Copy `len` bytes from `src` to `dst`. The ranges must not overlap.
    ///
    /// # Errors
    /// [`Status::PageNotPresent`] if a page of either range is not mapped.
    pub fn copy(&self, src: VirtualAddress, dst: VirtualAddress, len: u32) -> KResult<()> {
        let mut buf = [0u8; 256];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(256);
            let part = &mut buf[..n as usize];
            self.read(src + done, part)?;
            self.write(dst + done, part)?;
            done += n;
        }
        Ok(())
    }

    /// # Errors
    /// [`Status::PageNotPresent`] if a page of the range is not mapped.
    pub fn read(&self, va: VirtualAddress, out: &mut [u8]) -> KResult<()> {
        let len = u32::try_from(out.len()).map_err(|_| Status::BadParameter)?;
        self.with_state(|vmm, s| {
            for_each_chunk(vmm, self.mapper, &s.space, va, len, |chunk, at| {
                out[at..at + chunk.len()].copy_from_slice(chunk);
            })
        })
    }

    /// # Errors
    /// [`Status::PageNotPresent`] if a page of the range is not mapped.
    pub fn write(&self, va: VirtualAddress, data: &[u8]) -> KResult<()> {
        let len = u32::try_from(data.len()).map_err(|_| Status::BadParameter)?;
        self.with_state(|vmm, s| {
            for_each_chunk(vmm, self.mapper, &s.space, va, len, |chunk, at| {
                chunk.copy_from_slice(&data[at..at + chunk.len()]);
            })
        })
    }
}

impl<M: PhysMapper + Sync> FaultResolver for KernelMemory<'_, M> {
    /// Resolve kernel-half faults against the kernel directory and user-half
    /// faults against the current process, if any.
    ///
    /// A fault raised while the memory lock is held on this core cannot be
    /// resolved without deadlocking and is reported as unresolved.
    fn resolve_fault(&self, addr: VirtualAddress, access: FaultAccess) -> KResult<FaultResolution> {
        let Some(mut state) = self.state.try_lock_irq() else {
            log::error!("memory: fault at {addr} while the memory lock is held");
            return Err(Status::PageNotPresent);
        };
        let vmm = self.vmm();
        if addr.as_u32() < USER_END {
            return process::resolve_current(&vmm, &mut state, addr, access);
        }
        let MemoryState { pma, space, .. } = &mut *state;
        vmm.resolve_fault(space, pma, addr, access)
    }
}

/// Call `f` for every page-bounded piece of `[va, va + len)` with the bytes
/// and their offset into the range.
fn for_each_chunk<M: PhysMapper>(
    vmm: &Vmm<'_, M>,
    mapper: &M,
    space: &AddressSpaceState<'_>,
    va: VirtualAddress,
    len: u32,
    mut f: impl FnMut(&mut [u8], usize),
) -> KResult<()> {
    let mut done = 0;
    while done < len {
        let at = va.checked_add(done).ok_or(Status::BadParameter)?;
        let pa = vmm.translate(space, at).ok_or(Status::PageNotPresent)?;
        let offset = (pa.as_u32() % PAGE_SIZE) as usize;
        let n = (PAGE_SIZE - pa.as_u32() % PAGE_SIZE).min(len - done);
        let frame = PhysicalAddress::new(align_down(pa.as_u32(), PAGE_SIZE));
        let bytes: &mut [u8; PAGE_SIZE as usize] = unsafe { mapper.phys_to_mut(frame) };
        f(&mut bytes[offset..offset + n as usize], done as usize);
        done += n;
    }
    Ok(())
}

/// Initialize the PFN database at `pa`.
///
/// # Safety
/// `[pa, pa + count * size_of::<FrameInfo>())` must be usable RAM reachable
/// through `mapper`, physically and virtually contiguous, and never handed
/// out by the allocator.
unsafe fn frame_database<'s, M: PhysMapper>(mapper: &M, pa: PhysicalAddress, count: usize) -> &'s mut [FrameInfo] {
    let ptr = core::ptr::from_mut(unsafe { mapper.phys_to_mut::<FrameInfo>(pa) });
    for i in 0..count {
        unsafe { ptr.add(i).write(FrameInfo::RESERVED) };
    }
    unsafe { core::slice::from_raw_parts_mut(ptr, count) }
}

/// A slot arena of `count` entries in freshly allocated, contiguous frames.
/// The frames are never returned.
fn carve_slots<'s, K, V, M: PhysMapper>(
    mapper: &M,
    pma: &mut PhysicalMemoryAllocator<'_>,
    count: usize,
) -> KResult<&'s mut [Slot<K, V>]> {
    slot_arena(mapper, pma, count).map(|(slots, _, _)| slots)
}

/// A slot arena of `count` entries, together with the first frame and the
/// frame count backing it.
pub(crate) fn slot_arena<'s, K, V, M: PhysMapper>(
    mapper: &M,
    pma: &mut PhysicalMemoryAllocator<'_>,
    count: usize,
) -> KResult<(&'s mut [Slot<K, V>], PhysicalPage<Size4K>, u32)> {
    let bytes = count
        .checked_mul(size_of::<Slot<K, V>>())
        .and_then(|b| u32::try_from(b).ok())
        .and_then(|b| align_up(b, PAGE_SIZE))
        .ok_or(Status::BadParameter)?;
    let pages = (bytes / PAGE_SIZE).max(1);
    let base = pma.allocate_contiguous(pages, 1)?;
    let ptr = core::ptr::from_mut(unsafe { mapper.phys_to_mut::<Slot<K, V>>(base.base()) });
    let slots = unsafe { Slot::init_raw(ptr, count) };
    Ok((slots, base, pages))
}
