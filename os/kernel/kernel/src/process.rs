//! # Process Page Directories
//!
//! A process directory shares the kernel half of the kernel directory and
//! tracks its own user-half regions. Its region tree lives in frames drawn
//! from the PMA together with the directory, and both go back on destroy.
//!
//! Directories are kept in a fixed table inside the memory lock and named by
//! a [`ProcessId`]. One of them may be current: [`KernelMemory::switch_to`]
//! loads its directory into CR3, and user-half page faults are resolved
//! against it.

use crate::memory::{KernelMemory, MemoryState, slot_arena};
use kernel_alloc::vmm::{AddressSpaceState, Region, Vmm};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_status::{KResult, Status};
use kernel_vmem::{AddressSpace, FaultAccess, FaultResolution, PhysMapper, Protection, RootPage};

/// Regions a process can hold.
pub const PROCESS_REGION_CAPACITY: usize = 64;

/// Process directories alive at the same time.
pub const MAX_PROCESSES: usize = 32;

/// Handle of a process directory. Stale after the directory is destroyed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ProcessId {
    index: u16,
    generation: u16,
}

/// A process address space.
pub struct ProcessDirectory<'s> {
    space: AddressSpaceState<'s>,
    arena: PhysicalPage<Size4K>,
    arena_pages: u32,
}

impl ProcessDirectory<'_> {
    /// Physical frame of the page directory, as loaded into CR3.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> RootPage {
        self.space.root()
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> + '_ {
        self.space.regions()
    }
}

/// Live process directories and the current one.
pub struct ProcessTable<'s> {
    slots: [Option<ProcessDirectory<'s>>; MAX_PROCESSES],
    generations: [u16; MAX_PROCESSES],
    current: Option<ProcessId>,
}

impl<'s> ProcessTable<'s> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; MAX_PROCESSES],
            generations: [0; MAX_PROCESSES],
            current: None,
        }
    }

    #[must_use]
    pub const fn current(&self) -> Option<ProcessId> {
        self.current
    }

    /// The directory user-half faults are resolved against.
    #[must_use]
    pub fn current_directory(&self) -> Option<&ProcessDirectory<'s>> {
        self.current.and_then(|id| self.get(id))
    }

    #[must_use]
    pub fn get(&self, id: ProcessId) -> Option<&ProcessDirectory<'s>> {
        let i = usize::from(id.index);
        if self.generations.get(i) != Some(&id.generation) {
            return None;
        }
        self.slots[i].as_ref()
    }

    pub fn get_mut(&mut self, id: ProcessId) -> Option<&mut ProcessDirectory<'s>> {
        let i = usize::from(id.index);
        if self.generations.get(i) != Some(&id.generation) {
            return None;
        }
        self.slots[i].as_mut()
    }

    fn insert(&mut self, directory: ProcessDirectory<'s>) -> Result<ProcessId, ProcessDirectory<'s>> {
        let Some(i) = self.slots.iter().position(Option::is_none) else {
            return Err(directory);
        };
        self.slots[i] = Some(directory);
        #[allow(clippy::cast_possible_truncation)]
        Ok(ProcessId {
            index: i as u16,
            generation: self.generations[i],
        })
    }

    fn take(&mut self, id: ProcessId) -> Option<ProcessDirectory<'s>> {
        self.get(id)?;
        let i = usize::from(id.index);
        self.generations[i] = self.generations[i].wrapping_add(1);
        self.slots[i].take()
    }
}

impl Default for ProcessTable<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve a user-half fault against the current process.
///
/// # Errors
/// [`Status::PageNotPresent`] if no process is current, otherwise as
/// [`Vmm::resolve_fault`].
pub(crate) fn resolve_current<M: PhysMapper>(
    vmm: &Vmm<'_, M>,
    state: &mut MemoryState<'_>,
    addr: VirtualAddress,
    access: FaultAccess,
) -> KResult<FaultResolution> {
    let MemoryState { pma, processes, .. } = state;
    let Some(directory) = processes.current_directory() else {
        log::debug!("process: user fault at {addr} with no current process");
        return Err(Status::PageNotPresent);
    };
    vmm.resolve_fault(&directory.space, pma, addr, access)
}

/// Create a page directory for a new process.
///
/// # Errors
/// [`Status::ExecProcessPageDirectoryCreationFailure`] if the directory or
/// its bookkeeping cannot be allocated, or the process table is full.
pub fn create_process_page_directory<M: PhysMapper>(memory: &KernelMemory<'_, M>) -> KResult<ProcessId> {
    let mapper = memory.mapper();
    memory
        .with_state(|vmm, s| {
            let (slots, arena, arena_pages) = slot_arena(mapper, &mut s.pma, PROCESS_REGION_CAPACITY)?;
            let space = match vmm.create_address_space(&s.space, &mut s.pma, slots) {
                Ok(space) => space,
                Err(e) => {
                    s.pma.free_contiguous(arena, arena_pages);
                    return Err(e);
                }
            };
            let directory = ProcessDirectory {
                space,
                arena,
                arena_pages,
            };
            match s.processes.insert(directory) {
                Ok(id) => Ok(id),
                Err(directory) => {
                    if let Err(e) = release(vmm, s, directory) {
                        log::warn!("process: leaked an unused directory: {e}");
                    }
                    Err(Status::OutOfResources)
                }
            }
        })
        .map_err(|e| {
            log::warn!("process: cannot create page directory: {e}");
            Status::ExecProcessPageDirectoryCreationFailure
        })
}

/// Unmap everything the process mapped and return the directory, its page
/// tables and its bookkeeping frames.
///
/// # Errors
/// - [`Status::BadParameter`] for a stale handle.
/// - [`Status::OperationNotAllowed`] if the process is current.
/// - Errors of [`Vmm::destroy_address_space`]; the bookkeeping frames are
///   leaked in that case.
pub fn destroy_process_page_directory<M: PhysMapper>(memory: &KernelMemory<'_, M>, id: ProcessId) -> KResult<()> {
    memory.with_state(|vmm, s| {
        if s.processes.current == Some(id) {
            return Err(Status::OperationNotAllowed);
        }
        let directory = s.processes.take(id).ok_or(Status::BadParameter)?;
        release(vmm, s, directory)
    })
}

fn release<M: PhysMapper>(vmm: &Vmm<'_, M>, s: &mut MemoryState<'_>, directory: ProcessDirectory<'_>) -> KResult<()> {
    let ProcessDirectory {
        space,
        arena,
        arena_pages,
    } = directory;
    vmm.destroy_address_space(space, &mut s.pma)?;
    s.pma.free_contiguous(arena, arena_pages);
    Ok(())
}

impl<'s, M: PhysMapper> KernelMemory<'s, M> {
    /// Run `f` on the directory of `id`.
    ///
    /// # Errors
    /// [`Status::BadParameter`] for a stale handle.
    pub fn with_process<R>(&self, id: ProcessId, f: impl FnOnce(&ProcessDirectory<'s>) -> R) -> KResult<R> {
        self.with_state(|_, s| s.processes.get(id).map(f).ok_or(Status::BadParameter))
    }

    /// Make `id` the current process and load its directory, or go back to
    /// the kernel directory for `None`.
    ///
    /// # Safety
    /// As [`AddressSpace::activate`]: the code executing the switch and its
    /// stack must live in the kernel half.
    ///
    /// # Errors
    /// [`Status::BadParameter`] for a stale handle; the current process is
    /// left unchanged.
    pub unsafe fn switch_to(&self, id: Option<ProcessId>) -> KResult<()> {
        self.with_state(|_, s| {
            let root = match id {
                Some(id) => s.processes.get(id).ok_or(Status::BadParameter)?.root(),
                None => s.space.root(),
            };
            s.processes.current = id;
            unsafe { AddressSpace::from_root(self.mapper(), root).activate() };
            Ok(())
        })
    }

    #[must_use]
    pub fn current_process(&self) -> Option<ProcessId> {
        self.with_state(|_, s| s.processes.current())
    }

    /// Back a user range of process `id` with fresh frames.
    ///
    /// # Errors
    /// [`Status::BadParameter`] for a stale handle, otherwise as
    /// [`Vmm::map_anonymous`].
    pub fn map_user_anonymous(&self, id: ProcessId, va: VirtualAddress, len: u32, protection: Protection) -> KResult<()> {
        self.with_state(|vmm, s| {
            let directory = s.processes.get_mut(id).ok_or(Status::BadParameter)?;
            vmm.map_anonymous(&mut directory.space, &mut s.pma, va, len, protection)
        })
    }

    /// Reserve a lazily committed user range of process `id`.
    ///
    /// # Errors
    /// [`Status::BadParameter`] for a stale handle, otherwise as
    /// [`Vmm::reserve`].
    pub fn reserve_user(&self, id: ProcessId, va: VirtualAddress, len: u32, protection: Protection) -> KResult<()> {
        self.with_state(|vmm, s| {
            let directory = s.processes.get_mut(id).ok_or(Status::BadParameter)?;
            vmm.reserve(&mut directory.space, va, len, protection)
        })
    }

    /// Resolve a user-half fault of process `id`, current or not.
    ///
    /// # Errors
    /// [`Status::BadParameter`] for a stale handle, otherwise as
    /// [`Vmm::resolve_fault`].
    pub fn resolve_user_fault(&self, id: ProcessId, addr: VirtualAddress, access: FaultAccess) -> KResult<FaultResolution> {
        self.with_state(|vmm, s| {
            let directory = s.processes.get(id).ok_or(Status::BadParameter)?;
            vmm.resolve_fault(&directory.space, &mut s.pma, addr, access)
        })
    }

    /// Translate a user address of process `id`.
    #[must_use]
    pub fn translate_user(&self, id: ProcessId, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.with_state(|vmm, s| vmm.translate(&s.processes.get(id)?.space, va))
    }
}
