//! Simulated physical memory for host-side tests of paging code.

use crate::{FrameAlloc, PhysMapper};
use core::cell::UnsafeCell;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

extern crate alloc;
use alloc::vec::Vec;

/// A trivial **bump** allocator: always hands out the next 4 KiB frame.
///
/// It only keeps a cursor (`next`) and "bumps" it by 4096 on each alloc.
/// Freed frames are counted but never reused.
pub struct BumpAlloc {
    next: u32,
    end: u32,
    /// Number of frames handed back through [`FrameAlloc::free_4k`].
    pub freed: usize,
}

impl BumpAlloc {
    #[must_use]
    pub const fn new(start: u32, end: u32) -> Self {
        Self {
            next: start,
            end,
            freed: 0,
        }
    }
}

impl FrameAlloc for BumpAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        if self.next + 4096 > self.end {
            return None;
        }
        let p = self.next;
        self.next += 4096;
        Some(PhysicalPage::from_addr(PhysicalAddress::new(p)))
    }

    fn free_4k(&mut self, _page: PhysicalPage<Size4K>) {
        self.freed += 1;
    }
}

/// A 4 KiB-aligned raw frame.
#[repr(align(4096))]
struct Aligned4K([u8; 4096]);

/// In-memory "RAM": physical address `pa` lives in frame `pa / 4096` of a
/// vector of 4 KiB-aligned frames.
pub struct TestPhys {
    frames: Vec<UnsafeCell<Aligned4K>>,
}

// Tests drive the simulated RAM from one thread at a time; the kernel
// structures built on top of it are guarded by their own locks.
unsafe impl Sync for TestPhys {}

impl TestPhys {
    #[must_use]
    pub fn with_frames(n: usize) -> Self {
        let mut v = Vec::with_capacity(n);
        for _ in 0..n {
            v.push(UnsafeCell::new(Aligned4K([0u8; 4096])));
        }
        Self { frames: v }
    }

    /// Number of simulated frames.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Read a byte of simulated physical memory.
    #[must_use]
    pub fn read_byte(&self, pa: PhysicalAddress) -> u8 {
        let (idx, off) = Self::locate(pa);
        unsafe { (*self.frames[idx].get()).0[off] }
    }

    /// Write a byte of simulated physical memory.
    pub fn write_byte(&self, pa: PhysicalAddress, value: u8) {
        let (idx, off) = Self::locate(pa);
        unsafe { (*self.frames[idx].get()).0[off] = value }
    }

    const fn locate(pa: PhysicalAddress) -> (usize, usize) {
        ((pa.as_u32() >> 12) as usize, (pa.as_u32() & 0xFFF) as usize)
    }
}

impl PhysMapper for TestPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let (idx, off) = Self::locate(pa);
        // Tables and frames are always accessed from their base.
        debug_assert_eq!(off, 0);
        unsafe { &mut *self.frames[idx].get().cast::<T>() }
    }
}
