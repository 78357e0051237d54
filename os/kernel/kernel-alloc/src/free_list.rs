//! # Free Range Index
//!
//! Free address ranges indexed twice: by base address (to find the neighbours
//! a returned range coalesces with) and by `(size, base)` (best fit, lowest
//! address on ties). Shared by the dynamic mapper and the kernel heap.
//!
//! Ranges are kept **coalesced**: no two free ranges touch.
//!
//! ```text
//!   by address:  [a, a+n) ─ … ─ [b, b+m)        ← coalescing on insert
//!   by size:     (n, a) < (m, b) < …            ← best fit on carve
//! ```

use crate::avl::{AvlTree, Slot};
use kernel_status::{KResult, Status};

/// Slot type of the by-address index.
pub type AddrSlot = Slot<u32, u32>;

/// Slot type of the by-size index.
pub type SizeSlot = Slot<(u32, u32), ()>;

/// A range carved out of a free range.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Carve {
    /// Start of the consumed range, including any sliver in front of `start`.
    pub block: u32,
    /// Length of the consumed range.
    pub len: u32,
    /// The aligned start handed to the caller.
    pub start: u32,
}

/// Coalescing free range index with best-fit carving.
pub struct FreeList<'s> {
    by_addr: AvlTree<'s, u32, u32>,
    by_size: AvlTree<'s, (u32, u32), ()>,
    bytes: u64,
}

impl<'s> FreeList<'s> {
    /// An empty index holding at most `min(by_addr.len(), by_size.len())` ranges.
    pub fn new(by_addr: &'s mut [AddrSlot], by_size: &'s mut [SizeSlot]) -> Self {
        Self {
            by_addr: AvlTree::new(by_addr),
            by_size: AvlTree::new(by_size),
            bytes: 0,
        }
    }

    /// Number of free ranges.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    /// Total free bytes.
    #[inline]
    #[must_use]
    pub const fn free_bytes(&self) -> u64 {
        self.bytes
    }

    /// Largest free range, as `(base, len)`.
    #[must_use]
    pub fn largest(&self) -> Option<(u32, u32)> {
        self.by_size.last().map(|((len, base), ())| (base, len))
    }

    /// Free ranges in address order, as `(base, len)`.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.by_addr.iter().map(|(base, len)| (base, *len))
    }

    /// Return `[base, base + len)` to the index, merging it with free
    /// neighbours that touch it.
    ///
    /// # Errors
    /// - [`Status::BadParameter`] if the range is empty, wraps, or overlaps a
    ///   free range.
    /// - [`Status::MmTooManyEntries`] if the range merges with nothing and the
    ///   index is full.
    pub fn insert(&mut self, base: u32, len: u32) -> KResult<()> {
        let end = base.checked_add(len).filter(|_| len > 0);
        let Some(end) = end else {
            return Err(Status::BadParameter);
        };

        let below = self
            .by_addr
            .floor(&base)
            .map(|(b, l)| (b, *l))
            .filter(|&(b, l)| b + l >= base);
        let above = self
            .by_addr
            .ceiling(&base)
            .map(|(b, l)| (b, *l))
            .filter(|&(b, _)| b <= end);

        if below.is_some_and(|(b, l)| b + l > base) || above.is_some_and(|(b, _)| b < end) {
            return Err(Status::BadParameter);
        }
        if below.is_none() && above.is_none() && (self.by_addr.is_full() || self.by_size.is_full()) {
            return Err(Status::MmTooManyEntries);
        }

        let (mut start, mut stop) = (base, end);
        if let Some((b, l)) = below {
            self.unlink(b, l);
            start = b;
        }
        if let Some((b, l)) = above {
            self.unlink(b, l);
            stop = b + l;
        }
        self.link(start, stop - start)?;
        self.bytes += u64::from(len);
        Ok(())
    }

    /// Carve `len` bytes aligned to `align` from the best-fitting range.
    ///
    /// Leading and trailing remainders of at least `min_remainder` bytes stay
    /// free; smaller slivers become part of the returned [`Carve`].
    /// Returns `Ok(None)` if no range fits.
    ///
    /// # Errors
    /// [`Status::MmTooManyEntries`] if both remainders would have to be kept
    /// but the index has no room for the extra range.
    pub fn take(&mut self, len: u32, align: u32, min_remainder: u32) -> KResult<Option<Carve>> {
        debug_assert!(align.is_power_of_two());
        let mut cursor = self.by_size.ceiling(&(len, 0)).map(|(k, ())| k);
        while let Some((size, base)) = cursor {
            let end = base + size;
            let fit = base
                .checked_add(align - 1)
                .map(|v| v & !(align - 1))
                .filter(|&start| start.checked_add(len).is_some_and(|e| e <= end));
            if let Some(start) = fit {
                return self.carve(base, end, start, len, min_remainder).map(Some);
            }
            cursor = self.by_size.successor(&(size, base)).map(|(k, ())| k);
        }
        Ok(None)
    }

    /// Remove exactly `[base, base + len)` from the index, splitting the free
    /// range that contains it.
    ///
    /// # Errors
    /// - [`Status::BadParameter`] if the range is not entirely free.
    /// - [`Status::MmTooManyEntries`] if the split needs a range slot the index
    ///   does not have.
    pub fn take_exact(&mut self, base: u32, len: u32) -> KResult<()> {
        let end = base.checked_add(len).ok_or(Status::BadParameter)?;
        let Some((b, l)) = self.by_addr.floor(&base).map(|(b, l)| (b, *l)) else {
            return Err(Status::BadParameter);
        };
        if b + l < end {
            return Err(Status::BadParameter);
        }
        self.carve(b, b + l, base, len, 1).map(|_| ())
    }

    fn carve(
        &mut self,
        block: u32,
        end: u32,
        start: u32,
        len: u32,
        min_remainder: u32,
    ) -> KResult<Carve> {
        let head = start - block;
        let tail = end - (start + len);
        let keep_head = head > 0 && head >= min_remainder;
        let keep_tail = tail > 0 && tail >= min_remainder;
        if keep_head && keep_tail && (self.by_addr.is_full() || self.by_size.is_full()) {
            return Err(Status::MmTooManyEntries);
        }

        self.unlink(block, end - block);
        let mut carve = Carve {
            block,
            len: end - block,
            start,
        };
        if keep_head {
            self.link(block, head)?;
            carve.block = start;
            carve.len -= head;
        }
        if keep_tail {
            self.link(start + len, tail)?;
            carve.len -= tail;
        }
        self.bytes -= u64::from(carve.len);
        Ok(carve)
    }

    fn link(&mut self, base: u32, len: u32) -> KResult<()> {
        self.by_addr.insert(base, len)?;
        self.by_size.insert((len, base), ())?;
        Ok(())
    }

    fn unlink(&mut self, base: u32, len: u32) {
        self.by_addr.remove(&base);
        self.by_size.remove(&(len, base));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Storage {
        addr: Vec<AddrSlot>,
        size: Vec<SizeSlot>,
    }

    impl Storage {
        fn new(n: usize) -> Self {
            Self {
                addr: (0..n).map(|_| Slot::vacant()).collect(),
                size: (0..n).map(|_| Slot::vacant()).collect(),
            }
        }

        fn list(&mut self) -> FreeList<'_> {
            FreeList::new(&mut self.addr, &mut self.size)
        }
    }

    #[test]
    fn insert_coalesces_both_neighbours() {
        let mut s = Storage::new(4);
        let mut f = s.list();
        f.insert(0x1000, 0x1000).unwrap();
        f.insert(0x3000, 0x1000).unwrap();
        assert_eq!(f.len(), 2);
        f.insert(0x2000, 0x1000).unwrap();
        assert_eq!(f.iter().collect::<Vec<_>>(), vec![(0x1000, 0x3000)]);
        assert_eq!(f.free_bytes(), 0x3000);
        assert_eq!(f.insert(0x2800, 0x100), Err(Status::BadParameter));
    }

    #[test]
    fn take_prefers_smallest_then_lowest() {
        let mut s = Storage::new(8);
        let mut f = s.list();
        f.insert(0x10000, 0x4000).unwrap();
        f.insert(0x20000, 0x2000).unwrap();
        f.insert(0x30000, 0x2000).unwrap();
        let c = f.take(0x1000, 0x1000, 0x1000).unwrap().unwrap();
        assert_eq!(c.start, 0x20000);
        assert_eq!(c.len, 0x1000);
        assert_eq!(f.largest(), Some((0x10000, 0x4000)));
    }

    #[test]
    fn aligned_take_keeps_remainders_and_attaches_slivers() {
        let mut s = Storage::new(8);
        let mut f = s.list();
        f.insert(0x1008, 0x200).unwrap();
        let c = f.take(0x40, 0x100, 16).unwrap().unwrap();
        assert_eq!(c.start, 0x1100);
        assert_eq!((c.block, c.len), (0x1100, 0x40));
        assert_eq!(
            f.iter().collect::<Vec<_>>(),
            vec![(0x1008, 0xF8), (0x1140, 0xC8)]
        );

        // A 8-byte head sliver stays with the allocation.
        let mut s = Storage::new(8);
        let mut f = s.list();
        f.insert(0x10F8, 0x100).unwrap();
        let c = f.take(0x10, 0x100, 16).unwrap().unwrap();
        assert_eq!((c.block, c.len, c.start), (0x10F8, 0x18, 0x1100));
    }

    #[test]
    fn take_returns_none_when_nothing_fits() {
        let mut s = Storage::new(2);
        let mut f = s.list();
        f.insert(0x1000, 0x1000).unwrap();
        assert_eq!(f.take(0x2000, 1, 1), Ok(None));
        assert_eq!(f.take(0x800, 0x2000, 1), Ok(None));
    }

    #[test]
    fn take_exact_splits_range() {
        let mut s = Storage::new(4);
        let mut f = s.list();
        f.insert(0, 0x10000).unwrap();
        f.take_exact(0x4000, 0x1000).unwrap();
        assert_eq!(
            f.iter().collect::<Vec<_>>(),
            vec![(0, 0x4000), (0x5000, 0xB000)]
        );
        assert_eq!(f.take_exact(0x4000, 0x1000), Err(Status::BadParameter));
    }

    #[test]
    fn full_index_rejects_isolated_range() {
        let mut s = Storage::new(1);
        let mut f = s.list();
        f.insert(0, 0x1000).unwrap();
        assert_eq!(f.insert(0x3000, 0x1000), Err(Status::MmTooManyEntries));
        // Adjacent ranges still merge.
        f.insert(0x1000, 0x1000).unwrap();
        assert_eq!(f.iter().collect::<Vec<_>>(), vec![(0, 0x2000)]);
    }

    #[test]
    fn carve_needing_two_remainders_fails_when_full() {
        let mut s = Storage::new(1);
        let mut f = s.list();
        f.insert(0x800, 0x1800).unwrap();
        assert_eq!(f.take(0x100, 0x1000, 1), Err(Status::MmTooManyEntries));
        assert_eq!(f.iter().collect::<Vec<_>>(), vec![(0x800, 0x1800)]);
        // Without a leading remainder the carve fits.
        let c = f.take(0x100, 0x800, 1).unwrap().unwrap();
        assert_eq!(c.start, 0x800);
    }
}
