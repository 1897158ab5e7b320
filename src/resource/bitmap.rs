//! Fixed-capacity bitmap allocator.
//!
//! [`BitResource`] backs every countable thing in the crate: aperture
//! columns, clock-gate and in-use state, per-module event status and the
//! runtime/static resource ledgers.
//!
//! # Semantics
//!
//! ```text
//! bit clear = free, bit set = taken
//!
//! region ops are all-or-nothing: either the whole run is found/modified,
//! or the bitmap is untouched and an error is returned.
//! ```
//!
//! The allocator does no locking of its own. Find-then-set sequences are
//! only atomic because every owner keeps its bitmaps behind a partition or
//! aperture lock.

use bitvec::prelude::*;
use smallvec::SmallVec;

use crate::error::{PartError, Result};

/// Ids handed back by multi-bit acquisitions.
pub type IdList = SmallVec<[u32; 8]>;

/// A bitmap of `total` bits with region search and reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitResource {
    bits: BitVec<u64, Lsb0>,
}

impl BitResource {
    /// Allocate a zeroed bitmap of `count` bits.
    pub fn new(count: u32) -> Result<Self> {
        if count == 0 {
            return Err(PartError::InvalidArgument("bitmap of zero bits"));
        }
        Ok(Self {
            bits: BitVec::repeat(false, count as usize),
        })
    }

    /// Number of bits managed.
    pub fn total(&self) -> u32 {
        self.bits.len() as u32
    }

    fn check_region(&self, start: u32, count: u32) -> Result<()> {
        match start.checked_add(count) {
            Some(end) if end <= self.total() => Ok(()),
            _ => Err(PartError::OutOfRange {
                start,
                count,
                total: self.total(),
            }),
        }
    }

    fn region(start: u32, count: u32) -> std::ops::Range<usize> {
        start as usize..(start + count) as usize
    }

    // ========================================================================
    // Single bits and plain regions
    // ========================================================================

    /// Check one bit. Out-of-range bits read as clear.
    pub fn test(&self, bit: u32) -> bool {
        bit < self.total() && self.bits[bit as usize]
    }

    /// Set `count` bits starting at `start`.
    pub fn set(&mut self, start: u32, count: u32) -> Result<()> {
        self.check_region(start, count)?;
        self.bits[Self::region(start, count)].fill(true);
        Ok(())
    }

    /// Clear `count` bits starting at `start`.
    pub fn clear(&mut self, start: u32, count: u32) -> Result<()> {
        self.check_region(start, count)?;
        self.bits[Self::region(start, count)].fill(false);
        Ok(())
    }

    /// Clear every bit.
    pub fn clear_all(&mut self) {
        self.bits.fill(false);
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> u32 {
        self.bits.count_ones() as u32
    }

    /// Whether no bit is set in `[start, start + count)`.
    pub fn is_region_clear(&self, start: u32, count: u32) -> Result<bool> {
        self.check_region(start, count)?;
        Ok(self.bits[Self::region(start, count)].not_any())
    }

    /// Iterate over the indices of set bits.
    pub fn iter_ones(&self) -> impl Iterator<Item = u32> + '_ {
        self.bits.iter_ones().map(|i| i as u32)
    }

    // ========================================================================
    // Contiguous regions
    // ========================================================================

    /// First run of `count` free bits at or after `start`. Read-only.
    pub fn find_free_region(&self, start: u32, count: u32) -> Result<u32> {
        if count == 0 {
            return Err(PartError::InvalidArgument("empty region"));
        }
        let mut run = 0;
        let mut run_start = start;
        for bit in start..self.total() {
            if self.bits[bit as usize] {
                run = 0;
                run_start = bit + 1;
            } else {
                run += 1;
                if run == count {
                    return Ok(run_start);
                }
            }
        }
        Err(PartError::NotAvailable)
    }

    /// Find a free run of `count` bits at or after `start` and set it.
    pub fn acquire_region(&mut self, start: u32, count: u32) -> Result<u32> {
        let found = self.find_free_region(start, count)?;
        self.set(found, count)?;
        Ok(found)
    }

    /// Clear a region unconditionally. Releasing a clear region is harmless.
    pub fn release_region(&mut self, start: u32, count: u32) -> Result<()> {
        self.clear(start, count)
    }

    // ========================================================================
    // Two-ledger operations
    // ========================================================================

    /// Count positions in `[start, start + count)` free in both bitmaps.
    pub fn count_common_free(&self, other: &BitResource, start: u32, count: u32) -> Result<u32> {
        self.check_region(start, count)?;
        other.check_region(start, count)?;
        let range = Self::region(start, count);
        let free = self.bits[range.clone()]
            .iter()
            .zip(other.bits[range].iter())
            .filter(|(mine, theirs)| !**mine && !**theirs)
            .count();
        Ok(free as u32)
    }

    /// Take `n_wanted` positions free in both bitmaps from the window
    /// `[start, start + window)`.
    ///
    /// Only `self` is modified. Nothing changes unless all `n_wanted`
    /// positions are found.
    pub fn acquire_common_free(
        &mut self,
        other: &BitResource,
        start: u32,
        n_wanted: u32,
        window: u32,
    ) -> Result<IdList> {
        if n_wanted == 0 {
            return Err(PartError::InvalidArgument("zero ids requested"));
        }
        self.check_region(start, window)?;
        other.check_region(start, window)?;

        let mut ids = IdList::new();
        for bit in start..start + window {
            if !self.bits[bit as usize] && !other.bits[bit as usize] {
                ids.push(bit);
                if ids.len() as u32 == n_wanted {
                    break;
                }
            }
        }
        if (ids.len() as u32) < n_wanted {
            return Err(PartError::NotAvailable);
        }
        for &id in &ids {
            self.bits.set(id as usize, true);
        }
        Ok(ids)
    }

    // ========================================================================
    // Aligned blocks
    // ========================================================================

    fn check_block_args(&self, start: u32, end: u32, block: u32) -> Result<()> {
        if block == 0 {
            return Err(PartError::InvalidArgument("zero block size"));
        }
        if start > end {
            return Err(PartError::InvalidArgument("block search window is inverted"));
        }
        self.check_region(start, end - start)
    }

    /// First free block of `block` bits inside `[start, end)` whose offset
    /// from `start` is a multiple of `block`. Read-only.
    pub fn find_pattern_block(&self, start: u32, end: u32, block: u32) -> Result<u32> {
        self.check_block_args(start, end, block)?;
        let mut offset = start;
        while offset + block <= end {
            if self.bits[Self::region(offset, block)].not_any() {
                return Ok(offset);
            }
            offset += block;
        }
        Err(PartError::NotAvailable)
    }

    /// Like [`find_pattern_block`](Self::find_pattern_block), but the block
    /// must be free in both bitmaps. Read-only.
    pub fn find_common_pattern_block(
        &self,
        other: &BitResource,
        start: u32,
        end: u32,
        block: u32,
    ) -> Result<u32> {
        self.check_block_args(start, end, block)?;
        other.check_block_args(start, end, block)?;
        let mut offset = start;
        while offset + block <= end {
            let range = Self::region(offset, block);
            if self.bits[range.clone()].not_any() && other.bits[range].not_any() {
                return Ok(offset);
            }
            offset += block;
        }
        Err(PartError::NotAvailable)
    }

    /// Find an aligned block free in both bitmaps and reserve it in both.
    pub fn acquire_common_pattern_block(
        &mut self,
        other: &mut BitResource,
        start: u32,
        end: u32,
        block: u32,
    ) -> Result<u32> {
        let found = self.find_common_pattern_block(other, start, end, block)?;
        self.set(found, block)?;
        other.set(found, block)?;
        Ok(found)
    }

    // ========================================================================
    // Bulk copies
    // ========================================================================

    /// Overwrite this bitmap with another of the same size.
    pub fn copy_from(&mut self, other: &BitResource) -> Result<()> {
        if other.total() != self.total() {
            return Err(PartError::InvalidArgument("bitmap size mismatch"));
        }
        self.bits.copy_from_bitslice(&other.bits);
        Ok(())
    }

    /// New bitmap holding the union of both bitmaps over `[start, start + count)`.
    pub fn union_window(&self, other: &BitResource, start: u32, count: u32) -> Result<BitResource> {
        self.check_region(start, count)?;
        other.check_region(start, count)?;
        let mut out = BitResource::new(count)?;
        let range = Self::region(start, count);
        for (i, (mine, theirs)) in self.bits[range.clone()]
            .iter()
            .zip(other.bits[range].iter())
            .enumerate()
        {
            if *mine || *theirs {
                out.bits.set(i, true);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_zero_sized_rejected() {
        assert_eq!(
            BitResource::new(0).unwrap_err(),
            PartError::InvalidArgument("bitmap of zero bits")
        );
    }

    #[test]
    fn test_test_out_of_range_is_false() {
        let mut res = BitResource::new(8).unwrap();
        res.set(0, 8).unwrap();
        assert!(res.test(7));
        assert!(!res.test(8));
        assert!(!res.test(u32::MAX));
    }

    #[test]
    fn test_set_clear_bounds() {
        let mut res = BitResource::new(16).unwrap();
        assert!(matches!(res.set(10, 7), Err(PartError::OutOfRange { .. })));
        assert!(matches!(res.clear(u32::MAX, 2), Err(PartError::OutOfRange { .. })));
        assert_eq!(res.count_ones(), 0);

        res.set(10, 6).unwrap();
        res.set(10, 6).unwrap();
        assert_eq!(res.count_ones(), 6);
        res.clear(12, 2).unwrap();
        assert_eq!(res.iter_ones().collect::<Vec<_>>(), vec![10, 11, 14, 15]);
    }

    #[test]
    fn test_find_free_region_skips_taken_bits() {
        let mut res = BitResource::new(16).unwrap();
        res.set(2, 1).unwrap();
        res.set(5, 1).unwrap();

        assert_eq!(res.find_free_region(0, 2).unwrap(), 0);
        assert_eq!(res.find_free_region(0, 3).unwrap(), 6);
        assert_eq!(res.find_free_region(3, 2).unwrap(), 3);
        assert_eq!(res.find_free_region(0, 11).unwrap_err(), PartError::NotAvailable);
        assert_eq!(res.find_free_region(20, 1).unwrap_err(), PartError::NotAvailable);

        // Read-only
        assert_eq!(res.iter_ones().collect::<Vec<_>>(), vec![2, 5]);
    }

    #[test]
    fn test_acquire_release_restores_state() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..200 {
            let total = rng.gen_range(1..=96);
            let mut res = BitResource::new(total).unwrap();
            for _ in 0..rng.gen_range(0..total) {
                res.set(rng.gen_range(0..total), 1).unwrap();
            }
            let before = res.clone();
            let count = rng.gen_range(1..=total);
            let start = rng.gen_range(0..total);

            match res.acquire_region(start, count) {
                Ok(found) => {
                    assert!(found >= start);
                    assert!(before.is_region_clear(found, count).unwrap());
                    res.release_region(found, count).unwrap();
                    assert_eq!(res, before);
                }
                Err(err) => {
                    assert_eq!(err, PartError::NotAvailable);
                    assert_eq!(res, before);
                }
            }
        }
    }

    #[test]
    fn test_count_common_free() {
        let mut runtime = BitResource::new(8).unwrap();
        let mut reserved = BitResource::new(8).unwrap();
        runtime.set(0, 2).unwrap();
        reserved.set(1, 2).unwrap();

        assert_eq!(runtime.count_common_free(&reserved, 0, 8).unwrap(), 5);
        assert_eq!(runtime.count_common_free(&reserved, 0, 4).unwrap(), 1);
        assert!(runtime.count_common_free(&reserved, 4, 5).is_err());
    }

    #[test]
    fn test_acquire_common_free_sets_only_self() {
        let mut runtime = BitResource::new(8).unwrap();
        let mut reserved = BitResource::new(8).unwrap();
        reserved.set(0, 2).unwrap();
        runtime.set(3, 1).unwrap();

        let ids = runtime.acquire_common_free(&reserved, 0, 3, 8).unwrap();
        assert_eq!(ids.as_slice(), &[2, 4, 5]);
        assert!(runtime.test(2) && runtime.test(4) && runtime.test(5));
        assert_eq!(reserved.iter_ones().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_acquire_common_free_is_all_or_nothing() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let mut runtime = BitResource::new(32).unwrap();
            let mut reserved = BitResource::new(32).unwrap();
            for _ in 0..24 {
                runtime.set(rng.gen_range(0..32), 1).unwrap();
                reserved.set(rng.gen_range(0..32), 1).unwrap();
            }
            let free = runtime.count_common_free(&reserved, 0, 32).unwrap();
            let before = runtime.clone();

            let err = runtime
                .acquire_common_free(&reserved, 0, free + 1, 32)
                .unwrap_err();
            assert_eq!(err, PartError::NotAvailable);
            assert_eq!(runtime, before);
        }
    }

    #[test]
    fn test_pattern_block_alignment() {
        let mut rng = StdRng::seed_from_u64(7);
        for block in [1u32, 2, 3, 4, 8] {
            for _ in 0..100 {
                let mut res = BitResource::new(64).unwrap();
                for _ in 0..rng.gen_range(0..48) {
                    res.set(rng.gen_range(0..64), 1).unwrap();
                }
                let start = rng.gen_range(0..32);
                let end = rng.gen_range(start..=64);
                if let Ok(found) = res.find_pattern_block(start, end, block) {
                    assert_eq!((found - start) % block, 0);
                    assert!(found + block <= end);
                    assert!(res.is_region_clear(found, block).unwrap());
                }
            }
        }
    }

    #[test]
    fn test_pattern_block_skips_misaligned_runs() {
        let mut res = BitResource::new(16).unwrap();
        res.set(0, 1).unwrap();
        // Bits 1..4 are free but not aligned to 4.
        assert_eq!(res.find_pattern_block(0, 16, 4).unwrap(), 4);
        assert_eq!(res.find_pattern_block(1, 16, 4).unwrap(), 1);
        assert_eq!(res.find_pattern_block(0, 3, 4).unwrap_err(), PartError::NotAvailable);
    }

    #[test]
    fn test_acquire_common_pattern_block_commits_both() {
        let mut a = BitResource::new(16).unwrap();
        let mut b = BitResource::new(16).unwrap();
        a.set(0, 1).unwrap();
        b.set(5, 1).unwrap();

        let found = a.acquire_common_pattern_block(&mut b, 0, 16, 4).unwrap();
        assert_eq!(found, 8);
        assert!(!a.is_region_clear(8, 4).unwrap());
        assert!(!b.is_region_clear(8, 4).unwrap());

        let before = (a.clone(), b.clone());
        assert!(a.acquire_common_pattern_block(&mut b, 0, 8, 4).is_err());
        assert_eq!((a, b), before);
    }

    #[test]
    fn test_union_window() {
        let mut a = BitResource::new(16).unwrap();
        let mut b = BitResource::new(16).unwrap();
        a.set(4, 1).unwrap();
        b.set(6, 1).unwrap();
        let merged = a.union_window(&b, 4, 4).unwrap();
        assert_eq!(merged.iter_ones().collect::<Vec<_>>(), vec![0, 2]);
    }
}
