//! Clock-gate and tile-usage bookkeeping for one partition.
//!
//! Two parallel bitmaps cover every non-shim tile of the partition:
//!
//! ```text
//! bit(col, row) = col * (rows - 1) + (row - 1)        rows are partition-local
//!
//!   clock_on[bit]  tile clock currently enabled
//!   in_use[bit]    a client has requested the tile
//! ```
//!
//! Clocks are daisy-chained up each column from the shim, so after every
//! reconcile the enabled rows of a column form a prefix `1..=top` that
//! covers the highest in-use row. The hardware side of scanning and
//! reconciling lives in the device's `TileOperations`; this type only holds
//! the state and the column arithmetic.

use crate::device::Location;
use crate::error::{PartError, Result};
use crate::resource::BitResource;

/// Clock-enabled and in-use state for the tiles of one partition.
#[derive(Debug, Clone)]
pub struct ClockGateTracker {
    cols: u32,
    rows: u32,
    clock_on: BitResource,
    in_use: BitResource,
    scanned: bool,
}

impl ClockGateTracker {
    /// Tracker for `cols` columns of `rows` rows, shim row included.
    pub fn new(cols: u32, rows: u32) -> Result<Self> {
        if rows < 2 {
            return Err(PartError::InvalidArgument("partition needs a row above the shim"));
        }
        let bits = cols
            .checked_mul(rows - 1)
            .ok_or(PartError::InvalidArgument("partition too large"))?;
        Ok(Self {
            cols,
            rows,
            clock_on: BitResource::new(bits)?,
            in_use: BitResource::new(bits)?,
            scanned: false,
        })
    }

    pub fn cols(&self) -> u32 {
        self.cols
    }

    /// Rows per column, shim row included.
    pub fn rows(&self) -> u32 {
        self.rows
    }

    fn bit(&self, loc: Location) -> Option<u32> {
        (loc.col < self.cols && loc.row >= 1 && loc.row < self.rows)
            .then(|| loc.col * (self.rows - 1) + (loc.row - 1))
    }

    fn check(&self, loc: Location) -> Result<()> {
        if loc.col < self.cols && loc.row < self.rows {
            Ok(())
        } else {
            Err(PartError::InvalidLocation(loc))
        }
    }

    // ========================================================================
    // Usage
    // ========================================================================

    /// Record that a client uses the tile. Shim tiles have no gate and are
    /// accepted without effect.
    pub fn mark_in_use(&mut self, loc: Location) -> Result<()> {
        self.check(loc)?;
        match self.bit(loc) {
            Some(bit) => self.in_use.set(bit, 1),
            None => Ok(()),
        }
    }

    /// Record that the client no longer uses the tile.
    pub fn mark_released(&mut self, loc: Location) -> Result<()> {
        self.check(loc)?;
        match self.bit(loc) {
            Some(bit) => self.in_use.clear(bit, 1),
            None => Ok(()),
        }
    }

    /// Drop every usage claim.
    pub fn release_all(&mut self) {
        self.in_use.clear_all();
    }

    pub fn is_in_use(&self, loc: Location) -> bool {
        self.bit(loc).is_some_and(|bit| self.in_use.test(bit))
    }

    /// Whether register access to the tile is safe. Always true for the
    /// shim row.
    pub fn is_enabled(&self, loc: Location) -> bool {
        match self.bit(loc) {
            Some(bit) => self.clock_on.test(bit),
            None => loc.row == 0 && loc.col < self.cols,
        }
    }

    /// Whether the tile's clock is gated off.
    pub fn is_gated(&self, loc: Location) -> bool {
        self.bit(loc).is_some_and(|bit| !self.clock_on.test(bit))
    }

    // ========================================================================
    // Column arithmetic
    // ========================================================================

    fn top_set_row(&self, res: &BitResource, col: u32) -> u32 {
        (1..self.rows)
            .rev()
            .find(|&row| {
                self.bit(Location::new(col, row))
                    .is_some_and(|bit| res.test(bit))
            })
            .unwrap_or(0)
    }

    /// Highest in-use row of a column, 0 when none.
    pub fn top_in_use_row(&self, col: u32) -> u32 {
        self.top_set_row(&self.in_use, col)
    }

    /// Highest clock-enabled row of a column, 0 when fully gated.
    pub fn top_clock_row(&self, col: u32) -> u32 {
        self.top_set_row(&self.clock_on, col)
    }

    /// Whether any tile of the column is in use.
    pub fn column_in_use(&self, col: u32) -> bool {
        self.top_in_use_row(col) > 0
    }

    /// Update the clock bits of rows `first..=last` in one column.
    pub fn set_clock_rows(&mut self, col: u32, first: u32, last: u32, on: bool) -> Result<()> {
        if first > last {
            return Ok(());
        }
        let start = self
            .bit(Location::new(col, first))
            .ok_or(PartError::InvalidLocation(Location::new(col, first)))?;
        if self.bit(Location::new(col, last)).is_none() {
            return Err(PartError::InvalidLocation(Location::new(col, last)));
        }
        let count = last - first + 1;
        if on {
            self.clock_on.set(start, count)
        } else {
            self.clock_on.clear(start, count)
        }
    }

    /// Set the whole column's clock state.
    pub fn set_column_clock(&mut self, col: u32, on: bool) -> Result<()> {
        self.set_clock_rows(col, 1, self.rows - 1, on)
    }

    // ========================================================================
    // Hardware scan
    // ========================================================================

    /// Record a scanned column whose clock is on for rows `1..=top`.
    pub fn record_scan(&mut self, col: u32, top: u32) -> Result<()> {
        let top = top.min(self.rows - 1);
        self.set_clock_rows(col, 1, top, true)?;
        self.set_clock_rows(col, top + 1, self.rows - 1, false)
    }

    /// Close a scan. The first scan after attach treats every clocked tile
    /// as in use, since something claimed it before we were here.
    pub fn finish_scan(&mut self) -> Result<()> {
        if !self.scanned {
            self.in_use.copy_from(&self.clock_on)?;
            self.scanned = true;
        }
        Ok(())
    }

    /// Whether every column satisfies the daisy-chain rule: clocked rows
    /// form a prefix from the shim and cover every in-use row.
    pub fn is_consistent(&self) -> bool {
        (0..self.cols).all(|col| {
            let top = self.top_clock_row(col);
            let prefix = (1..=top).all(|row| self.is_enabled(Location::new(col, row)));
            prefix && self.top_in_use_row(col) <= top
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_row_above_shim() {
        assert!(ClockGateTracker::new(4, 1).is_err());
        assert!(ClockGateTracker::new(0, 5).is_err());
    }

    #[test]
    fn test_shim_row_is_always_enabled() {
        let mut tracker = ClockGateTracker::new(2, 3).unwrap();
        tracker.mark_in_use(Location::new(1, 0)).unwrap();
        assert!(tracker.is_enabled(Location::new(1, 0)));
        assert!(!tracker.is_in_use(Location::new(1, 0)));
        assert!(!tracker.is_enabled(Location::new(1, 1)));
        assert!(!tracker.is_enabled(Location::new(2, 0)));
    }

    #[test]
    fn test_out_of_partition_rejected() {
        let mut tracker = ClockGateTracker::new(2, 3).unwrap();
        assert_eq!(
            tracker.mark_in_use(Location::new(2, 1)).unwrap_err(),
            PartError::InvalidLocation(Location::new(2, 1))
        );
        assert!(tracker.mark_released(Location::new(0, 3)).is_err());
    }

    #[test]
    fn test_top_rows() {
        let mut tracker = ClockGateTracker::new(2, 5).unwrap();
        assert_eq!(tracker.top_in_use_row(0), 0);
        tracker.mark_in_use(Location::new(0, 2)).unwrap();
        tracker.mark_in_use(Location::new(0, 4)).unwrap();
        assert_eq!(tracker.top_in_use_row(0), 4);
        assert_eq!(tracker.top_in_use_row(1), 0);

        tracker.set_clock_rows(1, 1, 3, true).unwrap();
        assert_eq!(tracker.top_clock_row(1), 3);
        assert!(tracker.is_gated(Location::new(1, 4)));
    }

    #[test]
    fn test_first_scan_claims_clocked_tiles() {
        let mut tracker = ClockGateTracker::new(2, 5).unwrap();
        tracker.record_scan(0, 2).unwrap();
        tracker.record_scan(1, 0).unwrap();
        tracker.finish_scan().unwrap();
        assert!(tracker.is_in_use(Location::new(0, 1)));
        assert!(tracker.is_in_use(Location::new(0, 2)));
        assert!(!tracker.is_in_use(Location::new(0, 3)));

        // Later scans only refresh clock state.
        tracker.release_all();
        tracker.record_scan(1, 4).unwrap();
        tracker.finish_scan().unwrap();
        assert!(!tracker.is_in_use(Location::new(1, 1)));
        assert_eq!(tracker.top_clock_row(1), 4);
    }

    #[test]
    fn test_consistency_check() {
        let mut tracker = ClockGateTracker::new(1, 5).unwrap();
        tracker.mark_in_use(Location::new(0, 3)).unwrap();
        assert!(!tracker.is_consistent());
        tracker.set_clock_rows(0, 1, 3, true).unwrap();
        assert!(tracker.is_consistent());
        tracker.set_clock_rows(0, 2, 2, false).unwrap();
        assert!(!tracker.is_consistent());
    }
}
