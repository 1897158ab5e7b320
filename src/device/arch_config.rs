//! Per-generation tile operations.
//!
//! Tile classification, memory layout and the clock scan/reconcile rules
//! differ between generations. They sit behind one sealed trait so that
//! the partition core asks `device.ops` instead of checking which
//! generation it runs on.
//!
//! # Clock rules
//!
//! ```text
//! AIE     per tile. Shim CLKCNTR needs COLBUF|NEXTCLK for row 1 to run;
//!         each tile's NEXTCLK bit feeds the tile above it.
//! AIE-ML  per column. Shim COLCLOCK bits[1:0] switch the whole column,
//!         driven through the reset/power collaborator.
//! ```
//!
//! # Example
//!
//! ```ignore
//! use aie_partition::device::{DeviceGeneration, Location, Range, TileKind};
//!
//! let ops = DeviceGeneration::Aie.description().ops;
//! assert_eq!(ops.classify(Location::new(3, 0)), TileKind::ShimNoc);
//! assert_eq!(ops.classify(Location::new(1, 0)), TileKind::ShimPlain);
//! assert_eq!(ops.memory_regions(&Range::new(0, 0, 4, 1)).len(), 0);
//! ```

use std::fmt;

use smallvec::SmallVec;

use crate::error::Result;
use crate::partition::ClockGateTracker;

use super::aie_spec::{self, aie, aieml};
use super::tile::TileKind;
use super::{Hardware, Location, Range};

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::AieTileOps {}
    impl Sealed for super::AiemlTileOps {}
}

/// Class of on-tile memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    DataMemory,
    ProgramMemory,
    MemTileMemory,
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryKind::DataMemory => write!(f, "data"),
            MemoryKind::ProgramMemory => write!(f, "program"),
            MemoryKind::MemTileMemory => write!(f, "memtile"),
        }
    }
}

/// Contiguous absolute rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowSpan {
    pub start: u32,
    pub count: u32,
}

/// One class of memory: its intra-tile window and the rows that carry it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub kind: MemoryKind,
    pub offset: u64,
    pub size: u64,
    pub rows: RowSpan,
}

/// Generation-specific tile behaviour.
///
/// Ranges passed in are absolute; `tracker` is indexed in the range's
/// local frame with `col` a local column.
pub trait TileOperations: sealed::Sealed + Send + Sync + fmt::Debug {
    /// Kind of the tile at an absolute location.
    fn classify(&self, loc: Location) -> TileKind;

    /// Memory windows present in the rows of `range`; empty for shim-only
    /// ranges.
    fn memory_regions(&self, range: &Range) -> SmallVec<[MemoryRegion; 3]>;

    /// Highest clock-enabled local row of a column, read from hardware.
    fn scan_column(&self, hw: &Hardware, range: &Range, col: u32) -> Result<u32>;

    /// Bring one column's clocks in line with its in-use rows.
    fn reconcile_column(
        &self,
        hw: &Hardware,
        range: &Range,
        tracker: &mut ClockGateTracker,
        col: u32,
    ) -> Result<()>;

    /// Populate the tracker from hardware.
    fn scan_clocks(&self, hw: &Hardware, range: &Range, tracker: &mut ClockGateTracker) -> Result<()> {
        for col in 0..range.size.cols {
            let top = self.scan_column(hw, range, col)?;
            tracker.record_scan(col, top)?;
        }
        tracker.finish_scan()
    }

    /// Reconcile every column of the range.
    fn reconcile_clocks(
        &self,
        hw: &Hardware,
        range: &Range,
        tracker: &mut ClockGateTracker,
    ) -> Result<()> {
        for col in 0..range.size.cols {
            self.reconcile_column(hw, range, tracker, col)?;
        }
        Ok(())
    }
}

fn shim_kind(col: u32) -> TileKind {
    if col % aie_spec::SHIM_GROUP_SIZE < aie_spec::SHIM_PLAIN_PER_GROUP {
        TileKind::ShimPlain
    } else {
        TileKind::ShimNoc
    }
}

/// Intersection of `range`'s rows with `[first, end)`.
fn row_span(range: &Range, first: u32, end: u32) -> Option<RowSpan> {
    let start = range.start.row.max(first);
    let stop = range.end_row().min(end);
    (start < stop).then(|| RowSpan {
        start,
        count: stop - start,
    })
}

// ============================================================================
// AIE
// ============================================================================

/// First-generation rules: per-tile clock daisy chain through registers.
#[derive(Debug, Clone, Copy, Default)]
pub struct AieTileOps;

impl AieTileOps {
    fn clock_regoff(row: u32) -> u32 {
        if row == 0 {
            aie::SHIMPL_CLKCNTR_REGOFF
        } else {
            aie::TILE_CORE_CLKCNTR_REGOFF
        }
    }
}

impl TileOperations for AieTileOps {
    fn classify(&self, loc: Location) -> TileKind {
        match loc.row {
            0 => shim_kind(loc.col),
            _ => TileKind::ArrayTile,
        }
    }

    fn memory_regions(&self, range: &Range) -> SmallVec<[MemoryRegion; 3]> {
        let mut regions = SmallVec::new();
        if let Some(rows) = row_span(range, 1, u32::MAX) {
            regions.push(MemoryRegion {
                kind: MemoryKind::DataMemory,
                offset: 0,
                size: aie::DATA_MEMORY_SIZE,
                rows,
            });
            regions.push(MemoryRegion {
                kind: MemoryKind::ProgramMemory,
                offset: aie::PROGRAM_MEMORY_OFFSET,
                size: aie::PROGRAM_MEMORY_SIZE,
                rows,
            });
        }
        regions
    }

    fn scan_column(&self, hw: &Hardware, range: &Range, col: u32) -> Result<u32> {
        let abs_col = range.start.col + col;
        let shim = Location::new(abs_col, range.start.row);
        let both = aie::SHIMPL_CLKCNTR_COLBUF_MASK | aie::SHIMPL_CLKCNTR_NEXTCLK_MASK;
        if hw.read(shim, aie::SHIMPL_CLKCNTR_REGOFF) & both != both {
            return Ok(0);
        }

        let mut top = 1;
        for row in 1..range.size.rows - 1 {
            let loc = Location::new(abs_col, range.start.row + row);
            if hw.read(loc, aie::TILE_CORE_CLKCNTR_REGOFF) & aie::TILE_CLKCNTR_NEXTCLK_MASK == 0 {
                break;
            }
            top = row + 1;
        }
        Ok(top)
    }

    fn reconcile_column(
        &self,
        hw: &Hardware,
        range: &Range,
        tracker: &mut ClockGateTracker,
        col: u32,
    ) -> Result<()> {
        let abs_col = range.start.col + col;
        let in_use = tracker.top_in_use_row(col);
        let clocked = tracker.top_clock_row(col);

        if in_use < clocked {
            // Cutting NEXTCLK at the top in-use tile gates everything above.
            let loc = Location::new(abs_col, range.start.row + in_use);
            hw.write(loc, Self::clock_regoff(in_use), 0);
            tracker.set_clock_rows(col, in_use + 1, clocked, false)?;
            log::debug!("gated column {} rows {}..={}", abs_col, in_use + 1, clocked);
        } else if in_use > clocked {
            let value = aie::TILE_CLKCNTR_COLBUF_MASK | aie::TILE_CLKCNTR_NEXTCLK_MASK;
            for row in clocked..in_use {
                let loc = Location::new(abs_col, range.start.row + row);
                hw.write(loc, Self::clock_regoff(row), value);
            }
            // A stale NEXTCLK left by an earlier gate would clock the rows
            // above the new top.
            if in_use < range.size.rows - 1 {
                let top = Location::new(abs_col, range.start.row + in_use);
                hw.mask_write(top, aie::TILE_CORE_CLKCNTR_REGOFF, aie::TILE_CLKCNTR_NEXTCLK_MASK, 0);
            }
            tracker.set_clock_rows(col, clocked + 1, in_use, true)?;
            log::debug!("ungated column {} rows {}..={}", abs_col, clocked + 1, in_use);
        }
        Ok(())
    }
}

// ============================================================================
// AIE-ML
// ============================================================================

/// AIE-ML rules: one memory-tile row, clocks switched per column.
#[derive(Debug, Clone, Copy, Default)]
pub struct AiemlTileOps;

impl TileOperations for AiemlTileOps {
    fn classify(&self, loc: Location) -> TileKind {
        match loc.row {
            0 => shim_kind(loc.col),
            r if r <= aieml::NUM_MEM_TILE_ROWS => TileKind::MemoryTile,
            _ => TileKind::ArrayTile,
        }
    }

    fn memory_regions(&self, range: &Range) -> SmallVec<[MemoryRegion; 3]> {
        let mut regions = SmallVec::new();
        let array_start = 1 + aieml::NUM_MEM_TILE_ROWS;
        if let Some(rows) = row_span(range, 1, array_start) {
            regions.push(MemoryRegion {
                kind: MemoryKind::MemTileMemory,
                offset: 0,
                size: aieml::MEM_TILE_MEMORY_SIZE,
                rows,
            });
        }
        if let Some(rows) = row_span(range, array_start, u32::MAX) {
            regions.push(MemoryRegion {
                kind: MemoryKind::DataMemory,
                offset: 0,
                size: aieml::DATA_MEMORY_SIZE,
                rows,
            });
            regions.push(MemoryRegion {
                kind: MemoryKind::ProgramMemory,
                offset: aieml::PROGRAM_MEMORY_OFFSET,
                size: aieml::PROGRAM_MEMORY_SIZE,
                rows,
            });
        }
        regions
    }

    fn scan_column(&self, hw: &Hardware, range: &Range, col: u32) -> Result<u32> {
        let shim = Location::new(range.start.col + col, range.start.row);
        let value = hw.read(shim, aieml::SHIMPL_COLCLOCK_CTRL_REGOFF);
        Ok(if value & aieml::SHIMPL_COLCLOCK_CTRL_MASK != 0 {
            range.size.rows - 1
        } else {
            0
        })
    }

    fn reconcile_column(
        &self,
        hw: &Hardware,
        range: &Range,
        tracker: &mut ClockGateTracker,
        col: u32,
    ) -> Result<()> {
        let abs_col = range.start.col + col;
        let in_use = tracker.column_in_use(col);
        let clocked = tracker.top_clock_row(col) > 0;

        if in_use && !clocked {
            hw.reset.enable_column_clock_buffer(&range.column(abs_col))?;
            tracker.set_column_clock(col, true)?;
            log::debug!("enabled clock buffer of column {}", abs_col);
        } else if !in_use && clocked {
            hw.reset.disable_column_clock_buffer(&range.column(abs_col))?;
            tracker.set_column_clock(col, false)?;
            log::debug!("disabled clock buffer of column {}", abs_col);
        }
        Ok(())
    }
}
