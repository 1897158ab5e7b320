//! Grid coordinates.
//!
//! A [`Location`] is either absolute (array frame) or relative to a
//! partition's origin. Nothing in the type records which; conversions go
//! through [`Range::to_local`] and [`Range::to_absolute`] so the frame change
//! is always explicit at the call site.

use std::fmt;

/// Column/row coordinate of a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Location {
    pub col: u32,
    pub row: u32,
}

impl Location {
    pub const fn new(col: u32, row: u32) -> Self {
        Self { col, row }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.col, self.row)
    }
}

/// Extent of a rectangular sub-grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Size {
    pub cols: u32,
    pub rows: u32,
}

/// Rectangular sub-grid: an aperture's full extent or a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Range {
    pub start: Location,
    pub size: Size,
}

impl Range {
    pub const fn new(start_col: u32, start_row: u32, cols: u32, rows: u32) -> Self {
        Self {
            start: Location::new(start_col, start_row),
            size: Size { cols, rows },
        }
    }

    /// One past the last column.
    pub fn end_col(&self) -> u32 {
        self.start.col + self.size.cols
    }

    /// One past the last row.
    pub fn end_row(&self) -> u32 {
        self.start.row + self.size.rows
    }

    /// Whether an absolute location lies inside this range.
    pub fn contains(&self, loc: Location) -> bool {
        loc.col >= self.start.col
            && loc.col < self.end_col()
            && loc.row >= self.start.row
            && loc.row < self.end_row()
    }

    /// Whether a local location lies inside this range's frame.
    pub fn contains_local(&self, loc: Location) -> bool {
        loc.col < self.size.cols && loc.row < self.size.rows
    }

    /// Whether the column spans of two ranges intersect.
    pub fn overlaps_columns(&self, other: &Range) -> bool {
        self.start.col < other.end_col() && other.start.col < self.end_col()
    }

    /// Absolute to local coordinates; `None` when outside the range.
    pub fn to_local(&self, loc: Location) -> Option<Location> {
        self.contains(loc)
            .then(|| Location::new(loc.col - self.start.col, loc.row - self.start.row))
    }

    /// Local to absolute coordinates; `None` when outside the range.
    pub fn to_absolute(&self, loc: Location) -> Option<Location> {
        self.contains_local(loc)
            .then(|| Location::new(loc.col + self.start.col, loc.row + self.start.row))
    }

    /// Every local location, column-major.
    pub fn local_tiles(&self) -> impl Iterator<Item = Location> + '_ {
        (0..self.size.cols)
            .flat_map(move |col| (0..self.size.rows).map(move |row| Location::new(col, row)))
    }

    /// Single-column sub-range at absolute column `col`, same rows.
    pub fn column(&self, col: u32) -> Range {
        Range::new(col, self.start.row, 1, self.size.rows)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cols {}..{} rows {}..{}",
            self.start.col,
            self.end_col(),
            self.start.row,
            self.end_row()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_conversions() {
        let range = Range::new(4, 0, 2, 5);
        let abs = Location::new(5, 3);
        let local = range.to_local(abs).unwrap();
        assert_eq!(local, Location::new(1, 3));
        assert_eq!(range.to_absolute(local), Some(abs));

        assert_eq!(range.to_local(Location::new(3, 0)), None);
        assert_eq!(range.to_absolute(Location::new(2, 0)), None);
        assert_eq!(range.to_absolute(Location::new(0, 5)), None);
    }

    #[test]
    fn test_column_overlap() {
        let a = Range::new(0, 0, 4, 5);
        let b = Range::new(2, 0, 2, 5);
        let c = Range::new(4, 0, 4, 5);
        assert!(a.overlaps_columns(&b));
        assert!(!a.overlaps_columns(&c));
        assert!(!c.overlaps_columns(&a));
    }

    #[test]
    fn test_local_tiles_order() {
        let range = Range::new(7, 0, 2, 2);
        let tiles: Vec<_> = range.local_tiles().collect();
        assert_eq!(
            tiles,
            vec![
                Location::new(0, 0),
                Location::new(0, 1),
                Location::new(1, 0),
                Location::new(1, 1)
            ]
        );
    }
}
