//! Register addressing and the register access capability.
//!
//! # Address Encoding
//!
//! Every tile register lives in one linear window per aperture:
//!
//! ```text
//! offset = (col << col_shift) | (row << row_shift) | intile
//!
//!   AIE     col_shift = 23, row_shift = 18, array_shift = 30
//!   AIE-ML  col_shift = 25, row_shift = 20, array_shift = 32
//! ```
//!
//! The shifts come from the [`DeviceDescription`](super::DeviceDescription),
//! so no caller hardcodes a generation's layout.

use std::fmt;

use crate::error::{PartError, Result};

use super::Location;

/// Per-generation linear addressing formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterLayout {
    pub array_shift: u32,
    pub col_shift: u32,
    pub row_shift: u32,
}

/// A register offset split back into tile and intra-tile parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileAddress {
    pub loc: Location,
    pub intile: u32,
}

impl RegisterLayout {
    /// Window offset of register `intile` in the tile at absolute `loc`.
    pub fn tile_offset(&self, loc: Location, intile: u32) -> u64 {
        (u64::from(loc.col) << self.col_shift)
            | (u64::from(loc.row) << self.row_shift)
            | u64::from(intile)
    }

    /// Split a window offset into tile location and intra-tile offset.
    pub fn decode(&self, offset: u64) -> TileAddress {
        let col_mask = (1u64 << (self.array_shift - self.col_shift)) - 1;
        let row_mask = (1u64 << (self.col_shift - self.row_shift)) - 1;
        let intile_mask = (1u64 << self.row_shift) - 1;
        TileAddress {
            loc: Location::new(
                ((offset >> self.col_shift) & col_mask) as u32,
                ((offset >> self.row_shift) & row_mask) as u32,
            ),
            intile: (offset & intile_mask) as u32,
        }
    }

    /// Largest intra-tile offset this layout can express.
    pub fn max_intile(&self) -> u32 {
        ((1u64 << self.row_shift) - 1) as u32
    }
}

impl fmt::Display for TileAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tile{} @ 0x{:05X}", self.loc, self.intile)
    }
}

/// Access to one aperture's register window.
///
/// Implemented by the memory-mapped window on real hardware and by
/// [`SimRegisters`](super::sim::SimRegisters) in tests and the CLI.
pub trait RegisterIo: Send + Sync + fmt::Debug {
    /// Read a 32-bit register.
    fn read32(&self, offset: u64) -> u32;

    /// Write a 32-bit register.
    fn write32(&self, offset: u64, value: u32);

    /// Read-modify-write the bits selected by `mask`.
    fn mask_write32(&self, offset: u64, mask: u32, value: u32) {
        let current = self.read32(offset);
        self.write32(offset, (current & !mask) | (value & mask));
    }
}

/// Poll until `read32(offset) & mask == expected`, giving up after
/// `retries` reads.
pub fn mask_poll(
    io: &dyn RegisterIo,
    offset: u64,
    mask: u32,
    expected: u32,
    retries: u32,
) -> Result<()> {
    for _ in 0..retries.max(1) {
        if io.read32(offset) & mask == expected {
            return Ok(());
        }
        std::hint::spin_loop();
    }
    log::warn!(
        "register 0x{:08x} never matched 0x{:08x}/0x{:08x}",
        offset,
        expected,
        mask
    );
    Err(PartError::Timeout { offset, retries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::SimRegisters;

    const AIE: RegisterLayout = RegisterLayout {
        array_shift: 30,
        col_shift: 23,
        row_shift: 18,
    };
    const AIEML: RegisterLayout = RegisterLayout {
        array_shift: 32,
        col_shift: 25,
        row_shift: 20,
    };

    #[test]
    fn test_tile_offset_aie() {
        let off = AIE.tile_offset(Location::new(2, 1), 0x36040);
        assert_eq!(off, (2 << 23) | (1 << 18) | 0x36040);
    }

    #[test]
    fn test_decode_inverts_offset() {
        for layout in [AIE, AIEML] {
            let loc = Location::new(37, 7);
            let addr = layout.decode(layout.tile_offset(loc, 0x14200));
            assert_eq!(addr.loc, loc);
            assert_eq!(addr.intile, 0x14200);
        }
    }

    #[test]
    fn test_aieml_offset_exceeds_32_bits() {
        let off = AIEML.tile_offset(Location::new(127, 0), 0);
        assert!(off > u64::from(u32::MAX) / 2);
        assert_eq!(AIEML.decode(off).loc.col, 127);
    }

    #[test]
    fn test_mask_write_preserves_other_bits() {
        let regs = SimRegisters::new();
        regs.write32(0x10, 0xf0);
        regs.mask_write32(0x10, 0x3, 0x1);
        assert_eq!(regs.read32(0x10), 0xf1);
    }

    #[test]
    fn test_mask_poll_timeout() {
        let regs = SimRegisters::new();
        assert!(mask_poll(&regs, 0x20, 0x1, 0x0, 4).is_ok());
        assert_eq!(
            mask_poll(&regs, 0x20, 0x1, 0x1, 4).unwrap_err(),
            PartError::Timeout {
                offset: 0x20,
                retries: 4
            }
        );
    }
}
