//! Device models and register definitions for AI Engine arrays.
//!
//! This module provides:
//! - Grid coordinates and tile classification
//! - Register addressing and the register access capability
//! - Event, interrupt controller and resource tables per generation
//! - Column reset/clock primitives and their simulated backends
//!
//! # Architecture Overview
//!
//! An aperture is a grid of tiles addressed through one register window:
//!
//! ```text
//!     Col 0    Col 1    Col 2    Col 3    Col 4
//!   +--------+--------+--------+--------+--------+
//! 3 | Array  | Array  | Array  | Array  | Array  |
//!   +--------+--------+--------+--------+--------+
//! 2 | Array  | Array  | Array  | Array  | Array  |
//!   +--------+--------+--------+--------+--------+
//! 1 | Array  | Array  | Array  | Array  | Array  |  <- MemTile on AIE-ML
//!   +--------+--------+--------+--------+--------+
//! 0 | ShimPL | ShimPL | ShimNOC| ShimNOC| ShimPL |  <- col % 4 >= 2 has NOC
//!   +--------+--------+--------+--------+--------+
//! ```
//!
//! Everything generation-specific hangs off one static [`DeviceDescription`]
//! selected at attach time; the rest of the crate never matches on the
//! generation itself.
//!
//! # Example
//!
//! ```
//! use aie_partition::device::{DeviceGeneration, Location, TileKind};
//!
//! let device = DeviceGeneration::AieMl.description();
//! assert_eq!(device.ops.classify(Location::new(2, 0)), TileKind::ShimNoc);
//! assert_eq!(device.ops.classify(Location::new(0, 1)), TileKind::MemoryTile);
//! assert_eq!(device.layout.tile_offset(Location::new(1, 2), 0x10), 0x0220_0010);
//! ```

pub mod aie_spec;
pub mod arch_config;
pub mod catalog;
pub mod events;
pub mod geometry;
pub mod power;
pub mod registers;
pub mod sim;
pub mod tile;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{PartError, Result};

pub use arch_config::{AieTileOps, AiemlTileOps, MemoryKind, MemoryRegion, RowSpan, TileOperations};
pub use catalog::{ResourceCatalog, ResourceType, TileClass};
pub use events::{ErrorCategories, ErrorCategory, EventDomain, EventTables, RegField};
pub use geometry::{Location, Range, Size};
pub use power::{ColumnOp, Firmware, FirmwareReset, RegisterReset, ResetControl};
pub use registers::{mask_poll, RegisterIo, RegisterLayout, TileAddress};
pub use tile::{ModuleType, TileKind};

/// AI Engine silicon generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceGeneration {
    /// First generation: per-tile clock gating, register-driven resets.
    Aie,
    /// AIE-ML: memory-tile row, per-column clock control through firmware.
    AieMl,
}

impl DeviceGeneration {
    /// Static description of this generation.
    pub fn description(self) -> &'static DeviceDescription {
        match self {
            DeviceGeneration::Aie => &AIE_DEVICE,
            DeviceGeneration::AieMl => &AIEML_DEVICE,
        }
    }
}

impl fmt::Display for DeviceGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceGeneration::Aie => write!(f, "aie"),
            DeviceGeneration::AieMl => write!(f, "aieml"),
        }
    }
}

impl FromStr for DeviceGeneration {
    type Err = PartError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "aie" => Ok(DeviceGeneration::Aie),
            "aieml" | "aie-ml" | "aie2" => Ok(DeviceGeneration::AieMl),
            _ => Err(PartError::InvalidArgument("unknown device generation")),
        }
    }
}

/// Immutable per-generation device data.
#[derive(Debug)]
pub struct DeviceDescription {
    pub generation: DeviceGeneration,
    pub name: &'static str,
    pub layout: RegisterLayout,
    /// Shim register whose bits turn a column's clock buffer on.
    pub column_clock: RegField,
    /// Shim register whose bits hold a column in reset.
    pub column_reset: RegField,
    pub catalog: &'static ResourceCatalog,
    pub events: &'static EventTables,
    pub ops: &'static dyn TileOperations,
}

static AIE_OPS: AieTileOps = AieTileOps;
static AIEML_OPS: AiemlTileOps = AiemlTileOps;

pub static AIE_DEVICE: DeviceDescription = DeviceDescription {
    generation: DeviceGeneration::Aie,
    name: "AIE",
    layout: RegisterLayout {
        array_shift: aie_spec::aie::ARRAY_SHIFT,
        col_shift: aie_spec::aie::COL_SHIFT,
        row_shift: aie_spec::aie::ROW_SHIFT,
    },
    column_clock: RegField {
        mask: aie_spec::aie::SHIMPL_CLKCNTR_COLBUF_MASK,
        regoff: aie_spec::aie::SHIMPL_CLKCNTR_REGOFF,
    },
    column_reset: RegField {
        mask: aie_spec::aie::SHIMPL_COLRST_MASK,
        regoff: aie_spec::aie::SHIMPL_COLRESET_REGOFF,
    },
    catalog: &catalog::AIE_CATALOG,
    events: &events::AIE_EVENTS,
    ops: &AIE_OPS,
};

pub static AIEML_DEVICE: DeviceDescription = DeviceDescription {
    generation: DeviceGeneration::AieMl,
    name: "AIE-ML",
    layout: RegisterLayout {
        array_shift: aie_spec::aieml::ARRAY_SHIFT,
        col_shift: aie_spec::aieml::COL_SHIFT,
        row_shift: aie_spec::aieml::ROW_SHIFT,
    },
    column_clock: RegField {
        mask: aie_spec::aieml::SHIMPL_COLCLOCK_CTRL_MASK,
        regoff: aie_spec::aieml::SHIMPL_COLCLOCK_CTRL_REGOFF,
    },
    column_reset: RegField {
        mask: aie_spec::aieml::SHIMPL_COLRESET_CTRL_MASK,
        regoff: aie_spec::aieml::SHIMPL_COLRESET_CTRL_REGOFF,
    },
    catalog: &catalog::AIEML_CATALOG,
    events: &events::AIEML_EVENTS,
    ops: &AIEML_OPS,
};

/// Everything the partition core needs to touch one aperture's hardware.
#[derive(Debug, Clone)]
pub struct Hardware {
    pub device: &'static DeviceDescription,
    pub io: Arc<dyn RegisterIo>,
    pub reset: Arc<dyn ResetControl>,
    /// Read budget for every bounded register poll.
    pub poll_retries: u32,
}

impl Hardware {
    pub fn new(
        device: &'static DeviceDescription,
        io: Arc<dyn RegisterIo>,
        reset: Arc<dyn ResetControl>,
        poll_retries: u32,
    ) -> Self {
        Self {
            device,
            io,
            reset,
            poll_retries,
        }
    }

    /// Tile kind at an absolute location.
    #[inline]
    pub fn classify(&self, loc: Location) -> TileKind {
        self.device.ops.classify(loc)
    }

    /// Window offset of a tile register.
    #[inline]
    pub fn offset(&self, loc: Location, intile: u32) -> u64 {
        self.device.layout.tile_offset(loc, intile)
    }

    pub fn read(&self, loc: Location, intile: u32) -> u32 {
        self.io.read32(self.offset(loc, intile))
    }

    pub fn write(&self, loc: Location, intile: u32, value: u32) {
        self.io.write32(self.offset(loc, intile), value);
    }

    pub fn mask_write(&self, loc: Location, intile: u32, mask: u32, value: u32) {
        self.io.mask_write32(self.offset(loc, intile), mask, value);
    }

    /// Poll a tile register within the configured retry budget.
    pub fn poll(&self, loc: Location, intile: u32, mask: u32, expected: u32) -> Result<()> {
        mask_poll(self.io.as_ref(), self.offset(loc, intile), mask, expected, self.poll_retries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_parse() {
        assert_eq!("aie".parse::<DeviceGeneration>().unwrap(), DeviceGeneration::Aie);
        assert_eq!("AIEML".parse::<DeviceGeneration>().unwrap(), DeviceGeneration::AieMl);
        assert!("aie3".parse::<DeviceGeneration>().is_err());
        assert_eq!(DeviceGeneration::AieMl.to_string(), "aieml");
    }

    #[test]
    fn test_descriptions_are_consistent() {
        for generation in [DeviceGeneration::Aie, DeviceGeneration::AieMl] {
            let device = generation.description();
            assert_eq!(device.generation, generation);
            assert!(device.layout.col_shift > device.layout.row_shift);
            assert!(device.layout.max_intile() >= device.events.l1.regoff);
        }
        assert_eq!(AIE_DEVICE.layout.tile_offset(Location::new(1, 2), 0), 0x0088_0000);
        assert_eq!(AIEML_DEVICE.layout.tile_offset(Location::new(1, 2), 0), 0x0220_0000);
    }

    #[test]
    fn test_hardware_register_helpers() {
        let device = DeviceGeneration::Aie.description();
        let range = Range::new(0, 0, 4, 3);
        let (regs, hw) = sim::simulated_hardware(device, &range, 4);
        let loc = Location::new(3, 1);
        hw.write(loc, 0x100, 0xabcd);
        assert_eq!(regs.peek(hw.offset(loc, 0x100)), 0xabcd);
        hw.mask_write(loc, 0x100, 0xff, 0x12);
        assert_eq!(hw.read(loc, 0x100), 0xab12);
        assert!(hw.poll(loc, 0x100, 0xff, 0x12).is_ok());
        assert!(hw.poll(loc, 0x100, 0xff, 0x00).is_err());
    }
}
