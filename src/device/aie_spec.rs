//! AI Engine register and geometry constants, per device generation.
//!
//! Only the registers the partition core touches are listed: clock and
//! reset control in the shim and array tiles, the event blocks used for
//! error backtracking, and the level-1/level-2 interrupt controllers.

// ============================================================================
// Shared across generations
// ============================================================================

/// Columns per shim group; the first [`SHIM_PLAIN_PER_GROUP`] are plain.
pub const SHIM_GROUP_SIZE: u32 = 4;

/// Shim tiles with `col % SHIM_GROUP_SIZE` below this have no NOC access.
pub const SHIM_PLAIN_PER_GROUP: u32 = 2;

/// Level-1 IRQ id carrying array-tile error broadcasts.
pub const ARRAY_TILE_ERROR_BC_ID: u32 = 0;

/// Level-1 IRQ id carrying shim-tile errors.
pub const SHIM_TILE_ERROR_IRQ_ID: u32 = 16;

/// Level-2 status bits per level-1 controller, one per switch.
pub const L2_BITS_PER_COLUMN: u32 = 2;

// ============================================================================
// AIE (first generation)
// ============================================================================

pub mod aie {
    pub const ARRAY_SHIFT: u32 = 30;
    pub const COL_SHIFT: u32 = 23;
    pub const ROW_SHIFT: u32 = 18;

    /// Shim clock control: column buffer enable (bit 0), next-clock (bit 1).
    pub const SHIMPL_CLKCNTR_REGOFF: u32 = 0x0003_6040;
    pub const SHIMPL_CLKCNTR_COLBUF_MASK: u32 = 1 << 0;
    pub const SHIMPL_CLKCNTR_NEXTCLK_MASK: u32 = 1 << 1;

    /// Column reset control in the shim tile.
    pub const SHIMPL_COLRESET_REGOFF: u32 = 0x0003_6048;
    pub const SHIMPL_COLRST_MASK: u32 = 0x1;

    /// Array tile clock control; next-clock enables the tile above.
    pub const TILE_CORE_CLKCNTR_REGOFF: u32 = 0x0003_6040;
    pub const TILE_CLKCNTR_COLBUF_MASK: u32 = 1 << 0;
    pub const TILE_CLKCNTR_NEXTCLK_MASK: u32 = 1 << 1;

    pub const DATA_MEMORY_SIZE: u64 = 32 * 1024;
    pub const PROGRAM_MEMORY_OFFSET: u64 = 0x2_0000;
    pub const PROGRAM_MEMORY_SIZE: u64 = 16 * 1024;
}

// ============================================================================
// AIE-ML
// ============================================================================

pub mod aieml {
    pub const ARRAY_SHIFT: u32 = 32;
    pub const COL_SHIFT: u32 = 25;
    pub const ROW_SHIFT: u32 = 20;

    /// Memory tile rows directly above the shim row.
    pub const NUM_MEM_TILE_ROWS: u32 = 1;

    /// Whole-column clock buffer control in the shim tile.
    pub const SHIMPL_COLCLOCK_CTRL_REGOFF: u32 = 0x000f_ff20;
    pub const SHIMPL_COLCLOCK_CTRL_MASK: u32 = 0x3;

    /// Whole-column reset control in the shim tile.
    pub const SHIMPL_COLRESET_CTRL_REGOFF: u32 = 0x000f_ff28;
    pub const SHIMPL_COLRESET_CTRL_MASK: u32 = 0x3;

    pub const DATA_MEMORY_SIZE: u64 = 64 * 1024;
    pub const PROGRAM_MEMORY_OFFSET: u64 = 0x2_0000;
    pub const PROGRAM_MEMORY_SIZE: u64 = 16 * 1024;
    pub const MEM_TILE_MEMORY_SIZE: u64 = 512 * 1024;
}
