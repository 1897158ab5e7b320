//! Tile kinds and the hardware modules they carry.
//!
//! A tile is never stored as an object. It is the pair `(Location, TileKind)`
//! derived on demand from the device's row layout and shim NOC rule.
//!
//! ```text
//!   row N  ArrayTile   core + memory modules, clock gated per tile (AIE)
//!   ...
//!   row 1  MemoryTile  memory module only (AIE-ML), or first ArrayTile (AIE)
//!   row 0  Shim        PL module; NOC-capable when col % 4 >= 2
//! ```

use std::fmt;

/// Kind of a tile, fixed by its location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileKind {
    /// Compute tile with core and data memory.
    ArrayTile,
    /// Shared memory tile (AIE-ML only).
    MemoryTile,
    /// Shim tile without NOC access.
    ShimPlain,
    /// Shim tile with NOC access; hosts a level-2 interrupt controller.
    ShimNoc,
}

impl TileKind {
    /// Check if this is either shim kind.
    #[inline]
    pub fn is_shim(self) -> bool {
        matches!(self, TileKind::ShimPlain | TileKind::ShimNoc)
    }

    /// Whether the tile has a clock-gate bit of its own.
    #[inline]
    pub fn is_gateable(self) -> bool {
        !self.is_shim()
    }

    /// Hardware modules present in this kind of tile.
    pub fn modules(self) -> &'static [ModuleType] {
        match self {
            TileKind::ArrayTile => &[ModuleType::Core, ModuleType::Memory],
            TileKind::MemoryTile => &[ModuleType::Memory],
            TileKind::ShimPlain | TileKind::ShimNoc => &[ModuleType::Pl],
        }
    }

    /// Check if the module exists in this kind of tile.
    pub fn has_module(self, module: ModuleType) -> bool {
        self.modules().contains(&module)
    }
}

impl fmt::Display for TileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TileKind::ArrayTile => write!(f, "Array"),
            TileKind::MemoryTile => write!(f, "MemTile"),
            TileKind::ShimPlain => write!(f, "ShimPL"),
            TileKind::ShimNoc => write!(f, "ShimNOC"),
        }
    }
}

/// Module within a tile that owns events and countable resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModuleType {
    Core,
    Memory,
    Pl,
}

impl fmt::Display for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleType::Core => write!(f, "core"),
            ModuleType::Memory => write!(f, "memory"),
            ModuleType::Pl => write!(f, "pl"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_kind_modules() {
        assert!(TileKind::ArrayTile.has_module(ModuleType::Core));
        assert!(TileKind::ArrayTile.has_module(ModuleType::Memory));
        assert!(!TileKind::MemoryTile.has_module(ModuleType::Core));
        assert_eq!(TileKind::ShimNoc.modules(), &[ModuleType::Pl]);
    }

    #[test]
    fn test_shims_are_not_gateable() {
        assert!(!TileKind::ShimPlain.is_gateable());
        assert!(!TileKind::ShimNoc.is_gateable());
        assert!(TileKind::MemoryTile.is_gateable());
        assert!(TileKind::ArrayTile.is_gateable());
    }
}
