//! Static resource catalogs.
//!
//! For every tile kind and module, how many instances of each abstract
//! resource exist. The tables only size and index the per-partition
//! resource ledgers; nothing mutates them.

use std::fmt;

use super::tile::{ModuleType, TileKind};

/// Countable per-module hardware feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceType {
    PerfCounter,
    UserEvent,
    TraceControl,
    PcEvent,
    StreamSwitchSelect,
    Broadcast,
    ComboEvent,
    GroupEvent,
}

impl ResourceType {
    pub const COUNT: usize = 8;

    pub const ALL: [ResourceType; Self::COUNT] = [
        ResourceType::PerfCounter,
        ResourceType::UserEvent,
        ResourceType::TraceControl,
        ResourceType::PcEvent,
        ResourceType::StreamSwitchSelect,
        ResourceType::Broadcast,
        ResourceType::ComboEvent,
        ResourceType::GroupEvent,
    ];

    /// Position in catalog count arrays.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceType::PerfCounter => "perf-counter",
            ResourceType::UserEvent => "user-event",
            ResourceType::TraceControl => "trace-control",
            ResourceType::PcEvent => "pc-event",
            ResourceType::StreamSwitchSelect => "ss-port-select",
            ResourceType::Broadcast => "broadcast",
            ResourceType::ComboEvent => "combo-event",
            ResourceType::GroupEvent => "group-event",
        };
        f.write_str(name)
    }
}

/// Coarse tile class used to key resource ledgers. Both shim kinds share
/// one class since their modules are identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TileClass {
    Array,
    Memory,
    Shim,
}

impl From<TileKind> for TileClass {
    fn from(kind: TileKind) -> Self {
        match kind {
            TileKind::ArrayTile => TileClass::Array,
            TileKind::MemoryTile => TileClass::Memory,
            TileKind::ShimPlain | TileKind::ShimNoc => TileClass::Shim,
        }
    }
}

/// Resource counts of one module, indexed by [`ResourceType::index`].
#[derive(Debug, Clone, Copy)]
pub struct ModuleResources {
    pub module: ModuleType,
    pub counts: [u32; ResourceType::COUNT],
}

/// Resource counts for every tile class of a device generation.
#[derive(Debug)]
pub struct ResourceCatalog {
    pub array: &'static [ModuleResources],
    pub memory: &'static [ModuleResources],
    pub shim: &'static [ModuleResources],
}

impl ResourceCatalog {
    /// Modules with catalogued resources in a tile class.
    pub fn modules(&self, class: TileClass) -> &'static [ModuleResources] {
        match class {
            TileClass::Array => self.array,
            TileClass::Memory => self.memory,
            TileClass::Shim => self.shim,
        }
    }

    /// Instances of `rtype` in `module` of a tile of `class`; 0 if absent.
    pub fn count(&self, class: TileClass, module: ModuleType, rtype: ResourceType) -> u32 {
        self.modules(class)
            .iter()
            .find(|m| m.module == module)
            .map_or(0, |m| m.counts[rtype.index()])
    }
}

//                                  perf user trace pc  ss  bc combo group
const AIE_CORE: [u32; 8] = [4, 4, 1, 4, 8, 16, 4, 9];
const AIE_MEM: [u32; 8] = [2, 4, 1, 0, 0, 16, 4, 8];
const AIE_PL: [u32; 8] = [2, 4, 1, 0, 8, 16, 4, 7];
const AIEML_MEMTILE: [u32; 8] = [4, 2, 1, 0, 8, 16, 4, 9];
const AIEML_PL: [u32; 8] = [2, 2, 1, 0, 8, 16, 4, 6];

pub static AIE_CATALOG: ResourceCatalog = ResourceCatalog {
    array: &[
        ModuleResources { module: ModuleType::Core, counts: AIE_CORE },
        ModuleResources { module: ModuleType::Memory, counts: AIE_MEM },
    ],
    memory: &[],
    shim: &[ModuleResources { module: ModuleType::Pl, counts: AIE_PL }],
};

pub static AIEML_CATALOG: ResourceCatalog = ResourceCatalog {
    array: &[
        ModuleResources { module: ModuleType::Core, counts: AIE_CORE },
        ModuleResources { module: ModuleType::Memory, counts: AIE_MEM },
    ],
    memory: &[ModuleResources { module: ModuleType::Memory, counts: AIEML_MEMTILE }],
    shim: &[ModuleResources { module: ModuleType::Pl, counts: AIEML_PL }],
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aie_counts() {
        assert_eq!(AIE_CATALOG.count(TileClass::Array, ModuleType::Core, ResourceType::PcEvent), 4);
        assert_eq!(AIE_CATALOG.count(TileClass::Array, ModuleType::Memory, ResourceType::PcEvent), 0);
        assert_eq!(AIE_CATALOG.count(TileClass::Shim, ModuleType::Pl, ResourceType::GroupEvent), 7);
        assert_eq!(AIE_CATALOG.count(TileClass::Memory, ModuleType::Memory, ResourceType::Broadcast), 0);
    }

    #[test]
    fn test_aieml_counts() {
        assert_eq!(AIEML_CATALOG.count(TileClass::Memory, ModuleType::Memory, ResourceType::PerfCounter), 4);
        assert_eq!(AIEML_CATALOG.count(TileClass::Memory, ModuleType::Memory, ResourceType::UserEvent), 2);
        assert_eq!(AIEML_CATALOG.count(TileClass::Shim, ModuleType::Pl, ResourceType::UserEvent), 2);
        assert_eq!(AIEML_CATALOG.count(TileClass::Shim, ModuleType::Pl, ResourceType::GroupEvent), 6);
        assert_eq!(AIEML_CATALOG.count(TileClass::Shim, ModuleType::Core, ResourceType::Broadcast), 0);
    }

    #[test]
    fn test_tile_class_from_kind() {
        assert_eq!(TileClass::from(TileKind::ShimNoc), TileClass::Shim);
        assert_eq!(TileClass::from(TileKind::ShimPlain), TileClass::Shim);
        assert_eq!(TileClass::from(TileKind::MemoryTile), TileClass::Memory);
    }
}
