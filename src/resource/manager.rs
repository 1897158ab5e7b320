//! Per-partition ledgers for countable module resources.
//!
//! One pool exists for every (tile class, module, resource type) with a
//! non-zero catalog count. A pool has two parallel bitmaps covering every
//! tile of that class in the partition:
//!
//! ```text
//! bit = tile_index * per_tile + id
//! tile_index = col * class_rows + (row - class_first_row)
//!
//!   runtime   handed out to the partition's client
//!   reserved  held outside the allocator (firmware, static configuration)
//! ```
//!
//! An id is available iff it is clear in both. Releasing a partition clears
//! every runtime bit but leaves static reservations alone.

use std::collections::BTreeMap;

use crate::device::{
    Location, ModuleType, Range, ResourceCatalog, ResourceType, TileClass, TileOperations,
};
use crate::error::{PartError, Result};

use super::bitmap::{BitResource, IdList};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PoolKey {
    class: TileClass,
    module: ModuleType,
    rtype: ResourceType,
}

#[derive(Debug, Clone)]
struct Pool {
    per_tile: u32,
    first_row: u32,
    rows: u32,
    runtime: BitResource,
    reserved: BitResource,
}

/// Usage of one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceStat {
    pub class: TileClass,
    pub module: ModuleType,
    pub runtime: u32,
    pub reserved: u32,
    pub total: u32,
}

/// Resolved bitmap position of one tile module's resources.
#[derive(Debug, Clone, Copy)]
struct Slot {
    key: PoolKey,
    base: u32,
    per_tile: u32,
}

/// Runtime and static resource ledgers of one partition.
#[derive(Debug, Clone)]
pub struct ResourceManager {
    range: Range,
    ops: &'static dyn TileOperations,
    pools: BTreeMap<PoolKey, Pool>,
}

impl ResourceManager {
    /// Ledgers for every catalogued resource of the tiles in `range`.
    pub fn new(
        range: Range,
        catalog: &'static ResourceCatalog,
        ops: &'static dyn TileOperations,
    ) -> Result<Self> {
        let mut pools = BTreeMap::new();
        for class in [TileClass::Array, TileClass::Memory, TileClass::Shim] {
            let rows: Vec<u32> = (range.start.row..range.end_row())
                .filter(|&row| TileClass::from(ops.classify(Location::new(range.start.col, row))) == class)
                .collect();
            let (Some(&first_row), Some(&last_row)) = (rows.first(), rows.last()) else {
                continue;
            };
            let class_rows = last_row - first_row + 1;

            for module in catalog.modules(class) {
                for rtype in ResourceType::ALL {
                    let per_tile = module.counts[rtype.index()];
                    if per_tile == 0 {
                        continue;
                    }
                    let bits = range.size.cols * class_rows * per_tile;
                    pools.insert(
                        PoolKey {
                            class,
                            module: module.module,
                            rtype,
                        },
                        Pool {
                            per_tile,
                            first_row,
                            rows: class_rows,
                            runtime: BitResource::new(bits)?,
                            reserved: BitResource::new(bits)?,
                        },
                    );
                }
            }
        }
        Ok(Self { range, ops, pools })
    }

    fn slot(&self, loc: Location, module: ModuleType, rtype: ResourceType) -> Result<Slot> {
        let abs = self.range.to_absolute(loc).ok_or(PartError::InvalidLocation(loc))?;
        let kind = self.ops.classify(abs);
        if !kind.has_module(module) {
            return Err(PartError::InvalidArgument("module not present in tile"));
        }
        let key = PoolKey {
            class: TileClass::from(kind),
            module,
            rtype,
        };
        let pool = self
            .pools
            .get(&key)
            .ok_or(PartError::InvalidArgument("resource not present in module"))?;
        let tile_idx = loc.col * pool.rows + (abs.row - pool.first_row);
        Ok(Slot {
            key,
            base: tile_idx * pool.per_tile,
            per_tile: pool.per_tile,
        })
    }

    fn pool(&self, key: &PoolKey) -> Result<&Pool> {
        self.pools
            .get(key)
            .ok_or(PartError::InvalidArgument("resource not present in module"))
    }

    fn pool_mut(&mut self, key: &PoolKey) -> Result<&mut Pool> {
        self.pools
            .get_mut(key)
            .ok_or(PartError::InvalidArgument("resource not present in module"))
    }

    fn check_id(slot: &Slot, id: u32) -> Result<()> {
        if id < slot.per_tile {
            Ok(())
        } else {
            Err(PartError::OutOfRange {
                start: id,
                count: 1,
                total: slot.per_tile,
            })
        }
    }

    /// Instances of a resource type in one tile module.
    pub fn capacity(&self, loc: Location, module: ModuleType, rtype: ResourceType) -> Result<u32> {
        Ok(self.slot(loc, module, rtype)?.per_tile)
    }

    /// Take `count` free ids. With `aligned` the ids form one block whose
    /// first id is a multiple of `count`.
    pub fn request(
        &mut self,
        loc: Location,
        module: ModuleType,
        rtype: ResourceType,
        count: u32,
        aligned: bool,
    ) -> Result<IdList> {
        let slot = self.slot(loc, module, rtype)?;
        if count == 0 {
            return Err(PartError::InvalidArgument("zero resources requested"));
        }
        if count > slot.per_tile {
            return Err(PartError::NotAvailable);
        }
        let pool = self.pool_mut(&slot.key)?;

        let ids: IdList = if aligned {
            let start = pool.runtime.find_common_pattern_block(
                &pool.reserved,
                slot.base,
                slot.base + slot.per_tile,
                count,
            )?;
            pool.runtime.set(start, count)?;
            (start - slot.base..start - slot.base + count).collect()
        } else {
            pool.runtime
                .acquire_common_free(&pool.reserved, slot.base, count, slot.per_tile)?
                .into_iter()
                .map(|bit| bit - slot.base)
                .collect()
        };
        log::debug!("{} {} at {}: took {:?}", module, rtype, loc, ids.as_slice());
        Ok(ids)
    }

    /// Take one specific id.
    pub fn request_specific(
        &mut self,
        loc: Location,
        module: ModuleType,
        rtype: ResourceType,
        id: u32,
    ) -> Result<()> {
        let slot = self.slot(loc, module, rtype)?;
        Self::check_id(&slot, id)?;
        let pool = self.pool_mut(&slot.key)?;
        let bit = slot.base + id;
        if pool.runtime.test(bit) || pool.reserved.test(bit) {
            return Err(PartError::ResourceInUse { id });
        }
        pool.runtime.set(bit, 1)
    }

    /// Take the same aligned block of ids from the core and memory modules
    /// of one array tile.
    pub fn request_paired(&mut self, loc: Location, rtype: ResourceType, count: u32) -> Result<IdList> {
        let core = self.slot(loc, ModuleType::Core, rtype)?;
        let mem = self.slot(loc, ModuleType::Memory, rtype)?;
        if count == 0 {
            return Err(PartError::InvalidArgument("zero resources requested"));
        }
        let window = core.per_tile.min(mem.per_tile);
        if count > window {
            return Err(PartError::NotAvailable);
        }

        let core_pool = self.pool(&core.key)?;
        let mem_pool = self.pool(&mem.key)?;
        let mut core_taken = core_pool.runtime.union_window(&core_pool.reserved, core.base, window)?;
        let mut mem_taken = mem_pool.runtime.union_window(&mem_pool.reserved, mem.base, window)?;
        let start = core_taken.acquire_common_pattern_block(&mut mem_taken, 0, window, count)?;

        self.pool_mut(&core.key)?.runtime.set(core.base + start, count)?;
        self.pool_mut(&mem.key)?.runtime.set(mem.base + start, count)?;
        Ok((start..start + count).collect())
    }

    /// Return one id to the pool. Static reservations are untouched.
    pub fn release(&mut self, loc: Location, module: ModuleType, rtype: ResourceType, id: u32) -> Result<()> {
        let slot = self.slot(loc, module, rtype)?;
        Self::check_id(&slot, id)?;
        self.pool_mut(&slot.key)?.runtime.clear(slot.base + id, 1)
    }

    /// Clear one id in both ledgers.
    pub fn free(&mut self, loc: Location, module: ModuleType, rtype: ResourceType, id: u32) -> Result<()> {
        let slot = self.slot(loc, module, rtype)?;
        Self::check_id(&slot, id)?;
        let pool = self.pool_mut(&slot.key)?;
        pool.runtime.clear(slot.base + id, 1)?;
        pool.reserved.clear(slot.base + id, 1)
    }

    /// Reserve one id outside the runtime allocator.
    pub fn set_static(&mut self, loc: Location, module: ModuleType, rtype: ResourceType, id: u32) -> Result<()> {
        let slot = self.slot(loc, module, rtype)?;
        Self::check_id(&slot, id)?;
        let pool = self.pool_mut(&slot.key)?;
        if pool.runtime.test(slot.base + id) {
            return Err(PartError::ResourceInUse { id });
        }
        pool.reserved.set(slot.base + id, 1)
    }

    /// Ids of a tile module that are free in both ledgers.
    pub fn check_available(&self, loc: Location, module: ModuleType, rtype: ResourceType) -> Result<u32> {
        let slot = self.slot(loc, module, rtype)?;
        let pool = self.pool(&slot.key)?;
        pool.runtime.count_common_free(&pool.reserved, slot.base, slot.per_tile)
    }

    /// Reserve the lowest broadcast id free in every listed tile module.
    pub fn request_broadcast(&mut self, modules: &[(Location, ModuleType)]) -> Result<u32> {
        if modules.is_empty() {
            return Err(PartError::InvalidArgument("no modules to broadcast between"));
        }
        let slots = modules
            .iter()
            .map(|&(loc, module)| self.slot(loc, module, ResourceType::Broadcast))
            .collect::<Result<Vec<_>>>()?;
        let window = slots.iter().map(|s| s.per_tile).min().unwrap_or(0);

        let mut chosen = None;
        'ids: for id in 0..window {
            for slot in &slots {
                let pool = self.pool(&slot.key)?;
                let bit = slot.base + id;
                if pool.runtime.test(bit) || pool.reserved.test(bit) {
                    continue 'ids;
                }
            }
            chosen = Some(id);
            break;
        }
        let id = chosen.ok_or(PartError::NotAvailable)?;

        for slot in &slots {
            self.pool_mut(&slot.key)?.runtime.set(slot.base + id, 1)?;
        }
        log::debug!("broadcast {} across {} modules", id, slots.len());
        Ok(id)
    }

    /// Usage of `rtype` per tile class and module.
    pub fn statistics(&self, rtype: ResourceType) -> Vec<ResourceStat> {
        self.pools
            .iter()
            .filter(|(key, _)| key.rtype == rtype)
            .map(|(key, pool)| ResourceStat {
                class: key.class,
                module: key.module,
                runtime: pool.runtime.count_ones(),
                reserved: pool.reserved.count_ones(),
                total: pool.runtime.total(),
            })
            .collect()
    }

    /// Drop every runtime allocation.
    pub fn reset_runtime(&mut self) {
        for pool in self.pools.values_mut() {
            pool.runtime.clear_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceGeneration;

    fn aie_manager(cols: u32, rows: u32) -> ResourceManager {
        let device = DeviceGeneration::Aie.description();
        ResourceManager::new(Range::new(4, 0, cols, rows), device.catalog, device.ops).unwrap()
    }

    #[test]
    fn test_request_and_release() {
        let mut rm = aie_manager(2, 3);
        let tile = Location::new(1, 2);
        let ids = rm.request(tile, ModuleType::Core, ResourceType::PerfCounter, 3, false).unwrap();
        assert_eq!(ids.as_slice(), &[0, 1, 2]);
        assert_eq!(rm.check_available(tile, ModuleType::Core, ResourceType::PerfCounter).unwrap(), 1);
        assert_eq!(
            rm.request(tile, ModuleType::Core, ResourceType::PerfCounter, 2, false).unwrap_err(),
            PartError::NotAvailable
        );

        rm.release(tile, ModuleType::Core, ResourceType::PerfCounter, 1).unwrap();
        let ids = rm.request(tile, ModuleType::Core, ResourceType::PerfCounter, 2, false).unwrap();
        assert_eq!(ids.as_slice(), &[1, 3]);

        // Other tiles have their own ledgers.
        let other = Location::new(0, 2);
        assert_eq!(rm.check_available(other, ModuleType::Core, ResourceType::PerfCounter).unwrap(), 4);
    }

    #[test]
    fn test_aligned_request_skips_partial_blocks() {
        let mut rm = aie_manager(1, 2);
        let tile = Location::new(0, 1);
        rm.request_specific(tile, ModuleType::Memory, ResourceType::Broadcast, 1).unwrap();
        let ids = rm.request(tile, ModuleType::Memory, ResourceType::Broadcast, 4, true).unwrap();
        assert_eq!(ids.as_slice(), &[4, 5, 6, 7]);
        let ids = rm.request(tile, ModuleType::Memory, ResourceType::Broadcast, 2, true).unwrap();
        assert_eq!(ids.as_slice(), &[2, 3]);
    }

    #[test]
    fn test_static_reservations() {
        let mut rm = aie_manager(1, 2);
        let shim = Location::new(0, 0);
        rm.set_static(shim, ModuleType::Pl, ResourceType::UserEvent, 0).unwrap();
        assert_eq!(
            rm.request_specific(shim, ModuleType::Pl, ResourceType::UserEvent, 0).unwrap_err(),
            PartError::ResourceInUse { id: 0 }
        );
        let ids = rm.request(shim, ModuleType::Pl, ResourceType::UserEvent, 1, false).unwrap();
        assert_eq!(ids.as_slice(), &[1]);
        assert_eq!(
            rm.set_static(shim, ModuleType::Pl, ResourceType::UserEvent, 1).unwrap_err(),
            PartError::ResourceInUse { id: 1 }
        );

        rm.reset_runtime();
        assert_eq!(rm.check_available(shim, ModuleType::Pl, ResourceType::UserEvent).unwrap(), 3);
        rm.free(shim, ModuleType::Pl, ResourceType::UserEvent, 0).unwrap();
        assert_eq!(rm.check_available(shim, ModuleType::Pl, ResourceType::UserEvent).unwrap(), 4);
    }

    #[test]
    fn test_rejects_missing_modules_and_resources() {
        let mut rm = aie_manager(1, 2);
        assert_eq!(
            rm.request(Location::new(0, 0), ModuleType::Core, ResourceType::PerfCounter, 1, false)
                .unwrap_err(),
            PartError::InvalidArgument("module not present in tile")
        );
        assert_eq!(
            rm.request(Location::new(0, 1), ModuleType::Memory, ResourceType::PcEvent, 1, false)
                .unwrap_err(),
            PartError::InvalidArgument("resource not present in module")
        );
        assert_eq!(
            rm.request(Location::new(1, 1), ModuleType::Core, ResourceType::PcEvent, 1, false)
                .unwrap_err(),
            PartError::InvalidLocation(Location::new(1, 1))
        );
        assert!(rm.release(Location::new(0, 1), ModuleType::Core, ResourceType::PcEvent, 4).is_err());
    }

    #[test]
    fn test_paired_request_matches_both_modules() {
        let mut rm = aie_manager(1, 2);
        let tile = Location::new(0, 1);
        rm.request_specific(tile, ModuleType::Core, ResourceType::ComboEvent, 0).unwrap();
        rm.request_specific(tile, ModuleType::Memory, ResourceType::ComboEvent, 3).unwrap();
        assert_eq!(
            rm.request_paired(tile, ResourceType::ComboEvent, 2).unwrap_err(),
            PartError::NotAvailable
        );
        assert_eq!(rm.request_paired(tile, ResourceType::ComboEvent, 1).unwrap().as_slice(), &[1]);
        assert_eq!(rm.check_available(tile, ModuleType::Memory, ResourceType::ComboEvent).unwrap(), 2);
    }

    #[test]
    fn test_broadcast_common_id() {
        let mut rm = aie_manager(2, 3);
        let a = (Location::new(0, 1), ModuleType::Core);
        let b = (Location::new(1, 2), ModuleType::Memory);
        let c = (Location::new(1, 0), ModuleType::Pl);
        rm.request_specific(a.0, a.1, ResourceType::Broadcast, 0).unwrap();
        rm.set_static(b.0, b.1, ResourceType::Broadcast, 1).unwrap();
        assert_eq!(rm.request_broadcast(&[a, b, c]).unwrap(), 2);
        assert_eq!(rm.request_broadcast(&[c]).unwrap(), 0);
        assert!(rm.request_broadcast(&[]).is_err());
    }

    #[test]
    fn test_statistics_and_aieml_memtile() {
        let device = DeviceGeneration::AieMl.description();
        let mut rm = ResourceManager::new(Range::new(0, 0, 2, 4), device.catalog, device.ops).unwrap();
        let memtile = Location::new(1, 1);
        rm.request(memtile, ModuleType::Memory, ResourceType::PerfCounter, 2, false).unwrap();
        rm.set_static(Location::new(0, 1), ModuleType::Memory, ResourceType::PerfCounter, 3).unwrap();

        let stats = rm.statistics(ResourceType::PerfCounter);
        let mem = stats
            .iter()
            .find(|s| s.class == TileClass::Memory)
            .unwrap();
        assert_eq!((mem.runtime, mem.reserved, mem.total), (2, 1, 8));
        let core = stats
            .iter()
            .find(|s| s.class == TileClass::Array && s.module == ModuleType::Core)
            .unwrap();
        assert_eq!(core.total, 2 * 2 * 4);
    }
}
