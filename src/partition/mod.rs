//! Partitions: contiguous column ranges handed to one client.
//!
//! A [`Partition`] owns its tile-usage and clock bookkeeping, its resource
//! ledgers and its cached error events, all behind one cancellable lock.
//! Clients hold a [`PartitionHandle`], a weak reference that fails with
//! `PartitionGone` once the partition is destroyed.
//!
//! # Lifecycle
//!
//! ```text
//!   request_partition      mark_in_use         release
//!  -------------------> Idle ---------> InUse ---------> Released
//!                        |                ^                 |
//!                        |                +-----------------+
//!                        |                    mark_in_use
//!                        +--------- destroy <----------------+
//! ```
//!
//! Locking order is aperture before partition; nothing here takes the
//! aperture lock.

pub mod clock;
pub mod errors;

use std::fmt;
use std::sync::{Arc, MutexGuard, Weak};

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::device::{
    ErrorCategories, EventDomain, Hardware, Location, MemoryRegion, ModuleType, Range,
    ResourceType,
};
use crate::error::{PartError, Result};
use crate::interrupt::{self, Switch, WorkQueue};
use crate::resource::{IdList, ResourceManager};
use crate::sync::{CancelToken, CancellableMutex};

pub use clock::ClockGateTracker;
pub use errors::{ErrorCallback, ErrorState, TileError};

/// Where a partition is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionState {
    /// Created, never handed out or handed out and returned before use.
    Idle,
    /// Handed out to a client.
    InUse,
    /// Returned by its client; may be handed out again or destroyed.
    Released,
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionState::Idle => write!(f, "idle"),
            PartitionState::InUse => write!(f, "in-use"),
            PartitionState::Released => write!(f, "released"),
        }
    }
}

bitflags! {
    /// Status flags of a partition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PartitionStatus: u32 {
        const IN_USE = 1 << 0;
        /// Client enabled the shim bridge to the programmable logic.
        const BRIDGE_ENABLED = 1 << 1;
    }
}

/// Mutable state of a live partition.
#[derive(Debug)]
pub(crate) struct PartitionInner {
    pub(crate) state: PartitionState,
    pub(crate) status: PartitionStatus,
    pub(crate) clock: ClockGateTracker,
    pub(crate) resources: ResourceManager,
    pub(crate) errors: ErrorState,
}

/// Outcome of routing one level-1 line to its partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LineOutcome {
    /// Partition is not in use; the error is left pending.
    Deferred,
    /// Backtracked; `pending` reports level-1 status still set afterwards.
    Handled { pending: bool },
}

/// A contiguous column range of the aperture.
pub struct Partition {
    id: u32,
    range: Range,
    hw: Arc<Hardware>,
    queue: WorkQueue,
    reset_on_release: bool,
    inner: CancellableMutex<Option<PartitionInner>>,
}

impl fmt::Debug for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partition")
            .field("id", &self.id)
            .field("range", &self.range)
            .field("device", &self.hw.device.name)
            .finish_non_exhaustive()
    }
}

impl Partition {
    /// Build a partition over `range` and read its clock state from
    /// hardware. Clocked tiles found here count as in use.
    pub(crate) fn new(
        id: u32,
        range: Range,
        hw: Arc<Hardware>,
        queue: WorkQueue,
        reset_on_release: bool,
    ) -> Result<Self> {
        let device = hw.device;
        let mut clock = ClockGateTracker::new(range.size.cols, range.size.rows)?;
        device.ops.scan_clocks(&hw, &range, &mut clock)?;
        let resources = ResourceManager::new(range, device.catalog, device.ops)?;
        let errors = ErrorState::new(range.size.cols, range.size.rows, device.events)?;

        Ok(Self {
            id,
            range,
            hw,
            queue,
            reset_on_release,
            inner: CancellableMutex::new(Some(PartitionInner {
                state: PartitionState::Idle,
                status: PartitionStatus::empty(),
                clock,
                resources,
                errors,
            })),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Absolute tile range.
    pub fn range(&self) -> Range {
        self.range
    }

    fn lock(&self, cancel: &CancelToken) -> Result<MutexGuard<'_, Option<PartitionInner>>> {
        self.inner.lock(cancel)
    }

    fn with_inner<R>(
        &self,
        cancel: &CancelToken,
        f: impl FnOnce(&mut PartitionInner) -> Result<R>,
    ) -> Result<R> {
        let mut guard = self.lock(cancel)?;
        let inner = guard.as_mut().ok_or(PartError::PartitionGone(self.id))?;
        f(inner)
    }

    fn absolute(&self, loc: Location) -> Result<Location> {
        self.range.to_absolute(loc).ok_or(PartError::InvalidLocation(loc))
    }

    pub fn state(&self, cancel: &CancelToken) -> Result<PartitionState> {
        self.with_inner(cancel, |inner| Ok(inner.state))
    }

    pub fn status(&self, cancel: &CancelToken) -> Result<PartitionStatus> {
        self.with_inner(cancel, |inner| Ok(inner.status))
    }

    // ========================================================================
    // Tiles and clocks
    // ========================================================================

    fn update_tiles(
        &self,
        cancel: &CancelToken,
        locs: &[Location],
        in_use: bool,
    ) -> Result<usize> {
        let all: Vec<Location>;
        let locs = if locs.is_empty() {
            all = self.range.local_tiles().collect();
            &all[..]
        } else {
            locs
        };
        for &loc in locs {
            self.absolute(loc)?;
        }

        self.with_inner(cancel, |inner| {
            for &loc in locs {
                let abs = self.absolute(loc)?;
                if !self.hw.classify(abs).is_gateable() {
                    continue;
                }
                if in_use {
                    inner.clock.mark_in_use(loc)?;
                } else {
                    inner.clock.mark_released(loc)?;
                }
            }
            self.hw
                .device
                .ops
                .reconcile_clocks(&self.hw, &self.range, &mut inner.clock)?;
            Ok(locs.len())
        })
    }

    /// Claim tiles (partition-local) and ungate their clocks. An empty list
    /// claims every tile. Returns the number of tiles named.
    pub fn request_tiles(&self, cancel: &CancelToken, locs: &[Location]) -> Result<usize> {
        let count = self.update_tiles(cancel, locs, true)?;
        log::debug!("partition {}: requested {} tiles", self.id, count);
        Ok(count)
    }

    /// Drop tile claims and gate whatever clocks are no longer needed. An
    /// empty list releases every tile. Returns the number of tiles named.
    pub fn release_tiles(&self, cancel: &CancelToken, locs: &[Location]) -> Result<usize> {
        let count = self.update_tiles(cancel, locs, false)?;
        log::debug!("partition {}: released {} tiles", self.id, count);
        Ok(count)
    }

    /// Whether registers of a partition-local tile may be accessed.
    pub fn is_tile_enabled(&self, cancel: &CancelToken, loc: Location) -> Result<bool> {
        let abs = self.absolute(loc)?;
        if !self.hw.classify(abs).is_gateable() {
            return Ok(true);
        }
        self.with_inner(cancel, |inner| Ok(inner.clock.is_enabled(loc)))
    }

    fn check_access(&self, inner: &PartitionInner, loc: Location, intile: u32) -> Result<Location> {
        let abs = self.absolute(loc)?;
        if intile > self.hw.device.layout.max_intile() {
            return Err(PartError::InvalidArgument("register offset outside tile"));
        }
        if self.hw.classify(abs).is_gateable() && !inner.clock.is_enabled(loc) {
            return Err(PartError::TileGated(abs));
        }
        Ok(abs)
    }

    /// Read a register of a partition-local tile.
    pub fn read_register(&self, cancel: &CancelToken, loc: Location, intile: u32) -> Result<u32> {
        self.with_inner(cancel, |inner| {
            let abs = self.check_access(inner, loc, intile)?;
            Ok(self.hw.read(abs, intile))
        })
    }

    pub fn write_register(
        &self,
        cancel: &CancelToken,
        loc: Location,
        intile: u32,
        value: u32,
    ) -> Result<()> {
        self.with_inner(cancel, |inner| {
            let abs = self.check_access(inner, loc, intile)?;
            self.hw.write(abs, intile, value);
            Ok(())
        })
    }

    /// Wait for `(reg & mask) == expected` within the hardware retry budget.
    pub fn poll_register(
        &self,
        cancel: &CancelToken,
        loc: Location,
        intile: u32,
        mask: u32,
        expected: u32,
    ) -> Result<()> {
        self.with_inner(cancel, |inner| {
            let abs = self.check_access(inner, loc, intile)?;
            self.hw.poll(abs, intile, mask, expected)
        })
    }

    /// Memory windows a client may map for this partition.
    pub fn memory_regions(&self) -> SmallVec<[MemoryRegion; 3]> {
        self.hw.device.ops.memory_regions(&self.range)
    }

    pub fn set_bridge_enabled(&self, cancel: &CancelToken, enabled: bool) -> Result<()> {
        self.with_inner(cancel, |inner| {
            inner.status.set(PartitionStatus::BRIDGE_ENABLED, enabled);
            Ok(())
        })
    }

    // ========================================================================
    // Resources
    // ========================================================================

    /// Run `f` against the partition's resource ledgers.
    pub fn resources<R>(
        &self,
        cancel: &CancelToken,
        f: impl FnOnce(&mut ResourceManager) -> Result<R>,
    ) -> Result<R> {
        self.with_inner(cancel, |inner| f(&mut inner.resources))
    }

    pub fn request_resource(
        &self,
        cancel: &CancelToken,
        loc: Location,
        module: ModuleType,
        rtype: ResourceType,
        count: u32,
        aligned: bool,
    ) -> Result<IdList> {
        self.resources(cancel, |rm| rm.request(loc, module, rtype, count, aligned))
    }

    pub fn release_resource(
        &self,
        cancel: &CancelToken,
        loc: Location,
        module: ModuleType,
        rtype: ResourceType,
        id: u32,
    ) -> Result<()> {
        self.resources(cancel, |rm| rm.release(loc, module, rtype, id))
    }

    /// Free instances of a resource in one tile module.
    pub fn check_resource_available(
        &self,
        cancel: &CancelToken,
        loc: Location,
        module: ModuleType,
        rtype: ResourceType,
    ) -> Result<u32> {
        self.resources(cancel, |rm| rm.check_available(loc, module, rtype))
    }

    // ========================================================================
    // Errors
    // ========================================================================

    /// Every cached error event, memory modules first.
    pub fn errors(&self, cancel: &CancelToken) -> Result<Vec<TileError>> {
        self.with_inner(cancel, |inner| Ok(inner.errors.errors(&self.range)))
    }

    pub fn error_categories(&self, cancel: &CancelToken) -> Result<ErrorCategories> {
        self.with_inner(cancel, |inner| Ok(inner.errors.categories(&self.range)))
    }

    /// Catalog name of an error event of `module`.
    pub fn error_name(&self, module: ModuleType, event: u32) -> Option<&'static str> {
        let tables = self.hw.device.events;
        EventDomain::ALL
            .into_iter()
            .filter(|domain| domain.module() == module)
            .find_map(|domain| tables.classify(domain, event))
            .map(|(_, name)| name)
    }

    pub fn clear_cached_errors(&self, cancel: &CancelToken) -> Result<()> {
        self.with_inner(cancel, |inner| {
            inner.errors.clear();
            Ok(())
        })
    }

    /// Install the error notification hook. Errors recorded before the hook
    /// existed are reported through it from the next deferred backtrack.
    pub fn register_error_callback(
        &self,
        cancel: &CancelToken,
        callback: impl Fn(u32) + Send + Sync + 'static,
    ) -> Result<()> {
        let pending = self.with_inner(cancel, |inner| {
            inner.errors.set_callback(Arc::new(callback))?;
            Ok(inner.errors.error_to_report)
        })?;
        if pending {
            self.queue.schedule();
        }
        Ok(())
    }

    pub fn unregister_error_callback(&self, cancel: &CancelToken) -> Result<()> {
        self.with_inner(cancel, |inner| {
            inner.errors.clear_callback();
            Ok(())
        })
    }

    // ========================================================================
    // Aperture-driven transitions
    // ========================================================================

    /// Hand the partition to a client. Returns whether errors are waiting
    /// to be reported.
    pub(crate) fn mark_in_use(&self, cancel: &CancelToken) -> Result<bool> {
        self.with_inner(cancel, |inner| {
            if inner.state == PartitionState::InUse {
                return Err(PartError::AlreadyInUse);
            }
            inner.state = PartitionState::InUse;
            inner.status.insert(PartitionStatus::IN_USE);
            Ok(inner.errors.error_to_report)
        })
    }

    /// Take the partition back from its client: drop every tile claim, gate
    /// the clocks, reset runtime resources and optionally reset the columns.
    ///
    /// Only a partition that is not in use is rejected untouched. Once the
    /// transition starts it always completes in software; a failing clock or
    /// reset step is reported after the partition is already `Released`.
    pub(crate) fn release(&self, cancel: &CancelToken, reset: bool) -> Result<()> {
        self.with_inner(cancel, |inner| {
            if inner.state != PartitionState::InUse {
                return Err(PartError::InvalidArgument("partition is not in use"));
            }
            inner.status.remove(PartitionStatus::IN_USE | PartitionStatus::BRIDGE_ENABLED);
            inner.state = PartitionState::Released;
            inner.clock.release_all();
            inner.resources.reset_runtime();

            let gated = self
                .hw
                .device
                .ops
                .reconcile_clocks(&self.hw, &self.range, &mut inner.clock);
            let reset = if reset || self.reset_on_release {
                self.hw
                    .reset
                    .assert_column_reset(&self.range)
                    .and_then(|()| self.hw.reset.release_column_reset(&self.range))
            } else {
                Ok(())
            };
            if let Err(e) = gated.as_ref().and(reset.as_ref()) {
                log::warn!("partition {}: released with hardware error: {}", self.id, e);
            }
            gated.and(reset)
        })
    }

    /// Detach the partition's state for destruction. Fails while in use.
    pub(crate) fn take_inner(&self, cancel: &CancelToken) -> Result<PartitionInner> {
        let mut guard = self.lock(cancel)?;
        let busy = match guard.as_ref() {
            None => return Err(PartError::PartitionGone(self.id)),
            Some(inner) => inner.state == PartitionState::InUse,
        };
        if busy {
            return Err(PartError::PartitionBusy(self.id));
        }
        guard.take().ok_or(PartError::PartitionGone(self.id))
    }

    /// Route a level-1 line of absolute column `col` into this partition.
    pub(crate) fn backtrack_line(
        &self,
        cancel: &CancelToken,
        col: u32,
        sw: Switch,
    ) -> Result<LineOutcome> {
        self.with_inner(cancel, |inner| {
            if inner.state != PartitionState::InUse {
                inner.errors.error_to_report = true;
                return Ok(LineOutcome::Deferred);
            }
            if interrupt::backtrack_column(&self.hw, &self.range, &inner.clock, &mut inner.errors, col, sw)? {
                inner.errors.error_to_report = true;
            }
            Ok(LineOutcome::Handled {
                pending: interrupt::l1_status(&self.hw, &self.range, col, sw) != 0,
            })
        })
    }

    /// Hook to run for a pending report, if the partition is in use and has
    /// one installed.
    pub(crate) fn take_notification(&self, cancel: &CancelToken) -> Result<Option<ErrorCallback>> {
        let mut guard = self.lock(cancel)?;
        Ok(guard
            .as_mut()
            .filter(|inner| inner.state == PartitionState::InUse)
            .and_then(|inner| inner.errors.take_notification()))
    }
}

/// Weak client reference to a partition.
#[derive(Debug, Clone)]
pub struct PartitionHandle {
    id: u32,
    range: Range,
    partition: Weak<Partition>,
}

impl PartitionHandle {
    pub(crate) fn new(partition: &Arc<Partition>) -> Self {
        Self {
            id: partition.id,
            range: partition.range,
            partition: Arc::downgrade(partition),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn range(&self) -> Range {
        self.range
    }

    /// Upgrade to the live partition.
    pub fn get(&self) -> Result<Arc<Partition>> {
        self.partition.upgrade().ok_or(PartError::PartitionGone(self.id))
    }
}
