//! Apertures: the column allocator and interrupt owner of one register
//! window.
//!
//! An [`Aperture`] hands out disjoint column ranges as partitions, keeps the
//! L2 interrupt masks in step with which partitions are in use, and runs
//! error backtracking, either inline through [`Aperture::flush_errors`] and
//! [`Aperture::run_pending_work`] or on an [`ApertureWorker`] thread fed by
//! [`Aperture::interrupt_top_half`].
//!
//! Lock order is aperture state first, then any partition. Error callbacks
//! run after every lock is dropped.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::device::sim::{simulated_hardware, SimRegisters};
use crate::device::{DeviceDescription, Hardware, Location, Range};
use crate::error::{PartError, Result};
use crate::interrupt::{self, l2_regoff, L2Routing, Switch, WorkQueue};
use crate::partition::{ErrorCallback, LineOutcome, Partition, PartitionHandle, PartitionState};
use crate::resource::BitResource;
use crate::sync::{CancelToken, CancellableMutex};

/// How long the worker waits for work before rechecking its stop flag.
const WORKER_POLL: Duration = Duration::from_millis(10);

/// Tunables of an aperture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApertureSettings {
    /// Capacity of the deferred-work queue.
    pub queue_depth: usize,
    /// Reset a partition's columns whenever it is released.
    pub reset_on_release: bool,
}

impl Default for ApertureSettings {
    fn default() -> Self {
        Self {
            queue_depth: 1,
            reset_on_release: false,
        }
    }
}

/// Occupant of a column span in an enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Free,
    Partition { id: u32, state: PartitionState },
}

/// One column span of the aperture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionSlot {
    pub start_col: u32,
    pub num_cols: u32,
    pub status: SlotStatus,
}

impl fmt::Display for PartitionSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cols {:>3}..{:<3} ", self.start_col, self.start_col + self.num_cols)?;
        match self.status {
            SlotStatus::Free => write!(f, "free"),
            SlotStatus::Partition { id, state } => write!(f, "partition {} ({})", id, state),
        }
    }
}

/// Result of [`Aperture::enumerate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enumeration {
    pub slots: Vec<PartitionSlot>,
    /// Slots left out because the caller's limit was reached.
    pub remaining: usize,
}

#[derive(Debug)]
struct ApertureState {
    columns: BitResource,
    partitions: Vec<Arc<Partition>>,
    /// Software copy of every L2 mask register; set means suppressed.
    l2_mask: BitResource,
    next_id: u32,
}

/// Column allocator and interrupt aggregator for one aperture.
#[derive(Debug)]
pub struct Aperture {
    id: u32,
    range: Range,
    hw: Arc<Hardware>,
    routing: L2Routing,
    settings: ApertureSettings,
    state: CancellableMutex<ApertureState>,
    irq_enabled: AtomicBool,
    queue: WorkQueue,
    work_rx: Mutex<Option<Receiver<u32>>>,
}

impl Aperture {
    /// Take over the aperture `range` and mask every L2 line.
    pub fn new(id: u32, range: Range, hw: Hardware, settings: ApertureSettings) -> Result<Self> {
        Self::check_extent(&range)?;
        let routing = L2Routing::build(hw.device, &range);
        let l2 = &hw.device.events.l2;
        let mut l2_mask = BitResource::new((routing.groups().len() as u32 * l2.num_broadcasts).max(1))?;
        l2_mask.set(0, l2_mask.total())?;
        for group in routing.groups() {
            let noc = Location::new(group.noc_col, range.start.row);
            hw.write(noc, l2_regoff(hw.device, l2.disable), l2.disable.mask);
        }

        let (tx, rx) = mpsc::sync_channel(settings.queue_depth.max(1));
        log::info!(
            "aperture {}: {} {} with {} L2 controllers",
            id,
            hw.device.name,
            range,
            routing.groups().len()
        );
        Ok(Self {
            id,
            range,
            hw: Arc::new(hw),
            routing,
            settings,
            state: CancellableMutex::new(ApertureState {
                columns: BitResource::new(range.size.cols)?,
                partitions: Vec::new(),
                l2_mask,
                next_id: 1,
            }),
            irq_enabled: AtomicBool::new(true),
            queue: WorkQueue::new(id, tx),
            work_rx: Mutex::new(Some(rx)),
        })
    }

    fn check_extent(range: &Range) -> Result<()> {
        if range.size.cols == 0 || range.size.rows < 2 {
            return Err(PartError::InvalidArgument("aperture needs a column and a row above the shim"));
        }
        if range.start.col.checked_add(range.size.cols).is_none()
            || range.start.row.checked_add(range.size.rows).is_none()
        {
            return Err(PartError::InvalidArgument("aperture extends past the addressable array"));
        }
        Ok(())
    }

    /// Aperture over simulated registers.
    pub fn simulated(
        id: u32,
        range: Range,
        device: &'static DeviceDescription,
        poll_retries: u32,
        settings: ApertureSettings,
    ) -> Result<(Arc<SimRegisters>, Self)> {
        Self::check_extent(&range)?;
        let (regs, hw) = simulated_hardware(device, &range, poll_retries);
        Ok((regs, Self::new(id, range, hw, settings)?))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn range(&self) -> Range {
        self.range
    }

    pub fn hardware(&self) -> &Arc<Hardware> {
        &self.hw
    }

    pub fn routing(&self) -> &L2Routing {
        &self.routing
    }

    /// Whether the host interrupt line is currently enabled.
    pub fn is_irq_enabled(&self) -> bool {
        self.irq_enabled.load(Ordering::Acquire)
    }

    // ========================================================================
    // Column allocation
    // ========================================================================

    /// Validate a request's shape; returns the aperture-local start column.
    fn admission(&self, start_col: u32, num_cols: u32) -> Result<u32> {
        if num_cols == 0 {
            return Err(PartError::InvalidArgument("partition needs at least one column"));
        }
        let end_col = start_col.checked_add(num_cols);
        if start_col < self.range.start.col || end_col.map_or(true, |end| end > self.range.end_col()) {
            return Err(PartError::InvalidRange {
                start_col,
                end_col: start_col.saturating_add(num_cols),
                aperture_start: self.range.start.col,
                aperture_end: self.range.end_col(),
            });
        }
        Ok(start_col - self.range.start.col)
    }

    fn check_columns(state: &ApertureState, start: u32, local: u32, num_cols: u32) -> Result<()> {
        if state.columns.is_region_clear(local, num_cols)? {
            Ok(())
        } else {
            Err(PartError::ColumnsInUse {
                start_col: start,
                end_col: start + num_cols,
            })
        }
    }

    /// Whether `num_cols` columns from absolute `start_col` could be
    /// requested right now.
    pub fn check_partition_available(&self, cancel: &CancelToken, start_col: u32, num_cols: u32) -> Result<()> {
        let local = self.admission(start_col, num_cols)?;
        let state = self.state.lock(cancel)?;
        Self::check_columns(&state, start_col, local, num_cols)
    }

    /// Create an idle partition over `num_cols` columns from absolute
    /// `start_col`, spanning every row of the aperture.
    pub fn request_partition(
        &self,
        cancel: &CancelToken,
        start_col: u32,
        num_cols: u32,
    ) -> Result<PartitionHandle> {
        let local = self.admission(start_col, num_cols)?;
        let mut state = self.state.lock(cancel)?;
        Self::check_columns(&state, start_col, local, num_cols)?;

        let id = state.next_id;
        let range = Range::new(start_col, self.range.start.row, num_cols, self.range.size.rows);
        let part = Arc::new(Partition::new(
            id,
            range,
            self.hw.clone(),
            self.queue.clone(),
            self.settings.reset_on_release,
        )?);
        debug_assert!(!state.partitions.iter().any(|p| p.range().overlaps_columns(&range)));
        state.columns.set(local, num_cols)?;
        state.next_id += 1;
        state.partitions.push(part.clone());

        log::info!("aperture {}: created partition {} over {}", self.id, id, range);
        Ok(PartitionHandle::new(&part))
    }

    /// Handle of a live partition.
    pub fn partition(&self, cancel: &CancelToken, id: u32) -> Result<PartitionHandle> {
        let state = self.state.lock(cancel)?;
        state
            .partitions
            .iter()
            .find(|p| p.id() == id)
            .map(PartitionHandle::new)
            .ok_or(PartError::PartitionGone(id))
    }

    /// Column map of the aperture: live partitions and the free gaps
    /// between them, in column order, at most `max` entries.
    pub fn enumerate(&self, cancel: &CancelToken, max: usize) -> Result<Enumeration> {
        let state = self.state.lock(cancel)?;
        let mut parts: Vec<&Arc<Partition>> = state.partitions.iter().collect();
        parts.sort_by_key(|p| p.range().start.col);

        let mut slots = Vec::with_capacity(parts.len() * 2 + 1);
        let mut col = self.range.start.col;
        for part in parts {
            let range = part.range();
            if range.start.col > col {
                slots.push(PartitionSlot {
                    start_col: col,
                    num_cols: range.start.col - col,
                    status: SlotStatus::Free,
                });
            }
            slots.push(PartitionSlot {
                start_col: range.start.col,
                num_cols: range.size.cols,
                status: SlotStatus::Partition {
                    id: part.id(),
                    state: part.state(cancel)?,
                },
            });
            col = range.end_col();
        }
        if col < self.range.end_col() {
            slots.push(PartitionSlot {
                start_col: col,
                num_cols: self.range.end_col() - col,
                status: SlotStatus::Free,
            });
        }

        let remaining = slots.len().saturating_sub(max);
        slots.truncate(max);
        Ok(Enumeration { slots, remaining })
    }

    // ========================================================================
    // Partition lifecycle
    // ========================================================================

    fn set_lines(&self, state: &mut ApertureState, range: &Range, enable: bool) -> Result<()> {
        let l2 = &self.hw.device.events.l2;
        for col in range.start.col..range.end_col() {
            for sw in Switch::BOTH {
                let Some(g) = self.routing.group_index(col) else { continue };
                let group = self.routing.groups()[g];
                let Some(bit) = group.bit(col, sw).filter(|&b| b < l2.num_broadcasts) else {
                    continue;
                };
                let idx = g as u32 * l2.num_broadcasts + bit;
                let noc = Location::new(group.noc_col, self.range.start.row);
                if enable {
                    state.l2_mask.clear(idx, 1)?;
                    self.hw.write(noc, l2_regoff(self.hw.device, l2.enable), 1 << bit);
                } else {
                    state.l2_mask.set(idx, 1)?;
                    self.hw.write(noc, l2_regoff(self.hw.device, l2.disable), 1 << bit);
                }
            }
        }
        Ok(())
    }

    /// Whether the L2 line of a column's switch is masked.
    pub fn is_line_masked(&self, cancel: &CancelToken, col: u32, sw: Switch) -> Result<bool> {
        let g = self
            .routing
            .group_index(col)
            .ok_or(PartError::InvalidArgument("column has no level-2 route"))?;
        let bit = self.routing.groups()[g]
            .bit(col, sw)
            .filter(|&b| b < self.hw.device.events.l2.num_broadcasts)
            .ok_or(PartError::InvalidArgument("column has no level-2 route"))?;
        let state = self.state.lock(cancel)?;
        Ok(state.l2_mask.test(g as u32 * self.hw.device.events.l2.num_broadcasts + bit))
    }

    /// Hand a partition to a client and unmask its error lines. Errors that
    /// arrived while it was idle are backtracked from the work queue.
    pub fn mark_in_use(&self, cancel: &CancelToken, handle: &PartitionHandle) -> Result<Arc<Partition>> {
        let mut state = self.state.lock(cancel)?;
        let part = handle.get()?;
        let pending = part.mark_in_use(cancel)?;
        self.set_lines(&mut state, &part.range(), true)?;
        drop(state);

        if pending {
            self.queue.schedule();
        }
        log::info!("aperture {}: partition {} in use", self.id, part.id());
        Ok(part)
    }

    /// Take a partition back from its client and mask its error lines.
    /// `reset` forces a column reset even when the aperture does not reset
    /// on every release.
    pub fn release(&self, cancel: &CancelToken, handle: &PartitionHandle, reset: bool) -> Result<()> {
        let mut state = self.state.lock(cancel)?;
        let part = handle.get()?;
        let released = part.release(cancel, reset);
        // A hardware failure still leaves the partition released.
        if part.state(cancel)? != PartitionState::InUse {
            self.set_lines(&mut state, &part.range(), false)?;
        }
        released?;
        log::info!("aperture {}: partition {} released", self.id, part.id());
        Ok(())
    }

    /// Tear a partition down and return its columns. Fails while the
    /// partition is in use.
    pub fn destroy(&self, cancel: &CancelToken, handle: PartitionHandle) -> Result<()> {
        let mut state = self.state.lock(cancel)?;
        let idx = state
            .partitions
            .iter()
            .position(|p| p.id() == handle.id())
            .ok_or(PartError::PartitionGone(handle.id()))?;
        let inner = state.partitions[idx].take_inner(cancel)?;
        let part = state.partitions.remove(idx);
        drop(inner);

        let range = part.range();
        self.set_lines(&mut state, &range, false)?;
        state
            .columns
            .release_region(range.start.col - self.range.start.col, range.size.cols)?;
        log::info!("aperture {}: destroyed partition {}", self.id, part.id());
        Ok(())
    }

    // ========================================================================
    // Error interrupts
    // ========================================================================

    /// Host interrupt entry: mask the line and queue a backtrack. Returns
    /// whether new work was queued.
    pub fn interrupt_top_half(&self) -> bool {
        self.irq_enabled.store(false, Ordering::Release);
        self.queue.schedule()
    }

    /// Backtrack every pending L2 line of the aperture now.
    pub fn flush_errors(&self, cancel: &CancelToken) -> Result<()> {
        self.backtrack(cancel)
    }

    fn owner<'a>(state: &'a ApertureState, col: u32) -> Option<&'a Arc<Partition>> {
        state
            .partitions
            .iter()
            .find(|p| col >= p.range().start.col && col < p.range().end_col())
    }

    fn backtrack(&self, cancel: &CancelToken) -> Result<()> {
        let device = self.hw.device;
        let l2 = &device.events.l2;
        let mut notify: Vec<(u32, ErrorCallback)> = Vec::new();
        let mut requeue = false;

        {
            let mut state = self.state.lock(cancel)?;
            for (g, group) in self.routing.groups().iter().enumerate() {
                let noc = Location::new(group.noc_col, self.range.start.row);
                let status_off = l2_regoff(device, l2.status);
                let status = self.hw.read(noc, status_off) & l2.status.mask & group.lines_mask();

                for bit in (0..l2.num_broadcasts).filter(|b| status & (1 << b) != 0) {
                    let Some((col, sw)) = group.line(bit) else { continue };
                    let Some(part) = Self::owner(&state, col).cloned() else {
                        log::warn!("aperture {}: error on unowned column {} switch {:?}", self.id, col, sw);
                        interrupt::clear_l1_status(&self.hw, &self.range, col, sw);
                        self.hw.write(noc, status_off, 1 << bit);
                        continue;
                    };

                    match part.backtrack_line(cancel, col, sw)? {
                        LineOutcome::Deferred => {
                            log::debug!("partition {}: error deferred until in use", part.id());
                        }
                        LineOutcome::Handled { pending } => {
                            if pending {
                                requeue = true;
                            } else {
                                self.hw.write(noc, status_off, 1 << bit);
                            }
                            state.l2_mask.clear(g as u32 * l2.num_broadcasts + bit, 1)?;
                            self.hw.write(noc, l2_regoff(device, l2.enable), 1 << bit);
                        }
                    }
                }
            }

            for part in &state.partitions {
                if let Some(callback) = part.take_notification(cancel)? {
                    notify.push((part.id(), callback));
                }
            }
        }

        if requeue {
            self.queue.schedule();
        }
        self.irq_enabled.store(true, Ordering::Release);
        for (id, callback) in notify {
            callback(id);
        }
        Ok(())
    }

    fn receiver(&self) -> MutexGuard<'_, Option<Receiver<u32>>> {
        self.work_rx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Process queued work on the calling thread. Returns whether a
    /// backtrack ran. Does nothing while a worker owns the queue.
    pub fn run_pending_work(&self, cancel: &CancelToken) -> Result<bool> {
        let queued = match self.receiver().as_ref() {
            Some(rx) => rx.try_iter().count(),
            None => 0,
        };
        if queued == 0 {
            return Ok(false);
        }
        self.backtrack(cancel)?;
        Ok(true)
    }

    /// Move the work queue onto a dedicated thread.
    pub fn spawn_worker(self: &Arc<Self>) -> Result<ApertureWorker> {
        let rx = self.receiver().take().ok_or(PartError::AlreadyInUse)?;
        let cancel = CancelToken::new();
        let aperture = Arc::clone(self);
        let token = cancel.clone();

        let handle = thread::spawn(move || {
            log::debug!("aperture {}: backtrack worker started", aperture.id);
            while !token.is_cancelled() {
                match rx.recv_timeout(WORKER_POLL) {
                    Ok(_) => match aperture.backtrack(&token) {
                        Ok(()) => {}
                        Err(PartError::Cancelled) => break,
                        Err(e) => log::warn!("aperture {}: backtrack failed: {}", aperture.id, e),
                    },
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            log::debug!("aperture {}: backtrack worker stopped", aperture.id);
            rx
        });

        Ok(ApertureWorker {
            aperture: Arc::clone(self),
            cancel,
            handle: Some(handle),
        })
    }
}

/// Background thread running an aperture's deferred backtracks.
///
/// Dropping the worker stops it and hands the queue back to the aperture.
#[derive(Debug)]
pub struct ApertureWorker {
    aperture: Arc<Aperture>,
    cancel: CancelToken,
    handle: Option<JoinHandle<Receiver<u32>>>,
}

impl ApertureWorker {
    /// Stop the worker and wait for it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(handle) = self.handle.take() else { return };
        self.cancel.cancel();
        match handle.join() {
            Ok(rx) => *self.aperture.receiver() = Some(rx),
            Err(_) => log::error!("aperture {}: backtrack worker panicked", self.aperture.id),
        }
    }
}

impl Drop for ApertureWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::SimFirmware;
    use crate::device::{ColumnOp, DeviceGeneration, ErrorCategory, FirmwareReset, ModuleType, RegisterReset, ResourceType};
    use crate::interrupt::{l1_status, simulate_tile_error};
    use std::sync::Barrier;

    fn aperture(generation: DeviceGeneration, cols: u32) -> (Arc<SimRegisters>, Aperture) {
        Aperture::simulated(
            0,
            Range::new(0, 0, cols, 4),
            generation.description(),
            8,
            ApertureSettings::default(),
        )
        .unwrap()
    }

    fn l2_reg(ap: &Aperture, regs: &SimRegisters, noc_col: u32, field: crate::device::RegField) -> u32 {
        regs.peek(ap.hw.offset(Location::new(noc_col, 0), l2_regoff(ap.hw.device, field)))
    }

    #[test]
    fn test_disjoint_partitions_and_enumeration() {
        let (_regs, ap) = aperture(DeviceGeneration::Aie, 8);
        let cancel = CancelToken::new();
        let a = ap.request_partition(&cancel, 0, 4).unwrap();
        let b = ap.request_partition(&cancel, 4, 4).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(
            ap.request_partition(&cancel, 2, 4).unwrap_err(),
            PartError::ColumnsInUse { start_col: 2, end_col: 6 }
        );

        let all = ap.enumerate(&cancel, 16).unwrap();
        assert_eq!(all.remaining, 0);
        assert_eq!(all.slots.len(), 2);
        assert_eq!(
            all.slots[1],
            PartitionSlot {
                start_col: 4,
                num_cols: 4,
                status: SlotStatus::Partition { id: b.id(), state: PartitionState::Idle },
            }
        );
        assert_eq!(ap.enumerate(&cancel, 1).unwrap().remaining, 1);
    }

    #[test]
    fn test_admission_errors() {
        let (_regs, ap) = aperture(DeviceGeneration::Aie, 8);
        let cancel = CancelToken::new();
        assert!(matches!(
            ap.request_partition(&cancel, 0, 0).unwrap_err(),
            PartError::InvalidArgument(_)
        ));
        assert!(matches!(
            ap.request_partition(&cancel, 6, 4).unwrap_err(),
            PartError::InvalidRange { start_col: 6, end_col: 10, .. }
        ));
        assert!(matches!(
            ap.request_partition(&cancel, u32::MAX, 2).unwrap_err(),
            PartError::InvalidRange { .. }
        ));

        ap.check_partition_available(&cancel, 1, 2).unwrap();
        ap.request_partition(&cancel, 1, 2).unwrap();
        assert!(ap.check_partition_available(&cancel, 2, 1).is_err());

        let slots = ap.enumerate(&cancel, 8).unwrap().slots;
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0].status, SlotStatus::Free);
        assert_eq!((slots[2].start_col, slots[2].num_cols), (3, 5));
    }

    #[test]
    fn test_lifecycle_and_l2_masks() {
        let (regs, ap) = aperture(DeviceGeneration::Aie, 8);
        let cancel = CancelToken::new();
        let l2 = ap.hw.device.events.l2;
        assert_eq!(l2_reg(&ap, &regs, 2, l2.mask), 0xffff);

        let handle = ap.request_partition(&cancel, 0, 4).unwrap();
        let part = ap.mark_in_use(&cancel, &handle).unwrap();
        assert_eq!(ap.mark_in_use(&cancel, &handle).unwrap_err(), PartError::AlreadyInUse);
        assert_eq!(l2_reg(&ap, &regs, 2, l2.mask) & 0x3f, 0);
        assert_eq!(l2_reg(&ap, &regs, 3, l2.mask) & 0x3, 0);
        assert!(!ap.is_line_masked(&cancel, 1, Switch::B).unwrap());
        assert!(ap.is_line_masked(&cancel, 4, Switch::A).unwrap());

        part.request_tiles(&cancel, &[Location::new(1, 2)]).unwrap();
        assert!(part.is_tile_enabled(&cancel, Location::new(1, 2)).unwrap());
        assert_eq!(
            ap.destroy(&cancel, handle.clone()).unwrap_err(),
            PartError::PartitionBusy(handle.id())
        );

        ap.release(&cancel, &handle, false).unwrap();
        assert!(!part.is_tile_enabled(&cancel, Location::new(1, 2)).unwrap());
        assert_eq!(l2_reg(&ap, &regs, 2, l2.mask) & 0x3f, 0x3f);
        assert!(ap.is_line_masked(&cancel, 1, Switch::B).unwrap());

        ap.destroy(&cancel, handle.clone()).unwrap();
        drop(part);
        assert_eq!(handle.get().unwrap_err(), PartError::PartitionGone(handle.id()));
        assert_eq!(ap.partition(&cancel, handle.id()).unwrap_err(), PartError::PartitionGone(handle.id()));
        ap.request_partition(&cancel, 0, 8).unwrap();
    }

    #[test]
    fn test_overflowing_aperture_range_rejected() {
        let device = DeviceGeneration::Aie.description();
        let range = Range::new(1, 0, u32::MAX, 4);
        assert!(matches!(
            Aperture::simulated(0, range, device, 8, ApertureSettings::default()).unwrap_err(),
            PartError::InvalidArgument(_)
        ));

        let regs = Arc::new(SimRegisters::new());
        let reset = Arc::new(RegisterReset::new(regs.clone(), device, 8));
        let hw = Hardware::new(device, regs, reset, 8);
        assert!(matches!(
            Aperture::new(0, range, hw, ApertureSettings::default()).unwrap_err(),
            PartError::InvalidArgument(_)
        ));
    }

    #[test]
    fn test_failed_column_reset_still_masks_lines() {
        let (regs, ap) = aperture(DeviceGeneration::Aie, 8);
        let cancel = CancelToken::new();
        let l2 = ap.hw.device.events.l2;
        let handle = ap.request_partition(&cancel, 0, 4).unwrap();
        let part = ap.mark_in_use(&cancel, &handle).unwrap();
        assert_eq!(part.request_tiles(&cancel, &[]).unwrap(), 16);

        let loc = Location::new(0, 1);
        let free = part
            .check_resource_available(&cancel, loc, ModuleType::Core, ResourceType::PerfCounter)
            .unwrap();
        part.request_resource(&cancel, loc, ModuleType::Core, ResourceType::PerfCounter, 2, false)
            .unwrap();

        let reset = ap.hw.device.column_reset;
        regs.stick(ap.hw.offset(Location::new(0, 0), reset.regoff), reset.mask);
        assert!(matches!(
            ap.release(&cancel, &handle, true).unwrap_err(),
            PartError::Timeout { .. }
        ));

        assert_eq!(part.state(&cancel).unwrap(), PartitionState::Released);
        assert_eq!(l2_reg(&ap, &regs, 2, l2.mask) & 0x3f, 0x3f);
        assert_eq!(l2_reg(&ap, &regs, 3, l2.mask) & 0x3, 0x3);
        assert!(ap.is_line_masked(&cancel, 1, Switch::A).unwrap());
        assert!(ap.is_line_masked(&cancel, 3, Switch::B).unwrap());
        assert!(!part.is_tile_enabled(&cancel, Location::new(1, 2)).unwrap());
        assert_eq!(
            part.check_resource_available(&cancel, loc, ModuleType::Core, ResourceType::PerfCounter)
                .unwrap(),
            free
        );

        assert!(matches!(
            ap.release(&cancel, &handle, true).unwrap_err(),
            PartError::InvalidArgument(_)
        ));
        ap.destroy(&cancel, handle).unwrap();
    }

    #[test]
    fn test_firmware_rejection_leaves_consistent_state() {
        let device = DeviceGeneration::AieMl.description();
        let range = Range::new(0, 0, 4, 4);
        let regs = Arc::new(SimRegisters::for_aperture(device, &range));
        let firmware = Arc::new(SimFirmware::new(regs.clone(), device));
        let hw = Hardware::new(device, regs.clone(), Arc::new(FirmwareReset::new(firmware.clone())), 8);
        let ap = Aperture::new(0, range, hw, ApertureSettings::default()).unwrap();
        let cancel = CancelToken::new();
        let handle = ap.request_partition(&cancel, 0, 4).unwrap();
        let part = ap.mark_in_use(&cancel, &handle).unwrap();
        let tile = Location::new(1, 2);

        firmware.reject_next(-5);
        assert!(matches!(
            part.request_tiles(&cancel, &[tile]).unwrap_err(),
            PartError::HardwareRejected { code: -5, .. }
        ));
        assert!(!part.is_tile_enabled(&cancel, tile).unwrap());
        assert_eq!(part.request_tiles(&cancel, &[tile]).unwrap(), 1);
        assert!(part.is_tile_enabled(&cancel, tile).unwrap());

        firmware.reject_next(-5);
        assert!(matches!(
            ap.release(&cancel, &handle, false).unwrap_err(),
            PartError::HardwareRejected { code: -5, .. }
        ));
        assert_eq!(part.state(&cancel).unwrap(), PartitionState::Released);
        assert!(ap.is_line_masked(&cancel, 1, Switch::A).unwrap());
        // Firmware refused to gate the column, so it still reads as clocked.
        assert!(part.is_tile_enabled(&cancel, tile).unwrap());

        ap.mark_in_use(&cancel, &handle).unwrap();
        assert!(!ap.is_line_masked(&cancel, 1, Switch::A).unwrap());
        ap.release(&cancel, &handle, false).unwrap();
        assert!(!part.is_tile_enabled(&cancel, tile).unwrap());
        assert_eq!(firmware.requests().last().map(|r| r.2), Some(ColumnOp::DisableClockBuffer));
    }

    #[test]
    fn test_destroyed_partition_rejects_operations() {
        let (_regs, ap) = aperture(DeviceGeneration::AieMl, 4);
        let cancel = CancelToken::new();
        let handle = ap.request_partition(&cancel, 0, 2).unwrap();
        let part = handle.get().unwrap();
        ap.destroy(&cancel, handle.clone()).unwrap();
        assert_eq!(part.errors(&cancel).unwrap_err(), PartError::PartitionGone(handle.id()));
        assert_eq!(
            ap.mark_in_use(&cancel, &handle).unwrap_err(),
            PartError::PartitionGone(handle.id())
        );
    }

    #[test]
    fn test_core_error_reaches_callback() {
        let (regs, ap) = aperture(DeviceGeneration::Aie, 8);
        let cancel = CancelToken::new();
        let handle = ap.request_partition(&cancel, 0, 4).unwrap();
        let part = ap.mark_in_use(&cancel, &handle).unwrap();
        part.request_tiles(&cancel, &[]).unwrap();

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        part.register_error_callback(&cancel, move |id| {
            let _ = tx.lock().unwrap().send(id);
        })
        .unwrap();

        let loc = Location::new(2, 1);
        let event = simulate_tile_error(&regs, ap.hw.device, ap.routing(), loc, ModuleType::Core, 5).unwrap();
        assert_eq!(event, 53);
        assert_eq!(ap.routing().line_for(2, Switch::A), Some((2, 4)));

        assert!(ap.interrupt_top_half());
        assert!(!ap.is_irq_enabled());
        assert!(ap.run_pending_work(&cancel).unwrap());
        assert!(ap.is_irq_enabled());
        assert_eq!(rx.try_recv().unwrap(), handle.id());

        let errors = part.errors(&cancel).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].loc, loc);
        assert_eq!(errors[0].module, ModuleType::Core);
        assert_eq!(errors[0].event, 53);
        assert_eq!(errors[0].category, ErrorCategory::Unclassified);

        assert_eq!(l1_status(&ap.hw, &ap.range, 2, Switch::A), 0);
        assert_eq!(l2_reg(&ap, &regs, 2, ap.hw.device.events.l2.status), 0);
        assert!(!ap.run_pending_work(&cancel).unwrap());

        part.clear_cached_errors(&cancel).unwrap();
        assert!(part.errors(&cancel).unwrap().is_empty());
    }

    #[test]
    fn test_error_on_idle_partition_is_deferred() {
        let (regs, ap) = aperture(DeviceGeneration::Aie, 4);
        let cancel = CancelToken::new();
        let handle = ap.request_partition(&cancel, 0, 4).unwrap();
        let part = handle.get().unwrap();
        part.request_tiles(&cancel, &[]).unwrap();

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        part.register_error_callback(&cancel, move |id| {
            let _ = tx.lock().unwrap().send(id);
        })
        .unwrap();

        simulate_tile_error(&regs, ap.hw.device, ap.routing(), Location::new(1, 2), ModuleType::Memory, 3).unwrap();
        ap.flush_errors(&cancel).unwrap();
        assert!(part.errors(&cancel).unwrap().is_empty());
        assert!(rx.try_recv().is_err());
        assert_ne!(l2_reg(&ap, &regs, 2, ap.hw.device.events.l2.status), 0);

        ap.mark_in_use(&cancel, &handle).unwrap();
        assert!(ap.run_pending_work(&cancel).unwrap());
        assert_eq!(rx.try_recv().unwrap(), handle.id());
        let errors = part.errors(&cancel).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].event, 90);
        assert_eq!(errors[0].name, Some("dm_ecc_error_2-bit"));
    }

    #[test]
    fn test_unowned_column_is_cleared() {
        let (regs, ap) = aperture(DeviceGeneration::Aie, 8);
        let cancel = CancelToken::new();
        simulate_tile_error(&regs, ap.hw.device, ap.routing(), Location::new(5, 0), ModuleType::Pl, 1).unwrap();
        ap.flush_errors(&cancel).unwrap();
        assert_eq!(l1_status(&ap.hw, &ap.range, 5, Switch::A), 0);
        assert_eq!(l2_reg(&ap, &regs, 6, ap.hw.device.events.l2.status), 0);
    }

    #[test]
    fn test_concurrent_requests_do_not_overlap() {
        let (_regs, ap) = aperture(DeviceGeneration::Aie, 8);
        let ap = Arc::new(ap);
        let barrier = Arc::new(Barrier::new(4));
        let workers: Vec<_> = (0..4u32)
            .map(|i| {
                let ap = Arc::clone(&ap);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    ap.request_partition(&CancelToken::new(), i, 4).is_ok()
                })
            })
            .collect();
        let wins = workers
            .into_iter()
            .map(|w| w.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(wins, 1);

        let slots = ap.enumerate(&CancelToken::new(), 16).unwrap().slots;
        let owned: u32 = slots
            .iter()
            .filter(|s| s.status != SlotStatus::Free)
            .map(|s| s.num_cols)
            .sum();
        assert_eq!(owned, 4);
        for pair in slots.windows(2) {
            assert_eq!(pair[0].start_col + pair[0].num_cols, pair[1].start_col);
        }
    }

    #[test]
    fn test_waiter_cancelled_while_aperture_locked() {
        let (_regs, ap) = aperture(DeviceGeneration::Aie, 8);
        let ap = Arc::new(ap);
        let held = ap.state.lock(&CancelToken::new()).unwrap();

        let cancel = CancelToken::new();
        let waiter = {
            let ap = Arc::clone(&ap);
            let cancel = cancel.clone();
            thread::spawn(move || ap.request_partition(&cancel, 0, 2).map(|_| ()))
        };
        thread::sleep(Duration::from_millis(10));
        cancel.cancel();
        assert_eq!(waiter.join().unwrap(), Err(PartError::Cancelled));
        drop(held);
        assert!(ap.check_partition_available(&CancelToken::new(), 0, 2).is_ok());
    }

    #[test]
    fn test_worker_delivers_and_returns_queue() {
        let (regs, ap) = aperture(DeviceGeneration::Aie, 4);
        let ap = Arc::new(ap);
        let cancel = CancelToken::new();
        let handle = ap.request_partition(&cancel, 0, 4).unwrap();
        let part = ap.mark_in_use(&cancel, &handle).unwrap();
        part.request_tiles(&cancel, &[]).unwrap();

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        part.register_error_callback(&cancel, move |id| {
            let _ = tx.lock().unwrap().send(id);
        })
        .unwrap();

        let worker = ap.spawn_worker().unwrap();
        assert_eq!(ap.spawn_worker().unwrap_err(), PartError::AlreadyInUse);
        simulate_tile_error(&regs, ap.hw.device, ap.routing(), Location::new(3, 3), ModuleType::Core, 0).unwrap();
        assert!(ap.interrupt_top_half());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), handle.id());
        worker.shutdown();

        assert!(!ap.run_pending_work(&cancel).unwrap());
        let worker = ap.spawn_worker().unwrap();
        drop(worker);
        assert_eq!(part.errors(&cancel).unwrap().len(), 1);
    }
}
