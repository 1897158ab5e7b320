//! Error interrupt aggregation.
//!
//! Errors raised inside a tile travel to the host in three hops:
//!
//! ```text
//!   tile event block --broadcast 0 down the column--> shim L1 (switch A/B)
//!   shim L1 --one line per column and switch--> L2 in the column's NOC shim
//!   L2 --> host interrupt
//! ```
//!
//! Core errors ride switch A and memory errors switch B. A shim's own PL
//! errors raise L1 line 16 directly. Backtracking walks the path in reverse:
//! L2 status names the column and switch, L1 status says whether the error
//! came from the array or the shim, and the array walk follows broadcast 0
//! up from row 1 until the tile that originated it.
//!
//! Nothing in this module locks anything; callers hold the aperture and
//! partition locks as needed.

use std::sync::mpsc::{SyncSender, TrySendError};

use smallvec::SmallVec;

use crate::device::aie_spec::{ARRAY_TILE_ERROR_BC_ID, L2_BITS_PER_COLUMN, SHIM_TILE_ERROR_IRQ_ID};
use crate::device::events::{EventAttr, L1Attr};
use crate::device::sim::SimRegisters;
use crate::device::{
    DeviceDescription, EventDomain, Hardware, Location, ModuleType, Range, RegField, TileKind,
};
use crate::error::{PartError, Result};
use crate::partition::{ClockGateTracker, ErrorState};

/// Level-1 switch of a shim column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Switch {
    A,
    B,
}

impl Switch {
    pub const BOTH: [Switch; 2] = [Switch::A, Switch::B];

    pub fn index(self) -> u32 {
        match self {
            Switch::A => 0,
            Switch::B => 1,
        }
    }

    /// Array module whose errors the switch carries.
    pub fn module(self) -> ModuleType {
        match self {
            Switch::A => ModuleType::Core,
            Switch::B => ModuleType::Memory,
        }
    }

    /// Switch carrying errors of `module`.
    pub fn for_module(module: ModuleType) -> Self {
        match module {
            ModuleType::Memory => Switch::B,
            ModuleType::Core | ModuleType::Pl => Switch::A,
        }
    }

    fn status(self, l1: &L1Attr) -> RegField {
        match self {
            Switch::A => l1.swa_status,
            Switch::B => l1.swb_status,
        }
    }

    fn event(self, l1: &L1Attr) -> RegField {
        match self {
            Switch::A => l1.swa_event,
            Switch::B => l1.swb_event,
        }
    }
}

// ============================================================================
// Deferred work
// ============================================================================

/// Sender side of an aperture's deferred-work queue.
///
/// The queue holds aperture ids; a full queue already has a backtrack
/// pending, so a failed send is not an error.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    id: u32,
    tx: SyncSender<u32>,
}

impl WorkQueue {
    pub fn new(id: u32, tx: SyncSender<u32>) -> Self {
        Self { id, tx }
    }

    /// Ask for a backtrack. Returns whether a new item was queued.
    pub fn schedule(&self) -> bool {
        match self.tx.try_send(self.id) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Disconnected(_)) => {
                log::warn!("aperture {}: backtrack worker is gone", self.id);
                false
            }
        }
    }
}

// ============================================================================
// Level-2 routing
// ============================================================================

/// Columns whose L1 lines feed one NOC shim's L2 controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2Group {
    pub noc_col: u32,
    pub first_col: u32,
    pub num_cols: u32,
}

impl L2Group {
    /// L2 bit of a served column's switch line.
    pub fn bit(&self, col: u32, sw: Switch) -> Option<u32> {
        (col >= self.first_col && col < self.first_col + self.num_cols)
            .then(|| L2_BITS_PER_COLUMN * (col - self.first_col) + sw.index())
    }

    /// Column and switch behind an L2 bit.
    pub fn line(&self, bit: u32) -> Option<(u32, Switch)> {
        let col = self.first_col + bit / L2_BITS_PER_COLUMN;
        let sw = if bit % L2_BITS_PER_COLUMN == 0 { Switch::A } else { Switch::B };
        (col < self.first_col + self.num_cols).then_some((col, sw))
    }

    /// Mask of every L2 bit in use.
    pub fn lines_mask(&self) -> u32 {
        match L2_BITS_PER_COLUMN * self.num_cols {
            n if n >= 32 => u32::MAX,
            n => (1u32 << n) - 1,
        }
    }
}

/// L1-to-L2 wiring of an aperture.
///
/// Each NOC shim serves the plain columns to its left back to the previous
/// NOC shim, plus itself. Plain columns right of the last NOC shim hang off
/// that last controller.
#[derive(Debug, Clone, Default)]
pub struct L2Routing {
    groups: Vec<L2Group>,
}

impl L2Routing {
    pub fn build(device: &DeviceDescription, range: &Range) -> Self {
        let mut groups: Vec<L2Group> = Vec::new();
        let mut first = range.start.col;
        for col in range.start.col..range.end_col() {
            if device.ops.classify(Location::new(col, range.start.row)) == TileKind::ShimNoc {
                groups.push(L2Group {
                    noc_col: col,
                    first_col: first,
                    num_cols: col - first + 1,
                });
                first = col + 1;
            }
        }
        match groups.last_mut() {
            Some(last) => last.num_cols = range.end_col() - last.first_col,
            None => log::warn!("no NOC shim in {}; error interrupts cannot be routed", range),
        }
        Self { groups }
    }

    pub fn groups(&self) -> &[L2Group] {
        &self.groups
    }

    /// Index of the group serving `col`.
    pub fn group_index(&self, col: u32) -> Option<usize> {
        self.groups
            .iter()
            .position(|g| col >= g.first_col && col < g.first_col + g.num_cols)
    }

    /// NOC column and L2 bit of a column's switch line.
    pub fn line_for(&self, col: u32, sw: Switch) -> Option<(u32, u32)> {
        let group = &self.groups[self.group_index(col)?];
        group.bit(col, sw).map(|bit| (group.noc_col, bit))
    }
}

// ============================================================================
// Register helpers
// ============================================================================

/// Offset of an L2 controller register field.
pub fn l2_regoff(device: &DeviceDescription, field: RegField) -> u32 {
    device.events.l2.regoff + field.regoff
}

fn l1_status_regoff(l1: &L1Attr, sw: Switch) -> u32 {
    l1.regoff + sw.status(l1).regoff
}

/// Pending L1 status bits of one column's switch.
pub fn l1_status(hw: &Hardware, range: &Range, col: u32, sw: Switch) -> u32 {
    let l1 = &hw.device.events.l1;
    let shim = Location::new(col, range.start.row);
    hw.read(shim, l1_status_regoff(l1, sw)) & sw.status(l1).mask
}

/// Acknowledge every pending L1 status bit of one column's switch.
pub fn clear_l1_status(hw: &Hardware, range: &Range, col: u32, sw: Switch) {
    let pending = l1_status(hw, range, col, sw);
    if pending != 0 {
        let l1 = &hw.device.events.l1;
        hw.write(Location::new(col, range.start.row), l1_status_regoff(l1, sw), pending);
    }
}

fn status_bit(words: &[u32], event: u32) -> bool {
    words
        .get((event / 32) as usize)
        .is_some_and(|word| word & (1 << (event % 32)) != 0)
}

fn read_status(hw: &Hardware, loc: Location, attr: &EventAttr) -> SmallVec<[u32; 6]> {
    (0..attr.status_words())
        .map(|word| hw.read(loc, attr.status_regoff + word * 4))
        .collect()
}

/// Domain used when walking a tile on the given switch. Tiles without the
/// switch's module (memory tiles on switch A) relay through their own.
fn walk_domain(kind: TileKind, module: ModuleType) -> Option<EventDomain> {
    EventDomain::of(kind, module)
        .or_else(|| kind.modules().iter().find_map(|&m| EventDomain::of(kind, m)))
}

// ============================================================================
// Backtracking
// ============================================================================

/// Collect the enabled error events of one tile module whose summary event
/// `grevent` fired. Each hit is recorded, acknowledged in the status and
/// disabled in the group-error mask until the cache is cleared by the
/// client and the mask is reprogrammed.
fn tile_backtrack(
    hw: &Hardware,
    range: &Range,
    loc: Location,
    domain: EventDomain,
    attr: &EventAttr,
    grevent: u32,
    errors: &mut ErrorState,
) -> Result<bool> {
    let status = read_status(hw, loc, attr);
    if !status_bit(&status, grevent) {
        return Ok(false);
    }

    let local = range.to_local(loc).ok_or(PartError::InvalidLocation(loc))?;
    let group_off = attr.group_error_regoff();
    let enabled = hw.read(loc, group_off) & attr.group_error.mask;
    let mut remaining = enabled;
    let mut found = false;

    for n in (0..32).filter(|n| enabled & (1 << n) != 0) {
        let event = attr.base_error_event + n;
        if !status_bit(&status, event) {
            continue;
        }
        remaining &= !(1 << n);
        errors.record(domain, local, event)?;
        hw.write(loc, attr.status_word_regoff(event), 1 << (event % 32));
        log::warn!("tile {} {} module raised error event {}", loc, domain.module(), event);
        found = true;
    }

    hw.write(loc, group_off, remaining);
    Ok(found)
}

/// Backtrack one column's switch line into the errors of the partition
/// spanning `range`. `col` is absolute. Returns whether any error was
/// recorded.
pub fn backtrack_column(
    hw: &Hardware,
    range: &Range,
    clock: &ClockGateTracker,
    errors: &mut ErrorState,
    col: u32,
    sw: Switch,
) -> Result<bool> {
    let events = hw.device.events;
    let l1 = &events.l1;
    let shim = Location::new(col, range.start.row);
    let status_off = l1_status_regoff(l1, sw);
    let status = l1_status(hw, range, col, sw);
    let mut found = false;

    if status & (1 << ARRAY_TILE_ERROR_BC_ID) != 0 {
        hw.write(shim, status_off, 1 << ARRAY_TILE_ERROR_BC_ID);
        for row in range.start.row + 1..range.end_row() {
            let loc = Location::new(col, row);
            let local = range.to_local(loc).ok_or(PartError::InvalidLocation(loc))?;
            if !clock.is_enabled(local) {
                break;
            }
            let kind = hw.classify(loc);
            let Some(domain) = walk_domain(kind, sw.module()) else { break };
            let Some(attr) = events.attr(domain) else { break };

            let grevent = hw.read(loc, attr.bc_select_regoff(ARRAY_TILE_ERROR_BC_ID)) & attr.bc_event.mask;
            found |= tile_backtrack(hw, range, loc, domain, attr, grevent, errors)?;

            let relay = attr.bc_event(ARRAY_TILE_ERROR_BC_ID);
            let relay_off = attr.status_word_regoff(relay);
            if hw.read(loc, relay_off) & (1 << (relay % 32)) == 0 {
                break;
            }
            hw.write(loc, relay_off, 1 << (relay % 32));
        }
    }

    if status & (1 << SHIM_TILE_ERROR_IRQ_ID) != 0 {
        hw.write(shim, status_off, 1 << SHIM_TILE_ERROR_IRQ_ID);
        let field = sw.event(l1);
        let grevent = hw.read(shim, l1.regoff + field.regoff) & field.mask;
        found |= tile_backtrack(hw, range, shim, EventDomain::Pl, &events.pl, grevent, errors)?;
    }

    Ok(found)
}

// ============================================================================
// Simulation
// ============================================================================

/// Raise error `group_bit` of a tile module on simulated hardware, with
/// every register along its path to the L2 controller set the way the
/// hardware would leave it. Returns the error event id.
pub fn simulate_tile_error(
    regs: &SimRegisters,
    device: &DeviceDescription,
    routing: &L2Routing,
    loc: Location,
    module: ModuleType,
    group_bit: u32,
) -> Result<u32> {
    let events = device.events;
    let layout = &device.layout;
    let kind = device.ops.classify(loc);
    let domain = EventDomain::of(kind, module).ok_or(PartError::InvalidArgument("module not present in tile"))?;
    let attr = events
        .attr(domain)
        .ok_or(PartError::InvalidArgument("event domain not present on device"))?;
    if group_bit >= 32 || attr.group_error.mask & (1 << group_bit) == 0 {
        return Err(PartError::InvalidArgument("group error bit not implemented"));
    }
    let event = attr.base_error_event + group_bit;
    let summary = attr.base_error_event - 1;
    let group_off = layout.tile_offset(loc, attr.group_error_regoff());
    regs.poke(group_off, regs.peek(group_off) | (1 << group_bit));
    for ev in [event, summary] {
        regs.raise(layout.tile_offset(loc, attr.status_word_regoff(ev)), 1 << (ev % 32));
    }

    let l1 = &events.l1;
    let sw = Switch::for_module(module);
    let shim = Location::new(loc.col, 0);
    let irq = if kind.is_shim() {
        let field = sw.event(l1);
        regs.poke(layout.tile_offset(shim, l1.regoff + field.regoff), summary & field.mask);
        SHIM_TILE_ERROR_IRQ_ID
    } else {
        regs.poke(layout.tile_offset(loc, attr.bc_select_regoff(ARRAY_TILE_ERROR_BC_ID)), summary);
        for row in 1..loc.row {
            let below = Location::new(loc.col, row);
            let relay_domain = walk_domain(device.ops.classify(below), sw.module())
                .ok_or(PartError::InvalidArgument("tile cannot relay broadcasts"))?;
            let relay_attr = events
                .attr(relay_domain)
                .ok_or(PartError::InvalidArgument("event domain not present on device"))?;
            let relay = relay_attr.bc_event(ARRAY_TILE_ERROR_BC_ID);
            regs.raise(layout.tile_offset(below, relay_attr.status_word_regoff(relay)), 1 << (relay % 32));
        }
        ARRAY_TILE_ERROR_BC_ID
    };
    regs.raise(layout.tile_offset(shim, l1_status_regoff(l1, sw)), 1 << irq);

    let (noc_col, bit) = routing
        .line_for(loc.col, sw)
        .ok_or(PartError::InvalidArgument("column has no level-2 route"))?;
    let l2_status = layout.tile_offset(Location::new(noc_col, 0), l2_regoff(device, events.l2.status));
    regs.raise(l2_status, 1 << bit);
    Ok(event)
}
