//! In-process stand-ins for the register window and platform firmware.
//!
//! [`SimRegisters`] is a sparse register file with just enough behaviour to
//! exercise the interrupt and clock paths: write-one-to-clear status
//! registers, the level-2 enable/disable aliases that edit the mask
//! register, and stuck bits for timeout tests. [`SimFirmware`] applies
//! column requests to a `SimRegisters` the way platform firmware would.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::events::EventDomain;
use super::power::{ColumnOp, Firmware, FirmwareReset, RegisterReset, ResetControl};
use super::registers::RegisterIo;
use super::{DeviceDescription, DeviceGeneration, Hardware, Location, Range, TileKind};

/// Side effect of writing a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterBehaviour {
    /// Written ones clear the matching bits.
    WriteOneToClear,
    /// Written ones set bits in another register.
    SetBitsIn(u64),
    /// Written ones clear bits in another register.
    ClearBitsIn(u64),
}

#[derive(Debug, Default)]
struct SimState {
    values: HashMap<u64, u32>,
    behaviours: HashMap<u64, RegisterBehaviour>,
    stuck: HashMap<u64, u32>,
}

/// Sparse simulated register window. Unwritten registers read as zero.
#[derive(Debug, Default)]
pub struct SimRegisters {
    state: Mutex<SimState>,
}

impl SimRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register window for `range` of `device`, with the write behaviours
    /// of the event status and interrupt controller registers installed.
    pub fn for_aperture(device: &DeviceDescription, range: &Range) -> Self {
        let regs = Self::new();
        let events = device.events;
        let l1 = &events.l1;
        let l2 = &events.l2;

        for col in range.start.col..range.end_col() {
            let shim = Location::new(col, range.start.row);
            for status in [l1.swa_status, l1.swb_status] {
                let off = device.layout.tile_offset(shim, l1.regoff + status.regoff);
                regs.set_behaviour(off, RegisterBehaviour::WriteOneToClear);
            }

            if device.ops.classify(shim) == TileKind::ShimNoc {
                let mask = device.layout.tile_offset(shim, l2.regoff + l2.mask.regoff);
                let enable = device.layout.tile_offset(shim, l2.regoff + l2.enable.regoff);
                let disable = device.layout.tile_offset(shim, l2.regoff + l2.disable.regoff);
                let status = device.layout.tile_offset(shim, l2.regoff + l2.status.regoff);
                regs.set_behaviour(enable, RegisterBehaviour::ClearBitsIn(mask));
                regs.set_behaviour(disable, RegisterBehaviour::SetBitsIn(mask));
                regs.set_behaviour(status, RegisterBehaviour::WriteOneToClear);
            }

            for row in range.start.row..range.end_row() {
                let loc = Location::new(col, row);
                let kind = device.ops.classify(loc);
                for &module in kind.modules() {
                    let attr = EventDomain::of(kind, module).and_then(|d| events.attr(d));
                    let Some(attr) = attr else { continue };
                    for word in 0..attr.status_words() {
                        let off = device.layout.tile_offset(loc, attr.status_regoff + word * 4);
                        regs.set_behaviour(off, RegisterBehaviour::WriteOneToClear);
                    }
                }
            }
        }
        regs
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a write side effect to `offset`.
    pub fn set_behaviour(&self, offset: u64, behaviour: RegisterBehaviour) {
        self.lock().behaviours.insert(offset, behaviour);
    }

    /// Current value, bypassing nothing but write behaviours.
    pub fn peek(&self, offset: u64) -> u32 {
        let state = self.lock();
        state.values.get(&offset).copied().unwrap_or(0) | state.stuck.get(&offset).copied().unwrap_or(0)
    }

    /// Store a value directly, as hardware would.
    pub fn poke(&self, offset: u64, value: u32) {
        self.lock().values.insert(offset, value);
    }

    /// OR bits into a register directly, as a hardware event would.
    pub fn raise(&self, offset: u64, bits: u32) {
        *self.lock().values.entry(offset).or_insert(0) |= bits;
    }

    /// Force bits to read as set regardless of writes.
    pub fn stick(&self, offset: u64, bits: u32) {
        *self.lock().stuck.entry(offset).or_insert(0) |= bits;
    }
}

impl RegisterIo for SimRegisters {
    fn read32(&self, offset: u64) -> u32 {
        self.peek(offset)
    }

    fn write32(&self, offset: u64, value: u32) {
        let mut state = self.lock();
        match state.behaviours.get(&offset).copied() {
            None => {
                state.values.insert(offset, value);
            }
            Some(RegisterBehaviour::WriteOneToClear) => {
                if let Some(current) = state.values.get_mut(&offset) {
                    *current &= !value;
                }
            }
            Some(RegisterBehaviour::SetBitsIn(target)) => {
                *state.values.entry(target).or_insert(0) |= value;
            }
            Some(RegisterBehaviour::ClearBitsIn(target)) => {
                if let Some(current) = state.values.get_mut(&target) {
                    *current &= !value;
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct FirmwareLog {
    requests: Vec<(u32, u32, ColumnOp)>,
    reject_next: Option<i32>,
}

/// Firmware endpoint that applies column requests to simulated registers.
#[derive(Debug)]
pub struct SimFirmware {
    regs: Arc<SimRegisters>,
    device: &'static DeviceDescription,
    log: Mutex<FirmwareLog>,
}

impl SimFirmware {
    pub fn new(regs: Arc<SimRegisters>, device: &'static DeviceDescription) -> Self {
        Self {
            regs,
            device,
            log: Mutex::new(FirmwareLog::default()),
        }
    }

    /// Make the next request fail with `code`.
    pub fn reject_next(&self, code: i32) {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).reject_next = Some(code);
    }

    /// Every request received so far, rejected ones included.
    pub fn requests(&self) -> Vec<(u32, u32, ColumnOp)> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .requests
            .clone()
    }
}

impl Firmware for SimFirmware {
    fn column_request(&self, start_col: u32, num_cols: u32, op: ColumnOp) -> std::result::Result<(), i32> {
        {
            let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
            log.requests.push((start_col, num_cols, op));
            if let Some(code) = log.reject_next.take() {
                return Err(code);
            }
        }

        let (field, set) = match op {
            ColumnOp::AssertReset => (self.device.column_reset, true),
            ColumnOp::ReleaseReset => (self.device.column_reset, false),
            ColumnOp::EnableClockBuffer => (self.device.column_clock, true),
            ColumnOp::DisableClockBuffer => (self.device.column_clock, false),
        };
        for col in start_col..start_col + num_cols {
            let off = self.device.layout.tile_offset(Location::new(col, 0), field.regoff);
            self.regs.mask_write32(off, field.mask, if set { field.mask } else { 0 });
        }
        Ok(())
    }
}

/// Simulated hardware for one aperture. AIE columns are reset through
/// registers, AIE-ML columns through a [`SimFirmware`] endpoint, matching
/// how each generation is driven on silicon.
pub fn simulated_hardware(
    device: &'static DeviceDescription,
    range: &Range,
    poll_retries: u32,
) -> (Arc<SimRegisters>, Hardware) {
    let regs = Arc::new(SimRegisters::for_aperture(device, range));
    let reset: Arc<dyn ResetControl> = match device.generation {
        DeviceGeneration::Aie => Arc::new(RegisterReset::new(regs.clone(), device, poll_retries)),
        DeviceGeneration::AieMl => {
            let firmware = Arc::new(SimFirmware::new(regs.clone(), device));
            Arc::new(FirmwareReset::new(firmware))
        }
    };
    let hw = Hardware::new(device, regs.clone(), reset, poll_retries);
    (regs, hw)
}
