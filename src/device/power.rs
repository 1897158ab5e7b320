//! Column reset and clock-buffer control.
//!
//! The partition core only needs four column-level primitives. Whether they
//! are carried out by poking shim registers directly ([`RegisterReset`]) or
//! by asking platform firmware ([`FirmwareReset`]) is hidden behind
//! [`ResetControl`]; both report plain success or failure.

use std::fmt;
use std::sync::Arc;

use crate::error::{PartError, Result};

use super::registers::{mask_poll, RegisterIo};
use super::{DeviceDescription, Location, Range};

/// Column-level reset and clock primitives.
pub trait ResetControl: Send + Sync + fmt::Debug {
    /// Hold every column of `range` in reset.
    fn assert_column_reset(&self, range: &Range) -> Result<()>;

    /// Take every column of `range` out of reset.
    fn release_column_reset(&self, range: &Range) -> Result<()>;

    /// Turn on the clock buffer of every column of `range`.
    fn enable_column_clock_buffer(&self, range: &Range) -> Result<()>;

    /// Turn off the clock buffer of every column of `range`.
    fn disable_column_clock_buffer(&self, range: &Range) -> Result<()>;
}

/// Operation carried in a firmware column request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnOp {
    AssertReset,
    ReleaseReset,
    EnableClockBuffer,
    DisableClockBuffer,
}

impl ColumnOp {
    pub fn name(self) -> &'static str {
        match self {
            ColumnOp::AssertReset => "assert column reset",
            ColumnOp::ReleaseReset => "release column reset",
            ColumnOp::EnableClockBuffer => "enable column clock buffer",
            ColumnOp::DisableClockBuffer => "disable column clock buffer",
        }
    }
}

/// Firmware endpoint accepting column requests.
///
/// A non-zero status is the firmware's rejection code.
pub trait Firmware: Send + Sync + fmt::Debug {
    fn column_request(&self, start_col: u32, num_cols: u32, op: ColumnOp) -> std::result::Result<(), i32>;
}

// ============================================================================
// Direct register access
// ============================================================================

/// Column control through shim registers, confirmed by a bounded read-back.
#[derive(Debug, Clone)]
pub struct RegisterReset {
    io: Arc<dyn RegisterIo>,
    device: &'static DeviceDescription,
    retries: u32,
}

impl RegisterReset {
    pub fn new(io: Arc<dyn RegisterIo>, device: &'static DeviceDescription, retries: u32) -> Self {
        Self { io, device, retries }
    }

    fn write_columns(&self, range: &Range, regoff: u32, mask: u32, set: bool) -> Result<()> {
        let value = if set { mask } else { 0 };
        for col in range.start.col..range.end_col() {
            let offset = self.device.layout.tile_offset(Location::new(col, 0), regoff);
            self.io.mask_write32(offset, mask, value);
            mask_poll(self.io.as_ref(), offset, mask, value, self.retries)?;
        }
        log::debug!(
            "{} 0x{:x} mask 0x{:x} on {}",
            if set { "set" } else { "cleared" },
            regoff,
            mask,
            range
        );
        Ok(())
    }
}

impl ResetControl for RegisterReset {
    fn assert_column_reset(&self, range: &Range) -> Result<()> {
        let reg = self.device.column_reset;
        self.write_columns(range, reg.regoff, reg.mask, true)
    }

    fn release_column_reset(&self, range: &Range) -> Result<()> {
        let reg = self.device.column_reset;
        self.write_columns(range, reg.regoff, reg.mask, false)
    }

    fn enable_column_clock_buffer(&self, range: &Range) -> Result<()> {
        let reg = self.device.column_clock;
        self.write_columns(range, reg.regoff, reg.mask, true)
    }

    fn disable_column_clock_buffer(&self, range: &Range) -> Result<()> {
        let reg = self.device.column_clock;
        self.write_columns(range, reg.regoff, reg.mask, false)
    }
}

// ============================================================================
// Firmware requests
// ============================================================================

/// Column control delegated to platform firmware.
#[derive(Debug, Clone)]
pub struct FirmwareReset {
    firmware: Arc<dyn Firmware>,
}

impl FirmwareReset {
    pub fn new(firmware: Arc<dyn Firmware>) -> Self {
        Self { firmware }
    }

    fn request(&self, range: &Range, op: ColumnOp) -> Result<()> {
        self.firmware
            .column_request(range.start.col, range.size.cols, op)
            .map_err(|code| {
                log::warn!("firmware rejected {} on {}: status {}", op.name(), range, code);
                PartError::HardwareRejected { op: op.name(), code }
            })
    }
}

impl ResetControl for FirmwareReset {
    fn assert_column_reset(&self, range: &Range) -> Result<()> {
        self.request(range, ColumnOp::AssertReset)
    }

    fn release_column_reset(&self, range: &Range) -> Result<()> {
        self.request(range, ColumnOp::ReleaseReset)
    }

    fn enable_column_clock_buffer(&self, range: &Range) -> Result<()> {
        self.request(range, ColumnOp::EnableClockBuffer)
    }

    fn disable_column_clock_buffer(&self, range: &Range) -> Result<()> {
        self.request(range, ColumnOp::DisableClockBuffer)
    }
}
