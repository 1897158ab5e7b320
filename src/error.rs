//! Error type shared by every partition-management operation.
//!
//! Variants map onto the categories a caller has to handle: malformed
//! requests, out-of-bounds locations, contention for columns or resources,
//! hardware that stops answering, and callers that were asked to stop while
//! waiting on a lock.

use thiserror::Error;

use crate::device::Location;

/// Errors returned by the allocator, the partition manager and the
/// interrupt aggregator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PartError {
    /// Malformed request shape (zero-length region, empty tile list, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Requested columns fall outside the aperture.
    #[error("columns {start_col}..{end_col} outside aperture columns {aperture_start}..{aperture_end}")]
    InvalidRange {
        start_col: u32,
        end_col: u32,
        aperture_start: u32,
        aperture_end: u32,
    },

    /// A bit region falls outside the bitmap it addresses.
    #[error("bit region {start}+{count} exceeds capacity {total}")]
    OutOfRange { start: u32, count: u32, total: u32 },

    /// A tile location falls outside the partition.
    #[error("location {0} is outside the partition")]
    InvalidLocation(Location),

    /// Some column in the requested range is owned by a live partition.
    #[error("columns {start_col}..{end_col} overlap a live partition")]
    ColumnsInUse { start_col: u32, end_col: u32 },

    /// A specific resource id is already taken.
    #[error("resource id {id} is already in use")]
    ResourceInUse { id: u32 },

    /// No free region of the requested shape exists.
    #[error("no free region available")]
    NotAvailable,

    /// Double-acquire of a single-tenant object.
    #[error("already in use")]
    AlreadyInUse,

    /// Destroy was attempted while the partition is still handed out.
    #[error("partition {0} is in use and must be released first")]
    PartitionBusy(u32),

    /// The partition behind a handle has been destroyed.
    #[error("partition {0} no longer exists")]
    PartitionGone(u32),

    /// Register access to a tile whose clock is gated.
    #[error("tile {0} is clock gated")]
    TileGated(Location),

    /// A hardware polling loop exceeded its retry budget.
    #[error("timeout polling register 0x{offset:08x} after {retries} reads")]
    Timeout { offset: u64, retries: u32 },

    /// The reset/power collaborator reported failure.
    #[error("{op} rejected by hardware (status {code})")]
    HardwareRejected { op: &'static str, code: i32 },

    /// The caller was asked to stop while blocked on a lock.
    #[error("operation cancelled while waiting for a lock")]
    Cancelled,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PartError>;
