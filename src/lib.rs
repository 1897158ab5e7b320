//! aie-partition library
//!
//! Partition management for AMD AI Engine arrays: column allocation, tile
//! clock gating, hardware resource ledgers and error interrupt
//! aggregation.

pub mod error;
pub mod sync;
pub mod config;
pub mod device;
pub mod resource;
pub mod partition;
pub mod interrupt;
pub mod aperture;

pub use aperture::{Aperture, ApertureSettings, ApertureWorker};
pub use error::{PartError, Result};
pub use partition::{Partition, PartitionHandle, PartitionState};
pub use sync::CancelToken;
