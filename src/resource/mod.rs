//! Bitmap allocation and the per-partition resource ledgers built on it.

pub mod bitmap;
pub mod manager;

pub use bitmap::{BitResource, IdList};
pub use manager::{ResourceManager, ResourceStat};
