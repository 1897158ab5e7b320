//! Cached error events of one partition.
//!
//! Every event domain present in the device gets one bitmap over the
//! partition's tiles:
//!
//! ```text
//! bit = (col + (row - first_row) * cols) * num_events + event
//!
//!   first_row = 1 for core, memory and memory-tile events
//!   first_row = 0 for shim PL events (one row)
//! ```
//!
//! Bits are only set by interrupt backtracking and only cleared by
//! `clear`. Events without a catalog entry are kept and reported as
//! unclassified.

use std::fmt;
use std::sync::Arc;

use crate::device::{
    ErrorCategories, ErrorCategory, EventDomain, EventTables, Location, ModuleType, Range,
};
use crate::error::{PartError, Result};
use crate::resource::BitResource;

/// Notification hook; receives the partition id.
pub type ErrorCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// One recorded error event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileError {
    /// Absolute tile location.
    pub loc: Location,
    pub module: ModuleType,
    pub event: u32,
    pub category: ErrorCategory,
    /// Catalog name; `None` for unclassified events.
    pub name: Option<&'static str>,
}

impl fmt::Display for TileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tile{} {} event {} [{}] {}",
            self.loc,
            self.module,
            self.event,
            self.category,
            self.name.unwrap_or("-")
        )
    }
}

#[derive(Debug, Clone)]
struct EventBitmap {
    domain: EventDomain,
    first_row: u32,
    num_events: u32,
    bits: BitResource,
}

/// Error bitmaps, the report-pending flag and the notification hook.
pub struct ErrorState {
    cols: u32,
    tables: &'static EventTables,
    bitmaps: Vec<EventBitmap>,
    /// Set when errors were recorded or deferred but not yet reported.
    pub error_to_report: bool,
    callback: Option<ErrorCallback>,
}

impl fmt::Debug for ErrorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorState")
            .field("cols", &self.cols)
            .field("bitmaps", &self.bitmaps)
            .field("error_to_report", &self.error_to_report)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl ErrorState {
    /// Bitmaps for a partition of `cols` columns and `rows` rows.
    pub fn new(cols: u32, rows: u32, tables: &'static EventTables) -> Result<Self> {
        if rows < 2 {
            return Err(PartError::InvalidArgument("partition needs a row above the shim"));
        }
        let mut bitmaps = Vec::new();
        for domain in EventDomain::ALL {
            let Some(attr) = tables.attr(domain) else { continue };
            let (first_row, domain_rows) = match domain {
                EventDomain::Pl => (0, 1),
                _ => (1, rows - 1),
            };
            bitmaps.push(EventBitmap {
                domain,
                first_row,
                num_events: attr.num_events,
                bits: BitResource::new(cols * domain_rows * attr.num_events)?,
            });
        }
        Ok(Self {
            cols,
            tables,
            bitmaps,
            error_to_report: false,
            callback: None,
        })
    }

    fn bitmap(&self, domain: EventDomain) -> Option<&EventBitmap> {
        self.bitmaps.iter().find(|b| b.domain == domain)
    }

    fn bit(&self, map: &EventBitmap, local: Location, event: u32) -> Option<u32> {
        if event >= map.num_events || local.col >= self.cols || local.row < map.first_row {
            return None;
        }
        let tile = local.col + (local.row - map.first_row) * self.cols;
        let bit = tile * map.num_events + event;
        (bit < map.bits.total()).then_some(bit)
    }

    /// Record `event` for the tile at partition-local `local`.
    pub fn record(&mut self, domain: EventDomain, local: Location, event: u32) -> Result<()> {
        let map = self
            .bitmap(domain)
            .ok_or(PartError::InvalidArgument("event domain not present on device"))?;
        let bit = self
            .bit(map, local, event)
            .ok_or(PartError::InvalidLocation(local))?;
        let idx = self
            .bitmaps
            .iter()
            .position(|b| b.domain == domain)
            .ok_or(PartError::InvalidArgument("event domain not present on device"))?;
        self.bitmaps[idx].bits.set(bit, 1)
    }

    /// Whether `event` has been recorded for the tile.
    pub fn is_recorded(&self, domain: EventDomain, local: Location, event: u32) -> bool {
        self.bitmap(domain)
            .and_then(|map| self.bit(map, local, event).map(|bit| map.bits.test(bit)))
            .unwrap_or(false)
    }

    /// Number of recorded events.
    pub fn count(&self) -> u32 {
        self.bitmaps.iter().map(|b| b.bits.count_ones()).sum()
    }

    /// Every recorded event, memory modules first, with absolute locations.
    pub fn errors(&self, range: &Range) -> Vec<TileError> {
        let order = [EventDomain::Memory, EventDomain::MemTile, EventDomain::Core, EventDomain::Pl];
        let mut out = Vec::new();
        for domain in order {
            let Some(map) = self.bitmap(domain) else { continue };
            for bit in map.bits.iter_ones() {
                let tile = bit / map.num_events;
                let event = bit % map.num_events;
                let local = Location::new(tile % self.cols, tile / self.cols + map.first_row);
                let Some(loc) = range.to_absolute(local) else { continue };
                let (category, name) = match self.tables.classify(domain, event) {
                    Some((category, name)) => (category, Some(name)),
                    None => (ErrorCategory::Unclassified, None),
                };
                out.push(TileError {
                    loc,
                    module: domain.module(),
                    event,
                    category,
                    name,
                });
            }
        }
        out
    }

    /// Categories of every recorded event.
    pub fn categories(&self, range: &Range) -> ErrorCategories {
        self.errors(range)
            .iter()
            .fold(ErrorCategories::empty(), |acc, e| acc | e.category.flag())
    }

    /// Forget every recorded event.
    pub fn clear(&mut self) {
        for map in &mut self.bitmaps {
            map.bits.clear_all();
        }
    }

    /// Install the notification hook; one at a time.
    pub fn set_callback(&mut self, callback: ErrorCallback) -> Result<()> {
        if self.callback.is_some() {
            return Err(PartError::AlreadyInUse);
        }
        self.callback = Some(callback);
        Ok(())
    }

    pub fn clear_callback(&mut self) {
        self.callback = None;
    }

    /// Hand out the hook if a report is pending, clearing the flag. The
    /// caller runs it after dropping the partition lock.
    pub fn take_notification(&mut self) -> Option<ErrorCallback> {
        if !self.error_to_report {
            return None;
        }
        let callback = self.callback.clone()?;
        self.error_to_report = false;
        Some(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::events::{AIEML_EVENTS, AIE_EVENTS};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_record_and_list() {
        let range = Range::new(2, 0, 2, 4);
        let mut state = ErrorState::new(2, 4, &AIE_EVENTS).unwrap();
        state.record(EventDomain::Core, Location::new(0, 1), 54).unwrap();
        state.record(EventDomain::Core, Location::new(0, 1), 53).unwrap();
        state.record(EventDomain::Pl, Location::new(1, 0), 62).unwrap();
        assert!(state.is_recorded(EventDomain::Core, Location::new(0, 1), 53));
        assert!(!state.is_recorded(EventDomain::Memory, Location::new(0, 1), 53));
        assert_eq!(state.count(), 3);

        let errors = state.errors(&range);
        assert_eq!(errors.len(), 3);
        assert_eq!(errors[0].loc, Location::new(2, 1));
        assert_eq!(errors[0].event, 53);
        assert_eq!(errors[0].category, ErrorCategory::Unclassified);
        assert_eq!(errors[1].name, Some("tlast_in_wss_words_0-2"));
        assert_eq!(errors[2].loc, Location::new(3, 0));
        assert_eq!(errors[2].module, ModuleType::Pl);

        let cats = state.categories(&range);
        assert!(cats.contains(ErrorCategories::STREAM | ErrorCategories::UNCLASSIFIED));

        state.clear();
        assert_eq!(state.count(), 0);
    }

    #[test]
    fn test_bitmap_indexing() {
        let mut state = ErrorState::new(4, 5, &AIE_EVENTS).unwrap();
        state.record(EventDomain::Memory, Location::new(3, 4), 127).unwrap();
        assert!(state.record(EventDomain::Memory, Location::new(3, 5), 0).is_err());
        assert!(state.record(EventDomain::Memory, Location::new(0, 1), 128).is_err());
        assert!(state.record(EventDomain::Pl, Location::new(0, 1), 62).is_err());
        assert!(state.record(EventDomain::MemTile, Location::new(0, 1), 130).is_err());

        let mut ml = ErrorState::new(1, 3, &AIEML_EVENTS).unwrap();
        ml.record(EventDomain::MemTile, Location::new(0, 1), 139).unwrap();
        let errors = ml.errors(&Range::new(5, 0, 1, 3));
        assert_eq!(errors[0].loc, Location::new(5, 1));
        assert_eq!(errors[0].module, ModuleType::Memory);
        assert_eq!(errors[0].category, ErrorCategory::Lock);
    }

    #[test]
    fn test_single_callback_and_notification() {
        let mut state = ErrorState::new(1, 2, &AIE_EVENTS).unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        state
            .set_callback(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert_eq!(state.set_callback(Arc::new(|_| {})).unwrap_err(), PartError::AlreadyInUse);

        assert!(state.take_notification().is_none());
        state.error_to_report = true;
        let callback = state.take_notification().unwrap();
        callback(7);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!state.error_to_report);

        state.clear_callback();
        state.error_to_report = true;
        assert!(state.take_notification().is_none());
        assert!(state.error_to_report);
    }
}
