//! UnitStore - generic persistent record store
//!
//! Stores serde-serializable records in SQLite, keyed by collection and id,
//! with a side table of indexed fields for filtered queries. Writes are
//! per-record transactions, so an update is atomic: either the new body and
//! its index rows land together or nothing changes.

mod record;
mod store;

pub use record::{Filter, FilterOp, IndexValue, Record, now_ms};
pub use store::{Store, StoreError};
