//! Embedded persistence for harvested records.

pub mod store;

pub use store::SqliteRecordStore;
