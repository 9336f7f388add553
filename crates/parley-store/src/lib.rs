//! Durable conversation state for parley
//!
//! Keeps history, processed turn ids and pending clarifications in SQLite so
//! a clarification round survives a restart of the runtime.

pub mod sqlite;

pub use sqlite::SqliteStateStore;
