//! Persistent store: the single source of truth across restarts.
//!
//! SQLite-backed. Every state transition is a conditional update inside one
//! transaction that also appends to the `events` table; committed events are
//! rebroadcast to live subscribers.

pub mod db;
pub mod models;

pub use db::{PipelineDb, StoreHandle};
pub use models::*;
