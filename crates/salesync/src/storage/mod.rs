//! Storage traits and implementations
//!
//! This module defines the storage abstraction for accounts, sync state and
//! sale records. The trait-based design allows swapping between in-memory and
//! SQLite storage; the advisory account lock lives behind [`LockManager`] so
//! the orchestrator never depends on the storage technology.

mod memory;
mod sqlite;
mod traits;

pub use memory::InMemorySalesStore;
pub use sqlite::SqliteSalesStore;
pub use traits::{LockAcquisition, LockManager, SalesStore};
