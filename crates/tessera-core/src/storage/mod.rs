//! # Storage Backends
//!
//! - `MemoryStore`: volatile, in-process
//! - `RedbStore`: embedded, on disk

mod memory;
mod redb_store;

pub use memory::MemoryStore;
pub use redb_store::RedbStore;
